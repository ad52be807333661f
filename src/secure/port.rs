use std::{io::ErrorKind, sync::Arc};

use dashmap::DashSet;
use rand::Rng;
use tokio::net::TcpListener;
use tracing::{debug, trace};

use crate::utils::BrokerError;

/// Upper bound on bind probes per [`PortAllocator::find_free_port`] call.
pub const MAX_PROBES: usize = 512;

/// Finds unused listening ports inside an inclusive range.
///
/// Ports handed to live listeners are reserved so that the same allocator does
/// not offer them again while the listener holds them.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    reserved: Arc<DashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a port in `[min, max]` that could be bound on `host` at probe time.
    ///
    /// Probing starts at a random offset and wraps around the range. Only ports
    /// that are in use (or not permitted) are skipped.
    ///
    /// # Errors
    ///
    /// * `BrokerError::PortExhaustionError` if no probed port was free.
    /// * `BrokerError::BindError` if `host` itself cannot be bound.
    pub async fn find_free_port(&self, host: &str, min: u16, max: u16) -> Result<u16, BrokerError> {
        if min > max {
            return Err(BrokerError::ConfigurationError(format!(
                "invalid port range {}..={}",
                min, max
            )));
        }

        let span = (max - min) as usize + 1;
        let attempts = span.min(MAX_PROBES);
        let offset = rand::thread_rng().gen_range(0..span);

        for step in 0..attempts {
            let port = min + ((offset + step) % span) as u16;
            if self.reserved.contains(&port) {
                trace!("Port {} is reserved, skipping", port);
                continue;
            }
            // Binding port 0 would hand back an arbitrary ephemeral port.
            if port == 0 {
                continue;
            }
            match TcpListener::bind((host, port)).await {
                Ok(_) => {
                    debug!("Found free port {} on {}", port, host);
                    return Ok(port);
                }
                Err(e)
                    if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) =>
                {
                    trace!("Port {} unavailable: {}", port, e);
                }
                Err(e) => {
                    return Err(BrokerError::BindError(format!("{}:{}: {}", host, port, e)));
                }
            }
        }

        Err(BrokerError::PortExhaustionError { min, max, attempts })
    }

    /// Marks `port` as held by a live listener.
    pub fn reserve(&self, port: u16) {
        self.reserved.insert(port);
    }

    /// Releases a reservation made with [`PortAllocator::reserve`].
    pub fn release(&self, port: u16) {
        self.reserved.remove(&port);
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_port_within_range() {
        let allocator = PortAllocator::new();
        let port = allocator
            .find_free_port("127.0.0.1", 45433, 45533)
            .await
            .unwrap();
        assert!((45433..=45533).contains(&port));
    }

    #[tokio::test]
    async fn skips_reserved_ports() {
        let allocator = PortAllocator::new();
        let first = allocator
            .find_free_port("127.0.0.1", 46100, 46101)
            .await
            .unwrap();
        allocator.reserve(first);

        let second = allocator
            .find_free_port("127.0.0.1", 46100, 46101)
            .await
            .unwrap();
        assert_ne!(first, second);

        allocator.release(first);
        assert!(!allocator.is_reserved(first));
    }

    #[tokio::test]
    async fn exhausted_range_reports_error() {
        let allocator = PortAllocator::new();
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = held.local_addr().unwrap().port();

        let err = allocator
            .find_free_port("127.0.0.1", port, port)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::PortExhaustionError { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn unbindable_host_is_a_bind_error() {
        // TEST-NET-1, never assigned to a local interface.
        let err = PortAllocator::new()
            .find_free_port("192.0.2.1", 47700, 47800)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BindError(_)));
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let err = PortAllocator::new()
            .find_free_port("127.0.0.1", 10, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ConfigurationError(_)));
    }
}
