// src/server/middleware/mod.rs
pub mod rate_limit;
pub mod validation;

// Re-export main components for cleaner imports
pub use rate_limit::ConnectionRateLimiter;
pub use validation::validate_envelope;

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::{
    secure::listener::SecureListener,
    server::{
        client::{ClientChannel, ConnectionRegistry},
        events::Handler,
    },
    utils::BrokerError,
};

/// An event name paired with the handler to attach for it.
#[derive(Clone)]
pub struct MiddlewareEntry {
    pub event: String,
    pub handler: Handler,
}

impl std::fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareEntry")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Server-level and client-level middleware.
///
/// Client middleware is attached to every channel in the registry, including
/// channels admitted after the entry was added. Admission and
/// [`MiddlewareRegistry::add_client_middleware`] are serialized by the same
/// lock, so each channel receives each entry exactly once.
#[derive(Debug, Default)]
pub struct MiddlewareRegistry {
    server: Mutex<Vec<MiddlewareEntry>>,
    client: Mutex<Vec<MiddlewareEntry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `handler` to the live listener and records it.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::NotBoundError` if the listener is not bound; the
    /// entry is not recorded in that case.
    pub fn add_server_middleware(
        &self,
        listener: &SecureListener,
        event: &str,
        handler: Handler,
    ) -> Result<(), BrokerError> {
        listener.on(event, handler.clone())?;
        lock(&self.server).push(MiddlewareEntry {
            event: event.to_string(),
            handler,
        });
        debug!("Added server middleware for '{}'", event);
        Ok(())
    }

    /// Records `handler` for future channels and attaches it to every channel
    /// already in `registry`.
    pub fn add_client_middleware(
        &self,
        registry: &ConnectionRegistry,
        event: &str,
        handler: Handler,
    ) {
        let mut entries = lock(&self.client);
        let present = registry.snapshot();
        for channel in &present {
            channel.on(event, handler.clone());
        }
        entries.push(MiddlewareEntry {
            event: event.to_string(),
            handler,
        });
        debug!(
            "Added client middleware for '{}' ({} existing channels)",
            event,
            present.len()
        );
    }

    /// Attaches every client entry, in insertion order, to `channel`.
    pub fn apply_client_middleware(&self, channel: &ClientChannel) {
        Self::apply(&lock(&self.client), channel);
    }

    fn apply(entries: &[MiddlewareEntry], channel: &ClientChannel) {
        for entry in entries {
            channel.on(&entry.event, entry.handler.clone());
        }
    }

    /// Adds `channel` to `registry` and applies the client middleware, as one
    /// step with respect to [`MiddlewareRegistry::add_client_middleware`].
    ///
    /// Nothing happens when `open` returns `false` under the lock; returns
    /// whether the channel was admitted.
    pub(crate) fn admit(
        &self,
        registry: &ConnectionRegistry,
        channel: &ClientChannel,
        open: impl FnOnce() -> bool,
    ) -> bool {
        let entries = lock(&self.client);
        if !open() || !registry.add(channel.clone()) {
            return false;
        }
        Self::apply(&entries, channel);
        true
    }

    /// Clears `registry` while no admission can be in progress.
    pub(crate) fn clear_registry(&self, registry: &ConnectionRegistry) {
        let _entries = lock(&self.client);
        registry.clear();
    }

    pub fn server_middleware(&self) -> Vec<MiddlewareEntry> {
        lock(&self.server).clone()
    }

    pub fn client_middleware(&self) -> Vec<MiddlewareEntry> {
        lock(&self.client).clone()
    }
}
