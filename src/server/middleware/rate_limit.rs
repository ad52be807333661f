use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{net::IpAddr, num::NonZeroU32, sync::Arc};

use crate::utils::BrokerError;

/// A rate limiter for inbound connection attempts, keyed by peer IP.
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    /// The underlying rate limiter instance, shared across clones.
    limiter: Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock, NoOpMiddleware>>,
}

impl ConnectionRateLimiter {
    /// Creates a limiter allowing `per_second` connection attempts per IP.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConfigurationError` if `per_second` is zero.
    pub fn new(per_second: u32) -> Result<Self, BrokerError> {
        let burst_size = NonZeroU32::new(per_second).ok_or_else(|| {
            BrokerError::ConfigurationError("connection rate limit must be greater than 0".into())
        })?;

        Ok(Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_second(burst_size))),
        })
    }

    /// Returns `true` if a connection from `ip` is allowed right now.
    ///
    /// Unlike a waiting check this never delays the accept loop; peers over
    /// quota are simply turned away.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }
}

impl std::fmt::Debug for ConnectionRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRateLimiter").finish_non_exhaustive()
    }
}
