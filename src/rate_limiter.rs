//! Keyed gate for telemetry events: at most one event per key per window.
use std::{num::NonZeroU32, sync::Arc, time::Duration};

use governor::{
    middleware::NoOpMiddleware, nanos::Nanos, state::keyed::DefaultKeyedStateStore, Quota,
};

use crate::clock::Clock;

type KeyedLimiter = governor::RateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    GovernorClock,
    NoOpMiddleware<Nanos>,
>;

/// Feeds the client's [`Clock`] to governor, so the window follows injected time.
#[derive(Clone)]
struct GovernorClock(Arc<dyn Clock>);

impl governor::clock::Clock for GovernorClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        let millis = u64::try_from(self.0.now().timestamp_millis()).unwrap_or(0);
        Nanos::from(millis.saturating_mul(1_000_000))
    }
}

/// Allows one event per key within any `window`.
pub struct RateLimiter {
    /// `None` for a zero window, which never limits.
    limiter: Option<KeyedLimiter>,
}

impl RateLimiter {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> RateLimiter {
        let limiter = Quota::with_period(window).map(|quota| {
            governor::RateLimiter::dashmap_with_clock(
                quota.allow_burst(NonZeroU32::MIN),
                GovernorClock(clock),
            )
        });
        RateLimiter { limiter }
    }

    /// Record an event for `key` if it is within the limit. Returns whether it was allowed.
    pub fn check(&self, key: &str) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };
        let allowed = limiter.check_key(&key.to_owned()).is_ok();
        // Keys whose window has passed carry no state worth keeping.
        limiter.retain_recent();
        allowed
    }
}
