//! Time source for cache staleness, expiry and rate limiting.
//!
//! Everything time-dependent in the client reads the current time through a [`Clock`], so that
//! staleness and expiry can be tested deterministically with [`ManualClock`].
use std::{sync::Mutex, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};

/// Absolute point in time. Serialized as milliseconds since the Unix epoch in the flag cache.
pub type Timestamp = DateTime<Utc>;

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Return the current time.
    fn now(&self) -> Timestamp;
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagwise::clock::{Clock, ManualClock};
/// let clock = ManualClock::from_millis(0);
/// clock.advance(Duration::from_millis(1500));
/// assert_eq!(clock.now().timestamp_millis(), 1500);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Create a clock stopped at `now`.
    pub fn new(now: Timestamp) -> ManualClock {
        ManualClock {
            now: Mutex::new(now),
        }
    }

    /// Create a clock stopped at `millis` milliseconds after the Unix epoch.
    pub fn from_millis(millis: i64) -> ManualClock {
        ManualClock::new(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: Timestamp) {
        *self
            .now
            .lock()
            .expect("thread holding clock lock should not panic") = now;
    }

    /// Move the clock to `millis` milliseconds after the Unix epoch.
    pub fn set_millis(&self, millis: i64) {
        self.set(DateTime::from_timestamp_millis(millis).unwrap_or_default());
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self
            .now
            .lock()
            .expect("thread holding clock lock should not panic");
        *now = add_duration(*now, duration);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self
            .now
            .lock()
            .expect("thread holding clock lock should not panic")
    }
}

/// `timestamp + duration`, saturating at the maximum representable time.
pub(crate) fn add_duration(timestamp: Timestamp, duration: Duration) -> Timestamp {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| timestamp.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `timestamp - duration`, saturating at the minimum representable time.
pub(crate) fn sub_duration(timestamp: Timestamp, duration: Duration) -> Timestamp {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| timestamp.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
