//! Wall-clock and monotonic time reads behind a trait.
//!
//! `next_attempt_time` scheduling only ever compares stored instants against
//! "now"; wall-clock monotonicity is not assumed. Tests pin time with
//! [`ManualClock`].

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time, used for scheduling and result timestamps.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant, used for dialog deadlines.
    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock whose wall time only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance wall time by `seconds`.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn advance_secs(&self, seconds: i64) {
        let mut now = self.now.lock().expect("ManualClock mutex poisoned");
        *now += chrono::Duration::seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("ManualClock mutex poisoned")
    }
}
