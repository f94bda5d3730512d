//! Time source abstraction.
//!
//! Production code uses [`SystemClock`]; tests drive [`ManualClock`] to make
//! staleness, eviction and hydration age deterministic.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::clock";

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = mutex_lock(&self.now, SOURCE, "advance");
        *now += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        *mutex_lock(&self.now, SOURCE, "set") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *mutex_lock(&self.now, SOURCE, "now")
    }
}
