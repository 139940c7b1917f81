use std::{sync::OnceLock, time::Instant};

use chrono::{Duration, NaiveDateTime, Utc};
use wordclock_common::hal::WallClock;

/// Local wall time kept as an offset from the system UTC clock. Reads plain
/// UTC until the first sync sets it.
#[derive(Debug, Clone, Default)]
pub struct OffsetClock {
    offset: Duration,
}

impl OffsetClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WallClock for OffsetClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc() + self.offset
    }

    fn set(&mut self, local: NaiveDateTime) {
        self.offset = local - Utc::now().naive_utc();
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
