use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use log::{debug, info};

use crate::{
    config::ClockConfig,
    error::SyncError,
    hal::{NetworkTime, WallClock},
};

pub const SYNC_INTERVAL_SECS: i64 = 4 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncState {
    pub last_sync_timestamp: i64,
    pub has_synced_once: bool,
}

/// Last Sunday of `month`, found by stepping back from the last day.
pub fn last_sunday(year: i32, month: u32) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };

    let mut day = first_of_next.pred_opt()?;
    while day.weekday() != Weekday::Sun {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// `[start, end)` of summer time in local wall time for `year`.
pub fn dst_window(year: i32) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let start = last_sunday(year, 3)?.and_time(NaiveTime::from_hms_opt(2, 0, 0)?);
    let end = last_sunday(year, 10)?.and_time(NaiveTime::from_hms_opt(3, 0, 0)?);
    Some((start, end))
}

pub fn is_dst(local: NaiveDateTime) -> bool {
    dst_window(local.year())
        .map(|(start, end)| start <= local && local < end)
        .unwrap_or(false)
}

pub fn effective_offset_hours(config: &ClockConfig, local_now: NaiveDateTime) -> i32 {
    if config.auto_dst && is_dst(local_now) {
        config.timezone_offset + 1
    } else {
        config.timezone_offset
    }
}

pub fn timestamp(local: NaiveDateTime) -> i64 {
    local.and_utc().timestamp()
}

#[derive(Debug, Clone)]
pub struct TimeSyncService {
    state: SyncState,
    interval_secs: i64,
}

impl Default for TimeSyncService {
    fn default() -> Self {
        Self::new(SYNC_INTERVAL_SECS)
    }
}

impl TimeSyncService {
    pub fn new(interval_secs: i64) -> Self {
        Self {
            state: SyncState::default(),
            interval_secs,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// A clock that never synced is always due; afterwards the interval
    /// counts from the last stamped sync.
    pub fn is_due(&self, local_now: NaiveDateTime) -> bool {
        !self.state.has_synced_once
            || timestamp(local_now) - self.state.last_sync_timestamp > self.interval_secs
    }

    /// Queries network time and sets the wall clock. The first success after
    /// boot immediately queries again: the DST decision for that first query
    /// was made against an unset clock.
    pub fn sync(
        &mut self,
        config: &ClockConfig,
        network_time: &mut dyn NetworkTime,
        clock: &mut dyn WallClock,
    ) -> Result<(), SyncError> {
        loop {
            let offset = effective_offset_hours(config, clock.now());
            let utc = network_time.query()?;
            let local = utc.naive_utc() + Duration::hours(i64::from(offset));
            clock.set(local);
            debug!("clock set to {local} (offset {offset:+}h)");

            if self.state.has_synced_once {
                self.state.last_sync_timestamp = timestamp(clock.now());
                info!("time synced: {local}");
                return Ok(());
            }

            info!("first time sync after boot, repeating once");
            self.state.has_synced_once = true;
        }
    }
}
