//! Wall-clock to schedule-time mapping and the persisted clock offset.
//!
//! The recorder works in *effective* time: local wall-clock plus a sub-hour
//! offset that the calibrator keeps tuning.  The player works in *playback*
//! time: wall-clock minus the fixed broadcast delay, with no offset applied.

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::ClockConfig;

pub const SECONDS_PER_DAY: u32 = 86_400;

const HALF_HOUR: f64 = 1800.0;
const HOUR: f64 = 3600.0;

/// Seconds since local midnight, with sub-second precision.
pub fn seconds_since_midnight(t: NaiveTime) -> f64 {
    t.num_seconds_from_midnight() as f64 + t.nanosecond() as f64 / 1e9
}

/// Fold an offset into (−1800, 1800].
///
/// A whole-hour component is always a calibration error, never real skew, so
/// it is discarded rather than applied.
pub fn normalize_offset(offset: f64) -> f64 {
    let folded = (offset + HALF_HOUR).rem_euclid(HOUR) - HALF_HOUR;
    if folded <= -HALF_HOUR {
        folded + HOUR
    } else {
        folded
    }
}

pub fn round_tenth(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// On-disk form of the offset: `{"offset": .., "lastUpdated": ..}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockOffset {
    pub offset: f64,
    pub last_updated: DateTime<Local>,
}

/// Reads and writes the offset file.  The control loop re-reads it every
/// iteration; calibration tasks only ever write it.
#[derive(Debug, Clone)]
pub struct OffsetStore {
    path: PathBuf,
    default_offset: f64,
}

impl OffsetStore {
    pub fn new(path: PathBuf, default_offset: f64) -> Self {
        Self {
            path,
            default_offset,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Current offset, falling back to the configured default when the file is
    /// missing or unreadable.
    pub fn load(&self) -> f64 {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<ClockOffset>(&content) {
                Ok(stored) if stored.offset.is_finite() => stored.offset,
                Ok(_) => {
                    warn!("clock offset file holds a non-finite value, using default");
                    self.default_offset
                }
                Err(e) => {
                    warn!("clock offset file {:?} unreadable: {}", self.path, e);
                    self.default_offset
                }
            },
            Err(_) => self.default_offset,
        }
    }

    pub fn save(&self, offset: f64) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = ClockOffset {
            offset,
            last_updated: Local::now(),
        };
        // Write-then-rename so a reader never sees a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&record)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("clock offset persisted: {:.1}s", offset);
        Ok(())
    }
}

/// Converts instants into the two time bases used by the daemons.
#[derive(Debug, Clone)]
pub struct TimeModel {
    playback_delay: chrono::Duration,
}

impl TimeModel {
    pub fn new(config: &ClockConfig) -> Self {
        Self {
            playback_delay: config.playback_delay(),
        }
    }

    /// `now + offset` as a local date-time.  Crossing midnight moves the date.
    pub fn effective_now(&self, now: DateTime<Local>, offset: f64) -> NaiveDateTime {
        let offset_ms = (offset * 1000.0).round() as i64;
        now.naive_local() + chrono::Duration::milliseconds(offset_ms)
    }

    /// `now − delay`, the moment whose broadcast is due on air now.
    pub fn playback_now(&self, now: DateTime<Local>) -> NaiveDateTime {
        now.naive_local() - self.playback_delay
    }
}
