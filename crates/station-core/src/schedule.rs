//! Daily schedule model and slot resolution.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::SECONDS_PER_DAY;

/// A schedule row as delivered by a fetcher, before time parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSlot {
    pub time_text: String,
    pub identifier: String,
    pub display_label: String,
}

/// One program occupying `[start_seconds, next slot's start)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub start_seconds: u32,
    pub identifier: String,
    pub display_label: String,
    pub raw_time_text: String,
}

/// A day's slots, sorted by strictly increasing start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub date: NaiveDate,
    #[serde(rename = "schedule")]
    pub slots: Vec<Slot>,
}

impl Schedule {
    /// Build a schedule from fetched rows.  Rows whose time cannot be parsed,
    /// and rows that repeat an earlier start time, are logged and dropped.
    pub fn from_raw(date: NaiveDate, rows: Vec<RawSlot>) -> Self {
        let mut slots: Vec<Slot> = rows
            .into_iter()
            .filter_map(|row| match parse_time_of_day(&row.time_text) {
                Some(start_seconds) => Some(Slot {
                    start_seconds,
                    identifier: row.identifier,
                    display_label: row.display_label,
                    raw_time_text: row.time_text,
                }),
                None => {
                    warn!(
                        "schedule {}: unparseable time {:?} for {:?}, not scheduled",
                        date, row.time_text, row.identifier
                    );
                    None
                }
            })
            .collect();

        // Stable sort keeps the first of any rows sharing a start time.
        slots.sort_by_key(|s| s.start_seconds);
        let mut deduped: Vec<Slot> = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(prev) = deduped.last() {
                if prev.start_seconds == slot.start_seconds {
                    warn!(
                        "schedule {}: {:?} shares start {} with {:?}, dropped",
                        date, slot.identifier, slot.raw_time_text, prev.identifier
                    );
                    continue;
                }
            }
            deduped.push(slot);
        }

        Self {
            date,
            slots: deduped,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A slot together with its derived window.  `window_start` is 0 for the
/// day's first slot and the nominal start for every other slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSlot {
    pub date: NaiveDate,
    pub slot: Slot,
    pub window_start: u32,
    pub end_seconds: u32,
}

impl ResolvedSlot {
    pub fn start_seconds(&self) -> u32 {
        self.slot.start_seconds
    }

    pub fn duration_seconds(&self) -> u32 {
        self.end_seconds - self.slot.start_seconds
    }

    pub fn identifier(&self) -> &str {
        &self.slot.identifier
    }

    pub fn start_hour(&self) -> u32 {
        self.slot.start_seconds / 3600
    }

    /// True when the slot ends exactly on the hour, where the stream carries
    /// its timing marker.
    pub fn ends_on_hour(&self) -> bool {
        self.end_seconds % 3600 == 0
    }

    pub fn key(&self) -> SlotKey {
        SlotKey {
            date: self.date,
            identifier: self.slot.identifier.clone(),
            start_seconds: self.slot.start_seconds,
        }
    }
}

/// Identity of one slot instance.  A transition is due whenever the key of
/// the resolved slot differs from the key of what is running.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub identifier: String,
    pub start_seconds: u32,
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} @{}",
            self.date,
            self.identifier,
            format_time_of_day(self.start_seconds)
        )
    }
}

/// Find the slot whose window contains `seconds`.
///
/// The first slot's window opens at midnight even if its nominal start is
/// later; `start_seconds` stays nominal (file names and durations use it)
/// while `window_start` carries the implicit 0.  Slots with a non-positive
/// duration never match.
pub fn resolve(schedule: &Schedule, seconds: f64) -> Option<ResolvedSlot> {
    let slots = &schedule.slots;
    for (i, slot) in slots.iter().enumerate() {
        let end = slots
            .get(i + 1)
            .map(|next| next.start_seconds)
            .unwrap_or(SECONDS_PER_DAY);
        if end <= slot.start_seconds {
            continue;
        }
        let window_start = if i == 0 { 0 } else { slot.start_seconds };
        if seconds >= window_start as f64 && seconds < end as f64 {
            return Some(ResolvedSlot {
                date: schedule.date,
                slot: slot.clone(),
                window_start,
                end_seconds: end,
            });
        }
    }
    None
}

/// Parse `"h:MM AM"`, `"h:MM PM"` or 24-hour `"HH:MM[:SS]"` into seconds since
/// midnight.
pub fn parse_time_of_day(text: &str) -> Option<u32> {
    let text = text.trim();
    let upper = text.to_ascii_uppercase();
    let (clock, meridiem) = if let Some(rest) = upper.strip_suffix("AM") {
        (rest.trim(), Some(false))
    } else if let Some(rest) = upper.strip_suffix("PM") {
        (rest.trim(), Some(true))
    } else {
        (upper.as_str(), None)
    };

    let mut parts = clock.split(':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = match parts.next() {
        Some(m) => m.trim().parse().ok()?,
        None if meridiem.is_some() => 0,
        None => return None,
    };
    let second: u32 = match parts.next() {
        Some(s) => s.trim().parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || minute > 59 || second > 59 {
        return None;
    }

    let hour24 = match meridiem {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, false) => h,
                (h, true) => h + 12,
            }
        }
        None => {
            if hour > 23 {
                return None;
            }
            hour
        }
    };
    Some(hour24 * 3600 + minute * 60 + second)
}

pub fn format_time_of_day(seconds: u32) -> String {
    let s = seconds % SECONDS_PER_DAY;
    format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
}
