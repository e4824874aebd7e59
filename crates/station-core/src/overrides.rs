//! Scheduled interruptions (station IDs and the like) played over the main
//! program.
//!
//! The table is a TOML file of `[[override]]` rows:
//!
//! ```toml
//! [[override]]
//! day = "Any"            # or a weekday: "Mon", "tuesday", ...
//! time = "14:00:00"      # or "2:00 PM"
//! duration = 30          # seconds
//! path = "/srv/ids/station-id.mp3"
//! ```
//!
//! Rows are validated one by one; a bad row is logged and dropped without
//! affecting the others.

use chrono::Weekday;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::schedule::parse_time_of_day;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayFilter {
    Any,
    Day(Weekday),
}

impl DayFilter {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("any") {
            return Some(Self::Any);
        }
        text.parse::<Weekday>().ok().map(Self::Day)
    }

    pub fn matches(&self, day: Weekday) -> bool {
        match self {
            Self::Any => true,
            Self::Day(d) => *d == day,
        }
    }

    fn is_specific(&self) -> bool {
        matches!(self, Self::Day(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideEntry {
    pub day: DayFilter,
    pub time_of_day: u32,
    pub duration_secs: u32,
    pub path: PathBuf,
}

/// Parse a table, dropping invalid rows with a logged reason.
pub fn parse_overrides(content: &str) -> anyhow::Result<Vec<OverrideEntry>> {
    let doc: toml::Table = toml::from_str(content)?;
    let rows = match doc.get("override") {
        None => return Ok(Vec::new()),
        Some(toml::Value::Array(rows)) => rows,
        Some(_) => anyhow::bail!("`override` must be an array of tables"),
    };

    let mut entries = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        match parse_row(row) {
            Ok(entry) => entries.push(entry),
            Err(reason) => warn!("overrides: row {} dropped: {}", idx + 1, reason),
        }
    }
    Ok(entries)
}

fn parse_row(row: &toml::Value) -> Result<OverrideEntry, String> {
    let table = row.as_table().ok_or("not a table")?;
    let text = |key: &str| -> Result<&str, String> {
        table
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("missing or non-string `{}`", key))
    };

    let day_text = text("day")?;
    let day = DayFilter::parse(day_text).ok_or_else(|| format!("unknown day {:?}", day_text))?;
    let time_text = text("time")?;
    let time_of_day =
        parse_time_of_day(time_text).ok_or_else(|| format!("unparseable time {:?}", time_text))?;
    let duration = table
        .get("duration")
        .and_then(|v| v.as_integer())
        .ok_or("missing or non-integer `duration`")?;
    if duration <= 0 || duration > 3600 {
        return Err(format!("duration {} out of range", duration));
    }
    let path = text("path")?;
    if path.trim().is_empty() {
        return Err("empty `path`".to_string());
    }

    Ok(OverrideEntry {
        day,
        time_of_day,
        duration_secs: duration as u32,
        path: PathBuf::from(path),
    })
}

/// Pick the entry due at `(day, second)`.  A weekday-specific entry beats an
/// `Any` entry; among equals the first row in the table wins.
pub fn find_due(entries: &[OverrideEntry], day: Weekday, second: u32) -> Option<&OverrideEntry> {
    let mut due = entries
        .iter()
        .filter(|e| e.time_of_day == second && e.day.matches(day));
    let first = due.next()?;
    if first.day.is_specific() {
        return Some(first);
    }
    Some(due.find(|e| e.day.is_specific()).unwrap_or(first))
}

/// The loaded table plus its reload bookkeeping.  Owned by the player loop.
pub struct OverrideTable {
    path: PathBuf,
    reload_interval: Duration,
    entries: Vec<OverrideEntry>,
    loaded_at: Option<Instant>,
}

impl OverrideTable {
    pub fn new(path: PathBuf, reload_interval: Duration) -> Self {
        Self {
            path,
            reload_interval,
            entries: Vec::new(),
            loaded_at: None,
        }
    }

    pub fn entries(&self) -> &[OverrideEntry] {
        &self.entries
    }

    /// Reload if the last attempt is older than the reload interval.  A failed
    /// reload keeps the previous entries.
    pub fn refresh_if_stale(&mut self) {
        if let Some(at) = self.loaded_at {
            if at.elapsed() < self.reload_interval {
                return;
            }
        }
        self.loaded_at = Some(Instant::now());
        match self.load() {
            Ok(entries) => {
                if entries != self.entries {
                    info!("overrides: {} entries loaded from {:?}", entries.len(), self.path);
                }
                self.entries = entries;
            }
            Err(e) => warn!(
                "overrides: reload of {:?} failed, keeping {} previous entries: {:#}",
                self.path,
                self.entries.len(),
                e
            ),
        }
    }

    fn load(&self) -> anyhow::Result<Vec<OverrideEntry>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_overrides(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("overrides: {:?} not present", self.path);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_due(&self, day: Weekday, second: u32) -> Option<&OverrideEntry> {
        find_due(&self.entries, day, second)
    }
}
