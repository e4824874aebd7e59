//! Recordings tree: `<base>/<YYYY>/<MM>/<DD>/<HH>_<identifier>_<N>m.<ext>`.
//!
//! Hour, identifier and nominal minutes together identify one take of a slot.
//! A second take of the same slot gets `.<k>` before the extension until
//! duplicate cleanup settles on one file.  In-progress files carry a trailing
//! `.part` and are never matched.

use chrono::{Datelike, Duration, NaiveDate};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::probe::DurationProbe;
use crate::schedule::ResolvedSlot;

/// Filename-safe form of a schedule identifier.
pub fn sanitize_identifier(identifier: &str) -> String {
    let cleaned: String = identifier
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingName {
    pub hour: u32,
    pub identifier: String,
    pub minutes: u32,
    pub duplicate: Option<u32>,
    pub extension: String,
}

impl RecordingName {
    pub fn for_slot(slot: &ResolvedSlot, extension: &str) -> Self {
        Self {
            hour: slot.start_hour(),
            identifier: sanitize_identifier(slot.identifier()),
            minutes: (slot.duration_seconds() + 30) / 60,
            duplicate: None,
            extension: extension.to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        match self.duplicate {
            Some(k) => format!(
                "{:02}_{}_{}m.{}.{}",
                self.hour, self.identifier, self.minutes, k, self.extension
            ),
            None => format!(
                "{:02}_{}_{}m.{}",
                self.hour, self.identifier, self.minutes, self.extension
            ),
        }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        if !crate::platform::AUDIO_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
            return None;
        }
        let (stem, duplicate) = match stem.rsplit_once('.') {
            Some((base, k)) if !k.is_empty() && k.chars().all(|c| c.is_ascii_digit()) => {
                (base, Some(k.parse().ok()?))
            }
            Some(_) => return None,
            None => (stem, None),
        };
        let (hour, rest) = stem.split_once('_')?;
        let (identifier, minutes) = rest.rsplit_once('_')?;
        let hour: u32 = hour.parse().ok().filter(|h| *h < 24)?;
        let minutes: u32 = minutes.strip_suffix('m')?.parse().ok()?;
        if identifier.is_empty() {
            return None;
        }
        Some(Self {
            hour,
            identifier: identifier.to_string(),
            minutes,
            duplicate,
            extension: extension.to_string(),
        })
    }

    /// Same slot take, ignoring the duplicate counter.
    pub fn same_take(&self, other: &Self) -> bool {
        self.hour == other.hour
            && self.identifier == other.identifier
            && self.minutes == other.minutes
            && self.extension.eq_ignore_ascii_case(&other.extension)
    }

    pub fn canonical(&self) -> Self {
        Self {
            duplicate: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingsLayout {
    base: PathBuf,
}

impl RecordingsLayout {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.base
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    /// Temp target for a recording that is still being written.
    pub fn part_path(final_path: &Path) -> PathBuf {
        let mut s = final_path.as_os_str().to_os_string();
        s.push(".part");
        PathBuf::from(s)
    }

    /// Canonical path for `name` on `date`, or the first free duplicate slot
    /// if a take already exists there.
    pub fn unique_final_path(&self, date: NaiveDate, name: &RecordingName) -> PathBuf {
        let dir = self.day_dir(date);
        let canonical = dir.join(name.canonical().file_name());
        if !canonical.exists() && !Self::part_path(&canonical).exists() {
            return canonical;
        }
        let mut k = 1;
        loop {
            let candidate = dir.join(
                RecordingName {
                    duplicate: Some(k),
                    ..name.clone()
                }
                .file_name(),
            );
            if !candidate.exists() && !Self::part_path(&candidate).exists() {
                return candidate;
            }
            k += 1;
        }
    }

    /// Finished recordings in one day directory, sorted by file name.
    pub fn recordings_on(&self, date: NaiveDate) -> Vec<(PathBuf, RecordingName)> {
        let dir = self.day_dir(date);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut found: Vec<(PathBuf, RecordingName)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if !path.is_file() {
                    return None;
                }
                let name = RecordingName::parse(path.file_name()?.to_str()?)?;
                Some((path, name))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Look for a recording of `slot`: `date` first, then up to `lookback_days`
    /// earlier days, most recent first.  Paths in `exclude` are skipped.
    ///
    /// Within one day a take from the slot's own hour wins, then canonical
    /// names over duplicates.
    pub fn find_recording(
        &self,
        slot: &ResolvedSlot,
        date: NaiveDate,
        lookback_days: u32,
        exclude: &HashSet<PathBuf>,
    ) -> Option<PathBuf> {
        let wanted = sanitize_identifier(slot.identifier());
        for back in 0..=lookback_days {
            let day = date - Duration::days(back as i64);
            let mut candidates: Vec<(PathBuf, RecordingName)> = self
                .recordings_on(day)
                .into_iter()
                .filter(|(path, name)| name.identifier == wanted && !exclude.contains(path))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            candidates.sort_by_key(|(_, name)| (name.hour != slot.start_hour(), name.duplicate.is_some()));
            let (path, _) = candidates.swap_remove(0);
            debug!("recordings: {} matched {:?} ({} days back)", slot.identifier(), path, back);
            return Some(path);
        }
        None
    }
}

/// Collapse every take of `name` in `date`'s directory to the longest one,
/// stored under the canonical file name.  Returns the surviving path.
pub async fn cleanup_duplicates(
    layout: &RecordingsLayout,
    date: NaiveDate,
    name: &RecordingName,
    probe: &dyn DurationProbe,
) -> anyhow::Result<Option<PathBuf>> {
    let takes: Vec<(PathBuf, RecordingName)> = layout
        .recordings_on(date)
        .into_iter()
        .filter(|(_, n)| n.same_take(name))
        .collect();
    if takes.is_empty() {
        return Ok(None);
    }

    let mut best: Option<(PathBuf, f64)> = None;
    let mut losers = Vec::new();
    for (path, _) in takes {
        let duration = probe.probe_duration(&path).await;
        match &best {
            Some((_, best_duration)) if duration <= *best_duration => losers.push(path),
            _ => {
                if let Some((previous, _)) = best.take() {
                    losers.push(previous);
                }
                best = Some((path, duration));
            }
        }
    }

    for path in &losers {
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("recordings: removed shorter duplicate {:?}", path),
            Err(e) => warn!("recordings: could not remove duplicate {:?}: {}", path, e),
        }
    }

    let Some((keeper, _)) = best else {
        return Ok(None);
    };
    let canonical = layout.day_dir(date).join(name.canonical().file_name());
    if keeper != canonical {
        tokio::fs::rename(&keeper, &canonical).await?;
        info!("recordings: {:?} renamed to canonical {:?}", keeper, canonical);
    }
    Ok(Some(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Slot;

    fn slot(identifier: &str, start: u32, end: u32) -> ResolvedSlot {
        ResolvedSlot {
            date: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            slot: Slot {
                start_seconds: start,
                identifier: identifier.to_string(),
                display_label: identifier.to_string(),
                raw_time_text: String::new(),
            },
            window_start: start,
            end_seconds: end,
        }
    }

    #[test]
    fn test_name_for_slot() {
        let name = RecordingName::for_slot(&slot("Morning Show/Live", 5 * 3600, 6 * 3600), "mp3");
        assert_eq!(name.file_name(), "05_Morning-Show-Live_60m.mp3");
    }

    #[test]
    fn test_parse_names() {
        let n = RecordingName::parse("05_morning_show_60m.mp3").unwrap();
        assert_eq!(n.hour, 5);
        assert_eq!(n.identifier, "morning_show");
        assert_eq!(n.minutes, 60);
        assert_eq!(n.duplicate, None);

        let d = RecordingName::parse("05_morning_show_60m.2.mp3").unwrap();
        assert_eq!(d.duplicate, Some(2));
        assert!(d.same_take(&n));
        assert_eq!(d.canonical().file_name(), "05_morning_show_60m.mp3");

        assert!(RecordingName::parse("05_morning_60m.mp3.part").is_none());
        assert!(RecordingName::parse("notes.txt").is_none());
        assert!(RecordingName::parse("25_x_60m.mp3").is_none());
        assert!(RecordingName::parse("05_x_sixty.mp3").is_none());
    }

    #[test]
    fn test_unique_final_path_skips_existing_takes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RecordingsLayout::new(dir.path().to_path_buf());
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let name = RecordingName::for_slot(&slot("news", 7 * 3600, 7 * 3600 + 1800), "mp3");

        let first = layout.unique_final_path(date, &name);
        assert!(first.ends_with("2024/03/09/07_news_30m.mp3"));
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"x").unwrap();

        let second = layout.unique_final_path(date, &name);
        assert!(second.ends_with("07_news_30m.1.mp3"));
        std::fs::write(RecordingsLayout::part_path(&second), b"x").unwrap();
        let third = layout.unique_final_path(date, &name);
        assert!(third.ends_with("07_news_30m.2.mp3"));
    }

    #[test]
    fn test_find_prefers_same_hour_and_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RecordingsLayout::new(dir.path().to_path_buf());
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let day = layout.day_dir(date);
        std::fs::create_dir_all(&day).unwrap();
        for f in ["03_news_60m.mp3", "07_news_60m.1.mp3", "07_news_60m.mp3", "07_other_60m.mp3"] {
            std::fs::write(day.join(f), b"x").unwrap();
        }
        let found = layout
            .find_recording(&slot("news", 7 * 3600, 8 * 3600), date, 0, &HashSet::new())
            .unwrap();
        assert!(found.ends_with("07_news_60m.mp3"));

        let mut exclude = HashSet::new();
        exclude.insert(found);
        let found = layout
            .find_recording(&slot("news", 7 * 3600, 8 * 3600), date, 0, &exclude)
            .unwrap();
        assert!(found.ends_with("07_news_60m.1.mp3"));
    }
}
