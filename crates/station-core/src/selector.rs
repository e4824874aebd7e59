//! Decides what the player puts on air for a slot: the recording if a usable
//! one exists, otherwise filler from the song library.

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PlayerConfig;
use crate::library::SongLibrary;
use crate::probe::DurationProbe;
use crate::recordings::RecordingsLayout;
use crate::schedule::ResolvedSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationCheck {
    Ok,
    TooShort,
    TooLong,
}

/// Compare a probed duration with the scheduled one.  Differences of exactly
/// `tolerance` still count as `Ok`.
pub fn validate_duration(actual: f64, scheduled: f64, tolerance: f64) -> DurationCheck {
    let diff = actual - scheduled;
    if diff < -tolerance {
        DurationCheck::TooShort
    } else if diff > tolerance {
        DurationCheck::TooLong
    } else {
        DurationCheck::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Recording,
    Filler,
}

/// A chosen source and where to start inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub kind: SourceKind,
    pub path: PathBuf,
    pub duration_secs: f64,
    pub start_offset_secs: f64,
}

impl Source {
    pub fn is_filler(&self) -> bool {
        self.kind == SourceKind::Filler
    }
}

pub struct SourceSelector {
    layout: RecordingsLayout,
    probe: Arc<dyn DurationProbe>,
    tolerance_secs: f64,
    lookback_days: u32,
}

impl SourceSelector {
    pub fn new(layout: RecordingsLayout, probe: Arc<dyn DurationProbe>, config: &PlayerConfig) -> Self {
        Self {
            layout,
            probe,
            tolerance_secs: config.duration_tolerance_secs,
            lookback_days: config.lookback_days,
        }
    }

    /// Find and validate a recording for `slot`.  A recording that is too
    /// short is deleted; `failed` paths are never returned.
    ///
    /// `slot_position` is the current second within the slot and sets the
    /// start offset (wrapped by the file's duration).
    pub async fn select_recording(
        &self,
        slot: &ResolvedSlot,
        date: NaiveDate,
        slot_position: f64,
        failed: &HashSet<PathBuf>,
    ) -> Option<Source> {
        let mut excluded = failed.clone();
        loop {
            let path = self
                .layout
                .find_recording(slot, date, self.lookback_days, &excluded)?;
            let actual = self.probe.probe_duration(&path).await;
            if actual <= 0.0 {
                debug!("selector: {:?} has unknown duration, skipping", path);
                excluded.insert(path);
                continue;
            }

            let scheduled = slot.duration_seconds() as f64;
            match validate_duration(actual, scheduled, self.tolerance_secs) {
                DurationCheck::TooShort => {
                    warn!(
                        "selector: {:?} is {:.0}s, slot needs {:.0}s; deleting as corrupt",
                        path, actual, scheduled
                    );
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("selector: could not delete {:?}: {}", path, e);
                    }
                    excluded.insert(path);
                    continue;
                }
                DurationCheck::TooLong => {
                    debug!(
                        "selector: {:?} runs {:.0}s over, will be cut at slot end",
                        path,
                        actual - scheduled
                    );
                }
                DurationCheck::Ok => {}
            }

            let start_offset_secs = slot_position.rem_euclid(actual);
            info!(
                "selector: {} → {:?} from {:.1}s",
                slot.identifier(),
                path,
                start_offset_secs
            );
            return Some(Source {
                kind: SourceKind::Recording,
                path,
                duration_secs: actual,
                start_offset_secs,
            });
        }
    }

    /// Recording if possible, otherwise the next filler song.
    pub async fn select(
        &self,
        slot: &ResolvedSlot,
        date: NaiveDate,
        slot_position: f64,
        failed: &HashSet<PathBuf>,
        library: &mut SongLibrary,
    ) -> Option<Source> {
        if let Some(source) = self.select_recording(slot, date, slot_position, failed).await {
            return Some(source);
        }
        info!("selector: no usable recording for {}, using filler", slot.identifier());
        next_filler(library, failed).await
    }
}

/// Next library song that has not failed this run.
pub async fn next_filler(library: &mut SongLibrary, failed: &HashSet<PathBuf>) -> Option<Source> {
    // The queue may be rescanned mid-search, so a pass is not bounded by its
    // current length.  Every path shows up at most twice before one complete
    // queue has been walked; a third sighting means nothing is playable.
    let mut sightings: HashMap<PathBuf, u32> = HashMap::new();
    loop {
        let song = library.next_song().await?;
        if failed.contains(&song.path) {
            let seen = sightings.entry(song.path).or_insert(0);
            *seen += 1;
            if *seen >= 3 {
                return None;
            }
            continue;
        }
        return Some(Source {
            kind: SourceKind::Filler,
            path: song.path,
            duration_secs: song.duration_secs,
            start_offset_secs: 0.0,
        });
    }
}
