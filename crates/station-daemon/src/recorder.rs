//! Recorder daemon: keeps exactly one ffmpeg recording running for the slot
//! that is on air in effective time, hands off between slots with a short
//! overlap, and finalizes superseded recordings in the background.
//!
//! ```text
//!   tick ─ effective now ─ schedule(date) ─ resolve ─ plan
//!                                                      ├── WaitForStart / Skip → sleep
//!                                                      ├── Watch              → sleep (≤ watch interval)
//!                                                      └── Start              → new channel, install,
//!                                                                               overlap, retire old ─┐
//!   finalize (detached) ◄──────────────────────────────────────────────────────────────────────────┘
//!     stop → rename .part → duplicate cleanup → calibration (hour-aligned slots)
//! ```

use anyhow::Context;
use chrono::{Local, Timelike};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use station_core::clock::{seconds_since_midnight, OffsetStore, TimeModel};
use station_core::config::{secs_f64, Config, RecorderConfig};
use station_core::platform;
use station_core::probe::DurationProbe;
use station_core::recordings::{cleanup_duplicates, RecordingName, RecordingsLayout};
use station_core::schedule::{format_time_of_day, resolve, ResolvedSlot, SlotKey};
use station_core::schedule_store::ScheduleStore;

use crate::calibrate::{OffsetCalibrator, TailCalibrator};
use crate::channel::ChannelState;
use crate::record::{promote_part, FfmpegRecordLauncher, RecordLauncher, Recording};

/// Floor for watch sleeps so a boundary a few microseconds away cannot spin.
const MIN_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum RecorderAction {
    /// The resolved slot has not begun yet.
    WaitForStart(Duration),
    /// Joined too late; leave the slot alone until it ends.
    Skip(Duration),
    Start { record_secs: f64, resume: bool },
    /// Current recording is the right one.
    Watch(Duration),
}

/// What to do for `slot` at `effective_secs`, given the current recording's
/// key and whether its process is still alive.
pub fn plan(
    slot: &ResolvedSlot,
    effective_secs: f64,
    current: Option<(&SlotKey, bool)>,
    config: &RecorderConfig,
) -> RecorderAction {
    let until_end = slot.end_seconds as f64 - effective_secs;
    let record_secs = (until_end - config.startup_overhead_secs).max(0.0);
    let same_slot = current.map(|(key, _)| *key == slot.key()).unwrap_or(false);

    if same_slot {
        let alive = current.map(|(_, alive)| alive).unwrap_or(false);
        if alive {
            let sleep = secs_f64(until_end.min(config.watch_interval_secs)).max(MIN_SLEEP);
            return RecorderAction::Watch(sleep);
        }
        return RecorderAction::Start {
            record_secs,
            resume: true,
        };
    }

    // An offset moved backwards across a boundary resolves to the slot before
    // the live recording; that recording keeps running.
    if let Some((key, true)) = current {
        if (key.date, key.start_seconds) > (slot.date, slot.start_seconds()) {
            return RecorderAction::Watch(secs_f64(config.watch_interval_secs).max(MIN_SLEEP));
        }
    }

    let start = slot.window_start as f64;
    if start > effective_secs {
        return RecorderAction::WaitForStart(secs_f64(start - effective_secs).max(MIN_SLEEP));
    }
    if effective_secs - start > config.grace_secs {
        return RecorderAction::Skip(secs_f64(until_end).max(MIN_SLEEP));
    }
    RecorderAction::Start {
        record_secs,
        resume: false,
    }
}

struct Assignment {
    slot: ResolvedSlot,
    name: RecordingName,
    final_path: PathBuf,
    channel: Box<dyn Recording>,
}

/// Everything the detached finalize task needs.
#[derive(Clone)]
struct Finalizer {
    layout: RecordingsLayout,
    probe: Arc<dyn DurationProbe>,
    calibrator: Arc<dyn OffsetCalibrator>,
    calibrate: bool,
    stop_timeout: Duration,
}

impl Finalizer {
    async fn finalize(&self, assignment: Assignment) -> anyhow::Result<()> {
        let Assignment {
            slot,
            name,
            final_path,
            channel,
        } = assignment;
        let code = channel.stop(self.stop_timeout).await;
        debug!("record {}: finalizing (exit {:?})", channel.label(), code);

        if !promote_part(channel.part_path(), &final_path)
            .await
            .with_context(|| format!("renaming {:?}", channel.part_path()))?
        {
            warn!("record {}: nothing was captured", channel.label());
            return Ok(());
        }
        info!("record: saved {:?}", final_path);

        let kept = cleanup_duplicates(&self.layout, slot.date, &name, self.probe.as_ref())
            .await?
            .unwrap_or(final_path);

        if self.calibrate && slot.ends_on_hour() {
            match self.calibrator.calibrate(&kept).await {
                Ok(Some(_)) => {}
                Ok(None) => debug!("calibration: no adjustment from {:?}", kept),
                Err(e) => warn!("calibration: {:?} failed: {:#}", kept, e),
            }
        }
        Ok(())
    }
}

pub struct Recorder {
    config: RecorderConfig,
    prefetch_after_hour: u32,
    store: ScheduleStore,
    time: TimeModel,
    offsets: OffsetStore,
    layout: RecordingsLayout,
    launcher: Arc<dyn RecordLauncher>,
    finalizer: Finalizer,
    current: Option<Assignment>,
}

impl Recorder {
    pub fn new(config: &Config, store: ScheduleStore, probe: Arc<dyn DurationProbe>) -> anyhow::Result<Self> {
        if config.recorder.stream_url.trim().is_empty() {
            anyhow::bail!("recorder.stream_url is not configured");
        }
        let ffmpeg = platform::find_ffmpeg_binary().ok_or_else(|| anyhow::anyhow!("ffmpeg binary not found"))?;
        info!("record: using {:?}", ffmpeg);

        let offsets = OffsetStore::new(config.paths.offset_file(), config.clock.default_offset_secs);
        let calibrator = TailCalibrator::new(ffmpeg.clone(), config.calibration.clone(), offsets);
        Ok(Self::with_parts(
            config,
            store,
            probe,
            Arc::new(FfmpegRecordLauncher::new(ffmpeg)),
            Arc::new(calibrator),
        ))
    }

    fn with_parts(
        config: &Config,
        store: ScheduleStore,
        probe: Arc<dyn DurationProbe>,
        launcher: Arc<dyn RecordLauncher>,
        calibrator: Arc<dyn OffsetCalibrator>,
    ) -> Self {
        let layout = RecordingsLayout::new(config.paths.recordings_dir.clone());
        let finalizer = Finalizer {
            layout: layout.clone(),
            probe,
            calibrator,
            calibrate: config.calibration.enabled,
            stop_timeout: config.recorder.stop_timeout(),
        };
        Self {
            config: config.recorder.clone(),
            prefetch_after_hour: config.schedule.prefetch_after_hour,
            store,
            time: TimeModel::new(&config.clock),
            offsets: OffsetStore::new(config.paths.offset_file(), config.clock.default_offset_secs),
            layout,
            launcher,
            finalizer,
            current: None,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("record: recording {}", self.config.stream_url);
        loop {
            let sleep = match self.tick().await {
                Ok(sleep) => sleep,
                Err(e) => {
                    warn!("record: {:#}", e);
                    self.config.retry_backoff()
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("record: interrupted");
                    if let Some(current) = self.current.take() {
                        self.finalizer.finalize(current).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn tick(&mut self) -> anyhow::Result<Duration> {
        let now = Local::now();
        let offset = self.offsets.load();
        let effective = self.time.effective_now(now, offset);
        let date = effective.date();

        if now.hour() >= self.prefetch_after_hour {
            if let Some(tomorrow) = date.succ_opt() {
                self.store.ensure_in_background(tomorrow).await;
            }
        }

        let schedule = self.store.get(date).await?;
        let secs = seconds_since_midnight(effective.time());
        let Some(slot) = resolve(&schedule, secs) else {
            debug!("record: no slot at {} on {}", format_time_of_day(secs as u32), date);
            return Ok(self.config.retry_backoff());
        };

        let current = match &self.current {
            Some(a) => Some((a.slot.key(), a.channel.state().await)),
            None => None,
        };
        let view = current.as_ref().map(|(key, state)| (key, !state.is_exited()));

        match plan(&slot, secs, view, &self.config) {
            RecorderAction::WaitForStart(sleep) => {
                self.retire_current();
                info!(
                    "record: {} starts at {}, waiting {:.0}s",
                    slot.identifier(),
                    format_time_of_day(slot.start_seconds()),
                    sleep.as_secs_f64()
                );
                Ok(sleep)
            }
            RecorderAction::Skip(sleep) => {
                self.retire_current();
                warn!(
                    "record: {} began {:.0}s ago (offset {:+.1}s), skipping until it ends",
                    slot.key(),
                    secs - slot.window_start as f64,
                    offset
                );
                Ok(sleep)
            }
            RecorderAction::Start { record_secs, resume } => {
                if let (true, Some(a), Some((_, ChannelState::Exited(code)))) =
                    (resume, &self.current, &current)
                {
                    warn!("record: {}, resuming {}", a.channel.unexpected_exit(*code), a.slot.key());
                }
                self.start_recording(slot, record_secs, resume).await?;
                if resume {
                    Ok(self.config.retry_backoff())
                } else {
                    Ok(Duration::ZERO)
                }
            }
            RecorderAction::Watch(sleep) => Ok(sleep),
        }
    }

    async fn start_recording(&mut self, slot: ResolvedSlot, record_secs: f64, resume: bool) -> anyhow::Result<()> {
        let name = RecordingName::for_slot(&slot, &self.config.format);
        let final_path = self.layout.unique_final_path(slot.date, &name);
        let day_dir = self.layout.day_dir(slot.date);
        tokio::fs::create_dir_all(&day_dir)
            .await
            .with_context(|| format!("creating {:?}", day_dir))?;

        let part_path = RecordingsLayout::part_path(&final_path);
        let cap = secs_f64(record_secs + self.config.overlap_secs + self.config.tail_margin_secs);
        let channel = self
            .launcher
            .start(&self.config.stream_url, &self.config.format, &part_path, cap)
            .await?;
        info!(
            "record: {} → {:?} for {:.0}s{}",
            slot.key(),
            final_path,
            record_secs,
            if resume { " (resumed)" } else { "" }
        );

        let previous = self.current.replace(Assignment {
            slot,
            name,
            final_path,
            channel,
        });
        if let Some(previous) = previous {
            if !resume {
                tokio::time::sleep(self.config.overlap()).await;
            }
            self.retire(previous);
        }
        Ok(())
    }

    fn retire_current(&mut self) {
        if let Some(current) = self.current.take() {
            self.retire(current);
        }
    }

    /// Stop and finalize `assignment` without blocking the control loop.
    fn retire(&self, assignment: Assignment) {
        let finalizer = self.finalizer.clone();
        tokio::spawn(async move {
            let label = assignment.channel.label().to_string();
            if let Err(e) = finalizer.finalize(assignment).await {
                warn!("record {}: finalize failed: {:#}", label, e);
            }
        });
    }
}
