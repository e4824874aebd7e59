//! Player daemon: plays the recording of whatever was on air one broadcast
//! delay ago, falling back to library filler, and injects scheduled overrides
//! over the main program.

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use station_core::clock::{seconds_since_midnight, TimeModel};
use station_core::config::{secs_f64, Config, PlayerConfig};
use station_core::library::SongLibrary;
use station_core::overrides::{OverrideEntry, OverrideTable};
use station_core::probe::DurationProbe;
use station_core::recordings::RecordingsLayout;
use station_core::schedule::{resolve, ResolvedSlot, SlotKey};
use station_core::schedule_store::ScheduleStore;
use station_core::selector::{next_filler, Source, SourceSelector};

use crate::channel::{wait_for_playback, ChannelLauncher, ChannelState};
use crate::crossfade::{fade, Crossfader, FadeMode};
use crate::mpv::QUIT_GRACE;

const OVERRIDE_FADE_STEPS: u32 = 10;

/// Longest stretch the loop can spend between two override checks: a full
/// switch (playback-start wait, crossfade, quitting the old deck) plus one
/// tick, rounded up with a second to spare.  Seconds this far back are still
/// scanned when a tick runs late.
fn override_lookback(config: &Config) -> chrono::Duration {
    let stop = config.mpv.property_timeout_secs + QUIT_GRACE.as_secs_f64();
    let busy = config.player.playback_start_timeout_secs
        + config.player.crossfade_secs
        + stop
        + config.player.tick().as_secs_f64();
    chrono::Duration::seconds(busy.max(0.0).ceil() as i64 + 1)
}

struct OnAir {
    key: SlotKey,
    source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Different slot, or nothing playing yet.
    Slot,
    /// The source played to its end inside the slot.
    Finished,
    /// The channel died.
    Failed(Option<i32>),
}

pub struct Player {
    config: PlayerConfig,
    prefetch_after_hour: u32,
    store: ScheduleStore,
    time: TimeModel,
    selector: SourceSelector,
    library: SongLibrary,
    overrides: OverrideTable,
    launcher: Arc<dyn ChannelLauncher>,
    decks: Crossfader,
    on_air: Option<OnAir>,
    attempts: HashMap<PathBuf, u32>,
    failed: HashSet<PathBuf>,
    last_override_check: Option<NaiveDateTime>,
    override_lookback: chrono::Duration,
    ducked: bool,
}

impl Player {
    pub fn new(
        config: &Config,
        store: ScheduleStore,
        probe: Arc<dyn DurationProbe>,
        launcher: Arc<dyn ChannelLauncher>,
    ) -> Self {
        let layout = RecordingsLayout::new(config.paths.recordings_dir.clone());
        let library = SongLibrary::open(
            config.paths.library_dir.clone(),
            config.paths.song_cache_file(),
            config.paths.song_queue_file(),
            probe.clone(),
        );
        Self {
            config: config.player.clone(),
            prefetch_after_hour: config.schedule.prefetch_after_hour,
            store,
            time: TimeModel::new(&config.clock),
            selector: SourceSelector::new(layout, probe, &config.player),
            library,
            overrides: OverrideTable::new(config.paths.overrides_file.clone(), config.player.override_reload()),
            decks: Crossfader::new(launcher.clone(), &config.player),
            launcher,
            on_air: None,
            attempts: HashMap::new(),
            failed: HashSet::new(),
            last_override_check: None,
            override_lookback: override_lookback(config),
            ducked: false,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("play: started, tick {:?}", self.config.tick());
        loop {
            self.check_overrides().await;
            let sleep = match self.ensure_on_air().await {
                Ok(()) => self.config.tick(),
                Err(e) => {
                    warn!("play: {:#}", e);
                    self.config.retry_backoff()
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("play: interrupted, stopping decks");
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// Slot on air in playback time, with the position inside it.
    async fn current_slot(&self) -> anyhow::Result<Option<(ResolvedSlot, f64)>> {
        let now = Local::now();
        let playback = self.time.playback_now(now);
        let date = playback.date();

        if now.hour() >= self.prefetch_after_hour {
            if let Some(tomorrow) = date.succ_opt() {
                self.store.ensure_in_background(tomorrow).await;
            }
        }

        let schedule = self.store.get(date).await?;
        let secs = seconds_since_midnight(playback.time());
        Ok(resolve(&schedule, secs).map(|slot| {
            let position = (secs - slot.window_start as f64).max(0.0);
            (slot, position)
        }))
    }

    /// Make sure the right source is playing; switch if the slot changed or
    /// the current source ended or failed.
    async fn ensure_on_air(&mut self) -> anyhow::Result<()> {
        let Some((slot, position)) = self.current_slot().await? else {
            debug!("play: no slot on air");
            return Ok(());
        };
        let key = slot.key();

        let state = self.decks.active_state().await;
        let transition = match (&self.on_air, state) {
            (None, _) | (_, None) => Transition::Slot,
            (Some(on_air), _) if on_air.key != key => Transition::Slot,
            (Some(_), Some(ChannelState::Exited(Some(0)))) => Transition::Finished,
            (Some(_), Some(ChannelState::Exited(code))) => Transition::Failed(code),
            _ => return Ok(()),
        };

        let source = match transition {
            Transition::Slot => {
                info!("play: now {}", key);
                self.selector
                    .select(&slot, slot.date, position, &self.failed, &mut self.library)
                    .await
            }
            Transition::Finished => {
                debug!("play: source finished inside {}, continuing with filler", key);
                next_filler(&mut self.library, &self.failed).await
            }
            Transition::Failed(code) => {
                if let Some(on_air) = self.on_air.take() {
                    warn!("play: {:?} died (exit {:?})", on_air.source.path, code);
                    self.note_failure(&on_air.source.path);
                }
                self.selector
                    .select(&slot, slot.date, position, &self.failed, &mut self.library)
                    .await
            }
        };
        let Some(source) = source else {
            warn!("play: nothing playable for {}", key);
            return Ok(());
        };

        let mode = if self.ducked {
            FadeMode::Ducked
        } else {
            FadeMode::Crossfade
        };
        match self
            .decks
            .switch(&source.path, source.start_offset_secs, mode)
            .await
        {
            Ok(()) => {
                self.on_air = Some(OnAir { key, source });
                Ok(())
            }
            Err(e) => {
                self.note_failure(&source.path);
                Err(e.into())
            }
        }
    }

    /// First failure of a path earns one retry; the second excludes it for
    /// the rest of the run.
    fn note_failure(&mut self, path: &Path) {
        let attempts = self.attempts.entry(path.to_path_buf()).or_insert(0);
        *attempts += 1;
        if *attempts >= 2 {
            warn!("play: {:?} failed twice, not used again this run", path);
            self.failed.insert(path.to_path_buf());
        } else {
            info!("play: {:?} failed, retrying once", path);
        }
    }

    /// Check every wall-clock second since the previous check (bounded) for
    /// a due override and run it.
    async fn check_overrides(&mut self) {
        self.overrides.refresh_if_stale();
        let Some(now) = Local::now().naive_local().with_nanosecond(0) else {
            return;
        };
        let earliest = now - self.override_lookback;
        let from = match self.last_override_check {
            Some(last) if last >= now => return,
            Some(last) => (last + chrono::Duration::seconds(1)).max(earliest),
            None => now,
        };
        self.last_override_check = Some(now);

        let mut second = from;
        while second <= now {
            let due = self
                .overrides
                .find_due(second.weekday(), second.num_seconds_from_midnight())
                .cloned();
            if let Some(entry) = due {
                self.run_override(entry).await;
                return;
            }
            second += chrono::Duration::seconds(1);
        }
    }

    async fn run_override(&mut self, entry: OverrideEntry) {
        info!("override: {:?} for {}s", entry.path, entry.duration_secs);
        let step = secs_f64(self.config.override_fade_secs / OVERRIDE_FADE_STEPS as f64);
        let duck = self.config.duck_volume.min(100);

        if let Some(main) = self.decks.active() {
            fade(main, 100, duck, OVERRIDE_FADE_STEPS, step).await;
        }
        self.ducked = true;
        if let Err(e) = self.play_override(&entry, step).await {
            warn!("override: {:?} failed: {:#}", entry.path, e);
        }
        self.ducked = false;
        if let Some(main) = self.decks.active() {
            fade(main, duck, 100, OVERRIDE_FADE_STEPS, step).await;
        }
        info!("override: done");
    }

    async fn play_override(&mut self, entry: &OverrideEntry, step: Duration) -> anyhow::Result<()> {
        let channel = self.launcher.start("override", &entry.path, 0.0, 0).await?;
        if let Err(e) = wait_for_playback(channel.as_ref(), self.config.playback_start_timeout()).await {
            channel.stop().await;
            return Err(e.into());
        }
        fade(channel.as_ref(), 0, 100, OVERRIDE_FADE_STEPS, step).await;

        let hold = secs_f64(entry.duration_secs as f64 - 2.0 * self.config.override_fade_secs);
        let deadline = Instant::now() + hold;
        while Instant::now() < deadline {
            if channel.state().await.is_exited() {
                debug!("override: {:?} ended early", entry.path);
                break;
            }
            // Slot boundaries during the hold switch instantly at duck volume.
            if let Err(e) = self.ensure_on_air().await {
                warn!("play: {:#}", e);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(left.min(Duration::from_secs(1))).await;
        }

        fade(channel.as_ref(), 100, 0, OVERRIDE_FADE_STEPS, step).await;
        channel.stop().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.decks.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{Event, FakeLauncher};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use station_core::schedule::RawSlot;
    use station_core::schedule_store::ScheduleFetcher;

    /// One slot covering the whole day, whatever the date.
    struct AllDay;

    #[async_trait]
    impl ScheduleFetcher for AllDay {
        async fn fetch_schedule(&self, _date: NaiveDate) -> anyhow::Result<Vec<RawSlot>> {
            Ok(vec![RawSlot {
                time_text: "12:00 AM".to_string(),
                identifier: "allday".to_string(),
                display_label: "All Day".to_string(),
            }])
        }
    }

    /// Duration is the number written in the file.
    struct ContentProbe;

    #[async_trait]
    impl DurationProbe for ContentProbe {
        async fn probe_duration(&self, path: &Path) -> f64 {
            std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0.0)
        }
    }

    fn config(root: &Path) -> Config {
        let mut config = Config::default();
        config.paths.recordings_dir = root.join("recordings");
        config.paths.library_dir = root.join("music");
        config.paths.state_dir = root.join("state");
        config.paths.overrides_file = root.join("overrides.toml");
        config.player.crossfade_secs = 0.02;
        config.player.crossfade_steps = 2;
        config.player.playback_start_timeout_secs = 0.3;
        config.schedule.prefetch_after_hour = 24;
        config
    }

    fn player(root: &Path, launcher: Arc<FakeLauncher>) -> Player {
        let config = config(root);
        let store = ScheduleStore::new(Arc::new(AllDay), config.paths.schedule_dir(), Duration::from_secs(60));
        Player::new(&config, store, Arc::new(ContentProbe), launcher)
    }

    /// Put a full-day recording one day before the current playback date.
    fn seed_recording(root: &Path) -> PathBuf {
        let config = config(root);
        let date = TimeModel::new(&config.clock).playback_now(Local::now()).date() - chrono::Duration::days(1);
        let layout = RecordingsLayout::new(config.paths.recordings_dir.clone());
        let dir = layout.day_dir(date);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("00_allday_1440m.mp3");
        std::fs::write(&path, "86400").unwrap();
        path
    }

    fn seed_song(root: &Path) -> PathBuf {
        let music = root.join("music");
        std::fs::create_dir_all(&music).unwrap();
        let path = music.join("song.mp3");
        std::fs::write(&path, "180").unwrap();
        path
    }

    #[tokio::test]
    async fn test_plays_recording_for_slot() {
        let dir = tempfile::tempdir().unwrap();
        let recording = seed_recording(dir.path());
        let launcher = Arc::new(FakeLauncher::default());
        let mut player = player(dir.path(), launcher.clone());

        player.ensure_on_air().await.unwrap();
        assert_eq!(launcher.started.lock().unwrap().clone(), vec![recording]);

        // Same slot, channel running: nothing to do.
        player.ensure_on_air().await.unwrap();
        assert_eq!(launcher.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_recording_is_retried_once_then_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let recording = seed_recording(dir.path());
        let song = seed_song(dir.path());
        let launcher = Arc::new(FakeLauncher::default());
        launcher.dead_paths.lock().unwrap().push(recording.clone());
        let mut player = player(dir.path(), launcher.clone());

        assert!(player.ensure_on_air().await.is_err());
        assert!(player.ensure_on_air().await.is_err());
        player.ensure_on_air().await.unwrap();

        let started = launcher.started.lock().unwrap().clone();
        assert_eq!(started, vec![recording.clone(), recording, song]);
        assert!(player.on_air.as_ref().unwrap().source.is_filler());
    }

    #[tokio::test]
    async fn test_empty_slot_uses_filler() {
        let dir = tempfile::tempdir().unwrap();
        let song = seed_song(dir.path());
        let launcher = Arc::new(FakeLauncher::default());
        let mut player = player(dir.path(), launcher.clone());

        player.ensure_on_air().await.unwrap();
        assert_eq!(launcher.started.lock().unwrap().clone(), vec![song]);
        assert!(launcher
            .events()
            .contains(&Event::Playing { label: "deck-a".into() }));
    }

    #[tokio::test]
    async fn test_failure_count_marks_path() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut player = player(dir.path(), launcher);
        let path = PathBuf::from("/x.mp3");
        player.note_failure(&path);
        assert!(!player.failed.contains(&path));
        player.note_failure(&path);
        assert!(player.failed.contains(&path));
    }

    #[test]
    fn test_override_lookback_covers_a_full_switch() {
        let config = Config::default();
        let switch = config.player.playback_start_timeout_secs
            + config.player.crossfade_secs
            + config.mpv.property_timeout_secs
            + QUIT_GRACE.as_secs_f64()
            + config.player.tick().as_secs_f64();
        assert!(override_lookback(&config).num_seconds() as f64 > switch);
    }

    #[tokio::test]
    async fn test_override_due_during_a_long_switch_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.player.crossfade_secs = 5.0;
        config.player.playback_start_timeout_secs = 5.0;
        config.player.override_fade_secs = 0.1;

        let now = Local::now().naive_local().with_nanosecond(0).unwrap();
        let due = now - chrono::Duration::seconds(8);
        let jingle = dir.path().join("jingle.mp3");
        std::fs::write(
            &config.paths.overrides_file,
            format!(
                "[[override]]\nday = \"Any\"\ntime = \"{}\"\nduration = 1\npath = {:?}\n",
                due.format("%H:%M:%S"),
                jingle.to_string_lossy()
            ),
        )
        .unwrap();

        let launcher = Arc::new(FakeLauncher::default());
        let store = ScheduleStore::new(Arc::new(AllDay), config.paths.schedule_dir(), Duration::from_secs(60));
        let mut player = Player::new(&config, store, Arc::new(ContentProbe), launcher.clone());
        // The previous check happened before a switch that kept the loop busy.
        player.last_override_check = Some(now - chrono::Duration::seconds(10));

        player.check_overrides().await;
        assert_eq!(launcher.started.lock().unwrap().clone(), vec![jingle]);
        assert!(launcher
            .events()
            .contains(&Event::Stopped { label: "override".into() }));
        assert!(!player.ducked);
    }
}
