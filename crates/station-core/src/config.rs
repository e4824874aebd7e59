use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

/// Daemon configuration.  Every component receives the section it needs at
/// construction time; nothing reads global constants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the `<YYYY>/<MM>/<DD>` recordings tree.
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,
    /// Filler music, scanned recursively.
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
    /// Schedule snapshots, offset file, song cache and queue live here.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_overrides_file")]
    pub overrides_file: PathBuf,
}

impl PathsConfig {
    pub fn schedule_dir(&self) -> PathBuf {
        self.state_dir.join("schedules")
    }

    pub fn offset_file(&self) -> PathBuf {
        self.state_dir.join("clock_offset.json")
    }

    pub fn song_cache_file(&self) -> PathBuf {
        self.state_dir.join("song_durations.json")
    }

    pub fn song_queue_file(&self) -> PathBuf {
        self.state_dir.join("song_queue.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Offset used until the first calibration lands.
    #[serde(default = "default_offset_secs")]
    pub default_offset_secs: f64,
    /// Fixed delay between recording and playback.
    #[serde(default = "default_playback_delay_secs")]
    pub playback_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Schedule page URL.  `{date}` is replaced with `YYYY-MM-DD`.
    #[serde(default = "default_url_template")]
    pub url_template: String,
    #[serde(default = "default_row_selector")]
    pub row_selector: String,
    #[serde(default = "default_time_selector")]
    pub time_selector: String,
    #[serde(default = "default_title_selector")]
    pub title_selector: String,
    #[serde(default = "default_link_selector")]
    pub link_selector: String,
    /// Local hour after which tomorrow's schedule is fetched in the background.
    #[serde(default = "default_prefetch_after_hour")]
    pub prefetch_after_hour: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Cooldown before a failed background fetch is attempted again.
    #[serde(default = "default_fetch_retry_secs")]
    pub fetch_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub stream_url: String,
    /// A slot that started longer ago than this is skipped, not recorded.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: f64,
    /// How long old and new recordings run side by side.
    #[serde(default = "default_overlap_secs")]
    pub overlap_secs: f64,
    #[serde(default = "default_startup_overhead_secs")]
    pub startup_overhead_secs: f64,
    /// Extra ffmpeg runtime past the slot end, on top of the overlap.
    #[serde(default = "default_tail_margin_secs")]
    pub tail_margin_secs: f64,
    /// ffmpeg output container; also the file extension.
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Upper bound on a same-slot sleep, so an early ffmpeg exit is noticed.
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: f64,
    #[serde(default = "default_backoff_secs")]
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_crossfade_secs")]
    pub crossfade_secs: f64,
    #[serde(default = "default_crossfade_steps")]
    pub crossfade_steps: u32,
    /// Main-channel volume while an override plays.
    #[serde(default = "default_duck_volume")]
    pub duck_volume: u8,
    #[serde(default = "default_duration_tolerance_secs")]
    pub duration_tolerance_secs: f64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_playback_start_timeout_secs")]
    pub playback_start_timeout_secs: f64,
    /// Monitoring tick.  Must stay at or below one second or overrides are missed.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_override_reload_secs")]
    pub override_reload_secs: u64,
    #[serde(default = "default_override_fade_secs")]
    pub override_fade_secs: f64,
    #[serde(default = "default_backoff_secs")]
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
    #[serde(default = "default_property_timeout_secs")]
    pub property_timeout_secs: f64,
    /// Extra arguments passed to every mpv channel (e.g. `--ao=alsa`).
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_calibration_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tone_a_hz")]
    pub tone_a_hz: f64,
    #[serde(default = "default_tone_b_hz")]
    pub tone_b_hz: f64,
    /// Expected gap between the end of the marker and the end of the file.
    #[serde(default = "default_expected_distance_secs")]
    pub expected_distance_secs: f64,
    /// Larger drifts are treated as false detections.
    #[serde(default = "default_max_drift_secs")]
    pub max_drift_secs: f64,
    /// How much of the file tail is decoded and scanned.
    #[serde(default = "default_scan_window_secs")]
    pub scan_window_secs: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_min_tone_secs")]
    pub min_tone_secs: f64,
}

impl ClockConfig {
    pub fn playback_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.playback_delay_secs as i64)
    }
}

impl ScheduleConfig {
    pub fn url_for(&self, date: chrono::NaiveDate) -> String {
        self.url_template
            .replace("{date}", &date.format("%Y-%m-%d").to_string())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn fetch_retry(&self) -> Duration {
        Duration::from_secs(self.fetch_retry_secs)
    }
}

impl RecorderConfig {
    pub fn overlap(&self) -> Duration {
        secs_f64(self.overlap_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl PlayerConfig {
    pub fn crossfade_step(&self) -> Duration {
        secs_f64(self.crossfade_secs / self.crossfade_steps.max(1) as f64)
    }

    pub fn playback_start_timeout(&self) -> Duration {
        secs_f64(self.playback_start_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.clamp(50, 1000))
    }

    pub fn override_reload(&self) -> Duration {
        Duration::from_secs(self.override_reload_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl MpvConfig {
    pub fn connect_timeout(&self) -> Duration {
        secs_f64(self.connect_timeout_secs)
    }

    pub fn property_timeout(&self) -> Duration {
        secs_f64(self.property_timeout_secs)
    }
}

/// Negative or non-finite inputs collapse to zero instead of panicking.
pub fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            recordings_dir: default_recordings_dir(),
            library_dir: default_library_dir(),
            state_dir: default_state_dir(),
            overrides_file: default_overrides_file(),
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            default_offset_secs: default_offset_secs(),
            playback_delay_secs: default_playback_delay_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            row_selector: default_row_selector(),
            time_selector: default_time_selector(),
            title_selector: default_title_selector(),
            link_selector: default_link_selector(),
            prefetch_after_hour: default_prefetch_after_hour(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            fetch_retry_secs: default_fetch_retry_secs(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            stream_url: String::new(),
            grace_secs: default_grace_secs(),
            overlap_secs: default_overlap_secs(),
            startup_overhead_secs: default_startup_overhead_secs(),
            tail_margin_secs: default_tail_margin_secs(),
            format: default_format(),
            stop_timeout_secs: default_stop_timeout_secs(),
            watch_interval_secs: default_watch_interval_secs(),
            retry_backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            crossfade_secs: default_crossfade_secs(),
            crossfade_steps: default_crossfade_steps(),
            duck_volume: default_duck_volume(),
            duration_tolerance_secs: default_duration_tolerance_secs(),
            lookback_days: default_lookback_days(),
            playback_start_timeout_secs: default_playback_start_timeout_secs(),
            tick_ms: default_tick_ms(),
            override_reload_secs: default_override_reload_secs(),
            override_fade_secs: default_override_fade_secs(),
            retry_backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            property_timeout_secs: default_property_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: default_calibration_enabled(),
            tone_a_hz: default_tone_a_hz(),
            tone_b_hz: default_tone_b_hz(),
            expected_distance_secs: default_expected_distance_secs(),
            max_drift_secs: default_max_drift_secs(),
            scan_window_secs: default_scan_window_secs(),
            sample_rate: default_sample_rate(),
            min_tone_secs: default_min_tone_secs(),
        }
    }
}

fn default_recordings_dir() -> PathBuf {
    platform::data_dir().join("recordings")
}

fn default_library_dir() -> PathBuf {
    dirs::audio_dir()
        .unwrap_or_else(|| platform::data_dir().join("library"))
}

fn default_state_dir() -> PathBuf {
    platform::data_dir()
}

fn default_overrides_file() -> PathBuf {
    platform::config_dir().join("overrides.toml")
}

fn default_offset_secs() -> f64 {
    10.0
}

fn default_playback_delay_secs() -> u64 {
    7200
}

fn default_url_template() -> String {
    "https://example.org/schedule?date={date}".to_string()
}

fn default_row_selector() -> String {
    "table.schedule tr".to_string()
}

fn default_time_selector() -> String {
    "td.time".to_string()
}

fn default_title_selector() -> String {
    "td.title".to_string()
}

fn default_link_selector() -> String {
    "a".to_string()
}

fn default_prefetch_after_hour() -> u32 {
    12
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_fetch_retry_secs() -> u64 {
    60
}

fn default_grace_secs() -> f64 {
    5.0
}

fn default_overlap_secs() -> f64 {
    2.0
}

fn default_startup_overhead_secs() -> f64 {
    1.0
}

fn default_tail_margin_secs() -> f64 {
    10.0
}

fn default_format() -> String {
    "mp3".to_string()
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_watch_interval_secs() -> f64 {
    15.0
}

fn default_backoff_secs() -> u64 {
    5
}

fn default_crossfade_secs() -> f64 {
    5.0
}

fn default_crossfade_steps() -> u32 {
    20
}

fn default_duck_volume() -> u8 {
    10
}

fn default_duration_tolerance_secs() -> f64 {
    5.0
}

fn default_lookback_days() -> u32 {
    30
}

fn default_playback_start_timeout_secs() -> f64 {
    5.0
}

fn default_tick_ms() -> u64 {
    500
}

fn default_override_reload_secs() -> u64 {
    60
}

fn default_override_fade_secs() -> f64 {
    1.0
}

fn default_connect_timeout_secs() -> f64 {
    5.0
}

fn default_property_timeout_secs() -> f64 {
    1.0
}

fn default_calibration_enabled() -> bool {
    true
}

fn default_tone_a_hz() -> f64 {
    1000.0
}

fn default_tone_b_hz() -> f64 {
    1500.0
}

fn default_expected_distance_secs() -> f64 {
    13.0
}

fn default_max_drift_secs() -> f64 {
    60.0
}

fn default_scan_window_secs() -> f64 {
    90.0
}

fn default_sample_rate() -> u32 {
    8000
}

fn default_min_tone_secs() -> f64 {
    0.2
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
