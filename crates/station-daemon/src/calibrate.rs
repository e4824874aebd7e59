//! Decodes the tail of a finished recording and feeds it to the marker
//! detector.  Runs inside the detached finalize task, so its only output is
//! the offset file.

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use station_core::calibration::{calibrate_tail, decode_s16le};
use station_core::clock::OffsetStore;
use station_core::config::CalibrationConfig;

const DECODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Decode the last `scan_window_secs` of `path` to mono s16le PCM.
async fn decode_tail(ffmpeg: &Path, path: &Path, config: &CalibrationConfig) -> anyhow::Result<Vec<f32>> {
    let rate = config.sample_rate.max(1).to_string();
    let window = format!("-{:.3}", config.scan_window_secs.max(1.0));
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
        .args(["-sseof", &window])
        .arg("-i")
        .arg(path)
        .args(["-vn", "-ac", "1", "-ar", &rate, "-f", "s16le", "pipe:1"])
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(DECODE_TIMEOUT, output)
        .await
        .context("tail decode timed out")?
        .context("running ffmpeg for tail decode")?;
    if !output.status.success() {
        anyhow::bail!("ffmpeg tail decode exited with {}", output.status);
    }
    Ok(decode_s16le(&output.stdout))
}

/// Look for the marker near the end of `path` and persist a corrected offset.
/// Returns the new offset if one was written.
async fn calibrate_recording(
    ffmpeg: &Path,
    path: &Path,
    config: &CalibrationConfig,
    offsets: &OffsetStore,
) -> anyhow::Result<Option<f64>> {
    let samples = decode_tail(ffmpeg, path, config).await?;
    debug!("calibration: decoded {} samples from {:?}", samples.len(), path);

    let current = offsets.load();
    let Some(updated) = calibrate_tail(&samples, current, config) else {
        return Ok(None);
    };
    offsets.save(updated)?;
    info!("calibration: saved offset {:.1} to {:?}", updated, offsets.path());
    Ok(Some(updated))
}

/// Turns a finished recording into an offset correction.
#[async_trait]
pub trait OffsetCalibrator: Send + Sync {
    async fn calibrate(&self, path: &Path) -> anyhow::Result<Option<f64>>;
}

pub struct TailCalibrator {
    ffmpeg: PathBuf,
    config: CalibrationConfig,
    offsets: OffsetStore,
}

impl TailCalibrator {
    pub fn new(ffmpeg: PathBuf, config: CalibrationConfig, offsets: OffsetStore) -> Self {
        Self {
            ffmpeg,
            config,
            offsets,
        }
    }
}

#[async_trait]
impl OffsetCalibrator for TailCalibrator {
    async fn calibrate(&self, path: &Path) -> anyhow::Result<Option<f64>> {
        calibrate_recording(&self.ffmpeg, path, &self.config, &self.offsets).await
    }
}
