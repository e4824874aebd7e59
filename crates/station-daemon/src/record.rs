//! ffmpeg recording channel: stream-copies the station feed into a `.part`
//! file.  A requested stop writes `q` to ffmpeg's stdin so the container is
//! closed cleanly; the process is killed only if that does not work in time.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelState};

/// A capture of the station stream into a `.part` file.
#[async_trait]
pub trait Recording: Send + Sync {
    fn label(&self) -> &str;
    fn part_path(&self) -> &Path;
    async fn state(&self) -> ChannelState;
    /// Ask the capture to finish, wait up to `timeout`, then kill.  Returns
    /// the exit code if the process exited on its own terms.
    async fn stop(&self, timeout: Duration) -> Option<i32>;

    /// Error form of an exit nobody asked for.
    fn unexpected_exit(&self, code: Option<i32>) -> ChannelError {
        ChannelError::Exited {
            label: self.label().to_string(),
            code,
        }
    }
}

#[async_trait]
pub trait RecordLauncher: Send + Sync {
    async fn start(
        &self,
        stream_url: &str,
        format: &str,
        part_path: &Path,
        cap: Duration,
    ) -> Result<Box<dyn Recording>, ChannelError>;
}

pub struct FfmpegRecordLauncher {
    ffmpeg: PathBuf,
}

impl FfmpegRecordLauncher {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }
}

#[async_trait]
impl RecordLauncher for FfmpegRecordLauncher {
    async fn start(
        &self,
        stream_url: &str,
        format: &str,
        part_path: &Path,
        cap: Duration,
    ) -> Result<Box<dyn Recording>, ChannelError> {
        let channel = RecordChannel::start(&self.ffmpeg, stream_url, format, part_path, cap).await?;
        Ok(Box::new(channel))
    }
}

pub struct RecordChannel {
    label: String,
    part_path: PathBuf,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    state: Mutex<ChannelState>,
}

impl RecordChannel {
    /// Start recording `stream_url` into `part_path` for at most `cap`.
    pub async fn start(
        ffmpeg: &Path,
        stream_url: &str,
        format: &str,
        part_path: &Path,
        cap: Duration,
    ) -> Result<Self, ChannelError> {
        let label = part_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "recording".to_string());

        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"])
            .arg("-i")
            .arg(stream_url)
            .arg("-t")
            .arg(format!("{:.3}", cap.as_secs_f64()))
            .args(["-vn", "-c", "copy", "-f", format])
            .arg(part_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ChannelError::Spawn {
                label: label.clone(),
                program: ffmpeg.display().to_string(),
                source,
            })?;
        let stdin = child.stdin.take();
        info!("record {}: started, cap {:.0}s", label, cap.as_secs_f64());

        Ok(Self {
            label,
            part_path: part_path.to_path_buf(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            state: Mutex::new(ChannelState::Running),
        })
    }
}

#[async_trait]
impl Recording for RecordChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn part_path(&self) -> &Path {
        &self.part_path
    }

    async fn state(&self) -> ChannelState {
        let mut state = self.state.lock().await;
        if !state.is_exited() {
            if let Ok(Some(status)) = self.child.lock().await.try_wait() {
                *state = ChannelState::Exited(status.code());
            }
        }
        *state
    }

    async fn stop(&self, timeout: Duration) -> Option<i32> {
        {
            let mut state = self.state.lock().await;
            if let ChannelState::Exited(code) = *state {
                return code;
            }
            *state = ChannelState::Stopping;
        }

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!("record {}: could not send quit: {}", self.label, e);
            }
            drop(stdin);
        }

        let code = {
            let mut child = self.child.lock().await;
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => {
                    warn!("record {}: wait failed: {}", self.label, e);
                    None
                }
                Err(_) => {
                    warn!("record {}: no exit after {:?}, killing", self.label, timeout);
                    let _ = child.kill().await;
                    None
                }
            }
        };
        *self.state.lock().await = ChannelState::Exited(code);
        debug!("record {}: stopped ({:?})", self.label, code);
        code
    }
}

/// Move a finished `.part` file to its final name.  Returns `false` when there
/// was nothing worth keeping.
pub async fn promote_part(part_path: &Path, final_path: &Path) -> anyhow::Result<bool> {
    match tokio::fs::metadata(part_path).await {
        Ok(meta) if meta.len() > 0 => {
            tokio::fs::rename(part_path, final_path).await?;
            Ok(true)
        }
        Ok(_) => {
            let _ = tokio::fs::remove_file(part_path).await;
            Ok(false)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
