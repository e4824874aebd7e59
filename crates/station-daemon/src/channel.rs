//! Audio channel abstraction shared by the playback decks and the override
//! channel.  The mpv implementation lives in `mpv.rs`; tests drive the
//! crossfader through in-memory doubles.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Starting,
    Running,
    Stopping,
    /// The process is gone.  `Some(0)` after a stop we did not request means
    /// the source played to its end.
    Exited(Option<i32>),
}

impl ChannelState {
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited(_))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{label}: could not spawn {program}: {source}")]
    Spawn {
        label: String,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{label}: control socket not reachable after {after:?}")]
    ConnectTimeout { label: String, after: Duration },
    #[error("{label}: `{name}` got no reply within {after:?}")]
    PropertyTimeout {
        label: String,
        name: String,
        after: Duration,
    },
    #[error("{label}: playback did not start within {after:?}")]
    PlaybackStartTimeout { label: String, after: Duration },
    #[error("{label}: ipc failure: {message}")]
    Ipc { label: String, message: String },
    #[error("{label}: exited unexpectedly ({code:?})")]
    Exited { label: String, code: Option<i32> },
}

/// A running audio source with volume control.
#[async_trait]
pub trait PlaybackChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn state(&self) -> ChannelState;

    /// Volume in percent, 0..=100.
    async fn set_volume(&self, volume: u8) -> Result<(), ChannelError>;

    /// `Ok(None)` when the property exists but has no value yet.
    async fn get_property(&self, name: &str) -> Result<Option<Value>, ChannelError>;

    /// Stop and reap the channel.  Calling it again is a no-op.
    async fn stop(&self);
}

#[async_trait]
pub trait ChannelLauncher: Send + Sync {
    async fn start(
        &self,
        label: &str,
        path: &Path,
        offset_secs: f64,
        volume: u8,
    ) -> Result<Box<dyn PlaybackChannel>, ChannelError>;
}

/// Current playback position, or `None` if the channel has not started yet.
pub async fn playback_position(channel: &dyn PlaybackChannel) -> Result<Option<f64>, ChannelError> {
    Ok(channel
        .get_property("time-pos")
        .await?
        .and_then(|v| v.as_f64()))
}

/// Poll until the channel reports a position past zero.
pub async fn wait_for_playback(channel: &dyn PlaybackChannel, timeout: Duration) -> Result<(), ChannelError> {
    let poll = Duration::from_millis(100).min(timeout.max(Duration::from_millis(1)));
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let ChannelState::Exited(code) = channel.state().await {
            return Err(ChannelError::Exited {
                label: channel.label().to_string(),
                code,
            });
        }
        match playback_position(channel).await {
            Ok(Some(pos)) if pos > 0.0 => return Ok(()),
            Ok(_) => {}
            Err(ChannelError::PropertyTimeout { .. }) => {}
            Err(e) => return Err(e),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ChannelError::PlaybackStartTimeout {
                label: channel.label().to_string(),
                after: timeout,
            });
        }
        tokio::time::sleep(poll).await;
    }
}
