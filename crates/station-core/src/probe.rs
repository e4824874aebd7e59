//! Duration probing.  `0.0` always means "unknown, probe again later", never a
//! genuinely empty file.

use async_trait::async_trait;
use lofty::prelude::*;
use lofty::probe::Probe;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const FFPROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn probe_duration(&self, path: &Path) -> f64;
}

/// Reads the duration from container headers with lofty, falling back to
/// ffprobe for streams lofty cannot size (e.g. headerless stream copies).
#[derive(Debug, Clone, Default)]
pub struct MediaProbe {
    ffprobe: Option<PathBuf>,
}

impl MediaProbe {
    pub fn new() -> Self {
        Self {
            ffprobe: crate::platform::find_ffprobe_binary(),
        }
    }
}

#[async_trait]
impl DurationProbe for MediaProbe {
    async fn probe_duration(&self, path: &Path) -> f64 {
        let owned = path.to_path_buf();
        let from_tags = tokio::task::spawn_blocking(move || lofty_duration(&owned))
            .await
            .unwrap_or(0.0);
        if from_tags > 0.0 {
            return from_tags;
        }

        match &self.ffprobe {
            Some(ffprobe) => ffprobe_duration(ffprobe, path, FFPROBE_TIMEOUT).await,
            None => 0.0,
        }
    }
}

fn lofty_duration(path: &Path) -> f64 {
    let tagged = match Probe::open(path).and_then(|p| p.read()) {
        Ok(t) => t,
        Err(e) => {
            debug!("probe: lofty could not read {:?}: {}", path, e);
            return 0.0;
        }
    };
    tagged.properties().duration().as_secs_f64()
}

async fn ffprobe_duration(ffprobe: &Path, path: &Path, timeout: Duration) -> f64 {
    let output = tokio::process::Command::new(ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0"])
        .arg(path)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();
    let Ok(output) = tokio::time::timeout(timeout, output).await else {
        warn!("probe: ffprobe gave no answer for {:?} within {:?}", path, timeout);
        return 0.0;
    };
    match output {
        Ok(out) if out.status.success() => parse_ffprobe_duration(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            debug!("probe: ffprobe exited {:?} for {:?}", out.status.code(), path);
            0.0
        }
        Err(e) => {
            debug!("probe: ffprobe spawn failed: {}", e);
            0.0
        }
    }
}

fn parse_ffprobe_duration(stdout: &str) -> f64 {
    stdout
        .lines()
        .next()
        .and_then(|l| l.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ffprobe_output() {
        assert_eq!(parse_ffprobe_duration("3599.973878\n"), 3599.973878);
        assert_eq!(parse_ffprobe_duration("N/A\n"), 0.0);
        assert_eq!(parse_ffprobe_duration(""), 0.0);
        assert_eq!(parse_ffprobe_duration("-1\n"), 0.0);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-audio.mp3");
        std::fs::write(&path, b"definitely not an mp3").unwrap();
        let probe = MediaProbe { ffprobe: None };
        assert_eq!(probe.probe_duration(&path).await, 0.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_ffprobe_is_unknown() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ffprobe");
        {
            let mut file = std::fs::File::create(&script).unwrap();
            file.write_all(b"#!/bin/sh\nsleep 30\n").unwrap();
            file.sync_all().unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let started = tokio::time::Instant::now();
        let duration = ffprobe_duration(&script, &dir.path().join("x.mp3"), Duration::from_millis(300)).await;
        assert_eq!(duration, 0.0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
