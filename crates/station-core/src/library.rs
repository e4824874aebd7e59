//! Filler music: a persisted path → duration cache plus a persisted shuffled
//! queue consumed head-first.  An empty queue triggers a full rescan.

use rand::seq::SliceRandom;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::platform;
use crate::probe::DurationProbe;

/// A library track chosen as filler.
#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    pub path: PathBuf,
    pub duration_secs: f64,
}

pub struct SongLibrary {
    library_dir: PathBuf,
    cache_path: PathBuf,
    queue_path: PathBuf,
    probe: Arc<dyn DurationProbe>,
    durations: BTreeMap<String, f64>,
    queue: VecDeque<PathBuf>,
}

impl SongLibrary {
    /// Open the library, restoring the cache and queue from disk if present.
    pub fn open(
        library_dir: PathBuf,
        cache_path: PathBuf,
        queue_path: PathBuf,
        probe: Arc<dyn DurationProbe>,
    ) -> Self {
        let durations: BTreeMap<String, f64> = read_json(&cache_path).unwrap_or_default();
        let queue: Vec<PathBuf> = read_json(&queue_path).unwrap_or_default();
        debug!(
            "library: {} cached durations, {} queued",
            durations.len(),
            queue.len()
        );
        Self {
            library_dir,
            cache_path,
            queue_path,
            probe,
            durations,
            queue: queue.into(),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Pop the next playable song.  Entries that vanished from disk or have no
    /// known duration are skipped; an exhausted queue is regenerated once.
    pub async fn next_song(&mut self) -> Option<Song> {
        let mut rescanned = false;
        loop {
            if self.queue.is_empty() {
                if rescanned {
                    warn!("library: no playable songs in {:?}", self.library_dir);
                    return None;
                }
                if let Err(e) = self.rescan().await {
                    warn!("library: rescan failed: {:#}", e);
                    return None;
                }
                rescanned = true;
                continue;
            }

            let path = self.queue.pop_front()?;
            self.persist_queue();

            if !path.exists() {
                debug!("library: {:?} no longer exists, skipping", path);
                continue;
            }
            let key = path.to_string_lossy().to_string();
            let mut duration = self.durations.get(&key).copied().unwrap_or(0.0);
            if duration <= 0.0 {
                duration = self.probe.probe_duration(&path).await;
                self.durations.insert(key, duration);
                self.persist_cache();
            }
            if duration <= 0.0 {
                debug!("library: {:?} has unknown duration, skipping", path);
                continue;
            }
            return Some(Song {
                path,
                duration_secs: duration,
            });
        }
    }

    /// Walk the library directory, refresh the duration cache and build a new
    /// shuffled queue.
    pub async fn rescan(&mut self) -> anyhow::Result<()> {
        let dir = self.library_dir.clone();
        let files: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && platform::is_audio_file(e.path()))
                .map(|e| e.into_path())
                .collect()
        })
        .await?;

        let present: std::collections::HashSet<String> =
            files.iter().map(|p| p.to_string_lossy().to_string()).collect();
        self.durations.retain(|k, _| present.contains(k));

        let mut probed = 0usize;
        for path in &files {
            let key = path.to_string_lossy().to_string();
            if self.durations.get(&key).copied().unwrap_or(0.0) > 0.0 {
                continue;
            }
            let duration = self.probe.probe_duration(path).await;
            self.durations.insert(key, duration);
            probed += 1;
        }

        let mut playable: Vec<PathBuf> = files
            .into_iter()
            .filter(|p| {
                self.durations
                    .get(p.to_string_lossy().as_ref())
                    .copied()
                    .unwrap_or(0.0)
                    > 0.0
            })
            .collect();
        playable.shuffle(&mut rand::thread_rng());

        info!(
            "library: rescan found {} playable songs ({} probed)",
            playable.len(),
            probed
        );
        self.queue = playable.into();
        self.persist_cache();
        self.persist_queue();
        Ok(())
    }

    fn persist_cache(&self) {
        if let Err(e) = write_json(&self.cache_path, &self.durations) {
            warn!("library: could not write duration cache: {:#}", e);
        }
    }

    fn persist_queue(&self) {
        let queue: Vec<&PathBuf> = self.queue.iter().collect();
        if let Err(e) = write_json(&self.queue_path, &queue) {
            warn!("library: could not write queue: {:#}", e);
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("library: {:?} unreadable, starting fresh: {}", path, e);
            None
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Duration is the file size in bytes; empty files are "unknown".
    struct SizeProbe;

    #[async_trait]
    impl DurationProbe for SizeProbe {
        async fn probe_duration(&self, path: &Path) -> f64 {
            std::fs::metadata(path).map(|m| m.len() as f64).unwrap_or(0.0)
        }
    }

    fn library(root: &Path) -> SongLibrary {
        SongLibrary::open(
            root.join("music"),
            root.join("state/durations.json"),
            root.join("state/queue.json"),
            Arc::new(SizeProbe),
        )
    }

    #[tokio::test]
    async fn test_rescan_and_consume_whole_queue() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music/sub");
        std::fs::create_dir_all(&music).unwrap();
        std::fs::write(music.join("a.mp3"), b"aaaa").unwrap();
        std::fs::write(music.join("b.ogg"), b"bb").unwrap();
        std::fs::write(music.join("empty.mp3"), b"").unwrap();
        std::fs::write(music.join("cover.jpg"), b"jpeg").unwrap();

        let mut lib = library(dir.path());
        let mut seen = Vec::new();
        for _ in 0..2 {
            let song = lib.next_song().await.unwrap();
            assert!(song.duration_secs > 0.0);
            seen.push(song.path.file_name().unwrap().to_string_lossy().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["a.mp3", "b.ogg"]);
        assert_eq!(lib.queued(), 0);

        // Exhausted queue regenerates from a rescan.
        assert!(lib.next_song().await.is_some());
        assert_eq!(lib.queued(), 1);
    }

    #[tokio::test]
    async fn test_queue_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).unwrap();
        for name in ["1.mp3", "2.mp3", "3.mp3"] {
            std::fs::write(music.join(name), b"xyz").unwrap();
        }

        let mut lib = library(dir.path());
        let first = lib.next_song().await.unwrap();
        drop(lib);

        let mut reopened = library(dir.path());
        assert_eq!(reopened.queued(), 2);
        let second = reopened.next_song().await.unwrap();
        assert_ne!(first.path, second.path);
    }

    #[tokio::test]
    async fn test_vanished_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).unwrap();
        std::fs::write(music.join("keep.mp3"), b"k").unwrap();
        std::fs::write(music.join("gone.mp3"), b"g").unwrap();

        let mut lib = library(dir.path());
        lib.rescan().await.unwrap();
        std::fs::remove_file(music.join("gone.mp3")).unwrap();

        let song = lib.next_song().await.unwrap();
        assert!(song.path.ends_with("keep.mp3"));
    }

    #[tokio::test]
    async fn test_empty_library_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut lib = library(dir.path());
        assert!(lib.next_song().await.is_none());
    }
}
