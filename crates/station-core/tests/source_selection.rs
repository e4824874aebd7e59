use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use station_core::config::PlayerConfig;
use station_core::library::SongLibrary;
use station_core::probe::DurationProbe;
use station_core::recordings::{cleanup_duplicates, RecordingName, RecordingsLayout};
use station_core::schedule::{ResolvedSlot, Slot};
use station_core::selector::{next_filler, SourceKind, SourceSelector};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Duration in seconds is read from the file contents, e.g. `b"3600"`.
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

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
}

fn news_slot() -> ResolvedSlot {
    ResolvedSlot {
        date: today(),
        slot: Slot {
            start_seconds: 7 * 3600,
            identifier: "news".to_string(),
            display_label: "News".to_string(),
            raw_time_text: "7:00 AM".to_string(),
        },
        window_start: 7 * 3600,
        end_seconds: 8 * 3600,
    }
}

fn write_recording(layout: &RecordingsLayout, date: NaiveDate, file: &str, secs: f64) -> PathBuf {
    let dir = layout.day_dir(date);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file);
    std::fs::write(&path, secs.to_string()).unwrap();
    path
}

fn selector(root: &Path) -> (RecordingsLayout, SourceSelector) {
    let layout = RecordingsLayout::new(root.join("recordings"));
    let selector = SourceSelector::new(layout.clone(), Arc::new(ContentProbe), &PlayerConfig::default());
    (layout, selector)
}

fn library(root: &Path) -> SongLibrary {
    SongLibrary::open(
        root.join("music"),
        root.join("state/durations.json"),
        root.join("state/queue.json"),
        Arc::new(ContentProbe),
    )
}

#[tokio::test]
async fn yesterdays_recording_is_used_when_today_has_none() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, selector) = selector(dir.path());
    let yesterday = today() - Duration::days(1);
    let path = write_recording(&layout, yesterday, "07_news_60m.mp3", 3600.0);

    let source = selector
        .select_recording(&news_slot(), today(), 600.0, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(source.kind, SourceKind::Recording);
    assert_eq!(source.path, path);
    assert_eq!(source.start_offset_secs, 600.0);
}

#[tokio::test]
async fn nothing_older_than_lookback_is_used() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, selector) = selector(dir.path());
    write_recording(&layout, today() - Duration::days(31), "07_news_60m.mp3", 3600.0);

    assert!(selector
        .select_recording(&news_slot(), today(), 0.0, &HashSet::new())
        .await
        .is_none());

    let edge = write_recording(&layout, today() - Duration::days(30), "07_news_60m.mp3", 3600.0);
    let source = selector
        .select_recording(&news_slot(), today(), 0.0, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(source.path, edge);
}

#[tokio::test]
async fn short_recording_is_deleted_and_filler_used() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, selector) = selector(dir.path());
    let short = write_recording(&layout, today(), "07_news_60m.mp3", 1200.0);
    let music = dir.path().join("music");
    std::fs::create_dir_all(&music).unwrap();
    std::fs::write(music.join("song.mp3"), "240").unwrap();

    let mut lib = library(dir.path());
    let source = selector
        .select(&news_slot(), today(), 0.0, &HashSet::new(), &mut lib)
        .await
        .unwrap();
    assert!(source.is_filler());
    assert_eq!(source.duration_secs, 240.0);
    assert!(!short.exists());
}

#[tokio::test]
async fn short_recording_today_falls_back_to_an_older_take() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, selector) = selector(dir.path());
    write_recording(&layout, today(), "07_news_60m.mp3", 100.0);
    let older = write_recording(&layout, today() - Duration::days(2), "07_news_60m.mp3", 3610.0);

    let source = selector
        .select_recording(&news_slot(), today(), 3605.0, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(source.path, older);
    assert_eq!(source.start_offset_secs, 3605.0);
}

#[tokio::test]
async fn offset_wraps_and_failed_paths_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, selector) = selector(dir.path());
    let long = write_recording(&layout, today(), "07_news_60m.mp3", 3600.0);
    let fallback = write_recording(&layout, today() - Duration::days(1), "07_news_60m.mp3", 3598.0);

    let source = selector
        .select_recording(&news_slot(), today(), 3599.0, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(source.path, long);

    let failed: HashSet<PathBuf> = [long].into_iter().collect();
    let source = selector
        .select_recording(&news_slot(), today(), 3599.0, &failed)
        .await
        .unwrap();
    assert_eq!(source.path, fallback);
    assert_eq!(source.start_offset_secs, 1.0);
}

#[tokio::test]
async fn unknown_duration_is_skipped_but_kept() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, selector) = selector(dir.path());
    let unknown = write_recording(&layout, today(), "07_news_60m.mp3", 0.0);

    assert!(selector
        .select_recording(&news_slot(), today(), 0.0, &HashSet::new())
        .await
        .is_none());
    assert!(unknown.exists());
}

#[tokio::test]
async fn duplicate_cleanup_keeps_longest_under_canonical_name() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RecordingsLayout::new(dir.path().join("recordings"));
    let canonical = write_recording(&layout, today(), "07_news_60m.mp3", 1800.0);
    let longer = write_recording(&layout, today(), "07_news_60m.1.mp3", 3590.0);
    let shorter = write_recording(&layout, today(), "07_news_60m.2.mp3", 600.0);
    let unrelated = write_recording(&layout, today(), "08_weather_60m.mp3", 3600.0);

    let name = RecordingName::for_slot(&news_slot(), "mp3");
    let kept = cleanup_duplicates(&layout, today(), &name, &ContentProbe)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(kept, canonical);
    assert_eq!(std::fs::read_to_string(&kept).unwrap(), "3590");
    assert!(!longer.exists());
    assert!(!shorter.exists());
    assert!(unrelated.exists());
}

#[tokio::test]
async fn filler_search_survives_a_rescan_mid_search() {
    for _ in 0..20 {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).unwrap();
        let bad = music.join("bad.mp3");
        let good = music.join("good.mp3");
        std::fs::write(&bad, "200").unwrap();
        std::fs::write(&good, "180").unwrap();

        // Only the failed song is left in the persisted queue.
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(
            dir.path().join("state/queue.json"),
            serde_json::to_string(&vec![bad.clone()]).unwrap(),
        )
        .unwrap();

        let mut lib = library(dir.path());
        let failed: HashSet<PathBuf> = [bad].into_iter().collect();
        let source = next_filler(&mut lib, &failed).await.expect("good.mp3 is playable");
        assert_eq!(source.path, good);
        assert_eq!(source.kind, SourceKind::Filler);
    }
}

#[tokio::test]
async fn filler_search_gives_up_when_every_song_failed() {
    let dir = tempfile::tempdir().unwrap();
    let music = dir.path().join("music");
    std::fs::create_dir_all(&music).unwrap();
    let bad = music.join("bad.mp3");
    std::fs::write(&bad, "200").unwrap();

    let mut lib = library(dir.path());
    let failed: HashSet<PathBuf> = [bad].into_iter().collect();
    assert!(next_filler(&mut lib, &failed).await.is_none());
}
