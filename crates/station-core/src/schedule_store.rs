//! Schedule cache: memory → on-disk snapshot → fetch collaborator.
//!
//! ```text
//!   get(date)
//!     ├── cells[date] already initialised  → cached Arc<Schedule>
//!     └── OnceCell::get_or_try_init         (concurrent callers join here)
//!            ├── snapshot <dir>/<date>.json → parse
//!            └── fetcher.fetch_schedule()   → build → persist snapshot
//! ```
//!
//! A failed initialisation leaves the cell empty, so the next caller retries.

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::schedule::{RawSlot, Schedule};

/// Source of schedule rows for a calendar date (web page, API, file...).
#[async_trait]
pub trait ScheduleFetcher: Send + Sync {
    async fn fetch_schedule(&self, date: NaiveDate) -> anyhow::Result<Vec<RawSlot>>;
}

type Cell = Arc<OnceCell<Arc<Schedule>>>;

struct StoreInner {
    fetcher: Arc<dyn ScheduleFetcher>,
    snapshot_dir: PathBuf,
    retry_after: Duration,
    cells: Mutex<HashMap<NaiveDate, Cell>>,
    failures: Mutex<HashMap<NaiveDate, Instant>>,
}

/// Cheaply cloneable handle; clones share one cache.
#[derive(Clone)]
pub struct ScheduleStore {
    inner: Arc<StoreInner>,
}

impl ScheduleStore {
    pub fn new(fetcher: Arc<dyn ScheduleFetcher>, snapshot_dir: PathBuf, retry_after: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                fetcher,
                snapshot_dir,
                retry_after,
                cells: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn snapshot_path(&self, date: NaiveDate) -> PathBuf {
        self.inner
            .snapshot_dir
            .join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    pub async fn get(&self, date: NaiveDate) -> anyhow::Result<Arc<Schedule>> {
        let cell = {
            let mut cells = self.inner.cells.lock().await;
            cells.entry(date).or_default().clone()
        };
        let result = cell
            .get_or_try_init(|| self.load_or_fetch(date))
            .await
            .cloned();
        match &result {
            Ok(_) => {
                self.inner.failures.lock().await.remove(&date);
            }
            Err(_) => {
                self.inner.failures.lock().await.insert(date, Instant::now());
            }
        }
        result
    }

    /// Whether `date` is already in memory.
    pub async fn is_cached(&self, date: NaiveDate) -> bool {
        let cells = self.inner.cells.lock().await;
        cells.get(&date).map(|c| c.initialized()).unwrap_or(false)
    }

    /// Pre-fetch `date` without blocking the caller.  Skipped while the date is
    /// cached, or while a recent failure for it is cooling down.
    pub async fn ensure_in_background(&self, date: NaiveDate) {
        if self.is_cached(date).await {
            return;
        }
        {
            let failures = self.inner.failures.lock().await;
            if let Some(at) = failures.get(&date) {
                if at.elapsed() < self.inner.retry_after {
                    return;
                }
            }
        }
        // Mark as attempted now so a slow fetch is not re-spawned every tick.
        self.inner.failures.lock().await.insert(date, Instant::now());

        let store = self.clone();
        tokio::spawn(async move {
            match store.get(date).await {
                Ok(schedule) => info!(
                    "schedule {}: pre-fetched {} slots",
                    date,
                    schedule.slots.len()
                ),
                Err(e) => warn!("schedule {}: background fetch failed: {:#}", date, e),
            }
        });
    }

    async fn load_or_fetch(&self, date: NaiveDate) -> anyhow::Result<Arc<Schedule>> {
        if let Some(schedule) = self.read_snapshot(date).await {
            debug!("schedule {}: loaded from snapshot", date);
            return Ok(Arc::new(schedule));
        }

        info!("schedule {}: fetching", date);
        let rows = self
            .inner
            .fetcher
            .fetch_schedule(date)
            .await
            .with_context(|| format!("fetching schedule for {}", date))?;
        let schedule = Schedule::from_raw(date, rows);
        if schedule.is_empty() {
            anyhow::bail!("schedule for {} has no schedulable slots", date);
        }

        if let Err(e) = self.write_snapshot(&schedule).await {
            warn!("schedule {}: snapshot not written: {:#}", date, e);
        }
        info!("schedule {}: {} slots", date, schedule.slots.len());
        Ok(Arc::new(schedule))
    }

    async fn read_snapshot(&self, date: NaiveDate) -> Option<Schedule> {
        let path = self.snapshot_path(date);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str::<Schedule>(&content) {
            Ok(schedule) if schedule.date == date && !schedule.is_empty() => Some(schedule),
            Ok(_) => {
                warn!("schedule snapshot {:?} does not match {}, ignoring", path, date);
                None
            }
            Err(e) => {
                warn!("schedule snapshot {:?} unreadable: {}", path, e);
                None
            }
        }
    }

    async fn write_snapshot(&self, schedule: &Schedule) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.inner.snapshot_dir).await?;
        let path = self.snapshot_path(schedule.date);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(schedule)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
