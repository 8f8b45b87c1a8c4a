use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use log::{error, info, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::dataset::{HistoryDataset, MergeSummary};
use super::lock::{LockFile, sibling};
use crate::config::HistoryConfig;
use crate::error::HistoryError;
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::RateObservation;

/// Sole writer of the on-disk rolling dataset.
///
/// Every merge is a full read-modify-write cycle under exclusive access:
/// an in-process mutex serializes merges from the same store, and a
/// `<path>.lock` file serializes them across processes.
///
/// GUARANTEES:
/// - Readers never see a half-written file (temp file + rename)
/// - A missing dataset starts empty
/// - A corrupt dataset is copied to `<path>.corrupt` and replaced;
///   the merge proceeds from an empty dataset
pub struct HistoryStore {
    path: PathBuf,
    retention: usize,
    lock_timeout: Duration,
    guard: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, retention: usize, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            retention: retention.max(1),
            lock_timeout,
            guard: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &HistoryConfig) -> Self {
        Self::new(
            cfg.path.clone(),
            cfg.retention_days,
            Duration::from_secs(cfg.lock_timeout_secs),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current dataset, normalized.
    ///
    /// Returns `Corrupt` for malformed content; callers that only read
    /// (chart generation) decide what to do with it.
    pub async fn load(&self) -> Result<HistoryDataset, HistoryError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HistoryDataset::default()),
            Err(e) => {
                return Err(HistoryError::Read {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };

        if raw.trim().is_empty() {
            return Ok(HistoryDataset::default());
        }

        let mut ds: HistoryDataset =
            serde_json::from_str(&raw).map_err(|e| HistoryError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        ds.normalize(self.retention);
        Ok(ds)
    }

    /// Merges into today's entry (local calendar date).
    pub async fn merge(
        &self,
        observations: &[RateObservation],
    ) -> Result<MergeSummary, HistoryError> {
        self.merge_on(Local::now().date_naive(), observations).await
    }

    pub async fn merge_on(
        &self,
        date: NaiveDate,
        observations: &[RateObservation],
    ) -> Result<MergeSummary, HistoryError> {
        let result = self.merge_locked(date, observations).await;

        match &result {
            Ok(summary) => {
                RuntimeMetrics::incr(&METRICS.merges_written);
                info!("history {} updated, {summary}", self.path.display());
            }
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.merge_failures);
                error!("history merge failed: {e}");
            }
        }
        result
    }

    async fn merge_locked(
        &self,
        date: NaiveDate,
        observations: &[RateObservation],
    ) -> Result<MergeSummary, HistoryError> {
        let _guard = self.guard.lock().await;

        // the lock file lives next to the dataset
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await.map_err(|source| HistoryError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let _lock = LockFile::acquire(&self.path, self.lock_timeout).await?;

        let mut ds = match self.load().await {
            Ok(ds) => ds,
            Err(HistoryError::Corrupt { reason, .. }) => {
                self.quarantine(&reason).await;
                HistoryDataset::default()
            }
            Err(e) => return Err(e),
        };

        let summary = ds.merge(date, observations, self.retention);
        self.write_atomic(&ds).await?;
        Ok(summary)
    }

    async fn quarantine(&self, reason: &str) {
        RuntimeMetrics::incr(&METRICS.corrupt_recoveries);
        let backup = sibling(&self.path, ".corrupt");
        match fs::copy(&self.path, &backup).await {
            Ok(_) => warn!(
                "history {} is corrupt ({reason}); saved as {}, starting empty",
                self.path.display(),
                backup.display()
            ),
            Err(e) => warn!(
                "history {} is corrupt ({reason}); backup failed ({e}), starting empty",
                self.path.display()
            ),
        }
    }

    async fn write_atomic(&self, ds: &HistoryDataset) -> Result<(), HistoryError> {
        let json = serde_json::to_vec_pretty(ds)?;
        let tmp = sibling(&self.path, &format!(".tmp.{}", std::process::id()));

        let written = async {
            let mut f = fs::File::create(&tmp).await?;
            f.write_all(&json).await?;
            f.write_all(b"\n").await?;
            f.sync_all().await?;
            drop(f);
            fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(source) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(HistoryError::Write {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}
