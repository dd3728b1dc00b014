//! Tracking code persistence
//!
//! `TrackingRepository` is the narrow storage boundary used by the use cases.
//! `InMemoryTrackingRepository` keeps plain `TrackingRecord`s keyed by the
//! natural code and can be snapshotted to a JSONL file (one record per line).
//! Records are only turned back into aggregates through
//! `TrackingCode::from_record`, so a corrupt snapshot line is rejected
//! instead of producing an aggregate with broken invariants.

use crate::domain::error::ValidationError;
use crate::domain::tracking::{TrackingCode, TrackingRecord};
use crate::domain::types::{TrackingCodeValue, TrackingStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("stored record is invalid: {0}")]
    Corrupt(#[from] ValidationError),

    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Outcome of a retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub codes_touched: usize,
    pub events_removed: usize,
}

#[async_trait]
pub trait TrackingRepository: Send + Sync {
    async fn find_by_code(&self, code: &TrackingCodeValue) -> Result<Option<TrackingCode>, RepositoryError>;

    /// Insert or replace, keyed by the natural code
    async fn upsert(&self, tracking: &TrackingCode) -> Result<(), RepositoryError>;

    /// Active codes with `next_check_at <= now`, oldest-due first
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TrackingCode>, RepositoryError>;

    /// Every active code, least recently checked first
    async fn find_all(&self, limit: usize) -> Result<Vec<TrackingCode>, RepositoryError>;

    async fn count_by_status(&self, status: TrackingStatus) -> Result<usize, RepositoryError>;

    /// Drop events older than `cutoff` from every code (the latest event of
    /// each code is always kept)
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryTrackingRepository {
    records: RwLock<FxHashMap<String, TrackingRecord>>,
}

impl InMemoryTrackingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Load a JSONL snapshot. A missing file yields an empty repository.
    ///
    /// Every line must decode and validate; the first bad line fails the load.
    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        let repo = Self::new();
        if !path.exists() {
            info!(file = %path.display(), "snapshot_missing_starting_empty");
            return Ok(repo);
        }

        let reader = BufReader::new(File::open(path)?);
        {
            let mut records = repo.records.write();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: TrackingRecord = serde_json::from_str(&line)?;
                // Validate before accepting
                let tracking = TrackingCode::from_record(record)?;
                records.insert(tracking.code().as_str().to_string(), tracking.to_record());
            }
        }

        info!(file = %path.display(), records = %repo.len(), "snapshot_loaded");
        Ok(repo)
    }

    /// Write all records as JSONL, replacing the file atomically
    pub fn write_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<usize, RepositoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut records: Vec<TrackingRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.code.cmp(&b.code));

        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for record in &records {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;

        debug!(file = %path.display(), records = %records.len(), "snapshot_written");
        Ok(records.len())
    }

    fn hydrate(record: &TrackingRecord) -> Option<TrackingCode> {
        match TrackingCode::from_record(record.clone()) {
            Ok(tracking) => Some(tracking),
            Err(e) => {
                warn!(code = %record.code, error = %e, "stored_record_skipped");
                None
            }
        }
    }
}

#[async_trait]
impl TrackingRepository for InMemoryTrackingRepository {
    async fn find_by_code(&self, code: &TrackingCodeValue) -> Result<Option<TrackingCode>, RepositoryError> {
        let records = self.records.read();
        match records.get(code.as_str()) {
            Some(record) => Ok(Some(TrackingCode::from_record(record.clone())?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, tracking: &TrackingCode) -> Result<(), RepositoryError> {
        self.records.write().insert(tracking.code().as_str().to_string(), tracking.to_record());
        Ok(())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TrackingCode>, RepositoryError> {
        let records = self.records.read();
        let mut due: Vec<&TrackingRecord> =
            records.values().filter(|r| r.active && r.next_check_at <= now).collect();
        due.sort_by(|a, b| a.next_check_at.cmp(&b.next_check_at).then_with(|| a.code.cmp(&b.code)));
        Ok(due.into_iter().take(limit).filter_map(Self::hydrate).collect())
    }

    async fn find_all(&self, limit: usize) -> Result<Vec<TrackingCode>, RepositoryError> {
        let records = self.records.read();
        let mut all: Vec<&TrackingRecord> = records.values().filter(|r| r.active).collect();
        all.sort_by(|a, b| a.last_checked_at.cmp(&b.last_checked_at).then_with(|| a.code.cmp(&b.code)));
        Ok(all.into_iter().take(limit).filter_map(Self::hydrate).collect())
    }

    async fn count_by_status(&self, status: TrackingStatus) -> Result<usize, RepositoryError> {
        Ok(self.records.read().values().filter(|r| r.status == status).count())
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, RepositoryError> {
        let mut records = self.records.write();
        let mut report = PurgeReport::default();

        for record in records.values_mut() {
            if !record.events.iter().any(|e| e.timestamp < cutoff) {
                continue;
            }
            let Some(mut tracking) = Self::hydrate(record) else {
                continue;
            };
            let removed = tracking.prune_events_before(cutoff);
            if removed > 0 {
                report.codes_touched += 1;
                report.events_removed += removed;
                *record = tracking.to_record();
            }
        }

        Ok(report)
    }
}
