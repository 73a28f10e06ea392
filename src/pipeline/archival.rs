//! Archival Mover: relocate aged hot records into the cold tier
//!
//! Per data class and run:
//! 1. Select hot records older than the class retention window
//! 2. Group them by archive path
//! 3. Per path, under an in-process lease: read the object (absent = empty),
//!    merge keep-latest, write it back conditionally on the etag that was read
//! 4. Only after the cold write succeeds, delete the archived versions from
//!    the hot tier
//!
//! A conditional write that loses a race re-reads and re-merges, up to
//! `max_conflict_retries` times. A crash between 3 and 4 leaves a hot copy
//! that the reader folds as a duplicate and the next run archives again.

use super::series::{merge_keep_latest, TierRecord, TieredSeries};
use crate::store::{ColdStore, CompositeKey, HotDocument, HotStore, StoreError, WriteCondition};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Per-path mutual exclusion inside one process
#[derive(Default)]
pub struct PathLeases {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PathLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, path: &str) -> OwnedMutexGuard<()> {
        let lock = match self.locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(path.to_string()).or_default()),
            // Poisoned registry: fall back to a private lock, the etag check still guards the write
            Err(_) => Arc::new(AsyncMutex::new(())),
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveRunSummary {
    pub data_class: String,
    /// Hot records older than the cutoff
    pub selected: usize,
    pub paths: usize,
    pub failed_paths: usize,
    /// Records in written archive objects that came from this run
    pub archived: usize,
    pub deleted: usize,
    pub integrity_warnings: usize,
    pub conflicts: usize,
}

struct PathOutcome {
    archived: usize,
    deleted: usize,
    warnings: usize,
    conflicts: usize,
}

pub struct ArchivalMover {
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdStore>,
    leases: PathLeases,
    max_conflict_retries: u32,
}

impl ArchivalMover {
    pub fn new(hot: Arc<dyn HotStore>, cold: Arc<dyn ColdStore>) -> Self {
        Self {
            hot,
            cold,
            leases: PathLeases::new(),
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Archive every record of `series` older than its retention window
    ///
    /// Fails only if the hot selection fails; a failing path is logged,
    /// counted and left in the hot tier for the next run.
    pub async fn run<R: TierRecord>(
        &self,
        series: &TieredSeries<R>,
        now: DateTime<Utc>,
    ) -> Result<ArchiveRunSummary, StoreError> {
        let class = series.data_class();
        let cutoff = now - series.spec().retention;
        let mut summary = ArchiveRunSummary {
            data_class: class.to_string(),
            ..ArchiveRunSummary::default()
        };

        let docs = self
            .hot
            .select_older_than(class, cutoff.timestamp_millis())
            .await?;
        if docs.is_empty() {
            log::debug!("📦 Nothing to archive for {}", class);
            return Ok(summary);
        }
        summary.selected = docs.len();

        let mut by_path: BTreeMap<String, Vec<HotDocument>> = BTreeMap::new();
        for doc in docs {
            by_path
                .entry(series.archive_path(doc.key.bucket_ms))
                .or_default()
                .push(doc);
        }
        summary.paths = by_path.len();

        for (path, docs) in by_path {
            match self.archive_path(series, &path, docs).await {
                Ok(outcome) => {
                    summary.archived += outcome.archived;
                    summary.deleted += outcome.deleted;
                    summary.integrity_warnings += outcome.warnings;
                    summary.conflicts += outcome.conflicts;
                }
                Err(e) => {
                    summary.failed_paths += 1;
                    log::error!("❌ Archival of {} failed, hot copy kept: {}", path, e);
                }
            }
        }

        if summary.failed_paths > 0 {
            log::warn!(
                "⚠️  Archived {}: {} records, {} paths ({} failed), {} deleted from hot",
                class,
                summary.archived,
                summary.paths,
                summary.failed_paths,
                summary.deleted
            );
        } else {
            log::info!(
                "📦 Archived {}: {} records into {} paths, {} deleted from hot",
                class,
                summary.archived,
                summary.paths,
                summary.deleted
            );
        }
        Ok(summary)
    }

    async fn archive_path<R: TierRecord>(
        &self,
        series: &TieredSeries<R>,
        path: &str,
        docs: Vec<HotDocument>,
    ) -> Result<PathOutcome, StoreError> {
        let class = series.data_class();
        let _lease = self.leases.acquire(path).await;

        let mut records = Vec::with_capacity(docs.len());
        let mut archived: Vec<(CompositeKey, i64)> = Vec::with_capacity(docs.len());
        for doc in &docs {
            match series.decode(doc) {
                Ok(record) => {
                    records.push(record);
                    archived.push((doc.key.clone(), doc.record_ms));
                }
                Err(e) => log::error!("❌ Undecodable hot record {} left in place: {}", doc.key, e),
            }
        }
        if records.is_empty() {
            return Ok(PathOutcome {
                archived: 0,
                deleted: 0,
                warnings: 0,
                conflicts: 0,
            });
        }

        let mut conflicts = 0u32;
        let warnings = loop {
            let (existing, condition) = match self.cold.get_object(path).await? {
                None => (Vec::new(), WriteCondition::IfAbsent),
                Some(object) => (
                    series.decode_object(&object.body)?,
                    WriteCondition::IfMatch(object.etag),
                ),
            };

            let merged = merge_keep_latest(class, existing, records.clone());
            let body = series.encode_object(&merged.records)?;

            match self.cold.put_object(path, body, condition).await {
                Ok(_) => break merged.warnings.len(),
                Err(StoreError::PreconditionFailed(reason)) if conflicts < self.max_conflict_retries => {
                    conflicts += 1;
                    log::warn!("⚠️  Concurrent write on {} ({}), re-merging", path, reason);
                }
                Err(e) => return Err(e),
            }
        };

        let deleted = self.hot.delete_archived(class, &archived).await?;
        if deleted < archived.len() {
            log::debug!(
                "📦 {} of {} records on {} were rewritten after selection and stay hot",
                archived.len() - deleted,
                archived.len(),
                path
            );
        }

        Ok(PathOutcome {
            archived: archived.len(),
            deleted,
            warnings,
            conflicts: conflicts as usize,
        })
    }
}
