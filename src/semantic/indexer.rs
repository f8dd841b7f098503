//! Batched indexing of `{path, name}` records.
//!
//! Batches run one at a time: the compute worker is single-flight anyway, and
//! it bounds how many vectors are held in memory. A failed batch is logged and
//! skipped; the job itself never fails.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::semantic::bridge::{BridgeError, ComputeBridge};
use crate::semantic::lifecycle::LifecycleStatus;
use crate::semantic::preprocess::file_text;
use crate::semantic::protocol::{Progress, WorkerReply, WorkerRequest};
use crate::semantic::store::{now_millis, EmbeddingRecord, EmbeddingStore, StoreError};

/// Default number of files per embedding call
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// One file offered for indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

/// Outcome of one indexing job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub total: usize,
    pub indexed: usize,
    pub failed_batches: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    Progress(Progress),
    BatchFailed { batch: usize, error: String },
    Finished(IndexReport),
}

/// Why a single batch was skipped.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("expected {expected} vectors, got {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("unexpected reply to embed: {0}")]
    UnexpectedReply(String),

    #[error("store write task failed: {0}")]
    Join(String),
}

pub struct Indexer {
    bridge: Arc<ComputeBridge>,
    store: Arc<EmbeddingStore>,
    batch_size: usize,
    call_timeout: Duration,
    events: broadcast::Sender<IndexEvent>,
}

impl Indexer {
    pub fn new(
        bridge: Arc<ComputeBridge>,
        store: Arc<EmbeddingStore>,
        batch_size: usize,
        call_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            bridge,
            store,
            batch_size: batch_size.max(1),
            call_timeout,
            events,
        }
    }

    /// Progress, failure and completion events for every job run by this indexer.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub async fn index_files(&self, files: &[FileEntry]) -> IndexReport {
        self.index_files_with_cancel(files, &CancellationToken::new())
            .await
    }

    /// Embed and store `files`, batch by batch, until done or `cancel` fires.
    pub async fn index_files_with_cancel(
        &self,
        files: &[FileEntry],
        cancel: &CancellationToken,
    ) -> IndexReport {
        let total = files.len();
        let mut report = IndexReport {
            total,
            ..Default::default()
        };
        if files.is_empty() {
            return report;
        }

        log::info!(
            "indexing {} files in batches of {}",
            total,
            self.batch_size
        );

        let mut processed = 0;
        for (batch_no, batch) in files.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.index_batch(batch) => Some(result),
            };
            let Some(result) = outcome else {
                report.cancelled = true;
                break;
            };

            match result {
                Ok(count) => report.indexed += count,
                Err(e) => {
                    log::warn!("batch {} ({} files) failed: {}", batch_no + 1, batch.len(), e);
                    report.failed_batches += 1;
                    let _ = self.events.send(IndexEvent::BatchFailed {
                        batch: batch_no,
                        error: e.to_string(),
                    });
                }
            }

            processed += batch.len();
            let progress = Progress {
                current: processed.min(total),
                total,
            };
            self.publish_progress(Some(progress));
            let _ = self.events.send(IndexEvent::Progress(progress));
        }

        self.publish_progress(None);
        if report.cancelled {
            log::info!("indexing cancelled after {} of {} files", processed, total);
        } else {
            log::info!(
                "indexed {} of {} files ({} failed batches)",
                report.indexed,
                total,
                report.failed_batches
            );
        }
        let _ = self.events.send(IndexEvent::Finished(report.clone()));

        report
    }

    /// Index only files with no record from `model`.
    pub async fn index_missing(
        &self,
        files: &[FileEntry],
        model: &str,
        cancel: &CancellationToken,
    ) -> IndexReport {
        let snapshot = self.store.snapshot();
        let missing: Vec<FileEntry> = files
            .iter()
            .filter(|f| snapshot.get(&f.path).map_or(true, |r| r.model != model))
            .cloned()
            .collect();

        log::info!(
            "{} of {} files need embeddings for '{}'",
            missing.len(),
            files.len(),
            model
        );
        self.index_files_with_cancel(&missing, cancel).await
    }

    /// Drop records under `scope` whose path is not in `keep`.
    pub fn prune(&self, scope: &str, keep: &[FileEntry]) -> Result<usize, StoreError> {
        let keep: HashSet<&str> = keep.iter().map(|f| f.path.as_str()).collect();
        let removed = self
            .store
            .retain(|r| !r.path.starts_with(scope) || keep.contains(r.path.as_str()))?;
        if removed > 0 {
            log::info!("pruned {} stale embeddings under {}", removed, scope);
        }
        Ok(removed)
    }

    async fn index_batch(&self, batch: &[FileEntry]) -> Result<usize, BatchError> {
        let texts: Vec<String> = batch.iter().map(|f| file_text(&f.name, &f.path)).collect();

        let reply = self
            .bridge
            .call(WorkerRequest::Embed { texts }, self.call_timeout)
            .await?;

        let (model, vectors) = match reply {
            WorkerReply::Embeddings { model, vectors } => (model, vectors),
            other => return Err(BatchError::UnexpectedReply(format!("{:?}", other))),
        };
        if vectors.len() != batch.len() {
            return Err(BatchError::CountMismatch {
                expected: batch.len(),
                got: vectors.len(),
            });
        }

        let created_at = now_millis();
        let records: Vec<EmbeddingRecord> = batch
            .iter()
            .zip(vectors)
            .map(|(file, embedding)| EmbeddingRecord {
                path: file.path.clone(),
                embedding,
                model: model.clone(),
                created_at,
            })
            .collect();
        let count = records.len();

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.put_batch(records))
            .await
            .map_err(|e| BatchError::Join(e.to_string()))??;

        Ok(count)
    }

    fn publish_progress(&self, progress: Option<Progress>) {
        self.bridge.update_status(|snapshot| {
            if snapshot.status == LifecycleStatus::Disabled || snapshot.progress == progress {
                return false;
            }
            snapshot.progress = progress;
            true
        });
    }
}
