//! Semantic search service over file paths.
//!
//! Owns the embedding store and the compute bridge and exposes the
//! operations a front end needs:
//! - model lifecycle (`initialize`, `set_enabled`, status accessors)
//! - indexing (`index_files`, `index_missing`, `prune`)
//! - querying (`search`)

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SemanticSearchConfig;
use crate::semantic::bridge::{BridgeError, ComputeBridge};
use crate::semantic::embeddings::FastembedLoader;
use crate::semantic::indexer::{FileEntry, IndexEvent, IndexReport, Indexer};
use crate::semantic::lifecycle::{LifecycleStatus, LoadedModel, ModelManager, StatusSnapshot};
use crate::semantic::preprocess::is_blank;
use crate::semantic::protocol::Progress;
use crate::semantic::query::QueryEngine;
use crate::semantic::store::{EmbeddingStore, StoreError};
use crate::semantic::vector_math::SearchResult;
use crate::semantic::worker::{ContextSpawner, ThreadSpawner};

/// Errors that can occur during semantic search operations.
#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("Semantic search is disabled")]
    Disabled,

    #[error("Model not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

pub struct SemanticSearchService {
    config: SemanticSearchConfig,
    store: Arc<EmbeddingStore>,
    model: ModelManager,
    indexer: Indexer,
    query: QueryEngine,
}

impl SemanticSearchService {
    /// Open the store in `base_path` and wire up a fastembed-backed worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: SemanticSearchConfig, base_path: &Path) -> Result<Self, SemanticError> {
        let loader = Arc::new(FastembedLoader::new(
            config.model.clone(),
            base_path.to_path_buf(),
        ));
        Self::with_spawner(config, base_path, Arc::new(ThreadSpawner::new(loader)))
    }

    pub fn with_spawner(
        config: SemanticSearchConfig,
        base_path: &Path,
        spawner: Arc<dyn ContextSpawner>,
    ) -> Result<Self, SemanticError> {
        let store = Arc::new(EmbeddingStore::open(base_path)?);
        let bridge = Arc::new(ComputeBridge::new(spawner));
        let model = ModelManager::new(bridge.clone(), config.enabled, config.model_load_timeout());
        let indexer = Indexer::new(
            bridge.clone(),
            store.clone(),
            config.batch_size,
            config.call_timeout(),
        );
        let query = QueryEngine::new(
            bridge,
            store.clone(),
            config.top_k,
            config.call_timeout(),
            config.ranking,
        );

        Ok(Self {
            config,
            store,
            model,
            indexer,
            query,
        })
    }

    pub fn config(&self) -> &SemanticSearchConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.model.status() != LifecycleStatus::Disabled
    }

    /// Load the model; see [`ModelManager::initialize`].
    pub async fn initialize(&self) -> LifecycleStatus {
        self.model.initialize().await
    }

    pub fn set_enabled(&self, enabled: bool) {
        log::info!(
            "semantic search {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.model.set_enabled(enabled);
    }

    pub fn status(&self) -> LifecycleStatus {
        self.model.status()
    }

    pub fn status_message(&self) -> Option<String> {
        self.model.status_message()
    }

    pub fn progress(&self) -> Option<Progress> {
        self.model.progress()
    }

    pub fn is_ready(&self) -> bool {
        self.model.is_ready()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.model.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.model.subscribe()
    }

    pub fn index_events(&self) -> broadcast::Receiver<IndexEvent> {
        self.indexer.subscribe()
    }

    pub fn loaded_model(&self) -> Option<LoadedModel> {
        self.model.loaded_model()
    }

    /// Get the number of indexed files.
    pub fn indexed_count(&self) -> usize {
        self.store.len()
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub async fn index_files(&self, files: &[FileEntry]) -> Result<IndexReport, SemanticError> {
        self.index_files_with_cancel(files, &CancellationToken::new())
            .await
    }

    /// Embed and store `files`. Failed batches are reported, not returned.
    pub async fn index_files_with_cancel(
        &self,
        files: &[FileEntry],
        cancel: &CancellationToken,
    ) -> Result<IndexReport, SemanticError> {
        if files.is_empty() {
            return Ok(IndexReport::default());
        }
        self.ensure_ready().await?;
        Ok(self.indexer.index_files_with_cancel(files, cancel).await)
    }

    pub async fn index_missing(&self, files: &[FileEntry]) -> Result<IndexReport, SemanticError> {
        self.index_missing_with_cancel(files, &CancellationToken::new())
            .await
    }

    /// Index files with no embedding from the loaded model.
    pub async fn index_missing_with_cancel(
        &self,
        files: &[FileEntry],
        cancel: &CancellationToken,
    ) -> Result<IndexReport, SemanticError> {
        self.ensure_ready().await?;
        let model = self
            .model
            .loaded_model()
            .ok_or_else(|| SemanticError::NotReady("no model loaded".to_string()))?;
        Ok(self.indexer.index_missing(files, &model.name, cancel).await)
    }

    /// Forget stored files under `scope` that are not in `keep`.
    pub fn prune(&self, scope: &str, keep: &[FileEntry]) -> Result<usize, SemanticError> {
        Ok(self.indexer.prune(scope, keep)?)
    }

    pub async fn search(
        &self,
        query: &str,
        scope: Option<&str>,
    ) -> Result<Vec<SearchResult>, SemanticError> {
        self.search_with_cancel(query, scope, &CancellationToken::new())
            .await
    }

    /// Files most similar to `query`, best first.
    ///
    /// A blank query, or nothing stored under `scope`, returns nothing
    /// without loading the model. Only records embedded by the loaded model
    /// are ranked.
    pub async fn search_with_cancel(
        &self,
        query: &str,
        scope: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SemanticError> {
        if is_blank(query) || !self.query.has_candidates(scope) {
            return Ok(Vec::new());
        }
        self.ensure_ready().await?;
        let model = self
            .model
            .loaded_model()
            .ok_or_else(|| SemanticError::NotReady("no model loaded".to_string()))?;
        Ok(self
            .query
            .search_with_cancel(query, scope, Some(model.name.as_str()), cancel)
            .await?)
    }

    /// Load the model if needed, waiting out a load already in progress.
    async fn ensure_ready(&self) -> Result<(), SemanticError> {
        let mut status = self.model.initialize().await;
        if status == LifecycleStatus::Loading {
            let mut rx = self.model.subscribe();
            status = match rx
                .wait_for(|s| s.status != LifecycleStatus::Loading)
                .await
            {
                Ok(snapshot) => snapshot.status,
                Err(_) => LifecycleStatus::Disabled,
            };
        }

        match status {
            LifecycleStatus::Ready => Ok(()),
            LifecycleStatus::Disabled => Err(SemanticError::Disabled),
            _ => Err(SemanticError::NotReady(
                self.model
                    .status_message()
                    .unwrap_or_else(|| status.to_string()),
            )),
        }
    }

    /// Stop the compute context and release the store lock.
    pub fn close(self) -> Result<(), SemanticError> {
        let Self {
            store,
            model,
            indexer,
            query,
            ..
        } = self;

        model.set_enabled(false);
        drop(indexer);
        drop(query);
        drop(model);

        match Arc::try_unwrap(store) {
            Ok(store) => store.close()?,
            Err(_) => log::warn!("embedding store still in use, skipping close"),
        }
        Ok(())
    }
}
