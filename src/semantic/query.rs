//! Free-text search over the embedding store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::semantic::bridge::{BridgeError, ComputeBridge};
use crate::semantic::preprocess::is_blank;
use crate::semantic::protocol::{WorkerReply, WorkerRequest};
use crate::semantic::store::EmbeddingStore;
use crate::semantic::vector_math::{self, SearchResult};

/// Default number of results returned per query
pub const DEFAULT_TOP_K: usize = 20;

/// Where the corpus is ranked against the query vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ranking {
    /// Send the corpus to the compute worker in one `Rank` call
    #[default]
    Worker,
    /// Embed the query in the worker, rank on the calling task
    Local,
}

pub struct QueryEngine {
    bridge: Arc<ComputeBridge>,
    store: Arc<EmbeddingStore>,
    top_k: usize,
    call_timeout: Duration,
    ranking: Ranking,
}

impl QueryEngine {
    pub fn new(
        bridge: Arc<ComputeBridge>,
        store: Arc<EmbeddingStore>,
        top_k: usize,
        call_timeout: Duration,
        ranking: Ranking,
    ) -> Self {
        Self {
            bridge,
            store,
            top_k,
            call_timeout,
            ranking,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        scope: Option<&str>,
    ) -> Result<Vec<SearchResult>, BridgeError> {
        self.search_with_cancel(query, scope, None, &CancellationToken::new())
            .await
    }

    /// Whether any stored file falls under `scope`.
    pub fn has_candidates(&self, scope: Option<&str>) -> bool {
        self.store.snapshot().iter().any(|r| in_scope(&r.path, scope))
    }

    /// Rank stored files against `query`, optionally only paths under `scope`.
    ///
    /// With `model` set, records embedded by any other model are skipped:
    /// their vectors live in a different space. Blank queries and an empty
    /// (or fully filtered) corpus return no results without contacting the
    /// worker. Cancelling abandons the in-flight call.
    pub async fn search_with_cancel(
        &self,
        query: &str,
        scope: Option<&str>,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, BridgeError> {
        if is_blank(query) {
            return Ok(Vec::new());
        }

        let snapshot = self.store.snapshot();
        let corpus: Vec<(String, Vec<f32>)> = snapshot
            .iter()
            .filter(|r| in_scope(&r.path, scope))
            .filter(|r| model.map_or(true, |m| r.model == m))
            .map(|r| (r.path.clone(), r.embedding.clone()))
            .collect();
        drop(snapshot);

        if corpus.is_empty() {
            return Ok(Vec::new());
        }

        let query = query.trim().to_string();
        log::debug!(
            "ranking {} files for {:?} ({:?})",
            corpus.len(),
            query,
            self.ranking
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            result = self.rank(query, corpus) => result,
        }
    }

    async fn rank(
        &self,
        query: String,
        corpus: Vec<(String, Vec<f32>)>,
    ) -> Result<Vec<SearchResult>, BridgeError> {
        match self.ranking {
            Ranking::Worker => {
                let request = WorkerRequest::Rank {
                    query,
                    corpus,
                    top_k: self.top_k,
                };
                match self.bridge.call(request, self.call_timeout).await? {
                    WorkerReply::Ranked(results) => Ok(results),
                    other => Err(unexpected(other)),
                }
            }
            Ranking::Local => {
                let request = WorkerRequest::Embed { texts: vec![query] };
                match self.bridge.call(request, self.call_timeout).await? {
                    WorkerReply::Embeddings { vectors, .. } => {
                        let query_vector = vectors
                            .into_iter()
                            .next()
                            .ok_or_else(|| BridgeError::Remote("no query vector".to_string()))?;
                        Ok(vector_math::rank(&query_vector, &corpus, self.top_k))
                    }
                    other => Err(unexpected(other)),
                }
            }
        }
    }
}

fn in_scope(path: &str, scope: Option<&str>) -> bool {
    scope.map_or(true, |s| path.starts_with(s))
}

fn unexpected(reply: WorkerReply) -> BridgeError {
    BridgeError::Remote(format!("unexpected reply: {:?}", reply))
}
