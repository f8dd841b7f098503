//! On-device semantic search over file paths.
//!
//! # Architecture
//!
//! - `bridge`: correlated request/response calls into the compute worker
//! - `worker`: the compute context that owns the embedding model
//! - `protocol`: messages exchanged with the worker
//! - `lifecycle`: model readiness state machine
//! - `indexer`: batched embedding of `{path, name}` records
//! - `query`: query embedding and top-K ranking
//! - `store`: durable path -> embedding store
//! - `service`: facade tying the above together

pub mod bridge;
pub mod embeddings;
pub mod indexer;
pub mod lifecycle;
mod preprocess;
pub mod protocol;
pub mod query;
mod service;
pub mod store;
pub mod vector_math;
pub mod worker;

pub use bridge::{BridgeError, ComputeBridge};
pub use indexer::{FileEntry, IndexEvent, IndexReport};
pub use lifecycle::{LifecycleStatus, ModelManager, StatusSnapshot};
pub use service::{SemanticError, SemanticSearchService};
pub use store::{EmbeddingRecord, EmbeddingStore, StoreError};
pub use vector_math::SearchResult;
