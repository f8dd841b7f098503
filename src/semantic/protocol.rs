//! Messages exchanged between the bridge and the compute worker.

use serde::{Deserialize, Serialize};

use crate::semantic::vector_math::SearchResult;

/// Correlation id for one bridge call.
pub type CallId = u64;

/// Files processed out of a known total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

/// Requests the worker understands.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    /// Load the embedding model
    Init,
    /// Embed each text, one vector per text
    Embed { texts: Vec<String> },
    /// Embed `query` and rank `corpus` against it
    Rank {
        query: String,
        corpus: Vec<(String, Vec<f32>)>,
        top_k: usize,
    },
}

impl WorkerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::Init => "init",
            WorkerRequest::Embed { .. } => "embed",
            WorkerRequest::Rank { .. } => "rank",
        }
    }
}

/// A request tagged with its correlation id.
#[derive(Debug)]
pub struct Envelope {
    pub id: CallId,
    pub request: WorkerRequest,
}

/// Successful worker replies.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Loaded { model: String, dimensions: usize },
    /// Vectors tagged with the model that produced them
    Embeddings { model: String, vectors: Vec<Vec<f32>> },
    Ranked(Vec<SearchResult>),
}

/// Lifecycle phase carried by status pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusPhase {
    Loading,
    Ready,
    Error,
}

/// Out-of-band status push; not tied to any call.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub phase: StatusPhase,
    pub message: String,
    pub progress: Option<Progress>,
}

/// Everything the worker sends back.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Response {
        id: CallId,
        result: Result<WorkerReply, String>,
    },
    Status(StatusUpdate),
}
