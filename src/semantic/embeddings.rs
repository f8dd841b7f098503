//! Embedding model seam and the fastembed-backed implementation.
//!
//! The compute worker only knows about the [`Embedder`] and [`EmbedderLoader`]
//! traits. Production code loads [`EmbeddingModel`] through [`FastembedLoader`];
//! tests plug in deterministic fakes.

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;

use crate::semantic::protocol::Progress;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// A loaded model that turns texts into fixed-length vectors.
pub trait Embedder: Send {
    /// Identifier stored alongside every vector this model produces.
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Embed every text, returning one vector per input in the same order.
    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Builds an [`Embedder`] inside the compute worker.
///
/// `report` may be called any number of times while loading; each call is
/// forwarded to the host as a status push.
pub trait EmbedderLoader: Send + Sync {
    fn load(
        &self,
        report: &mut dyn FnMut(&str, Option<Progress>),
    ) -> Result<Box<dyn Embedder>, EmbeddingError>;
}

/// Wrapper around fastembed's TextEmbedding model.
pub struct EmbeddingModel {
    model: TextEmbedding,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(false);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;

        Ok(Self {
            model,
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    pub fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15Q)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for EmbeddingModel {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        self.model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

/// Loads a named fastembed model from a local cache directory.
pub struct FastembedLoader {
    model_name: String,
    cache_dir: PathBuf,
}

impl FastembedLoader {
    pub fn new(model_name: impl Into<String>, cache_dir: PathBuf) -> Self {
        Self {
            model_name: model_name.into(),
            cache_dir,
        }
    }
}

impl EmbedderLoader for FastembedLoader {
    fn load(
        &self,
        report: &mut dyn FnMut(&str, Option<Progress>),
    ) -> Result<Box<dyn Embedder>, EmbeddingError> {
        // fail fast on typos before touching the network
        EmbeddingModel::parse_model_name(&self.model_name)?;

        report(
            &format!("Loading model '{}' (first run downloads it)", self.model_name),
            Some(Progress { current: 0, total: 2 }),
        );
        let model = EmbeddingModel::new(&self.model_name, self.cache_dir.clone())?;
        report(
            &format!("Model '{}' loaded ({} dims)", self.model_name, model.dimensions()),
            Some(Progress { current: 2, total: 2 }),
        );

        Ok(Box::new(model))
    }
}
