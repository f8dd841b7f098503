use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::semantic::indexer::DEFAULT_BATCH_SIZE;
use crate::semantic::query::{Ranking, DEFAULT_TOP_K};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default embedding model (small enough to load quickly on a laptop)
const DEFAULT_SEMANTIC_MODEL: &str = "all-MiniLM-L6-v2";
/// Per-call deadline for embed and rank requests
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
/// Deadline for the initial model load, download included
const DEFAULT_MODEL_LOAD_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration for semantic search functionality
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Enable or disable semantic search
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Files per embedding call while indexing
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum results per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Timeout for model load (and download) in seconds
    #[serde(default = "default_model_load_timeout_secs")]
    pub model_load_timeout_secs: u64,

    /// "worker" ranks inside the compute worker, "local" on the caller
    #[serde(default)]
    pub ranking: Ranking,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            model: DEFAULT_SEMANTIC_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            top_k: DEFAULT_TOP_K,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            model_load_timeout_secs: DEFAULT_MODEL_LOAD_TIMEOUT_SECS,
            ranking: Ranking::default(),
        }
    }
}

impl SemanticSearchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn model_load_timeout(&self) -> Duration {
        Duration::from_secs(self.model_load_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "semantic_search.model must not be empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "semantic_search.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Invalid(
                "semantic_search.top_k must be greater than 0".to_string(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "semantic_search.call_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.model_load_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "semantic_search.model_load_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_semantic_model() -> String {
    DEFAULT_SEMANTIC_MODEL.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

fn default_model_load_timeout_secs() -> u64 {
    DEFAULT_MODEL_LOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    /// Load `config.yaml` from `base_path`, writing defaults if it is missing.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(base_path)?;
        let path = base_path.join(CONFIG_FILE_NAME);

        // create new if does not exist
        if !path.exists() {
            let defaults = Self {
                base_path: base_path.to_path_buf(),
                ..Default::default()
            };
            defaults.save()?;
        }

        let config_str = std::fs::read_to_string(&path)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.base_path = base_path.to_path_buf();

        config.semantic_search.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.base_path.join(CONFIG_FILE_NAME);
        let tmp = self.base_path.join(format!("{}.tmp", CONFIG_FILE_NAME));

        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&tmp, config_str.as_bytes())?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}
