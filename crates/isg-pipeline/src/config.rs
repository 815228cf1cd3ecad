//! Pipeline configuration
//!
//! One TOML document configures every component. Every section and field
//! has a default, so an empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [retrieval]
//! hard_cap = 50
//!
//! [context]
//! budget = 8000
//! size = "approx_tokens"
//!
//! [gate]
//! repo_root = "."
//! timeout_secs = 600
//! quarantined = ["net::tests::accept_many"]
//!
//! [confidence]
//! upper = 0.9
//! lower = 0.5
//!
//! [storage]
//! dir = ".isg"
//! ```

use crate::confidence::ConfidenceConfig;
use isg_graph::{CandidatePolicy, SnapshotStorage, VALIDATION_LOG_FILE};
use isg_retrieval::{RetrievalConfig, SizeMetric};
use isg_validation::GateConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Context assembly settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Default budget when a request does not set one
    pub budget: usize,
    pub size: SizeMetric,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget: 8000,
            size: SizeMetric::Chars,
        }
    }
}

/// Where graph snapshots and the validation log live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store directory, `None` keeps everything in memory
    pub dir: Option<PathBuf>,
    pub retries: u32,
    pub backoff_ms: u64,
    /// Rollback snapshots kept before superseded ones are dropped
    pub retain_snapshots: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retries: 3,
            backoff_ms: 50,
            retain_snapshots: 64,
        }
    }
}

impl StorageConfig {
    /// Snapshot storage for the configured directory
    #[must_use]
    pub fn snapshots(&self) -> Option<SnapshotStorage> {
        self.dir.as_ref().map(|dir| {
            SnapshotStorage::in_dir(dir).with_retries(self.retries, Duration::from_millis(self.backoff_ms))
        })
    }

    #[must_use]
    pub fn validation_log(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(VALIDATION_LOG_FILE))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub candidates: CandidatePolicy,
    pub gate: GateConfig,
    pub confidence: ConfidenceConfig,
    pub storage: StorageConfig,
}

impl PipelineConfig {
    /// Load and validate a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns error on invalid syntax or values
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let c = &self.confidence;
        if !(0.0..=1.0).contains(&c.lower) || !(0.0..=1.0).contains(&c.upper) || c.lower > c.upper {
            return invalid("confidence thresholds must satisfy 0 <= lower <= upper <= 1");
        }
        if !c.weights.is_valid() {
            return invalid("confidence weights must be non-negative with a positive sum");
        }
        if self.retrieval.hard_cap == 0 {
            return invalid("retrieval.hard_cap must be positive");
        }
        if self.retrieval.graph_weight < 0.0 || self.retrieval.vector_weight < 0.0 {
            return invalid("retrieval weights must be non-negative");
        }
        if self.context.budget == 0 {
            return invalid("context.budget must be positive");
        }
        if self.gate.timeout_secs == 0 {
            return invalid("gate.timeout_secs must be positive");
        }
        if self.gate.max_concurrent == 0 {
            return invalid("gate.max_concurrent must be positive");
        }
        if self.candidates.max_changed_entities == 0 {
            return invalid("candidates.max_changed_entities must be positive");
        }
        Ok(())
    }

    #[must_use]
    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: ConfidenceConfig) -> Self {
        self.confidence = confidence;
        self
    }

    #[must_use]
    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.dir = Some(dir.into());
        self
    }
}
