//! Accu Config
//!
//! This crate contains the serializable configuration types for the accu
//! workflow engine. Every field has a default, so an empty JSON object (or no
//! file at all) yields a working configuration.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI with `--config=engine.json`)
//! - Defaults ([`EngineConfig::default`])
//!
//! # Example
//!
//! ```json
//! {
//!   "runtime": { "tick_interval_secs": 900 },
//!   "retry": { "max_attempts": 3, "backoff": "linear" },
//!   "application": { "auto_issue": false }
//! }
//! ```

mod retry;
mod sections;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use retry::{RetryBackoff, RetryPolicy};
pub use sections::{ApplicationConfig, ProjectConfig, RuntimeConfig};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// The configuration file could not be read.
  #[error("failed to read config file '{path}': {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  /// The configuration file is not valid JSON for [`EngineConfig`].
  #[error("failed to parse config file '{path}': {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub runtime: RuntimeConfig,
  pub retry: RetryPolicy,
  pub application: ApplicationConfig,
  pub project: ProjectConfig,
}

impl EngineConfig {
  /// Load configuration from a JSON file.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.display().to_string(),
      source,
    })?;

    Self::from_json(&content).map_err(|source| ConfigError::Parse {
      path: path.display().to_string(),
      source,
    })
  }

  /// Parse configuration from a JSON string.
  pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(content)
  }
}
