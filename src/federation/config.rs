// SPDX-License-Identifier: Apache-2.0

//! Fan-out engine configuration.
//!
//! Loaded from a JSON file; every field has a default so partial files work.
//! A handful of environment variables override the file for ops tuning.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::error::{EngineError, EngineResult};

use super::types::{Collation, FailurePolicy, DEFAULT_SOURCE_COLUMN};

const ENV_MAX_CONCURRENCY: &str = "QOREFED_MAX_CONCURRENCY";
const ENV_REQUEST_TIMEOUT_MS: &str = "QOREFED_REQUEST_TIMEOUT_MS";
const ENV_FAILURE_POLICY: &str = "QOREFED_FAILURE_POLICY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Maximum number of instances executing at once (<= 1 means sequential)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Global timeout for one request (milliseconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Maximum number of "not yet available" signals tolerated per instance
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound applied to every retry delay a source asks for
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub collation: Collation,
    /// Number of plans retained by the plan cache
    #[serde(default = "default_plan_cache_capacity")]
    pub plan_cache_capacity: usize,
    /// Name of the synthetic source-identity column
    #[serde(default = "default_source_column")]
    pub source_column_name: String,
    /// Row budget of the shared buffer manager
    #[serde(default = "default_buffer_max_rows")]
    pub buffer_max_rows: u64,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_request_timeout() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    10_000
}

fn default_max_retry_delay() -> u64 {
    30_000
}

fn default_plan_cache_capacity() -> usize {
    256
}

fn default_source_column() -> String {
    DEFAULT_SOURCE_COLUMN.to_string()
}

fn default_buffer_max_rows() -> u64 {
    5_000_000
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            request_timeout_ms: default_request_timeout(),
            max_retries: default_max_retries(),
            max_retry_delay_ms: default_max_retry_delay(),
            failure_policy: FailurePolicy::default(),
            collation: Collation::default(),
            plan_cache_capacity: default_plan_cache_capacity(),
            source_column_name: default_source_column(),
            buffer_max_rows: default_buffer_max_rows(),
        }
    }
}

impl FederationConfig {
    /// Loads configuration from a JSON file, then applies environment overrides.
    ///
    /// A missing file is not an error: defaults are used.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                EngineError::configuration(format!("Failed to read {}: {e}", path.display()))
            })?;
            let config: Self = serde_json::from_str(&content).map_err(|e| {
                EngineError::configuration(format!("Failed to parse {}: {e}", path.display()))
            })?;
            info!("Loaded federation configuration from {:?}", path);
            config
        } else {
            debug!("No federation config file found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_parse::<usize>(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = value;
        }
        if let Some(value) = env_parse::<u64>(ENV_REQUEST_TIMEOUT_MS) {
            self.request_timeout_ms = value;
        }
        if let Ok(raw) = std::env::var(ENV_FAILURE_POLICY) {
            match serde_json::from_value::<FailurePolicy>(serde_json::Value::String(raw.clone())) {
                Ok(policy) => self.failure_policy = policy,
                Err(_) => warn!("Ignoring invalid {ENV_FAILURE_POLICY}={raw}"),
            }
        }
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.request_timeout_ms == 0 {
            return Err(EngineError::configuration(
                "request_timeout_ms must be greater than zero",
            ));
        }
        if self.plan_cache_capacity == 0 {
            return Err(EngineError::configuration(
                "plan_cache_capacity must be greater than zero",
            ));
        }
        if self.source_column_name.trim().is_empty() {
            return Err(EngineError::configuration(
                "source_column_name must not be empty",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {key}={raw}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("federation.json");
        std::fs::write(&path, r#"{"max_concurrency": 2, "collation": "case_insensitive"}"#)
            .unwrap();

        let config = FederationConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.collation, Collation::CaseInsensitive);
        assert_eq!(config.max_retries, 10_000);
        assert_eq!(config.source_column_name, "SOURCE_NAME");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FederationConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("federation.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FederationConfig::load(&path).unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = FederationConfig {
            request_timeout_ms: 0,
            ..FederationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
