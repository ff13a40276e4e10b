// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

use crate::core::types::{DistanceType, ObjectType};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "VECTOR_AGENT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub dimension: usize,
    pub distance_type: DistanceType,
    pub object_type: ObjectType,
    pub bulk_insert_chunk_size: usize,
    pub creation_edge_size: usize,
    pub search_edge_size: usize,
    pub enable_proactive_gc: bool,
    pub enable_copy_on_write: bool,
    pub broken_index_history_limit: usize,
    pub error_buffer_limit: usize,
    pub kvs_concurrency: usize,
    pub is_read_replica: bool,
    pub index_path: PathBuf,
    pub default_pool_size: usize,
    pub default_epsilon: f32,
    pub default_radius: f32,
    pub pod_name: String,
    pub pod_namespace: String,
    pub enable_export_index_info_to_k8s: bool,
    pub daemon: DaemonConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            distance_type: DistanceType::L2,
            object_type: ObjectType::Float,
            bulk_insert_chunk_size: 100,
            creation_edge_size: 20,
            search_edge_size: 40,
            enable_proactive_gc: false,
            enable_copy_on_write: false,
            broken_index_history_limit: 3,
            error_buffer_limit: 10,
            kvs_concurrency: 16,
            is_read_replica: false,
            index_path: PathBuf::from("/var/lib/vector-agent/index"),
            default_pool_size: 16,
            default_epsilon: 0.1,
            default_radius: -1.0,
            pod_name: String::new(),
            pod_namespace: String::new(),
            enable_export_index_info_to_k8s: false,
            daemon: DaemonConfig::default(),
        }
    }
}

/// Intervals of the background scheduler, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub auto_index_check_duration_ms: u64,
    pub auto_save_index_duration_ms: u64,
    pub auto_index_duration_limit_ms: u64,
    pub auto_index_length: usize,
    pub initial_delay_ms: u64,
    pub export_index_info_duration_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            auto_index_check_duration_ms: 30_000,
            auto_save_index_duration_ms: 35 * 60_000,
            auto_index_duration_limit_ms: 24 * 60 * 60_000,
            auto_index_length: 100,
            initial_delay_ms: 60_000,
            export_index_info_duration_ms: 60_000,
        }
    }
}

impl DaemonConfig {
    pub fn auto_index_check_duration(&self) -> Duration {
        Duration::from_millis(self.auto_index_check_duration_ms)
    }

    pub fn auto_save_index_duration(&self) -> Duration {
        Duration::from_millis(self.auto_save_index_duration_ms)
    }

    pub fn auto_index_duration_limit(&self) -> Duration {
        Duration::from_millis(self.auto_index_duration_limit_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn export_index_info_duration(&self) -> Duration {
        Duration::from_millis(self.export_index_info_duration_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

impl AgentConfig {
    /// Builds a configuration from `VECTOR_AGENT_*` variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let daemon = DaemonConfig {
            auto_index_check_duration_ms: env_parse("AUTO_INDEX_CHECK_DURATION_MS")
                .unwrap_or(defaults.daemon.auto_index_check_duration_ms),
            auto_save_index_duration_ms: env_parse("AUTO_SAVE_INDEX_DURATION_MS")
                .unwrap_or(defaults.daemon.auto_save_index_duration_ms),
            auto_index_duration_limit_ms: env_parse("AUTO_INDEX_DURATION_LIMIT_MS")
                .unwrap_or(defaults.daemon.auto_index_duration_limit_ms),
            auto_index_length: env_parse("AUTO_INDEX_LENGTH")
                .unwrap_or(defaults.daemon.auto_index_length),
            initial_delay_ms: env_parse("INITIAL_DELAY_MS")
                .unwrap_or(defaults.daemon.initial_delay_ms),
            export_index_info_duration_ms: env_parse("EXPORT_INDEX_INFO_DURATION_MS")
                .unwrap_or(defaults.daemon.export_index_info_duration_ms),
        };

        Self {
            dimension: env_parse("DIMENSION").unwrap_or(defaults.dimension),
            distance_type: env_parse("DISTANCE_TYPE").unwrap_or(defaults.distance_type),
            object_type: env_parse("OBJECT_TYPE").unwrap_or(defaults.object_type),
            bulk_insert_chunk_size: env_parse("BULK_INSERT_CHUNK_SIZE")
                .unwrap_or(defaults.bulk_insert_chunk_size),
            creation_edge_size: env_parse("CREATION_EDGE_SIZE")
                .unwrap_or(defaults.creation_edge_size),
            search_edge_size: env_parse("SEARCH_EDGE_SIZE").unwrap_or(defaults.search_edge_size),
            enable_proactive_gc: env_parse("ENABLE_PROACTIVE_GC")
                .unwrap_or(defaults.enable_proactive_gc),
            enable_copy_on_write: env_parse("ENABLE_COPY_ON_WRITE")
                .unwrap_or(defaults.enable_copy_on_write),
            broken_index_history_limit: env_parse("BROKEN_INDEX_HISTORY_LIMIT")
                .unwrap_or(defaults.broken_index_history_limit),
            error_buffer_limit: env_parse("ERROR_BUFFER_LIMIT")
                .unwrap_or(defaults.error_buffer_limit),
            kvs_concurrency: env_parse("KVS_CONCURRENCY").unwrap_or(defaults.kvs_concurrency),
            is_read_replica: env_parse("IS_READ_REPLICA").unwrap_or(defaults.is_read_replica),
            index_path: env::var(format!("{}INDEX_PATH", ENV_PREFIX))
                .map(PathBuf::from)
                .unwrap_or(defaults.index_path),
            default_pool_size: env_parse("DEFAULT_POOL_SIZE")
                .unwrap_or(defaults.default_pool_size),
            default_epsilon: env_parse("DEFAULT_EPSILON").unwrap_or(defaults.default_epsilon),
            default_radius: env_parse("DEFAULT_RADIUS").unwrap_or(defaults.default_radius),
            pod_name: env::var(format!("{}POD_NAME", ENV_PREFIX)).unwrap_or(defaults.pod_name),
            pod_namespace: env::var(format!("{}POD_NAMESPACE", ENV_PREFIX))
                .unwrap_or(defaults.pod_namespace),
            enable_export_index_info_to_k8s: env_parse("ENABLE_EXPORT_INDEX_INFO_TO_K8S")
                .unwrap_or(defaults.enable_export_index_info_to_k8s),
            daemon,
        }
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimension == 0 {
            return Err(ConfigError::Invalid("dimension must be greater than 0".into()));
        }
        if self.index_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("index_path must not be empty".into()));
        }
        if self.creation_edge_size == 0 || self.search_edge_size == 0 {
            return Err(ConfigError::Invalid("edge sizes must be greater than 0".into()));
        }
        if self.bulk_insert_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "bulk_insert_chunk_size must be greater than 0".into(),
            ));
        }
        if self.default_epsilon < 0.0 {
            return Err(ConfigError::Invalid("default_epsilon must not be negative".into()));
        }
        Ok(())
    }

    /// Convenience for tests and embedding: defaults rooted at `path`.
    pub fn with_index_path<P: Into<PathBuf>>(dimension: usize, path: P) -> Self {
        Self {
            dimension,
            index_path: path.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.broken_index_history_limit, 3);
        assert!(!config.is_read_replica);
    }

    #[test]
    fn test_validate_rejects_zero_dimension() {
        let config = AgentConfig {
            dimension: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"dimension": 3, "distance_type": "cosine"}"#).unwrap();
        assert_eq!(config.dimension, 3);
        assert_eq!(config.distance_type, DistanceType::Cosine);
        assert_eq!(config.search_edge_size, 40);
        assert_eq!(config.daemon, DaemonConfig::default());
    }
}
