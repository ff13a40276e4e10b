// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

use std::env;
use std::fs;
use vector_agent::config::ConfigError;
use vector_agent::core::{DistanceType, ObjectType};
use vector_agent::AgentConfig;

mod environment {
    use super::*;

    // Environment variables are process-wide, so every env case lives in one test
    #[test]
    fn test_from_env_overrides_and_fallbacks() {
        env::set_var("VECTOR_AGENT_DIMENSION", "256");
        env::set_var("VECTOR_AGENT_DISTANCE_TYPE", "cosine");
        env::set_var("VECTOR_AGENT_OBJECT_TYPE", "uint8");
        env::set_var("VECTOR_AGENT_ENABLE_COPY_ON_WRITE", "true");
        env::set_var("VECTOR_AGENT_INDEX_PATH", "/tmp/agent-index");
        env::set_var("VECTOR_AGENT_AUTO_INDEX_LENGTH", "500");
        env::set_var("VECTOR_AGENT_BROKEN_INDEX_HISTORY_LIMIT", "not-a-number");

        let config = AgentConfig::from_env();

        assert_eq!(config.dimension, 256);
        assert_eq!(config.distance_type, DistanceType::Cosine);
        assert_eq!(config.object_type, ObjectType::Uint8);
        assert!(config.enable_copy_on_write);
        assert_eq!(config.index_path.to_str(), Some("/tmp/agent-index"));
        assert_eq!(config.daemon.auto_index_length, 500);
        assert_eq!(
            config.broken_index_history_limit, 3,
            "Unparsable values should fall back to the default"
        );
        assert!(config.validate().is_ok());

        for key in [
            "DIMENSION",
            "DISTANCE_TYPE",
            "OBJECT_TYPE",
            "ENABLE_COPY_ON_WRITE",
            "INDEX_PATH",
            "AUTO_INDEX_LENGTH",
            "BROKEN_INDEX_HISTORY_LIMIT",
        ] {
            env::remove_var(format!("VECTOR_AGENT_{}", key));
        }
    }
}

mod file {
    use super::*;

    #[test]
    fn test_from_file_reads_json() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("agent.json");
        fs::write(
            &path,
            r#"{
                "dimension": 16,
                "is_read_replica": true,
                "broken_index_history_limit": 0,
                "daemon": { "auto_save_index_duration_ms": 1000 }
            }"#,
        )
        .unwrap();

        let config = AgentConfig::from_file(&path).unwrap();

        assert_eq!(config.dimension, 16);
        assert!(config.is_read_replica);
        assert_eq!(config.broken_index_history_limit, 0);
        assert_eq!(config.daemon.auto_save_index_duration_ms, 1000);
        assert_eq!(config.daemon.auto_index_length, 100);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = AgentConfig::from_file(temp_dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_malformed_file_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("agent.json");
        fs::write(&path, "{ dimension: ").unwrap();

        let result = AgentConfig::from_file(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
