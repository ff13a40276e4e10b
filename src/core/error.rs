// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::kvs::KvsError;
use crate::metadata::MetadataError;
use crate::service::lifecycle::LifecycleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("write operation to read replica is not possible")]
    WriteOperationToReadReplica,

    #[error("uncommitted indexes are not found")]
    UncommittedIndexNotFound,

    #[error("object uuid {uuid}'s metadata not found")]
    ObjectIdNotFound { uuid: String },

    #[error("dimension size {current} is invalid, the supporting dimension size must be {limit}")]
    InvalidDimensionSize { current: usize, limit: usize },

    #[error("invalid uuid: {uuid:?}")]
    InvalidUuid { uuid: String },

    #[error("uuid {uuid} index already exists")]
    UuidAlreadyExists { uuid: String },

    #[error("create index is already running")]
    IndexingInProgress,

    #[error("save index is already running")]
    SavingInProgress,

    #[error("flush is already running")]
    FlushingInProgress,

    #[error("operation cancelled")]
    Cancelled,

    #[error("search result is empty")]
    EmptySearchResult,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{} errors occurred, first: {}", .0.len(), .0.first().map(|e| e.to_string()).unwrap_or_default())]
    Multiple(Vec<AgentError>),

    #[error("graph index error: {0}")]
    Graph(#[from] GraphError),

    #[error("kvs error: {0}")]
    Kvs(#[from] KvsError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("index directory error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn object_not_found(uuid: impl Into<String>) -> Self {
        AgentError::ObjectIdNotFound { uuid: uuid.into() }
    }

    /// Collapses per-item failures: none is success, one is returned as is.
    pub fn aggregate(mut errors: Vec<AgentError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(AgentError::Multiple(errors)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AgentError::ObjectIdNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_collapses_errors() {
        assert!(AgentError::aggregate(Vec::new()).is_ok());

        let single = AgentError::aggregate(vec![AgentError::object_not_found("a")]);
        assert!(single.unwrap_err().is_not_found());

        let many = AgentError::aggregate(vec![
            AgentError::object_not_found("a"),
            AgentError::IndexingInProgress,
        ]);
        match many {
            Err(AgentError::Multiple(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].is_not_found());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
