// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Side-car descriptor stored next to the index files of a generation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const METADATA_FILENAME: &str = "metadata.json";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to access metadata {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed metadata {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Metadata {
    pub is_invalid: bool,
    pub index_count: u64,
}

impl Metadata {
    pub fn valid(index_count: u64) -> Self {
        Self {
            is_invalid: false,
            index_count,
        }
    }

    /// Marker written before files are rewritten in place.
    pub fn invalid() -> Self {
        Self {
            is_invalid: true,
            index_count: 0,
        }
    }
}

pub fn path_in(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILENAME)
}

pub fn exists(dir: &Path) -> bool {
    path_in(dir).is_file()
}

pub fn load(dir: &Path) -> Result<Metadata, MetadataError> {
    let path = path_in(dir);
    let raw = fs::read(&path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            MetadataError::NotFound(path.clone())
        } else {
            MetadataError::Io {
                path: path.clone(),
                source,
            }
        }
    })?;
    serde_json::from_slice(&raw).map_err(|source| MetadataError::Malformed { path, source })
}

/// Writes through a temporary file and a rename so readers never observe a
/// half-written descriptor.
pub fn store(dir: &Path, metadata: &Metadata) -> Result<(), MetadataError> {
    let path = path_in(dir);
    let tmp = dir.join(format!(".{}.tmp", METADATA_FILENAME));
    let body = serde_json::to_vec_pretty(metadata).map_err(|source| MetadataError::Malformed {
        path: path.clone(),
        source,
    })?;
    fs::write(&tmp, body).map_err(|source| MetadataError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, &path).map_err(|source| MetadataError::Io { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        store(dir.path(), &Metadata::valid(42)).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded, Metadata::valid(42));
        assert!(!dir.path().join(".metadata.json.tmp").exists());
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(load(dir.path()), Err(MetadataError::NotFound(_))));
        assert!(!exists(dir.path()));
    }

    #[test]
    fn test_load_malformed() {
        let dir = TempDir::new().unwrap();
        fs::write(path_in(dir.path()), b"{not json").unwrap();
        assert!(matches!(load(dir.path()), Err(MetadataError::Malformed { .. })));
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(Metadata::valid(7)).unwrap();
        assert_eq!(json, serde_json::json!({"is_invalid": false, "index_count": 7}));
    }
}
