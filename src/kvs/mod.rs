// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Persistent uuid <-> object id mapping kept alongside the graph index.

use crate::core::types::{ObjectId, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub const KVS_FILENAME: &str = "kvs.cbor";

#[derive(Debug, Error)]
pub enum KvsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Inconsistent mapping: {0}")]
    Inconsistent(String),
}

#[async_trait]
pub trait BidirectionalMap: Send + Sync {
    fn get(&self, uuid: &str) -> Option<(ObjectId, Timestamp)>;
    fn get_inverse(&self, oid: ObjectId) -> Option<(String, Timestamp)>;
    fn set(&self, uuid: &str, oid: ObjectId, timestamp: Timestamp);
    /// Removes the uuid and returns the object id it was bound to.
    fn delete(&self, uuid: &str) -> Option<ObjectId>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Visits every binding until `f` returns false.
    fn range(&self, f: &mut dyn FnMut(&str, ObjectId, Timestamp) -> bool);
    fn clear(&self);
    fn shrink(&self);
    async fn load(&self, dir: &Path) -> Result<(), KvsError>;
    async fn save(&self, dir: &Path) -> Result<(), KvsError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct KvsEntry {
    uuid: String,
    oid: ObjectId,
    timestamp: Timestamp,
}

/// Sharded in-memory map; the shard count follows the configured concurrency.
pub struct DashMapKvs {
    forward: DashMap<String, (ObjectId, Timestamp)>,
    inverse: DashMap<ObjectId, (String, Timestamp)>,
}

impl Default for DashMapKvs {
    fn default() -> Self {
        Self::new(16)
    }
}

impl DashMapKvs {
    pub fn new(concurrency: usize) -> Self {
        let shards = concurrency.max(2).next_power_of_two();
        Self {
            forward: DashMap::with_shard_amount(shards),
            inverse: DashMap::with_shard_amount(shards),
        }
    }

    fn snapshot(&self) -> Vec<KvsEntry> {
        let mut entries: Vec<KvsEntry> = self
            .forward
            .iter()
            .map(|e| KvsEntry {
                uuid: e.key().clone(),
                oid: e.value().0,
                timestamp: e.value().1,
            })
            .collect();
        entries.sort_by_key(|e| e.oid);
        entries
    }
}

#[async_trait]
impl BidirectionalMap for DashMapKvs {
    fn get(&self, uuid: &str) -> Option<(ObjectId, Timestamp)> {
        self.forward.get(uuid).map(|e| *e.value())
    }

    fn get_inverse(&self, oid: ObjectId) -> Option<(String, Timestamp)> {
        self.inverse.get(&oid).map(|e| e.value().clone())
    }

    fn set(&self, uuid: &str, oid: ObjectId, timestamp: Timestamp) {
        if let Some((old_oid, _)) = self.forward.insert(uuid.to_string(), (oid, timestamp)) {
            if old_oid != oid {
                self.inverse.remove(&old_oid);
            }
        }
        self.inverse.insert(oid, (uuid.to_string(), timestamp));
    }

    fn delete(&self, uuid: &str) -> Option<ObjectId> {
        let (_, (oid, _)) = self.forward.remove(uuid)?;
        self.inverse.remove(&oid);
        Some(oid)
    }

    fn len(&self) -> usize {
        self.forward.len()
    }

    fn range(&self, f: &mut dyn FnMut(&str, ObjectId, Timestamp) -> bool) {
        for entry in self.forward.iter() {
            let (oid, ts) = *entry.value();
            if !f(entry.key(), oid, ts) {
                break;
            }
        }
    }

    fn clear(&self) {
        self.forward.clear();
        self.inverse.clear();
    }

    fn shrink(&self) {
        self.forward.shrink_to_fit();
        self.inverse.shrink_to_fit();
    }

    async fn load(&self, dir: &Path) -> Result<(), KvsError> {
        let path = dir.join(KVS_FILENAME);
        let data = tokio::fs::read(&path).await?;
        let entries: Vec<KvsEntry> = serde_cbor::from_slice(&data)
            .map_err(|e| KvsError::Deserialization(e.to_string()))?;

        self.clear();
        for entry in entries {
            if self.inverse.contains_key(&entry.oid) {
                return Err(KvsError::Inconsistent(format!(
                    "object id {} bound twice",
                    entry.oid
                )));
            }
            self.set(&entry.uuid, entry.oid, entry.timestamp);
        }
        debug!("loaded {} kvs entries from {}", self.len(), path.display());
        Ok(())
    }

    async fn save(&self, dir: &Path) -> Result<(), KvsError> {
        let data = serde_cbor::to_vec(&self.snapshot())
            .map_err(|e| KvsError::Serialization(e.to_string()))?;
        let path = dir.join(KVS_FILENAME);
        let tmp = dir.join(format!(".{}.tmp", KVS_FILENAME));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_lookup_both_ways() {
        let kvs = DashMapKvs::new(4);
        kvs.set("a", 1, 100);
        assert_eq!(kvs.get("a"), Some((1, 100)));
        assert_eq!(kvs.get_inverse(1), Some(("a".to_string(), 100)));
        assert_eq!(kvs.len(), 1);
    }

    #[test]
    fn test_rebind_drops_stale_inverse() {
        let kvs = DashMapKvs::new(4);
        kvs.set("a", 1, 100);
        kvs.set("a", 2, 200);
        assert!(kvs.get_inverse(1).is_none());
        assert_eq!(kvs.get_inverse(2), Some(("a".to_string(), 200)));
    }

    #[test]
    fn test_delete() {
        let kvs = DashMapKvs::new(4);
        kvs.set("a", 1, 100);
        assert_eq!(kvs.delete("a"), Some(1));
        assert_eq!(kvs.delete("a"), None);
        assert!(kvs.get_inverse(1).is_none());
        assert!(kvs.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let kvs = DashMapKvs::new(4);
        kvs.set("a", 1, 100);
        kvs.set("b", 2, 200);
        kvs.save(dir.path()).await.unwrap();

        let restored = DashMapKvs::new(8);
        restored.load(dir.path()).await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get("b"), Some((2, 200)));
    }

    #[tokio::test]
    async fn test_load_garbage_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(KVS_FILENAME), b"\xff\xfe garbage").unwrap();
        let kvs = DashMapKvs::default();
        assert!(kvs.load(dir.path()).await.is_err());
    }
}
