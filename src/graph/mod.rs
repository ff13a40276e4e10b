// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

pub mod hnsw;

use crate::core::types::ObjectId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub use hnsw::{HnswConfig, HnswGraph};

pub const GRAPH_FILENAME: &str = "graph.cbor";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("Object id space exhausted")]
    IdsExhausted,

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: ObjectId,
    pub distance: f32,
}

/// Capability consumed by the coordinator. Mutations happen only while the
/// caller holds exclusive access, so implementations need no internal locking.
#[async_trait]
pub trait GraphIndex: Send + Sync {
    fn dimension(&self) -> usize;

    /// Stores the vector and returns its object id. The object becomes fully
    /// searchable once `build` has linked it.
    fn insert(&mut self, vector: Vec<f32>) -> Result<ObjectId, GraphError>;

    fn remove(&mut self, id: ObjectId) -> Result<(), GraphError>;

    /// Links one chunk of staged objects using up to `pool_size` workers and
    /// returns how many remain staged.
    fn build(&mut self, pool_size: usize) -> Result<usize, GraphError>;

    fn search(
        &self,
        query: &[f32],
        k: usize,
        epsilon: f32,
        radius: f32,
    ) -> Result<Vec<Neighbor>, GraphError>;

    fn linear_search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, GraphError>;

    fn get_vector(&self, id: ObjectId) -> Option<Vec<f32>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops tombstoned objects for good; returns how many were reclaimed.
    fn purge(&mut self) -> usize;

    fn clear(&mut self);

    async fn load(&mut self, dir: &Path) -> Result<(), GraphError>;

    async fn save(&self, dir: &Path) -> Result<(), GraphError>;
}

/// On-disk envelope: zstd-compressed CBOR payload guarded by a blake3 digest.
#[derive(Serialize, Deserialize)]
struct GraphFile {
    version: u32,
    checksum: String,
    payload: Vec<u8>,
}

const GRAPH_FILE_VERSION: u32 = 1;

pub(crate) fn encode_file<T: Serialize>(value: &T) -> Result<Vec<u8>, GraphError> {
    let raw = serde_cbor::to_vec(value).map_err(|e| GraphError::Serialization(e.to_string()))?;
    let payload = zstd::encode_all(&raw[..], 3)?;
    let file = GraphFile {
        version: GRAPH_FILE_VERSION,
        checksum: hex::encode(blake3::hash(&payload).as_bytes()),
        payload,
    };
    serde_cbor::to_vec(&file).map_err(|e| GraphError::Serialization(e.to_string()))
}

pub(crate) fn decode_file<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, GraphError> {
    let file: GraphFile =
        serde_cbor::from_slice(data).map_err(|e| GraphError::Deserialization(e.to_string()))?;
    if file.version != GRAPH_FILE_VERSION {
        return Err(GraphError::Deserialization(format!(
            "unsupported graph file version {}",
            file.version
        )));
    }
    let computed = hex::encode(blake3::hash(&file.payload).as_bytes());
    if computed != file.checksum {
        return Err(GraphError::ChecksumMismatch {
            stored: file.checksum,
            computed,
        });
    }
    let raw = zstd::decode_all(&file.payload[..])?;
    serde_cbor::from_slice(&raw).map_err(|e| GraphError::Deserialization(e.to_string()))
}
