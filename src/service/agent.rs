// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

use crate::config::AgentConfig;
use crate::core::error::{AgentError, Result};
use crate::core::types::{now_nanos, Distance, ObjectVector, Timestamp};
use crate::graph::{GraphError, GraphIndex, HnswConfig, HnswGraph, Neighbor};
use crate::kvs::{BidirectionalMap, DashMapKvs, KvsError};
use crate::metadata::{self, Metadata, MetadataError};
use crate::service::lifecycle::{list_dir, needs_backup, DirectoryManager, IndexPaths, LifecycleError};
use crate::service::metrics::{IndexMetrics, MetricsExporter, TracingPublisher};
use crate::vqueue::{MutationQueue, Pending};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reasons a generation directory could not be loaded. Never surfaced to
/// callers: they trigger quarantine and fallback instead.
#[derive(Debug, Error)]
enum LoadError {
    #[error(transparent)]
    Dir(#[from] LifecycleError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("index is marked invalid")]
    MarkedInvalid,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Kvs(#[from] KvsError),

    #[error("metadata records {expected} objects but {actual} were loaded")]
    CountMismatch { expected: u64, actual: u64 },
}

enum Loaded {
    Empty,
    Index(u64),
}

async fn load_generation(
    dir: &Path,
    graph: &mut dyn GraphIndex,
    kvs: &dyn BidirectionalMap,
) -> std::result::Result<Loaded, LoadError> {
    if list_dir(dir)?.is_empty() {
        return Ok(Loaded::Empty);
    }
    let meta = metadata::load(dir)?;
    if meta.is_invalid {
        return Err(LoadError::MarkedInvalid);
    }
    if meta.index_count == 0 {
        return Ok(Loaded::Empty);
    }

    graph.load(dir).await?;
    kvs.load(dir).await?;
    let actual = kvs.len() as u64;
    if actual != meta.index_count {
        return Err(LoadError::CountMismatch {
            expected: meta.index_count,
            actual,
        });
    }
    if graph.len() as u64 != actual {
        warn!(
            "graph holds {} objects while the id map holds {}",
            graph.len(),
            actual
        );
    }
    Ok(Loaded::Index(actual))
}

fn reset(graph: &mut dyn GraphIndex, kvs: &dyn BidirectionalMap) {
    graph.clear();
    kvs.clear();
}

/// Clears its flag when dropped, including when the owning future is
/// dropped mid-operation.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct IndexState {
    indexing: AtomicBool,
    saving: AtomicBool,
    flushing: AtomicBool,
    closed: AtomicBool,
    create_index_executions: AtomicU64,
    unsaved_create_index_executions: AtomicU64,
    unsaved_processed_vectors: AtomicU64,
    proactive_gc_executions: AtomicU64,
    last_save: Mutex<Option<DateTime<Utc>>>,
}

impl IndexState {
    fn last_save(&self) -> Option<DateTime<Utc>> {
        *self.last_save.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_save(&self, ts: DateTime<Utc>) {
        *self.last_save.lock().unwrap_or_else(PoisonError::into_inner) = Some(ts);
    }
}

/// Index lifecycle coordinator: buffers mutations, folds them into the graph
/// index on demand and persists committed generations.
pub struct Agent {
    config: AgentConfig,
    dirs: DirectoryManager,
    queue: MutationQueue,
    // The id map is only mutated while this lock is held for writing.
    graph: RwLock<Box<dyn GraphIndex>>,
    kvs: Box<dyn BidirectionalMap>,
    state: IndexState,
    exporter: Option<MetricsExporter>,
}

impl Agent {
    /// Builds an agent with the in-process backends. Pod annotations are
    /// logged when exporting is enabled in the configuration.
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let exporter = if config.enable_export_index_info_to_k8s {
            Some(MetricsExporter::new(
                Arc::new(TracingPublisher),
                config.pod_name.clone(),
                config.pod_namespace.clone(),
            ))
        } else {
            None
        };
        Self::with_exporter(config, exporter).await
    }

    pub async fn with_exporter(
        config: AgentConfig,
        exporter: Option<MetricsExporter>,
    ) -> Result<Self> {
        let graph = Box::new(HnswGraph::new(HnswConfig::from_agent(&config)));
        let kvs = Box::new(DashMapKvs::new(config.kvs_concurrency));
        Self::with_backends(config, graph, kvs, exporter).await
    }

    pub async fn with_backends(
        config: AgentConfig,
        mut graph: Box<dyn GraphIndex>,
        kvs: Box<dyn BidirectionalMap>,
        exporter: Option<MetricsExporter>,
    ) -> Result<Self> {
        config.validate()?;
        if graph.dimension() != config.dimension {
            return Err(AgentError::InvalidDimensionSize {
                current: graph.dimension(),
                limit: config.dimension,
            });
        }

        let dirs = DirectoryManager::new(
            &config.index_path,
            config.enable_copy_on_write,
            config.broken_index_history_limit,
        );

        if config.is_read_replica {
            match load_generation(&dirs.paths().origin, graph.as_mut(), kvs.as_ref()).await {
                Ok(Loaded::Index(count)) => info!("read replica loaded {} objects", count),
                Ok(Loaded::Empty) => info!("read replica found no committed index"),
                Err(e) => {
                    warn!("read replica failed to load index, serving empty: {}", e);
                    reset(graph.as_mut(), kvs.as_ref());
                }
            }
        } else {
            dirs.prepare()?;
            Self::recover(&dirs, graph.as_mut(), kvs.as_ref()).await?;
        }

        Ok(Self {
            config,
            dirs,
            queue: MutationQueue::new(),
            graph: RwLock::new(graph),
            kvs,
            state: IndexState::default(),
            exporter,
        })
    }

    /// Loads origin, quarantining or clearing whatever fails to load and
    /// falling back to the previous generation under copy-on-write.
    async fn recover(
        dirs: &DirectoryManager,
        graph: &mut dyn GraphIndex,
        kvs: &dyn BidirectionalMap,
    ) -> Result<()> {
        let origin = dirs.paths().origin.clone();
        match load_generation(&origin, graph, kvs).await {
            Ok(Loaded::Index(count)) => {
                info!("loaded {} objects from {}", count, origin.display());
                return Ok(());
            }
            Ok(Loaded::Empty) => {
                // An empty origin next to a populated old is what an
                // interrupted copy-on-write switch leaves behind.
                if !dirs.copy_on_write()
                    || !list_dir(&origin)?.is_empty()
                    || list_dir(&dirs.paths().old)?.is_empty()
                {
                    info!("no committed index in {}, starting empty", origin.display());
                    return Ok(());
                }
                warn!(
                    "{} is empty while the previous generation is not",
                    origin.display()
                );
            }
            Err(e) => {
                warn!("failed to load index from {}: {}", origin.display(), e);
                reset(graph, kvs);
            }
        }

        if needs_backup(&origin) {
            dirs.quarantine(&origin)?;
        } else {
            dirs.clear(&origin)?;
        }

        if dirs.copy_on_write() {
            let old = dirs.paths().old.clone();
            match load_generation(&old, graph, kvs).await {
                Ok(Loaded::Index(count)) => {
                    dirs.promote_old()?;
                    info!("recovered {} objects from the previous generation", count);
                    return Ok(());
                }
                Ok(Loaded::Empty) => {}
                Err(e) => {
                    warn!("previous generation in {} is unusable: {}", old.display(), e);
                    reset(graph, kvs);
                    if needs_backup(&old) {
                        dirs.quarantine(&old)?;
                    } else {
                        dirs.clear(&old)?;
                    }
                }
            }
        }

        info!("starting with an empty index");
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.config.is_read_replica {
            return Err(AgentError::WriteOperationToReadReplica);
        }
        Ok(())
    }

    /// Client writes are refused on replicas and while a flush runs.
    fn ensure_mutable(&self) -> Result<()> {
        self.ensure_writable()?;
        if self.is_flushing() {
            return Err(AgentError::FlushingInProgress);
        }
        Ok(())
    }

    fn validate_uuid(uuid: &str) -> Result<()> {
        if uuid.is_empty() {
            return Err(AgentError::InvalidUuid {
                uuid: uuid.to_string(),
            });
        }
        Ok(())
    }

    fn validate_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(AgentError::InvalidDimensionSize {
                current: vector.len(),
                limit: self.config.dimension,
            });
        }
        Ok(())
    }

    fn timestamp_or_now(t: Timestamp) -> Timestamp {
        if t <= 0 {
            now_nanos()
        } else {
            t
        }
    }

    fn check_insert(&self, uuid: &str, vector: &[f32], validation: bool) -> Result<()> {
        Self::validate_uuid(uuid)?;
        self.validate_vector(vector)?;
        if validation && self.exists(uuid) {
            return Err(AgentError::UuidAlreadyExists {
                uuid: uuid.to_string(),
            });
        }
        Ok(())
    }

    fn check_delete(&self, uuid: &str) -> Result<()> {
        Self::validate_uuid(uuid)?;
        if self.kvs.get(uuid).is_none() && !self.queue.contains_insert(uuid) {
            return Err(AgentError::object_not_found(uuid));
        }
        Ok(())
    }

    fn stage_insert(&self, uuid: &str, vector: Vec<f32>, t: Timestamp) {
        if !self.queue.stage_insert(uuid, vector, t) {
            debug!("insert of {} at {} superseded by a newer mutation", uuid, t);
        }
    }

    fn stage_delete(&self, uuid: &str, t: Timestamp) {
        if !self.queue.stage_delete(uuid, t) {
            debug!("delete of {} at {} superseded by a newer mutation", uuid, t);
        }
    }

    pub fn insert(&self, uuid: &str, vector: Vec<f32>) -> Result<()> {
        self.insert_with_time(uuid, vector, now_nanos())
    }

    pub fn insert_with_time(&self, uuid: &str, vector: Vec<f32>, t: Timestamp) -> Result<()> {
        self.ensure_mutable()?;
        self.check_insert(uuid, &vector, true)?;
        self.stage_insert(uuid, vector, Self::timestamp_or_now(t));
        Ok(())
    }

    pub fn insert_multiple(&self, vectors: HashMap<String, Vec<f32>>) -> Result<()> {
        self.insert_multiple_with_time(vectors, now_nanos())
    }

    /// Validates every entry first; nothing is staged if any entry fails.
    pub fn insert_multiple_with_time(
        &self,
        vectors: HashMap<String, Vec<f32>>,
        t: Timestamp,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let errors: Vec<AgentError> = vectors
            .iter()
            .filter_map(|(uuid, vector)| self.check_insert(uuid, vector, true).err())
            .collect();
        AgentError::aggregate(errors)?;

        let t = Self::timestamp_or_now(t);
        for (uuid, vector) in vectors {
            self.stage_insert(&uuid, vector, t);
        }
        Ok(())
    }

    /// Rejects updates that would store an identical vector.
    async fn ready_for_update(&self, uuid: &str, vector: &[f32]) -> Result<()> {
        Self::validate_uuid(uuid)?;
        self.validate_vector(vector)?;
        match self.get_object(uuid).await {
            Ok((current, _)) if current.as_slice() == vector => Err(AgentError::UuidAlreadyExists {
                uuid: uuid.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub async fn update(&self, uuid: &str, vector: Vec<f32>) -> Result<()> {
        self.update_with_time(uuid, vector, now_nanos()).await
    }

    /// Stages a delete at `t` and the replacement insert at `t + 1`.
    pub async fn update_with_time(&self, uuid: &str, vector: Vec<f32>, t: Timestamp) -> Result<()> {
        self.ensure_mutable()?;
        self.ready_for_update(uuid, &vector).await?;
        self.check_delete(uuid)?;

        let t = Self::timestamp_or_now(t);
        self.stage_delete(uuid, t);
        self.stage_insert(uuid, vector, t.saturating_add(1));
        Ok(())
    }

    pub async fn update_multiple(&self, vectors: HashMap<String, Vec<f32>>) -> Result<()> {
        self.update_multiple_with_time(vectors, now_nanos()).await
    }

    pub async fn update_multiple_with_time(
        &self,
        vectors: HashMap<String, Vec<f32>>,
        t: Timestamp,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let mut errors = Vec::new();
        for (uuid, vector) in &vectors {
            if let Err(e) = self.ready_for_update(uuid, vector).await {
                errors.push(e);
            } else if let Err(e) = self.check_delete(uuid) {
                errors.push(e);
            }
        }
        AgentError::aggregate(errors)?;

        let t = Self::timestamp_or_now(t);
        for (uuid, vector) in vectors {
            self.stage_delete(&uuid, t);
            self.stage_insert(&uuid, vector, t.saturating_add(1));
        }
        Ok(())
    }

    pub fn delete(&self, uuid: &str) -> Result<()> {
        self.delete_with_time(uuid, now_nanos())
    }

    pub fn delete_with_time(&self, uuid: &str, t: Timestamp) -> Result<()> {
        self.ensure_mutable()?;
        self.check_delete(uuid)?;
        self.stage_delete(uuid, Self::timestamp_or_now(t));
        Ok(())
    }

    pub fn delete_multiple(&self, uuids: &[String]) -> Result<()> {
        self.delete_multiple_with_time(uuids, now_nanos())
    }

    pub fn delete_multiple_with_time(&self, uuids: &[String], t: Timestamp) -> Result<()> {
        self.ensure_mutable()?;
        let errors: Vec<AgentError> = uuids
            .iter()
            .filter_map(|uuid| self.check_delete(uuid).err())
            .collect();
        AgentError::aggregate(errors)?;

        let t = Self::timestamp_or_now(t);
        for uuid in uuids {
            self.stage_delete(uuid, t);
        }
        Ok(())
    }

    /// Moves the freshest mutation of `uuid` to `t` without touching its
    /// vector. Unless `force` is set, `t` must be positive and newer than
    /// every timestamp already recorded for the uuid.
    pub async fn update_timestamp(&self, uuid: &str, t: Timestamp, force: bool) -> Result<()> {
        self.ensure_mutable()?;
        Self::validate_uuid(uuid)?;
        if !force && t <= 0 {
            return Err(AgentError::InvalidArgument(format!(
                "timestamp {} must be positive",
                t
            )));
        }
        let stale = || AgentError::UuidAlreadyExists {
            uuid: uuid.to_string(),
        };

        // Holding the write lock keeps create_index from draining the queue
        // or rewriting the id map underneath.
        let _graph = self.graph.write().await;
        match (self.queue.get(uuid), self.kvs.get(uuid)) {
            (None, None) | (Some(Pending::Delete { .. }), None) => {
                Err(AgentError::object_not_found(uuid))
            }
            (Some(Pending::Insert { timestamp: its, .. }), committed) => {
                let kts = committed.map_or(0, |(_, kts)| kts);
                if !force && (t <= its || t <= kts) {
                    return Err(stale());
                }
                self.queue.restamp_insert(uuid, t);
                debug!("restamped staged insert of {} from {} to {}", uuid, its, t);
                Ok(())
            }
            (Some(Pending::Delete { timestamp: dts }), Some((oid, kts))) => {
                if !force && (t <= dts || t <= kts) {
                    return Err(stale());
                }
                self.queue.cancel_delete(uuid, dts);
                self.kvs.set(uuid, oid, t);
                debug!("withdrew delete of {} at {}, committed at {}", uuid, dts, t);
                Ok(())
            }
            (None, Some((oid, kts))) => {
                if !force && t <= kts {
                    return Err(stale());
                }
                self.kvs.set(uuid, oid, t);
                Ok(())
            }
        }
    }

    /// Folds every staged mutation into the graph index and links the new
    /// objects. Readers are only blocked while a single chunk is linked.
    pub async fn create_index(&self, ctx: &CancellationToken, pool_size: usize) -> Result<()> {
        self.ensure_writable()?;
        let _indexing =
            FlagGuard::acquire(&self.state.indexing).ok_or(AgentError::IndexingInProgress)?;
        self.commit(ctx, self.pool_size_or_default(pool_size)).await
    }

    fn pool_size_or_default(&self, pool_size: usize) -> usize {
        if pool_size == 0 {
            self.config.default_pool_size
        } else {
            pool_size
        }
    }

    // Callers hold the indexing flag.
    async fn commit(&self, ctx: &CancellationToken, pool_size: usize) -> Result<()> {
        if self.queue.is_empty() {
            return Err(AgentError::UncommittedIndexNotFound);
        }
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let processed = {
            let mut graph = self.graph.write().await;
            let drained = self.queue.drain_all();
            if drained.is_empty() {
                return Err(AgentError::UncommittedIndexNotFound);
            }
            let processed = drained.len() as u64;
            info!(
                "create index operation started, uncommitted indexes = {}",
                processed
            );

            debug!("create index delete phase started");
            for pending in &drained.deletes {
                match self.kvs.delete(&pending.uuid) {
                    Some(oid) => {
                        if let Err(e) = graph.remove(oid) {
                            error!("failed to remove {} ({}): {}", pending.uuid, oid, e);
                        }
                    }
                    None => warn!("{}", AgentError::object_not_found(pending.uuid.as_str())),
                }
            }

            debug!("create index insert phase started");
            for pending in drained.inserts {
                if let Some(previous) = self.kvs.delete(&pending.uuid) {
                    if let Err(e) = graph.remove(previous) {
                        error!("failed to replace {} ({}): {}", pending.uuid, previous, e);
                    }
                }
                match graph.insert(pending.vector) {
                    Ok(oid) => self.kvs.set(&pending.uuid, oid, pending.timestamp),
                    Err(e) => error!("failed to insert {}: {}", pending.uuid, e),
                }
            }

            if self.config.enable_proactive_gc {
                self.gc(&mut **graph);
            }
            processed
        };

        debug!("create graph phase started, pool size = {}", pool_size);
        let outcome = self.build_graph(ctx, pool_size).await;
        self.record_create_index(processed).await;
        info!("create index operation finished");
        outcome
    }

    async fn record_create_index(&self, processed: u64) {
        {
            // Counters move under the write lock so a concurrent save
            // snapshots them consistently with the data it persists.
            let _graph = self.graph.write().await;
            self.state
                .create_index_executions
                .fetch_add(1, Ordering::AcqRel);
            self.state
                .unsaved_create_index_executions
                .fetch_add(1, Ordering::AcqRel);
            self.state
                .unsaved_processed_vectors
                .fetch_add(processed, Ordering::AcqRel);
        }

        if let Some(exporter) = &self.exporter {
            exporter
                .export_on_create_index(
                    self.len(),
                    self.queue.len() as u64,
                    self.state.unsaved_create_index_executions.load(Ordering::Acquire),
                    self.state.unsaved_processed_vectors.load(Ordering::Acquire),
                )
                .await;
        }
    }

    /// Rebuilds the graph from the committed vectors, compacting object ids,
    /// then folds in whatever is staged.
    pub async fn regenerate_indexes(
        &self,
        ctx: &CancellationToken,
        pool_size: usize,
    ) -> Result<()> {
        self.ensure_writable()?;
        let _indexing =
            FlagGuard::acquire(&self.state.indexing).ok_or(AgentError::IndexingInProgress)?;
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let pool_size = self.pool_size_or_default(pool_size);

        let rebuilt = {
            let mut graph = self.graph.write().await;
            let mut committed = Vec::with_capacity(self.kvs.len());
            self.kvs.range(&mut |uuid, oid, ts| {
                committed.push((uuid.to_string(), oid, ts));
                true
            });
            let mut live = Vec::with_capacity(committed.len());
            for (uuid, oid, ts) in committed {
                match graph.get_vector(oid) {
                    Some(vector) => live.push((uuid, vector, ts)),
                    None => warn!("{} ({}) has no vector and is dropped", uuid, oid),
                }
            }

            reset(&mut **graph, self.kvs.as_ref());
            for (uuid, vector, ts) in live {
                match graph.insert(vector) {
                    Ok(oid) => self.kvs.set(&uuid, oid, ts),
                    Err(e) => error!("failed to reinsert {}: {}", uuid, e),
                }
            }
            self.kvs.len() as u64
        };
        info!("regenerating index with {} objects", rebuilt);

        let outcome = self.build_graph(ctx, pool_size).await;
        self.record_create_index(rebuilt).await;
        outcome?;

        match self.commit(ctx, pool_size).await {
            Ok(()) | Err(AgentError::UncommittedIndexNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn build_graph(&self, ctx: &CancellationToken, pool_size: usize) -> Result<()> {
        loop {
            if ctx.is_cancelled() {
                warn!("create index cancelled before the graph was fully linked");
                return Err(AgentError::Cancelled);
            }
            let remaining = {
                let mut graph = self.graph.write().await;
                graph.build(pool_size)?
            };
            if remaining == 0 {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    fn gc(&self, graph: &mut dyn GraphIndex) {
        let reclaimed = graph.purge();
        self.kvs.shrink();
        self.queue.shrink();
        self.state
            .proactive_gc_executions
            .fetch_add(1, Ordering::AcqRel);
        debug!("proactive gc reclaimed {} objects", reclaimed);
    }

    /// Persists the committed index. A no-op when nothing was created since
    /// the last save.
    pub async fn save_index(&self, ctx: &CancellationToken) -> Result<()> {
        self.ensure_writable()?;
        let _saving = FlagGuard::acquire(&self.state.saving).ok_or(AgentError::SavingInProgress)?;
        if self
            .state
            .unsaved_create_index_executions
            .load(Ordering::Acquire)
            == 0
        {
            debug!("no index changes since the last save");
            return Ok(());
        }
        self.persist(ctx).await
    }

    // Callers hold the saving flag.
    async fn persist(&self, ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let graph = self.graph.read().await;
        let saved_executions = self
            .state
            .unsaved_create_index_executions
            .load(Ordering::Acquire);
        let saved_vectors = self.state.unsaved_processed_vectors.load(Ordering::Acquire);
        let count = self.kvs.len() as u64;
        info!("save index operation started, index count = {}", count);

        if self.dirs.copy_on_write() {
            let tmp = self.dirs.create_tmp()?;
            if let Err(e) = self.write_generation(&tmp, &**graph, count).await {
                self.dirs.discard_tmp(&tmp);
                return Err(e);
            }
            if ctx.is_cancelled() {
                self.dirs.discard_tmp(&tmp);
                return Err(AgentError::Cancelled);
            }
            if let Err(e) = self.dirs.switch_saved(&tmp) {
                self.dirs.discard_tmp(&tmp);
                return Err(e.into());
            }
        } else {
            let origin = &self.dirs.paths().origin;
            metadata::store(origin, &Metadata::invalid())?;
            self.write_generation(origin, &**graph, count).await?;
        }
        drop(graph);

        self.state
            .unsaved_create_index_executions
            .fetch_sub(saved_executions, Ordering::AcqRel);
        self.state
            .unsaved_processed_vectors
            .fetch_sub(saved_vectors, Ordering::AcqRel);
        let now = Utc::now();
        self.state.set_last_save(now);
        info!("save index operation finished");

        if let Some(exporter) = &self.exporter {
            exporter.export_on_save_index(count, now).await;
        }
        Ok(())
    }

    /// Drops every committed and staged object and persists the empty index.
    /// Client writes fail with [`AgentError::FlushingInProgress`] meanwhile,
    /// and a running create or save makes the flush fail instead of wait.
    pub async fn flush(&self, ctx: &CancellationToken) -> Result<()> {
        self.ensure_writable()?;
        let _flushing =
            FlagGuard::acquire(&self.state.flushing).ok_or(AgentError::FlushingInProgress)?;
        let _indexing =
            FlagGuard::acquire(&self.state.indexing).ok_or(AgentError::IndexingInProgress)?;
        let _saving = FlagGuard::acquire(&self.state.saving).ok_or(AgentError::SavingInProgress)?;
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        {
            let mut graph = self.graph.write().await;
            let discarded = self.queue.drain_all();
            reset(&mut **graph, self.kvs.as_ref());
            self.queue.shrink();
            self.kvs.shrink();
            info!("flush discarded {} uncommitted mutations", discarded.len());
        }
        self.persist(ctx).await?;
        info!("index flushed");
        Ok(())
    }

    async fn write_generation(&self, dir: &Path, graph: &dyn GraphIndex, count: u64) -> Result<()> {
        futures::try_join!(
            async { graph.save(dir).await.map_err(AgentError::from) },
            async { self.kvs.save(dir).await.map_err(AgentError::from) },
        )?;
        metadata::store(dir, &Metadata::valid(count))?;
        Ok(())
    }

    pub async fn create_and_save_index(
        &self,
        ctx: &CancellationToken,
        pool_size: usize,
    ) -> Result<()> {
        match self.create_index(ctx, pool_size).await {
            Ok(()) | Err(AgentError::UncommittedIndexNotFound) => {}
            Err(e) => return Err(e),
        }
        self.save_index(ctx).await
    }

    /// Freshest value for `uuid`: a staged insert wins, a staged delete hides
    /// committed data, otherwise the committed index answers.
    pub async fn get_object(&self, uuid: &str) -> Result<(Vec<f32>, Timestamp)> {
        if let Some(found) = self.queue.peek_insert(uuid) {
            return Ok(found);
        }

        let graph = self.graph.read().await;
        if let Some(found) = self.queue.peek_insert(uuid) {
            return Ok(found);
        }
        if self.queue.contains_delete(uuid) {
            debug!("{} is committed but scheduled for deletion", uuid);
            return Err(AgentError::object_not_found(uuid));
        }
        let (oid, timestamp) = self
            .kvs
            .get(uuid)
            .ok_or_else(|| AgentError::object_not_found(uuid))?;
        let vector = graph
            .get_vector(oid)
            .ok_or_else(|| AgentError::object_not_found(uuid))?;
        Ok((vector, timestamp))
    }

    pub fn exists(&self, uuid: &str) -> bool {
        if self.queue.contains_insert(uuid) {
            return true;
        }
        self.kvs.get(uuid).is_some() && !self.queue.contains_delete(uuid)
    }

    fn to_distances(&self, neighbors: Vec<Neighbor>) -> Result<Vec<Distance>> {
        let results: Vec<Distance> = neighbors
            .into_iter()
            .filter_map(|n| match self.kvs.get_inverse(n.id) {
                Some((uuid, _)) => Some(Distance::new(uuid, n.distance)),
                None => {
                    warn!("object {} has no uuid binding", n.id);
                    None
                }
            })
            .collect();
        if results.is_empty() {
            return Err(AgentError::EmptySearchResult);
        }
        Ok(results)
    }

    pub async fn search(
        &self,
        vector: &[f32],
        k: usize,
        epsilon: f32,
        radius: f32,
    ) -> Result<Vec<Distance>> {
        self.validate_vector(vector)?;
        if k == 0 {
            return Err(AgentError::InvalidArgument("k must be greater than 0".into()));
        }
        let graph = self.graph.read().await;
        let neighbors = graph.search(vector, k, epsilon, radius)?;
        self.to_distances(neighbors)
    }

    pub async fn search_by_id(
        &self,
        uuid: &str,
        k: usize,
        epsilon: f32,
        radius: f32,
    ) -> Result<(Vec<f32>, Vec<Distance>)> {
        let (vector, _) = self.get_object(uuid).await?;
        let results = self.search(&vector, k, epsilon, radius).await?;
        Ok((vector, results))
    }

    /// [`Agent::search`] with the configured default epsilon and radius.
    pub async fn search_with_defaults(&self, vector: &[f32], k: usize) -> Result<Vec<Distance>> {
        self.search(
            vector,
            k,
            self.config.default_epsilon,
            self.config.default_radius,
        )
        .await
    }

    pub async fn search_by_id_with_defaults(
        &self,
        uuid: &str,
        k: usize,
    ) -> Result<(Vec<f32>, Vec<Distance>)> {
        self.search_by_id(
            uuid,
            k,
            self.config.default_epsilon,
            self.config.default_radius,
        )
        .await
    }

    pub async fn linear_search(&self, vector: &[f32], k: usize) -> Result<Vec<Distance>> {
        self.validate_vector(vector)?;
        if k == 0 {
            return Err(AgentError::InvalidArgument("k must be greater than 0".into()));
        }
        let graph = self.graph.read().await;
        let neighbors = graph.linear_search(vector, k)?;
        self.to_distances(neighbors)
    }

    pub async fn linear_search_by_id(
        &self,
        uuid: &str,
        k: usize,
    ) -> Result<(Vec<f32>, Vec<Distance>)> {
        let (vector, _) = self.get_object(uuid).await?;
        let results = self.linear_search(&vector, k).await?;
        Ok((vector, results))
    }

    /// Committed uuids. Stops early once `ctx` is cancelled.
    pub fn uuids(&self, ctx: &CancellationToken) -> Vec<String> {
        let mut uuids = Vec::with_capacity(self.kvs.len());
        self.kvs.range(&mut |uuid, _, _| {
            uuids.push(uuid.to_string());
            !ctx.is_cancelled()
        });
        uuids
    }

    /// Visits every live object once, staged inserts first. A staged insert
    /// shadows its committed version only when it is newer; committed objects
    /// with a staged delete are skipped. Stops when `f` returns `false` or
    /// `ctx` is cancelled.
    pub async fn list_object<F>(&self, ctx: &CancellationToken, mut f: F)
    where
        F: FnMut(ObjectVector) -> bool,
    {
        let mut listed = HashSet::new();
        for pending in self.queue.pending_inserts() {
            if ctx.is_cancelled() {
                return;
            }
            let newer = match self.kvs.get(&pending.uuid) {
                Some((_, kts)) => pending.timestamp > kts,
                None => true,
            };
            if !newer {
                continue;
            }
            listed.insert(pending.uuid.clone());
            let object = ObjectVector {
                uuid: pending.uuid,
                vector: pending.vector,
                timestamp: pending.timestamp,
            };
            if !f(object) {
                return;
            }
        }

        let graph = self.graph.read().await;
        let mut committed = Vec::with_capacity(self.kvs.len());
        self.kvs.range(&mut |uuid, oid, ts| {
            if !listed.contains(uuid) && !self.queue.contains_delete(uuid) {
                committed.push((uuid.to_string(), oid, ts));
            }
            true
        });
        for (uuid, oid, timestamp) in committed {
            if ctx.is_cancelled() {
                return;
            }
            let vector = match graph.get_vector(oid) {
                Some(vector) => vector,
                None => {
                    debug!("{} ({}) has no vector, skipping", uuid, oid);
                    continue;
                }
            };
            if !f(ObjectVector {
                uuid,
                vector,
                timestamp,
            }) {
                return;
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.kvs.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_indexing(&self) -> bool {
        self.state.indexing.load(Ordering::Acquire)
    }

    pub fn is_saving(&self) -> bool {
        self.state.saving.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.state.flushing.load(Ordering::Acquire)
    }

    pub fn insert_vqueue_buffer_len(&self) -> u64 {
        self.queue.insert_len() as u64
    }

    pub fn delete_vqueue_buffer_len(&self) -> u64 {
        self.queue.delete_len() as u64
    }

    pub fn number_of_create_index_executions(&self) -> u64 {
        self.state.create_index_executions.load(Ordering::Acquire)
    }

    pub fn number_of_proactive_gc_executions(&self) -> u64 {
        self.state.proactive_gc_executions.load(Ordering::Acquire)
    }

    pub fn broken_index_count(&self) -> usize {
        self.dirs.broken_count()
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn paths(&self) -> &IndexPaths {
        self.dirs.paths()
    }

    pub fn is_read_replica(&self) -> bool {
        self.config.is_read_replica
    }

    pub fn index_metrics(&self) -> IndexMetrics {
        IndexMetrics {
            index_count: Some(self.len()),
            uncommitted_count: Some(self.queue.len() as u64),
            unsaved_create_index_executions: Some(
                self.state
                    .unsaved_create_index_executions
                    .load(Ordering::Acquire),
            ),
            unsaved_processed_vectors: Some(
                self.state.unsaved_processed_vectors.load(Ordering::Acquire),
            ),
            last_save: self.state.last_save(),
        }
    }

    pub async fn export_metrics(&self) {
        if let Some(exporter) = &self.exporter {
            exporter
                .export_on_tick(self.len(), self.queue.len() as u64)
                .await;
        }
    }

    /// Commits and persists outstanding work, then releases the in-memory
    /// index. A no-op on read replicas and on repeated calls.
    pub async fn close(&self, ctx: &CancellationToken) -> Result<()> {
        if self.config.is_read_replica {
            return Ok(());
        }
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = Vec::new();
        match self.create_index(ctx, self.config.default_pool_size).await {
            Ok(()) | Err(AgentError::UncommittedIndexNotFound) | Err(AgentError::Cancelled) => {}
            Err(e) => errors.push(e),
        }
        match self.save_index(ctx).await {
            Ok(()) | Err(AgentError::Cancelled) => {}
            Err(e) => errors.push(e),
        }

        {
            let mut graph = self.graph.write().await;
            reset(&mut **graph, self.kvs.as_ref());
        }
        info!("index released");
        AgentError::aggregate(errors)
    }
}
