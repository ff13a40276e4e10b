// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

use super::{decode_file, encode_file, GraphError, GraphIndex, Neighbor, GRAPH_FILENAME};
use crate::config::AgentConfig;
use crate::core::types::{DistanceType, ObjectId, ObjectType};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;
use tracing::debug;

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    pub dimension: usize,
    pub distance_type: DistanceType,
    pub object_type: ObjectType,
    pub max_connections: usize,
    pub max_connections_layer_0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Objects linked per `build` call.
    pub chunk_size: usize,
    pub seed: Option<u64>,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            distance_type: DistanceType::L2,
            object_type: ObjectType::Float,
            max_connections: 16,
            max_connections_layer_0: 32,
            ef_construction: 200,
            ef_search: 40,
            chunk_size: 100,
            seed: None,
        }
    }
}

impl HnswConfig {
    pub fn from_agent(config: &AgentConfig) -> Self {
        let edges = config.creation_edge_size.max(2);
        Self {
            dimension: config.dimension,
            distance_type: config.distance_type,
            object_type: config.object_type,
            max_connections: edges,
            max_connections_layer_0: edges * 2,
            ef_construction: (edges * 10).max(100),
            ef_search: config.search_edge_size.max(1),
            chunk_size: config.bulk_insert_chunk_size.max(1),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HnswNode {
    vector: Vec<f32>,
    level: usize,
    neighbors: Vec<Vec<ObjectId>>, // neighbors[i] = neighbors at layer i
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    linked: bool,
}

impl HnswNode {
    fn new(vector: Vec<f32>, level: usize) -> Self {
        Self {
            vector,
            level,
            neighbors: vec![Vec::new(); level + 1],
            is_deleted: false,
            linked: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
struct SearchCandidate {
    id: ObjectId,
    distance: f32,
}

impl Eq for SearchCandidate {}

impl PartialOrd for SearchCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

fn by_distance(a: &SearchCandidate, b: &SearchCandidate) -> Ordering {
    a.distance
        .partial_cmp(&b.distance)
        .unwrap_or(Ordering::Equal)
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    dimension: usize,
    distance_type: DistanceType,
    entry_point: Option<ObjectId>,
    next_id: ObjectId,
    unlinked: &'a [ObjectId],
    nodes: Vec<(ObjectId, &'a HnswNode)>,
}

#[derive(Deserialize)]
struct Snapshot {
    dimension: usize,
    distance_type: DistanceType,
    entry_point: Option<ObjectId>,
    next_id: ObjectId,
    unlinked: Vec<ObjectId>,
    nodes: Vec<(ObjectId, HnswNode)>,
}

/// Layered proximity graph. Inserted objects sit in a staging list until
/// `build` links them; staged objects are still served by a linear scan.
pub struct HnswGraph {
    config: HnswConfig,
    nodes: HashMap<ObjectId, HnswNode>,
    entry_point: Option<ObjectId>,
    unlinked: Vec<ObjectId>,
    next_id: ObjectId,
    live: usize,
    rng: StdRng,
}

impl HnswGraph {
    pub fn new(config: HnswConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            nodes: HashMap::new(),
            entry_point: None,
            unlinked: Vec::new(),
            next_id: 1,
            live: 0,
            rng,
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub fn staged_len(&self) -> usize {
        self.unlinked.len()
    }

    pub fn entry_point(&self) -> Option<ObjectId> {
        self.entry_point
    }

    fn assign_level(&mut self) -> usize {
        let p = 1.0 / (self.config.max_connections.max(2) as f64);
        let mut level = 0;
        while level < MAX_LEVEL && self.rng.gen::<f64>() < p {
            level += 1;
        }
        level
    }

    fn max_conn(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.max_connections_layer_0
        } else {
            self.config.max_connections
        }
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.config.distance_type.measure(a, b)
    }

    fn check_dimension(&self, actual: usize) -> Result<(), GraphError> {
        if actual != self.config.dimension {
            return Err(GraphError::DimensionMismatch {
                expected: self.config.dimension,
                actual,
            });
        }
        Ok(())
    }

    fn is_live(&self, id: ObjectId) -> bool {
        self.nodes.get(&id).map_or(false, |n| !n.is_deleted)
    }

    fn search_layer(
        &self,
        query: &[f32],
        entry_point: ObjectId,
        ef: usize,
        layer: usize,
    ) -> Vec<SearchCandidate> {
        let entry = match self.nodes.get(&entry_point) {
            Some(node) => node,
            None => return Vec::new(),
        };

        let mut visited = HashSet::new();
        let mut candidates = BinaryHeap::new();
        let mut nearest = BinaryHeap::new();

        let entry_distance = self.distance(query, &entry.vector);
        candidates.push(SearchCandidate {
            id: entry_point,
            distance: entry_distance,
        });
        nearest.push(SearchCandidate {
            id: entry_point,
            distance: -entry_distance, // Negative for max-heap
        });
        visited.insert(entry_point);

        while let Some(current) = candidates.pop() {
            let farthest = nearest.peek().map(|c| -c.distance).unwrap_or(f32::MAX);
            if current.distance > farthest {
                break;
            }

            let node = match self.nodes.get(&current.id) {
                Some(node) if node.level >= layer => node,
                _ => continue,
            };

            for neighbor_id in &node.neighbors[layer] {
                if !visited.insert(*neighbor_id) {
                    continue;
                }
                let neighbor = match self.nodes.get(neighbor_id) {
                    Some(neighbor) => neighbor,
                    None => continue,
                };

                // Tombstones are traversed but filtered by the caller.
                let distance = self.distance(query, &neighbor.vector);
                let farthest = nearest.peek().map(|c| -c.distance).unwrap_or(f32::MAX);
                if distance < farthest || nearest.len() < ef {
                    candidates.push(SearchCandidate {
                        id: *neighbor_id,
                        distance,
                    });
                    nearest.push(SearchCandidate {
                        id: *neighbor_id,
                        distance: -distance,
                    });
                    if nearest.len() > ef {
                        nearest.pop();
                    }
                }
            }
        }

        let mut result: Vec<_> = nearest
            .into_iter()
            .map(|c| SearchCandidate {
                id: c.id,
                distance: -c.distance,
            })
            .collect();
        result.sort_by(by_distance);
        result
    }

    /// Neighbour candidates per layer for a staged object, computed against
    /// the already linked part of the graph.
    fn layer_candidates(&self, id: ObjectId, entry: ObjectId) -> Vec<Vec<SearchCandidate>> {
        let node = match self.nodes.get(&id) {
            Some(node) => node,
            None => return Vec::new(),
        };
        let query = &node.vector;
        let top = self.nodes.get(&entry).map_or(0, |n| n.level);
        let mut current = entry;
        let mut layers = vec![Vec::new(); node.level + 1];

        for lc in ((node.level + 1)..=top).rev() {
            if let Some(best) = self.search_layer(query, current, 1, lc).first() {
                current = best.id;
            }
        }
        for lc in (0..=node.level.min(top)).rev() {
            let found = self.search_layer(query, current, self.config.ef_construction, lc);
            if let Some(best) = found.first() {
                current = best.id;
            }
            layers[lc] = found;
        }
        layers
    }

    fn collect_candidates(
        &self,
        chunk: &[ObjectId],
        pool_size: usize,
    ) -> Result<Vec<Vec<Vec<SearchCandidate>>>, GraphError> {
        let entry = match self.entry_point {
            Some(entry) => entry,
            None => return Ok(vec![Vec::new(); chunk.len()]),
        };

        let workers = pool_size.max(1).min(chunk.len().max(1));
        if workers == 1 {
            return Ok(chunk
                .iter()
                .map(|id| self.layer_candidates(*id, entry))
                .collect());
        }

        let per_worker = (chunk.len() + workers - 1) / workers;
        std::thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .chunks(per_worker)
                .map(|part| {
                    scope.spawn(move || {
                        part.iter()
                            .map(|id| self.layer_candidates(*id, entry))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let mut out = Vec::with_capacity(chunk.len());
            for handle in handles {
                let part = handle
                    .join()
                    .map_err(|_| GraphError::Build("candidate worker panicked".into()))?;
                out.extend(part);
            }
            Ok(out)
        })
    }

    fn link(&mut self, id: ObjectId, layers: Vec<Vec<SearchCandidate>>, mates: &[ObjectId]) {
        let (vector, level) = match self.nodes.get(&id) {
            Some(node) => (node.vector.clone(), node.level),
            None => return,
        };

        for lc in 0..=level {
            let mut pool: Vec<SearchCandidate> = layers.get(lc).cloned().unwrap_or_default();
            // Objects linked earlier in the same chunk were invisible to the
            // candidate search.
            for mate in mates {
                if let Some(node) = self.nodes.get(mate) {
                    if node.level >= lc {
                        pool.push(SearchCandidate {
                            id: *mate,
                            distance: self.distance(&vector, &node.vector),
                        });
                    }
                }
            }
            pool.retain(|c| {
                c.id != id
                    && self
                        .nodes
                        .get(&c.id)
                        .map_or(false, |n| n.linked && !n.is_deleted)
            });
            pool.sort_by(by_distance);

            let mut seen = HashSet::new();
            let selected: Vec<ObjectId> = pool
                .into_iter()
                .filter(|c| seen.insert(c.id))
                .take(self.max_conn(lc))
                .map(|c| c.id)
                .collect();

            if let Some(node) = self.nodes.get_mut(&id) {
                node.neighbors[lc] = selected.clone();
            }
            for neighbor in selected {
                self.connect(neighbor, id, lc);
            }
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.linked = true;
        }

        let entry_level = self
            .entry_point
            .and_then(|ep| self.nodes.get(&ep))
            .map(|n| n.level);
        match entry_level {
            Some(entry_level) if level <= entry_level => {}
            _ => self.entry_point = Some(id),
        }
    }

    fn connect(&mut self, from: ObjectId, to: ObjectId, layer: usize) {
        let max_conn = self.max_conn(layer);
        let (base, neighbors) = match self.nodes.get_mut(&from) {
            Some(node) if node.level >= layer => {
                if !node.neighbors[layer].contains(&to) {
                    node.neighbors[layer].push(to);
                }
                if node.neighbors[layer].len() <= max_conn {
                    return;
                }
                (node.vector.clone(), node.neighbors[layer].clone())
            }
            _ => return,
        };

        let mut scored: Vec<SearchCandidate> = neighbors
            .iter()
            .filter_map(|id| {
                self.nodes.get(id).map(|node| SearchCandidate {
                    id: *id,
                    distance: if node.is_deleted {
                        f32::INFINITY
                    } else {
                        self.distance(&base, &node.vector)
                    },
                })
            })
            .collect();
        scored.sort_by(by_distance);
        scored.truncate(max_conn);

        if let Some(node) = self.nodes.get_mut(&from) {
            node.neighbors[layer] = scored.into_iter().map(|c| c.id).collect();
        }
    }

    fn pick_entry_point(&self) -> Option<ObjectId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.linked && !n.is_deleted)
            .max_by(|(a_id, a), (b_id, b)| a.level.cmp(&b.level).then(b_id.cmp(a_id)))
            .map(|(id, _)| *id)
    }

    fn finish(&self, mut results: Vec<Neighbor>, k: usize, radius: f32) -> Vec<Neighbor> {
        if radius >= 0.0 {
            results.retain(|n| n.distance <= radius);
        }
        results.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
        });
        let mut seen = HashSet::new();
        results.retain(|n| seen.insert(n.id));
        results.truncate(k);
        results
    }
}

#[async_trait]
impl GraphIndex for HnswGraph {
    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn insert(&mut self, vector: Vec<f32>) -> Result<ObjectId, GraphError> {
        self.check_dimension(vector.len())?;
        let id = self.next_id;
        self.next_id = id.checked_add(1).ok_or(GraphError::IdsExhausted)?;

        let level = self.assign_level();
        let vector = self.config.object_type.normalize(vector);
        self.nodes.insert(id, HnswNode::new(vector, level));
        self.unlinked.push(id);
        self.live += 1;
        Ok(id)
    }

    fn remove(&mut self, id: ObjectId) -> Result<(), GraphError> {
        let linked = match self.nodes.get_mut(&id) {
            Some(node) if !node.is_deleted => {
                if node.linked {
                    node.is_deleted = true;
                }
                node.linked
            }
            _ => return Err(GraphError::ObjectNotFound(id)),
        };

        if !linked {
            self.nodes.remove(&id);
            self.unlinked.retain(|u| *u != id);
        } else if self.entry_point == Some(id) {
            self.entry_point = self.pick_entry_point();
        }
        self.live -= 1;
        Ok(())
    }

    fn build(&mut self, pool_size: usize) -> Result<usize, GraphError> {
        if self.unlinked.is_empty() {
            return Ok(0);
        }
        let take = self.config.chunk_size.max(1).min(self.unlinked.len());
        let chunk: Vec<ObjectId> = self.unlinked[..take].to_vec();
        let candidates = self.collect_candidates(&chunk, pool_size)?;
        self.unlinked.drain(..take);

        for (idx, layers) in candidates.into_iter().enumerate() {
            self.link(chunk[idx], layers, &chunk[..idx]);
        }
        debug!(
            "linked {} objects, {} still staged",
            chunk.len(),
            self.unlinked.len()
        );
        Ok(self.unlinked.len())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        epsilon: f32,
        radius: f32,
    ) -> Result<Vec<Neighbor>, GraphError> {
        self.check_dimension(query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let ef = (self.config.ef_search.max(k) as f32 * (1.0 + epsilon.max(0.0))).ceil() as usize;
        let mut found = Vec::new();
        if let Some(entry) = self.entry_point {
            let top = self.nodes.get(&entry).map_or(0, |n| n.level);
            let mut current = entry;
            for lc in (1..=top).rev() {
                if let Some(best) = self.search_layer(query, current, 1, lc).first() {
                    current = best.id;
                }
            }
            found = self.search_layer(query, current, ef, 0);
        }

        let mut results: Vec<Neighbor> = found
            .into_iter()
            .filter(|c| self.is_live(c.id))
            .map(|c| Neighbor {
                id: c.id,
                distance: c.distance,
            })
            .collect();
        for id in &self.unlinked {
            if let Some(node) = self.nodes.get(id) {
                results.push(Neighbor {
                    id: *id,
                    distance: self.distance(query, &node.vector),
                });
            }
        }
        Ok(self.finish(results, k, radius))
    }

    fn linear_search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, GraphError> {
        self.check_dimension(query.len())?;
        let results = self
            .nodes
            .iter()
            .filter(|(_, n)| !n.is_deleted)
            .map(|(id, n)| Neighbor {
                id: *id,
                distance: self.distance(query, &n.vector),
            })
            .collect();
        Ok(self.finish(results, k, -1.0))
    }

    fn get_vector(&self, id: ObjectId) -> Option<Vec<f32>> {
        self.nodes
            .get(&id)
            .filter(|n| !n.is_deleted)
            .map(|n| n.vector.clone())
    }

    fn len(&self) -> usize {
        self.live
    }

    fn purge(&mut self) -> usize {
        let dead: HashSet<ObjectId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.is_deleted)
            .map(|(id, _)| *id)
            .collect();
        if dead.is_empty() {
            return 0;
        }
        for id in &dead {
            self.nodes.remove(id);
        }

        let entry = self.entry_point;
        let mut orphans = Vec::new();
        for (id, node) in self.nodes.iter_mut() {
            for layer in node.neighbors.iter_mut() {
                layer.retain(|n| !dead.contains(n));
            }
            if node.linked
                && Some(*id) != entry
                && node.neighbors.iter().all(|layer| layer.is_empty())
            {
                orphans.push(*id);
            }
        }
        // Objects cut off from the graph are linked again on the next build.
        for id in orphans {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.linked = false;
            }
            self.unlinked.push(id);
        }
        dead.len()
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.shrink_to_fit();
        self.unlinked.clear();
        self.entry_point = None;
        self.next_id = 1;
        self.live = 0;
    }

    async fn load(&mut self, dir: &Path) -> Result<(), GraphError> {
        let data = tokio::fs::read(dir.join(GRAPH_FILENAME)).await?;
        let snapshot: Snapshot = decode_file(&data)?;

        if snapshot.dimension != self.config.dimension {
            return Err(GraphError::DimensionMismatch {
                expected: self.config.dimension,
                actual: snapshot.dimension,
            });
        }
        if snapshot.distance_type != self.config.distance_type {
            return Err(GraphError::Deserialization(format!(
                "index was built with {} distance, configured {}",
                snapshot.distance_type, self.config.distance_type
            )));
        }

        let nodes: HashMap<ObjectId, HnswNode> = snapshot.nodes.into_iter().collect();
        if let Some(entry) = snapshot.entry_point {
            if !nodes.contains_key(&entry) {
                return Err(GraphError::Deserialization(format!(
                    "entry point {} missing from node set",
                    entry
                )));
            }
        }
        if nodes
            .iter()
            .any(|(id, n)| *id >= snapshot.next_id || n.neighbors.len() != n.level + 1)
        {
            return Err(GraphError::Deserialization("malformed node table".into()));
        }

        self.live = nodes.values().filter(|n| !n.is_deleted).count();
        self.nodes = nodes;
        self.entry_point = snapshot.entry_point;
        self.unlinked = snapshot.unlinked;
        self.next_id = snapshot.next_id;
        debug!("loaded graph with {} live objects", self.live);
        Ok(())
    }

    async fn save(&self, dir: &Path) -> Result<(), GraphError> {
        let mut nodes: Vec<(ObjectId, &HnswNode)> =
            self.nodes.iter().map(|(id, n)| (*id, n)).collect();
        nodes.sort_by_key(|(id, _)| *id);
        let data = encode_file(&SnapshotRef {
            dimension: self.config.dimension,
            distance_type: self.config.distance_type,
            entry_point: self.entry_point,
            next_id: self.next_id,
            unlinked: &self.unlinked,
            nodes,
        })?;

        let path = dir.join(GRAPH_FILENAME);
        let tmp = dir.join(format!(".{}.tmp", GRAPH_FILENAME));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dimension: usize) -> HnswConfig {
        HnswConfig {
            dimension,
            chunk_size: 32,
            seed: Some(42),
            ..HnswConfig::default()
        }
    }

    fn random_vectors(count: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| (0..dimension).map(|_| rng.gen::<f32>()).collect())
            .collect()
    }

    fn build_all(graph: &mut HnswGraph, pool_size: usize) {
        while graph.build(pool_size).unwrap() > 0 {}
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let mut graph = HnswGraph::new(config(2));
        assert_eq!(graph.insert(vec![0.0, 0.0]).unwrap(), 1);
        assert_eq!(graph.insert(vec![1.0, 0.0]).unwrap(), 2);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.staged_len(), 2);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut graph = HnswGraph::new(config(3));
        let result = graph.insert(vec![1.0]);
        assert!(matches!(
            result,
            Err(GraphError::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn test_staged_objects_are_searchable() {
        let mut graph = HnswGraph::new(config(2));
        let id = graph.insert(vec![5.0, 5.0]).unwrap();
        let results = graph.search(&[5.0, 5.0], 1, 0.1, -1.0).unwrap();
        assert_eq!(results[0].id, id);
    }

    #[test]
    fn test_build_links_everything_in_parallel() {
        let mut graph = HnswGraph::new(config(8));
        let vectors = random_vectors(200, 8, 7);
        let ids: Vec<_> = vectors
            .iter()
            .map(|v| graph.insert(v.clone()).unwrap())
            .collect();
        build_all(&mut graph, 4);
        assert_eq!(graph.staged_len(), 0);
        assert!(graph.entry_point().is_some());

        let hits = ids
            .iter()
            .zip(vectors.iter())
            .filter(|(id, v)| {
                graph
                    .search(v, 1, 0.1, -1.0)
                    .unwrap()
                    .first()
                    .map_or(false, |n| n.id == **id)
            })
            .count();
        assert!(hits >= 190, "only {} of 200 vectors found themselves", hits);
    }

    #[test]
    fn test_remove_hides_object() {
        let mut graph = HnswGraph::new(config(2));
        let a = graph.insert(vec![0.0, 0.0]).unwrap();
        let b = graph.insert(vec![1.0, 1.0]).unwrap();
        build_all(&mut graph, 1);

        graph.remove(a).unwrap();
        assert!(graph.get_vector(a).is_none());
        assert_eq!(graph.len(), 1);
        let results = graph.search(&[0.0, 0.0], 2, 0.1, -1.0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, b);
        assert!(matches!(graph.remove(a), Err(GraphError::ObjectNotFound(_))));
    }

    #[test]
    fn test_purge_reclaims_tombstones() {
        let mut graph = HnswGraph::new(config(2));
        let ids: Vec<_> = (0..10)
            .map(|i| graph.insert(vec![i as f32, 0.0]).unwrap())
            .collect();
        build_all(&mut graph, 2);
        graph.remove(ids[0]).unwrap();
        graph.remove(ids[5]).unwrap();

        assert_eq!(graph.purge(), 2);
        assert_eq!(graph.purge(), 0);
        build_all(&mut graph, 2);
        assert_eq!(graph.len(), 8);
        let results = graph.search(&[5.4, 0.0], 1, 0.1, -1.0).unwrap();
        assert_eq!(results[0].id, ids[6]);
    }

    #[test]
    fn test_radius_filters_results() {
        let mut graph = HnswGraph::new(config(1));
        graph.insert(vec![0.0]).unwrap();
        graph.insert(vec![10.0]).unwrap();
        build_all(&mut graph, 1);
        let results = graph.search(&[0.0], 10, 0.0, 1.0).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut graph = HnswGraph::new(config(4));
        for v in random_vectors(50, 4, 1) {
            graph.insert(v).unwrap();
        }
        graph.build(1).unwrap();
        graph.save(dir.path()).await.unwrap();

        let mut restored = HnswGraph::new(config(4));
        restored.load(dir.path()).await.unwrap();
        assert_eq!(restored.len(), 50);
        assert_eq!(restored.get_vector(3), graph.get_vector(3));
        assert_eq!(restored.insert(vec![0.0; 4]).unwrap(), 51);
    }

    #[tokio::test]
    async fn test_load_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let mut graph = HnswGraph::new(config(2));
        graph.insert(vec![1.0, 2.0]).unwrap();
        graph.save(dir.path()).await.unwrap();

        let path = dir.path().join(GRAPH_FILENAME);
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        let mut restored = HnswGraph::new(config(2));
        assert!(restored.load(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_other_dimension() {
        let dir = TempDir::new().unwrap();
        let graph = HnswGraph::new(config(2));
        graph.save(dir.path()).await.unwrap();

        let mut restored = HnswGraph::new(config(3));
        assert!(matches!(
            restored.load(dir.path()).await,
            Err(GraphError::DimensionMismatch { .. })
        ));
    }
}
