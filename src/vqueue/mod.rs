// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! In-memory buffer of inserts and deletes that have not been folded into
//! the graph index yet.
//!
//! Every uuid has at most one pending entry, so the insert-pending and
//! delete-pending sets are disjoint by construction. A mutation carrying an
//! older timestamp than the entry already staged for its uuid is dropped.

use crate::core::types::{now_nanos, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    Insert { vector: Vec<f32>, timestamp: Timestamp },
    Delete { timestamp: Timestamp },
}

impl Pending {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Pending::Insert { timestamp, .. } | Pending::Delete { timestamp } => *timestamp,
        }
    }

    fn is_insert(&self) -> bool {
        matches!(self, Pending::Insert { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingInsert {
    pub uuid: String,
    pub vector: Vec<f32>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelete {
    pub uuid: String,
    pub timestamp: Timestamp,
}

/// Snapshot handed to the index builder by [`MutationQueue::drain_all`].
#[derive(Debug, Default)]
pub struct Drained {
    pub inserts: Vec<PendingInsert>,
    pub deletes: Vec<PendingDelete>,
}

impl Drained {
    pub fn len(&self) -> usize {
        self.inserts.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

pub struct MutationQueue {
    // Producers share the read side; drain_all swaps the map under the write side.
    entries: RwLock<DashMap<String, Pending>>,
    insert_len: AtomicUsize,
    delete_len: AtomicUsize,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationQueue {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(DashMap::new()),
            insert_len: AtomicUsize::new(0),
            delete_len: AtomicUsize::new(0),
        }
    }

    /// Stages an insert. Returns `false` when a newer mutation for the same
    /// uuid is already staged. A zero timestamp means "now".
    pub fn stage_insert(&self, uuid: &str, vector: Vec<f32>, timestamp: Timestamp) -> bool {
        let timestamp = if timestamp == 0 { now_nanos() } else { timestamp };
        self.stage(uuid, Pending::Insert { vector, timestamp })
    }

    /// Stages a delete, replacing any staged insert for the uuid.
    pub fn stage_delete(&self, uuid: &str, timestamp: Timestamp) -> bool {
        let timestamp = if timestamp == 0 { now_nanos() } else { timestamp };
        self.stage(uuid, Pending::Delete { timestamp })
    }

    fn stage(&self, uuid: &str, pending: Pending) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.entry(uuid.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().timestamp() > pending.timestamp() {
                    return false;
                }
                let was_insert = occupied.get().is_insert();
                let is_insert = pending.is_insert();
                occupied.insert(pending);
                if was_insert != is_insert {
                    self.bump(was_insert, false);
                    self.bump(is_insert, true);
                }
            }
            Entry::Vacant(vacant) => {
                let is_insert = pending.is_insert();
                vacant.insert(pending);
                self.bump(is_insert, true);
            }
        }
        true
    }

    fn bump(&self, insert: bool, up: bool) {
        let counter = if insert {
            &self.insert_len
        } else {
            &self.delete_len
        };
        if up {
            counter.fetch_add(1, Ordering::AcqRel);
        } else {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn peek_insert(&self, uuid: &str) -> Option<(Vec<f32>, Timestamp)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(uuid)?;
        match entry.value() {
            Pending::Insert { vector, timestamp } => Some((vector.clone(), *timestamp)),
            Pending::Delete { .. } => None,
        }
    }

    pub fn contains_delete(&self, uuid: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(uuid)
            .map(|entry| !entry.value().is_insert())
            .unwrap_or(false)
    }

    pub fn contains_insert(&self, uuid: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(uuid)
            .map(|entry| entry.value().is_insert())
            .unwrap_or(false)
    }

    pub fn get(&self, uuid: &str) -> Option<Pending> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(uuid).map(|entry| entry.value().clone())
    }

    /// Copies of the staged inserts, oldest first.
    pub fn pending_inserts(&self) -> Vec<PendingInsert> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut inserts: Vec<PendingInsert> = entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Pending::Insert { vector, timestamp } => Some(PendingInsert {
                    uuid: entry.key().clone(),
                    vector: vector.clone(),
                    timestamp: *timestamp,
                }),
                Pending::Delete { .. } => None,
            })
            .collect();
        inserts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        inserts
    }

    /// Moves the staged insert for `uuid` to `timestamp`, older or not.
    /// Returns `false` when no insert is staged.
    pub fn restamp_insert(&self, uuid: &str, timestamp: Timestamp) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let restamped = match entries.get_mut(uuid) {
            Some(mut entry) => match entry.value_mut() {
                Pending::Insert { timestamp: staged, .. } => {
                    *staged = timestamp;
                    true
                }
                Pending::Delete { .. } => false,
            },
            None => false,
        };
        restamped
    }

    /// Withdraws the staged delete for `uuid` if it still carries
    /// `timestamp`. A newer mutation staged in between is left alone.
    pub fn cancel_delete(&self, uuid: &str, timestamp: Timestamp) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let removed = entries
            .remove_if(uuid, |_, pending| {
                matches!(pending, Pending::Delete { timestamp: staged } if *staged == timestamp)
            })
            .is_some();
        if removed {
            self.bump(false, false);
        }
        removed
    }

    /// Atomically takes every staged mutation and leaves the queue empty.
    pub fn drain_all(&self) -> Drained {
        let taken = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            self.insert_len.store(0, Ordering::Release);
            self.delete_len.store(0, Ordering::Release);
            std::mem::take(&mut *entries)
        };

        let mut drained = Drained::default();
        for (uuid, pending) in taken {
            match pending {
                Pending::Insert { vector, timestamp } => drained.inserts.push(PendingInsert {
                    uuid,
                    vector,
                    timestamp,
                }),
                Pending::Delete { timestamp } => {
                    drained.deletes.push(PendingDelete { uuid, timestamp })
                }
            }
        }
        drained
            .inserts
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        drained.deletes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        drained
    }

    pub fn insert_len(&self) -> usize {
        self.insert_len.load(Ordering::Acquire)
    }

    pub fn delete_len(&self) -> usize {
        self.delete_len.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.insert_len() + self.delete_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases spare capacity left behind by drained or replaced entries.
    pub fn shrink(&self) {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_delete_switches_sets() {
        let queue = MutationQueue::new();
        assert!(queue.stage_insert("a", vec![1.0], 10));
        assert_eq!((queue.insert_len(), queue.delete_len()), (1, 0));

        assert!(queue.stage_delete("a", 11));
        assert_eq!((queue.insert_len(), queue.delete_len()), (0, 1));
        assert!(queue.peek_insert("a").is_none());
        assert!(queue.contains_delete("a"));
    }

    #[test]
    fn test_stale_mutation_is_dropped() {
        let queue = MutationQueue::new();
        assert!(queue.stage_delete("a", 20));
        assert!(!queue.stage_insert("a", vec![1.0], 19));
        assert!(queue.contains_delete("a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_restage_same_kind_keeps_counts() {
        let queue = MutationQueue::new();
        queue.stage_insert("a", vec![1.0], 1);
        queue.stage_insert("a", vec![2.0], 2);
        assert_eq!(queue.insert_len(), 1);
        assert_eq!(queue.peek_insert("a"), Some((vec![2.0], 2)));
    }

    #[test]
    fn test_drain_all_empties_queue() {
        let queue = MutationQueue::new();
        queue.stage_insert("b", vec![2.0], 2);
        queue.stage_insert("a", vec![1.0], 1);
        queue.stage_delete("c", 3);

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained.inserts[0].uuid, "a");
        assert_eq!(drained.deletes[0].uuid, "c");
        assert!(queue.is_empty());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_restamp_insert_ignores_ordering() {
        let queue = MutationQueue::new();
        queue.stage_insert("a", vec![1.0], 50);
        queue.stage_delete("b", 5);

        assert!(queue.restamp_insert("a", 7));
        assert!(!queue.restamp_insert("b", 9));
        assert!(!queue.restamp_insert("missing", 9));
        assert_eq!(queue.peek_insert("a"), Some((vec![1.0], 7)));
        assert_eq!(queue.get("b"), Some(Pending::Delete { timestamp: 5 }));
    }

    #[test]
    fn test_cancel_delete_requires_matching_timestamp() {
        let queue = MutationQueue::new();
        queue.stage_delete("a", 10);
        queue.stage_insert("b", vec![1.0], 10);

        assert!(!queue.cancel_delete("a", 9));
        assert!(!queue.cancel_delete("b", 10));
        assert!(queue.cancel_delete("a", 10));
        assert_eq!((queue.insert_len(), queue.delete_len()), (1, 0));
        assert!(queue.get("a").is_none());
    }

    #[test]
    fn test_pending_inserts_skip_deletes() {
        let queue = MutationQueue::new();
        queue.stage_insert("late", vec![2.0], 20);
        queue.stage_insert("early", vec![1.0], 10);
        queue.stage_delete("gone", 15);

        let uuids: Vec<String> = queue.pending_inserts().into_iter().map(|p| p.uuid).collect();
        assert_eq!(uuids, vec!["early".to_string(), "late".to_string()]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_zero_timestamp_uses_clock() {
        let queue = MutationQueue::new();
        queue.stage_insert("a", vec![1.0], 0);
        let (_, ts) = queue.peek_insert("a").unwrap();
        assert!(ts > 0);
    }
}
