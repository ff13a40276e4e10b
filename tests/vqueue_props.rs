// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

use proptest::prelude::*;
use std::collections::HashMap;
use vector_agent::vqueue::MutationQueue;

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, i64),
    Delete(u8, i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8, 1i64..50).prop_map(|(k, t)| Op::Insert(k, t)),
        (0u8..8, 1i64..50).prop_map(|(k, t)| Op::Delete(k, t)),
    ]
}

proptest! {
    #[test]
    fn prop_latest_timestamp_wins(ops in prop::collection::vec(op(), 1..64)) {
        let queue = MutationQueue::new();
        // Reference model: uuid -> (is_insert, timestamp)
        let mut model: HashMap<String, (bool, i64)> = HashMap::new();

        for op in &ops {
            let (uuid, insert, t) = match op {
                Op::Insert(k, t) => (format!("u{}", k), true, *t),
                Op::Delete(k, t) => (format!("u{}", k), false, *t),
            };
            let accepted = if insert {
                queue.stage_insert(&uuid, vec![t as f32], t)
            } else {
                queue.stage_delete(&uuid, t)
            };
            let expected = model.get(&uuid).map_or(true, |(_, current)| t >= *current);
            prop_assert_eq!(accepted, expected);
            if expected {
                model.insert(uuid, (insert, t));
            }
        }

        let inserts = model.values().filter(|(insert, _)| *insert).count();
        prop_assert_eq!(queue.insert_len(), inserts);
        prop_assert_eq!(queue.delete_len(), model.len() - inserts);

        for (uuid, (insert, t)) in &model {
            prop_assert_eq!(queue.contains_insert(uuid), *insert);
            prop_assert_eq!(queue.contains_delete(uuid), !*insert);
            if *insert {
                prop_assert_eq!(queue.peek_insert(uuid), Some((vec![*t as f32], *t)));
            }
        }

        let drained = queue.drain_all();
        prop_assert_eq!(drained.len(), model.len());
        prop_assert!(drained.inserts.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        prop_assert!(drained.deletes.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        prop_assert!(queue.is_empty());
    }
}
