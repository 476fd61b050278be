//! Property tests for the composite status rule and manager refcounting.

use live_hydrate::{HydrationStatus, MemoryStore, Query, SubscriptionManager, SyncError};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn status_strategy() -> impl Strategy<Value = HydrationStatus> {
    prop_oneof![
        Just(HydrationStatus::Unhydrated),
        Just(HydrationStatus::Loading),
        Just(HydrationStatus::Hydrated),
        "[a-z]{1,6}".prop_map(|code| HydrationStatus::Failed(SyncError::transport(code, "boom"))),
    ]
}

#[derive(Clone, Debug)]
enum Op {
    Acquire(usize),
    Release(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..4).prop_map(Op::Acquire),
        (0usize..4).prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn prop_composite_rule(statuses in prop::collection::vec(status_strategy(), 0..8)) {
        let composite = HydrationStatus::composite(statuses.clone());
        let first_failed = statuses.iter().find(|s| s.is_failed()).cloned();

        match first_failed {
            Some(failed) => prop_assert_eq!(composite, failed),
            None if statuses.iter().all(|s| s.is_hydrated()) => {
                prop_assert_eq!(composite, HydrationStatus::Hydrated)
            }
            None => prop_assert_eq!(composite, HydrationStatus::Loading),
        }
    }

    #[test]
    fn prop_refcount_tracks_acquire_release(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let store = Arc::new(MemoryStore::new());
        let manager = SubscriptionManager::new(store.clone());
        let queries: Vec<Query> = (0..4).map(|i| Query::collection(format!("c{}", i))).collect();
        let mut expected: HashMap<usize, usize> = HashMap::new();

        for op in ops {
            match op {
                Op::Acquire(i) => {
                    let sub = manager.acquire_query(&queries[i]).unwrap();
                    sub.subscribe();
                    *expected.entry(i).or_default() += 1;
                }
                Op::Release(i) => {
                    let count = expected.entry(i).or_default();
                    let torn_down = manager.release(&queries[i].key());
                    prop_assert_eq!(torn_down, *count == 1);
                    *count = count.saturating_sub(1);
                }
            }

            for (i, query) in queries.iter().enumerate() {
                let refs = expected.get(&i).copied().unwrap_or(0);
                prop_assert_eq!(manager.ref_count(&query.key()), refs);
                prop_assert_eq!(store.listener_count_for(&query.key()), refs.min(1));
            }
        }
    }
}
