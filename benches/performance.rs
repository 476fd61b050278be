//! Performance benchmarks for subscriptions and hydrators.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use live_hydrate::{
    DerivedSubscription, Hydratable, Hydrator, MemoryStore, Query, Snapshot, SubscriptionManager,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn setup() -> (Arc<MemoryStore>, Arc<SubscriptionManager>) {
    let store = Arc::new(MemoryStore::new());
    let manager = SubscriptionManager::new(store.clone());
    (store, manager)
}

/// Benchmark acquire/release of a shared key with varying holder counts
fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_release");

    for holders in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("holders", holders),
            &holders,
            |b, &holders| {
                let (_, manager) = setup();
                let query = Query::collection("clients").where_eq("officerId", json!("o1"));

                b.iter(|| {
                    for _ in 0..holders {
                        black_box(manager.acquire_query(&query).unwrap());
                    }
                    for _ in 0..holders {
                        manager.release(&query.key());
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark one snapshot fanned out to many hydrators over the same key
fn bench_snapshot_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_fan_out");

    for hydrators in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("hydrators", hydrators),
            &hydrators,
            |b, &count| {
                let (store, manager) = setup();
                let query = Query::collection("clients");
                let views: Vec<Arc<Hydrator>> = (0..count)
                    .map(|_| Hydrator::builder(&manager).shared(query.clone()).build())
                    .collect();
                for view in &views {
                    view.ensure_hydrated().unwrap();
                }
                store.flush();

                let mut n = 0u64;
                b.iter(|| {
                    n += 1;
                    store.insert("clients", "c1", json!({"version": n}));
                    store.flush();
                    black_box(views[0].current_data());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark derived requery as the upstream grows
fn bench_derived_requery(c: &mut Criterion) {
    let mut group = c.benchmark_group("derived_requery");

    for locations in [10, 100] {
        group.bench_with_input(
            BenchmarkId::new("locations", locations),
            &locations,
            |b, &locations| {
                let (store, manager) = setup();
                for i in 0..locations {
                    store.insert("locations", &format!("l{}", i), json!({}));
                    store.insert("clients", &format!("c{}", i), json!({"facilityId": format!("l{}", i)}));
                }
                let upstream = manager.acquire_query(&Query::collection("locations")).unwrap();
                let clients = DerivedSubscription::new(
                    &manager,
                    vec![upstream.clone() as Arc<dyn Hydratable>],
                    |inputs: &[Snapshot]| {
                        let ids: Vec<Value> = inputs[0].iter().map(|r| json!(r.id)).collect();
                        Ok(Some(Query::collection("clients").where_in("facilityId", ids)))
                    },
                )
                .unwrap();
                clients.hydrate();
                store.flush();

                let mut toggle = false;
                b.iter(|| {
                    toggle = !toggle;
                    if toggle {
                        store.insert("locations", "extra", json!({}));
                    } else {
                        store.remove("locations", "extra");
                    }
                    store.flush();
                    black_box(clients.current_data());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_snapshot_fan_out,
    bench_derived_requery,
);

criterion_main!(benches);
