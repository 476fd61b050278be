//! Session-scoped registry of live subscriptions.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::store::DocumentStore;
use crate::types::{Query, SubscriptionKey};
use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::graph::DependencyGraph;
use super::pipeline::RecordPipeline;
use super::subscription::Subscription;
use super::types::Hydratable;

/// Internal registry entry.
struct Entry {
    subscription: Arc<Subscription>,
    refs: usize,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<SubscriptionKey, Entry>,
    /// Keys whose factory is currently running.
    in_flight: HashSet<SubscriptionKey>,
}

/// Clears a key's in-flight mark when its factory returns or unwinds.
struct InFlight<'a> {
    registry: &'a RefCell<Registry>,
    key: SubscriptionKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.try_borrow_mut() {
            registry.in_flight.remove(&self.key);
        }
    }
}

/// Owns every shared subscription of one application session.
///
/// At most one subscription (and so one store listener) exists per key.
/// Consumers `acquire` a key and `release` it when done; the last release
/// unsubscribes and removes the entry. Dropping the manager tears down
/// whatever is left.
pub struct SubscriptionManager {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    /// Reentrant so a factory may acquire other keys; the `RefCell` borrow
    /// is never held across a factory call.
    registry: ReentrantMutex<RefCell<Registry>>,
    graph: Mutex<DependencyGraph>,
}

impl SubscriptionManager {
    /// Create a manager with default configuration and the system clock.
    pub fn new(store: Arc<dyn DocumentStore>) -> Arc<Self> {
        Self::with_config(store, EngineConfig::default(), Arc::new(SystemClock::new()))
    }

    pub fn with_config(
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            clock,
            registry: ReentrantMutex::new(RefCell::new(Registry::default())),
            graph: Mutex::new(DependencyGraph::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The session's dependency graph.
    pub fn graph(&self) -> MutexGuard<'_, DependencyGraph> {
        self.graph.lock()
    }

    /// Return the live subscription for `key`, or build one with `factory`.
    ///
    /// Each successful call adds one reference that must be given back with
    /// `release`. A factory error (or panic) leaves the registry as it was.
    /// Acquiring `key` again from inside its own factory fails with
    /// `Reentrancy`.
    pub fn acquire<F>(&self, key: SubscriptionKey, factory: F) -> Result<Arc<Subscription>>
    where
        F: FnOnce() -> Result<Arc<Subscription>>,
    {
        let guard = self.registry.lock();
        {
            let mut registry = guard.borrow_mut();
            if registry.in_flight.contains(&key) {
                warn!(key = %key, "re-entrant acquire from inside factory");
                return Err(SyncError::Reentrancy(key));
            }
            let stale = match registry.entries.get_mut(&key) {
                Some(entry) if !entry.subscription.is_disposed() => {
                    entry.refs += 1;
                    debug!(key = %key, refs = entry.refs, "reusing subscription");
                    return Ok(entry.subscription.clone());
                }
                Some(_) => true,
                None => false,
            };
            if stale {
                debug!(key = %key, "replacing disposed subscription");
                registry.entries.remove(&key);
            }
            registry.in_flight.insert(key.clone());
        }

        let in_flight = InFlight {
            registry: &*guard,
            key: key.clone(),
        };
        let built = factory();
        drop(in_flight);

        let mut registry = guard.borrow_mut();
        let subscription = built?;
        registry.entries.insert(
            key.clone(),
            Entry {
                subscription: subscription.clone(),
                refs: 1,
            },
        );
        debug!(key = %key, "registered subscription");
        Ok(subscription)
    }

    /// Acquire the subscription for `query`, building a plain one if needed.
    pub fn acquire_query(&self, query: &Query) -> Result<Arc<Subscription>> {
        self.acquire_with_pipeline(query, RecordPipeline::default())
    }

    /// Acquire the subscription for `query`; a newly built one uses
    /// `pipeline`.
    ///
    /// The pipeline is not part of the key: while a subscription for the
    /// query is live, later callers share it and their `pipeline` is
    /// ignored.
    pub fn acquire_with_pipeline(
        &self,
        query: &Query,
        pipeline: RecordPipeline,
    ) -> Result<Arc<Subscription>> {
        query.validate()?;
        let store = self.store.clone();
        self.acquire(query.key(), || {
            Subscription::with_pipeline(store, query.clone(), pipeline)
        })
    }

    /// Give back one reference. Returns true if this was the last one and
    /// the subscription was torn down.
    ///
    /// Holders of the acquired `Arc` should prefer `release_subscription`,
    /// which cannot touch a replacement registered under the same key.
    pub fn release(&self, key: &SubscriptionKey) -> bool {
        self.release_entry(key, None)
    }

    /// Give back one reference to `subscription`.
    ///
    /// A no-op returning false if the registry no longer holds this exact
    /// instance (it was shut down, or disposed and replaced).
    pub fn release_subscription(&self, subscription: &Arc<Subscription>) -> bool {
        self.release_entry(subscription.key(), Some(subscription))
    }

    fn release_entry(&self, key: &SubscriptionKey, expected: Option<&Arc<Subscription>>) -> bool {
        let removed = {
            let guard = self.registry.lock();
            let mut registry = guard.borrow_mut();
            let Some(entry) = registry.entries.get_mut(key) else {
                warn!(key = %key, "release of unknown key");
                return false;
            };
            if let Some(expected) = expected {
                if !Arc::ptr_eq(&entry.subscription, expected) {
                    debug!(key = %key, "release of replaced subscription ignored");
                    return false;
                }
            }
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                debug!(key = %key, refs = entry.refs, "released reference");
                return false;
            }
            registry.entries.remove(key)
        };

        match removed {
            Some(entry) => {
                entry.subscription.unsubscribe();
                self.graph.lock().remove_node(entry.subscription.node_id());
                debug!(key = %key, "tore down subscription");
                true
            }
            None => false,
        }
    }

    /// Current reference count for `key` (zero if absent).
    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        let guard = self.registry.lock();
        let registry = guard.borrow();
        registry.entries.get(key).map(|e| e.refs).unwrap_or(0)
    }

    /// Registered subscription for `key`, without taking a reference.
    pub fn get(&self, key: &SubscriptionKey) -> Option<Arc<Subscription>> {
        let guard = self.registry.lock();
        let registry = guard.borrow();
        registry.entries.get(key).map(|e| e.subscription.clone())
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        let guard = self.registry.lock();
        let registry = guard.borrow();
        registry.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let guard = self.registry.lock();
        let registry = guard.borrow();
        let mut keys: Vec<_> = registry.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        let guard = self.registry.lock();
        let registry = guard.borrow();
        registry.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down every registered subscription regardless of refcount
    /// (logout / unmount).
    pub fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let guard = self.registry.lock();
            let mut registry = guard.borrow_mut();
            registry.entries.drain().map(|(_, e)| e).collect()
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "shutting down subscriptions");
        let mut graph = self.graph.lock();
        for entry in entries {
            entry.subscription.unsubscribe();
            graph.remove_node(entry.subscription.node_id());
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
