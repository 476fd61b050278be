//! Composite hydration over several sources.
//!
//! A [`Hydrator`] is what a presenter holds: it reports one status for all
//! the data a view needs, triggers hydration on demand, and hands back the
//! combined records. Sources are either passed in directly or acquired as
//! shared subscriptions through the manager, in which case the hydrator
//! holds one reference per query until it is released.

use crate::error::{Result, SyncError};
use crate::subscriptions::{
    HydrationStatus, Hydratable, Observer, ObserverId, ObserverSet, RecordPipeline,
    StatusChange, Subscription, SubscriptionManager,
};
use crate::types::{empty_snapshot, NodeId, Query, Record, Snapshot};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

enum Source {
    Direct(Arc<dyn Hydratable>),
    Shared {
        query: Query,
        pipeline: RecordPipeline,
        acquired: Option<Arc<Subscription>>,
        /// Why the last acquire failed.
        error: Option<SyncError>,
    },
}

struct Slot {
    source: Source,
    observer: Option<ObserverId>,
}

/// A slot as seen without the lock.
enum SlotView {
    Live(Arc<dyn Hydratable>),
    Unacquired(Option<SyncError>),
}

impl SlotView {
    fn status(&self) -> HydrationStatus {
        match self {
            SlotView::Live(source) => source.status(),
            SlotView::Unacquired(Some(e)) => HydrationStatus::Failed(e.clone()),
            SlotView::Unacquired(None) => HydrationStatus::Unhydrated,
        }
    }
}

/// Builder for [`Hydrator`].
pub struct HydratorBuilder {
    manager: Arc<SubscriptionManager>,
    sources: Vec<Source>,
    hydrate_on_access: bool,
}

impl HydratorBuilder {
    /// Add a source the caller already owns.
    pub fn source(mut self, source: Arc<dyn Hydratable>) -> Self {
        self.sources.push(Source::Direct(source));
        self
    }

    /// Add a shared subscription for `query`, acquired on first hydration.
    pub fn shared(self, query: Query) -> Self {
        self.shared_with_pipeline(query, RecordPipeline::default())
    }

    pub fn shared_with_pipeline(mut self, query: Query, pipeline: RecordPipeline) -> Self {
        self.sources.push(Source::Shared {
            query,
            pipeline,
            acquired: None,
            error: None,
        });
        self
    }

    /// Hydrate the first time status or data is read.
    pub fn hydrate_on_access(mut self, enabled: bool) -> Self {
        self.hydrate_on_access = enabled;
        self
    }

    pub fn build(self) -> Arc<Hydrator> {
        let hydrator = Arc::new_cyclic(|me| Hydrator {
            node: NodeId::next(),
            manager: self.manager,
            slots: Mutex::new(
                self.sources
                    .into_iter()
                    .map(|source| Slot {
                        source,
                        observer: None,
                    })
                    .collect(),
            ),
            last_status: Mutex::new(HydrationStatus::Unhydrated),
            hydrate_on_access: self.hydrate_on_access,
            accessed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            observers: ObserverSet::default(),
            me: me.clone(),
        });

        let direct: Vec<(usize, Arc<dyn Hydratable>)> = hydrator
            .slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match &slot.source {
                Source::Direct(s) => Some((i, s.clone())),
                Source::Shared { .. } => None,
            })
            .collect();
        for (index, source) in direct {
            hydrator.attach(index, source.as_ref());
        }
        *hydrator.last_status.lock() = hydrator.composite();
        hydrator
    }
}

/// Composite view over one or more hydratable sources.
///
/// Status follows [`HydrationStatus::composite`]: any failed source fails
/// the whole, otherwise anything not yet hydrated keeps it loading. A
/// hydrator with no sources is hydrated.
pub struct Hydrator {
    node: NodeId,
    manager: Arc<SubscriptionManager>,
    slots: Mutex<Vec<Slot>>,
    /// Composite status last reported to observers.
    last_status: Mutex<HydrationStatus>,
    hydrate_on_access: bool,
    accessed: AtomicBool,
    released: AtomicBool,
    observers: ObserverSet,
    me: Weak<Hydrator>,
}

impl Hydrator {
    pub fn builder(manager: &Arc<SubscriptionManager>) -> HydratorBuilder {
        HydratorBuilder {
            manager: manager.clone(),
            sources: Vec::new(),
            hydrate_on_access: manager.config().hydrate_on_access,
        }
    }

    /// Hydrator over sources the caller owns.
    pub fn new(manager: &Arc<SubscriptionManager>, sources: Vec<Arc<dyn Hydratable>>) -> Arc<Self> {
        sources
            .into_iter()
            .fold(Self::builder(manager), HydratorBuilder::source)
            .build()
    }

    /// Composite status of every source.
    pub fn status(&self) -> HydrationStatus {
        self.touch();
        self.composite()
    }

    /// Acquire shared sources and hydrate any source still unhydrated.
    ///
    /// Cheap to call on every render. Returns the first acquire error; the
    /// failing source also shows up as failed in `status()`.
    pub fn ensure_hydrated(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(());
        }
        let first_error = self.acquire_shared();

        for view in self.views() {
            if let SlotView::Live(source) = view {
                if source.status() == HydrationStatus::Unhydrated {
                    source.hydrate();
                }
            }
        }
        self.refresh();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Records of every source that has data, in source order.
    pub fn current_data(&self) -> Option<Snapshot> {
        self.touch();
        let views = self.views();
        if views.is_empty() {
            return Some(empty_snapshot());
        }
        let present: Vec<Snapshot> = views
            .iter()
            .filter_map(|v| match v {
                SlotView::Live(source) => source.current_data(),
                SlotView::Unacquired(_) => None,
            })
            .collect();
        match present.len() {
            0 => None,
            1 => present.into_iter().next(),
            _ => {
                let records: Vec<Record> = present.iter().flat_map(|s| s.iter().cloned()).collect();
                Some(records.into())
            }
        }
    }

    /// Error of the first failed source.
    pub fn current_error(&self) -> Option<SyncError> {
        self.views().iter().find_map(|v| match v.status() {
            HydrationStatus::Failed(e) => Some(e),
            _ => None,
        })
    }

    /// Register a callback for composite status transitions.
    pub fn on_change<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.observers.add(Arc::new(move |change: &StatusChange| {
            if change.is_transition() {
                f(change);
            }
        }))
    }

    pub fn source_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Detach from every source and give back shared references. Safe to
    /// call more than once.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let detached: Vec<(Option<ObserverId>, Option<Arc<dyn Hydratable>>, Option<Arc<Subscription>>)> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .map(|slot| match &mut slot.source {
                    Source::Direct(s) => (slot.observer.take(), Some(s.clone()), None),
                    Source::Shared { acquired, .. } => {
                        let sub = acquired.take();
                        let observed = sub.clone().map(|s| s as Arc<dyn Hydratable>);
                        (slot.observer.take(), observed, sub)
                    }
                })
                .collect()
        };

        for (observer, observed, shared) in detached {
            if let (Some(id), Some(source)) = (observer, observed) {
                source.unobserve(id);
            }
            if let Some(sub) = shared {
                self.manager.release_subscription(&sub);
            }
        }
        self.manager.graph().remove_node(self.node);
        debug!(node = %self.node, "hydrator released");
    }

    fn touch(&self) {
        if self.hydrate_on_access && !self.accessed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.ensure_hydrated() {
                warn!(error = %e, "hydrate on access failed");
            }
        }
    }

    fn views(&self) -> Vec<SlotView> {
        self.slots
            .lock()
            .iter()
            .map(|slot| match &slot.source {
                Source::Direct(s) => SlotView::Live(s.clone()),
                Source::Shared {
                    acquired: Some(sub),
                    ..
                } => SlotView::Live(sub.clone()),
                Source::Shared { error, .. } => SlotView::Unacquired(error.clone()),
            })
            .collect()
    }

    fn composite(&self) -> HydrationStatus {
        HydrationStatus::composite(self.views().iter().map(SlotView::status))
    }

    /// Acquire every shared source not yet held. Returns the first error.
    fn acquire_shared(&self) -> Option<SyncError> {
        let wanted: Vec<(usize, Query, RecordPipeline)> = self
            .slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match &slot.source {
                Source::Shared {
                    query,
                    pipeline,
                    acquired: None,
                    ..
                } => Some((i, query.clone(), pipeline.clone())),
                _ => None,
            })
            .collect();

        let mut first_error = None;
        for (index, query, pipeline) in wanted {
            match self.manager.acquire_with_pipeline(&query, pipeline) {
                Ok(sub) => self.install(index, sub),
                Err(e) => {
                    warn!(key = %query.key(), error = %e, "shared source unavailable");
                    if let Some(Slot {
                        source: Source::Shared { error, .. },
                        ..
                    }) = self.slots.lock().get_mut(index)
                    {
                        *error = Some(e.clone());
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error
    }

    fn install(&self, index: usize, sub: Arc<Subscription>) {
        let taken = {
            let mut slots = self.slots.lock();
            match slots.get_mut(index) {
                Some(Slot {
                    source: Source::Shared { acquired, error, .. },
                    ..
                }) if acquired.is_none() && !self.released.load(Ordering::SeqCst) => {
                    *acquired = Some(sub.clone());
                    *error = None;
                    true
                }
                _ => false,
            }
        };
        if taken {
            self.attach(index, sub.as_ref());
        } else {
            // Lost a race with another ensure_hydrated or with release.
            self.manager.release_subscription(&sub);
        }
    }

    fn attach(&self, index: usize, source: &dyn Hydratable) {
        if let Err(e) = self.manager.graph().add_dependency(self.node, source.node_id()) {
            warn!(error = %e, "hydrator dependency rejected");
        }
        let me = self.me.clone();
        let id = source.observe(Arc::new(move |_: &StatusChange| {
            if let Some(hydrator) = me.upgrade() {
                hydrator.refresh();
            }
        }));
        if let Some(slot) = self.slots.lock().get_mut(index) {
            slot.observer = Some(id);
        }
    }

    /// Recompute the composite and tell observers.
    fn refresh(&self) {
        let current = self.composite();
        let previous = std::mem::replace(&mut *self.last_status.lock(), current.clone());
        self.observers.notify(&StatusChange {
            node: self.node,
            previous,
            current,
        });
    }
}

impl Hydratable for Hydrator {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn status(&self) -> HydrationStatus {
        Hydrator::status(self)
    }

    fn hydrate(&self) {
        if let Err(e) = self.ensure_hydrated() {
            warn!(error = %e, "hydrate failed");
        }
    }

    fn current_data(&self) -> Option<Snapshot> {
        Hydrator::current_data(self)
    }

    fn current_error(&self) -> Option<SyncError> {
        Hydrator::current_error(self)
    }

    fn observe(&self, observer: Observer) -> ObserverId {
        self.observers.add(observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id);
    }
}

impl Drop for Hydrator {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Hydrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hydrator")
            .field("node", &self.node)
            .field("sources", &self.source_count())
            .field("status", &*self.last_status.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, Arc<SubscriptionManager>) {
        let store = Arc::new(MemoryStore::new());
        let manager = SubscriptionManager::new(store.clone());
        (store, manager)
    }

    fn leaf(store: &Arc<MemoryStore>, collection: &str) -> Arc<dyn Hydratable> {
        Subscription::new(store.clone(), Query::collection(collection)).unwrap()
    }

    #[test]
    fn test_empty_hydrator_is_hydrated() {
        let (_, manager) = setup();
        let hydrator = Hydrator::new(&manager, Vec::new());
        assert_eq!(hydrator.status(), HydrationStatus::Hydrated);
        assert_eq!(hydrator.current_data().unwrap().len(), 0);
        assert!(hydrator.ensure_hydrated().is_ok());
    }

    #[test]
    fn test_composite_follows_sources() {
        let (store, manager) = setup();
        let a = leaf(&store, "a");
        let b = leaf(&store, "b");
        let hydrator = Hydrator::new(&manager, vec![a.clone(), b.clone()]);
        assert_eq!(hydrator.status(), HydrationStatus::Loading);

        hydrator.ensure_hydrated().unwrap();
        assert_eq!(hydrator.status(), HydrationStatus::Loading);
        store.flush();
        assert_eq!(hydrator.status(), HydrationStatus::Hydrated);

        let err = SyncError::transport("permission-denied", "no");
        store.emit_error(&Query::collection("b").key(), err.clone());
        store.flush();
        assert_eq!(hydrator.status(), HydrationStatus::Failed(err.clone()));
        assert_eq!(hydrator.current_error(), Some(err));
    }

    #[test]
    fn test_current_data_concatenates_in_order() {
        let (store, manager) = setup();
        store.insert("a", "1", json!({"n": 1}));
        store.insert("b", "2", json!({"n": 2}));
        store.insert("b", "3", json!({"n": 3}));
        let hydrator = Hydrator::new(&manager, vec![leaf(&store, "a"), leaf(&store, "b")]);
        assert!(hydrator.current_data().is_none());

        hydrator.ensure_hydrated().unwrap();
        store.flush();
        let ids: Vec<String> = hydrator
            .current_data()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_shared_sources_are_refcounted() {
        let (store, manager) = setup();
        let query = Query::collection("clients");
        let first = Hydrator::builder(&manager).shared(query.clone()).build();
        let second = Hydrator::builder(&manager).shared(query.clone()).build();
        assert!(manager.is_empty());

        first.ensure_hydrated().unwrap();
        second.ensure_hydrated().unwrap();
        first.ensure_hydrated().unwrap();
        assert_eq!(manager.ref_count(&query.key()), 2);
        assert_eq!(store.listener_count(), 1);

        first.release();
        assert_eq!(store.listener_count(), 1);
        drop(second);
        assert_eq!(store.listener_count(), 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_on_change_reports_transitions_only() {
        let (store, manager) = setup();
        store.insert("a", "1", json!({}));
        let hydrator = Hydrator::new(&manager, vec![leaf(&store, "a")]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hydrator.on_change(move |change| sink.lock().push(change.current.label()));

        hydrator.ensure_hydrated().unwrap();
        store.flush();
        store.insert("a", "2", json!({}));
        store.flush();
        assert_eq!(*seen.lock(), vec!["hydrated"]);
    }

    #[test]
    fn test_hydrate_on_access() {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            hydrate_on_access: true,
            ..EngineConfig::default()
        };
        let manager =
            SubscriptionManager::with_config(store.clone(), config, Arc::new(SystemClock::new()));
        let hydrator = Hydrator::builder(&manager)
            .shared(Query::collection("clients"))
            .build();
        assert_eq!(hydrator.status(), HydrationStatus::Loading);
        store.flush();
        assert_eq!(hydrator.status(), HydrationStatus::Hydrated);
    }

    #[test]
    fn test_invalid_shared_query_fails_composite() {
        let (_, manager) = setup();
        let hydrator = Hydrator::builder(&manager)
            .shared(Query::collection(""))
            .build();
        assert!(matches!(
            hydrator.ensure_hydrated(),
            Err(SyncError::InvalidQuery(_))
        ));
        assert!(hydrator.status().is_failed());
    }
}
