//! Subscriptions whose query is computed from other subscriptions' data.

use crate::error::{Result, SyncError};
use crate::types::{empty_snapshot, NodeId, Query, Snapshot, SubscriptionKey};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::manager::SubscriptionManager;
use super::pipeline::RecordPipeline;
use super::subscription::Subscription;
use super::types::{HydrationStatus, Hydratable, Observer, ObserverId, ObserverSet, StatusChange};

/// Builds the dependent query from upstream data, in upstream order.
///
/// `Ok(None)` means there is nothing to query (for example an empty location
/// list); the derived subscription is then hydrated with no records.
pub type DeriveFn = Arc<dyn Fn(&[Snapshot]) -> Result<Option<Query>> + Send + Sync>;

/// The leaf subscription currently backing a derived subscription.
struct ActiveQuery {
    key: SubscriptionKey,
    inner: Arc<Subscription>,
    observer: ObserverId,
}

/// What the upstreams currently call for.
enum Target {
    /// Hydration not requested yet.
    Idle,
    /// Upstreams still loading.
    Waiting,
    Failed(SyncError),
    NoQuery,
    Query(Query),
}

struct State {
    status: HydrationStatus,
    data: Option<Snapshot>,
    error: Option<SyncError>,
    requested: bool,
    active: Option<ActiveQuery>,
    disposed: bool,
    /// Set while `recompute` runs; nested calls only mark `dirty`.
    recomputing: bool,
    dirty: bool,
}

/// A subscription that re-targets its query whenever its upstreams change.
///
/// It never talks to the store itself: the derived query is acquired from
/// the manager, so several dependents deriving the same key share one
/// listener. Failure flows downward: if any upstream fails, this fails
/// without opening anything.
pub struct DerivedSubscription {
    node: NodeId,
    manager: Arc<SubscriptionManager>,
    upstreams: Vec<Arc<dyn Hydratable>>,
    upstream_observers: Mutex<Vec<ObserverId>>,
    derive: DeriveFn,
    pipeline: RecordPipeline,
    state: Mutex<State>,
    observers: ObserverSet,
    me: Weak<DerivedSubscription>,
}

impl DerivedSubscription {
    /// Create a derived subscription over `upstreams`.
    ///
    /// Records the dependency edges in the manager's graph; fails with
    /// `DependencyCycle` if they would close a cycle.
    pub fn new<F>(
        manager: &Arc<SubscriptionManager>,
        upstreams: Vec<Arc<dyn Hydratable>>,
        derive: F,
    ) -> Result<Arc<Self>>
    where
        F: Fn(&[Snapshot]) -> Result<Option<Query>> + Send + Sync + 'static,
    {
        Self::with_pipeline(manager, upstreams, derive, RecordPipeline::default())
    }

    /// Like `new`, with a pipeline for the derived query's records.
    pub fn with_pipeline<F>(
        manager: &Arc<SubscriptionManager>,
        upstreams: Vec<Arc<dyn Hydratable>>,
        derive: F,
        pipeline: RecordPipeline,
    ) -> Result<Arc<Self>>
    where
        F: Fn(&[Snapshot]) -> Result<Option<Query>> + Send + Sync + 'static,
    {
        if upstreams.is_empty() {
            return Err(SyncError::Configuration(
                "derived subscription needs at least one upstream".to_string(),
            ));
        }
        let node = NodeId::next();
        let deps: Vec<NodeId> = upstreams.iter().map(|u| u.node_id()).collect();
        manager.graph().add_dependencies(node, &deps)?;

        let derived = Arc::new_cyclic(|me| DerivedSubscription {
            node,
            manager: manager.clone(),
            upstreams,
            upstream_observers: Mutex::new(Vec::new()),
            derive: Arc::new(derive),
            pipeline,
            state: Mutex::new(State {
                status: HydrationStatus::Unhydrated,
                data: None,
                error: None,
                requested: false,
                active: None,
                disposed: false,
                recomputing: false,
                dirty: false,
            }),
            observers: ObserverSet::default(),
            me: me.clone(),
        });

        let ids: Vec<ObserverId> = derived
            .upstreams
            .iter()
            .map(|upstream| upstream.observe(derived.recompute_observer()))
            .collect();
        *derived.upstream_observers.lock() = ids;

        // An upstream may already be failed.
        derived.recompute();
        Ok(derived)
    }

    /// Key of the query currently backing this subscription.
    pub fn active_key(&self) -> Option<SubscriptionKey> {
        self.state.lock().active.as_ref().map(|a| a.key.clone())
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Release the backing query and detach from the upstreams.
    pub fn dispose(&self) {
        let active = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.active.take()
        };
        if let Some(active) = active {
            self.detach(active);
        }
        let ids = std::mem::take(&mut *self.upstream_observers.lock());
        for (upstream, id) in self.upstreams.iter().zip(ids) {
            upstream.unobserve(id);
        }
        self.manager.graph().remove_node(self.node);
        debug!(node = %self.node, "disposed derived subscription");
    }

    fn recompute_observer(&self) -> Observer {
        let me = self.me.clone();
        Arc::new(move |_change: &StatusChange| {
            if let Some(derived) = me.upgrade() {
                derived.recompute();
            }
        })
    }

    /// Bring this subscription in line with its upstreams.
    ///
    /// Runs to a fixed point: changes triggered from inside (an inner leaf
    /// delivering synchronously, an observer calling back) are picked up by
    /// another pass instead of nesting.
    fn recompute(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            if state.recomputing {
                state.dirty = true;
                return;
            }
            state.recomputing = true;
        }
        loop {
            self.recompute_once();
            let mut state = self.state.lock();
            if state.dirty && !state.disposed {
                state.dirty = false;
                continue;
            }
            state.recomputing = false;
            break;
        }
    }

    fn recompute_once(&self) {
        let (requested, previous, previous_data) = {
            let state = self.state.lock();
            (state.requested, state.status.clone(), state.data.clone())
        };

        match self.target(requested) {
            Target::Idle => self.set(HydrationStatus::Unhydrated, None, None),
            Target::Waiting => self.set(HydrationStatus::Loading, None, None),
            Target::Failed(e) => {
                self.clear_active();
                self.set(HydrationStatus::Failed(e.clone()), None, Some(e));
            }
            Target::NoQuery => {
                self.clear_active();
                let already_empty = previous_data.as_ref().map_or(false, |d| d.is_empty());
                let data = if already_empty { None } else { Some(empty_snapshot()) };
                self.set(HydrationStatus::Hydrated, data, None);
            }
            Target::Query(query) => match self.ensure_active(query) {
                Ok(inner) => self.mirror(&inner),
                Err(e) => {
                    warn!(node = %self.node, error = %e, "could not acquire derived query");
                    self.clear_active();
                    self.set(HydrationStatus::Failed(e.clone()), None, Some(e));
                }
            },
        }

        let change = {
            let state = self.state.lock();
            let data_changed = match (&previous_data, &state.data) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            };
            if state.status == previous && !data_changed {
                return;
            }
            StatusChange {
                node: self.node,
                previous,
                current: state.status.clone(),
            }
        };
        if change.is_transition() {
            debug!(
                node = %self.node,
                from = change.previous.label(),
                to = change.current.label(),
                "derived status changed"
            );
        }
        self.observers.notify(&change);
    }

    fn target(&self, requested: bool) -> Target {
        let composite =
            HydrationStatus::composite(self.upstreams.iter().map(|u| u.status()));
        match composite {
            HydrationStatus::Failed(e) => Target::Failed(SyncError::UpstreamFailed(Box::new(e))),
            _ if !requested => Target::Idle,
            HydrationStatus::Hydrated => {
                let inputs: Vec<Snapshot> = self
                    .upstreams
                    .iter()
                    .map(|u| u.current_data().unwrap_or_else(empty_snapshot))
                    .collect();
                match (self.derive)(&inputs) {
                    Ok(Some(query)) => match query.validate() {
                        Ok(()) => Target::Query(query),
                        Err(e) => Target::Failed(SyncError::Configuration(e.to_string())),
                    },
                    Ok(None) => Target::NoQuery,
                    Err(e @ SyncError::Configuration(_)) => Target::Failed(e),
                    Err(e) => Target::Failed(SyncError::Configuration(e.to_string())),
                }
            }
            _ => Target::Waiting,
        }
    }

    /// Make `query` the active query, swapping out any previous one.
    fn ensure_active(&self, query: Query) -> Result<Arc<Subscription>> {
        let key = query.key();
        {
            let state = self.state.lock();
            if let Some(ref active) = state.active {
                if active.key == key {
                    return Ok(active.inner.clone());
                }
            }
        }

        let inner = self
            .manager
            .acquire_with_pipeline(&query, self.pipeline.clone())?;
        let observer = inner.observe(self.recompute_observer());
        let previous = self.state.lock().active.replace(ActiveQuery {
            key: key.clone(),
            inner: inner.clone(),
            observer,
        });
        match previous {
            Some(old) => {
                debug!(node = %self.node, from = %old.key, to = %key, "derived query changed");
                self.detach(old);
            }
            None => debug!(node = %self.node, key = %key, "derived query opened"),
        }
        // May deliver synchronously; the nested recompute is deferred.
        inner.hydrate();
        Ok(inner)
    }

    fn clear_active(&self) {
        let active = self.state.lock().active.take();
        if let Some(active) = active {
            self.detach(active);
        }
    }

    fn detach(&self, active: ActiveQuery) {
        active.inner.unobserve(active.observer);
        self.manager.release_subscription(&active.inner);
    }

    /// Copy the inner leaf's state.
    fn mirror(&self, inner: &Subscription) {
        let data = inner.data();
        match inner.status() {
            HydrationStatus::Hydrated => self.set(HydrationStatus::Hydrated, data, None),
            HydrationStatus::Failed(e) => {
                self.set(HydrationStatus::Failed(e.clone()), data, Some(e))
            }
            _ => self.set(HydrationStatus::Loading, data, None),
        }
    }

    /// Update own state. `data` of `None` keeps the last good data.
    fn set(&self, status: HydrationStatus, data: Option<Snapshot>, error: Option<SyncError>) {
        let mut state = self.state.lock();
        state.status = status;
        if data.is_some() {
            state.data = data;
        }
        state.error = error;
    }
}

impl Hydratable for DerivedSubscription {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn status(&self) -> HydrationStatus {
        self.state.lock().status.clone()
    }

    fn hydrate(&self) {
        {
            let mut state = self.state.lock();
            if state.requested || state.disposed {
                return;
            }
            state.requested = true;
        }
        for upstream in &self.upstreams {
            upstream.hydrate();
        }
        self.recompute();
    }

    fn current_data(&self) -> Option<Snapshot> {
        self.state.lock().data.clone()
    }

    fn current_error(&self) -> Option<SyncError> {
        self.state.lock().error.clone()
    }

    fn observe(&self, observer: Observer) -> ObserverId {
        self.observers.add(observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id);
    }
}

impl Drop for DerivedSubscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for DerivedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DerivedSubscription")
            .field("node", &self.node)
            .field("status", &state.status)
            .field("active", &state.active.as_ref().map(|a| &a.key))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    /// Caseload query built from the ids of the hydrated locations.
    fn caseload_from_locations(inputs: &[Snapshot]) -> Result<Option<Query>> {
        let ids: Vec<Value> = inputs[0]
            .iter()
            .map(|r| {
                r.field("id")
                    .cloned()
                    .ok_or_else(|| SyncError::Configuration(format!("{} has no id", r.id)))
            })
            .collect::<Result<_>>()?;
        if ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(Query::collection("clients").where_in("facilityId", ids)))
    }

    fn setup() -> (Arc<MemoryStore>, Arc<SubscriptionManager>, Arc<Subscription>) {
        let store = Arc::new(MemoryStore::new());
        let manager = SubscriptionManager::new(store.clone());
        let locations = manager
            .acquire_query(&Query::collection("locations"))
            .unwrap();
        (store, manager, locations)
    }

    fn derive_caseload(
        manager: &Arc<SubscriptionManager>,
        locations: &Arc<Subscription>,
    ) -> Arc<DerivedSubscription> {
        let upstream: Arc<dyn Hydratable> = locations.clone();
        DerivedSubscription::new(manager, vec![upstream], caseload_from_locations).unwrap()
    }

    #[test]
    fn test_waits_for_upstream_then_queries() {
        let (store, manager, locations) = setup();
        store.insert("locations", "L1", json!({"id": "F1"}));
        store.insert("clients", "c1", json!({"facilityId": "F1"}));
        store.insert("clients", "c2", json!({"facilityId": "F9"}));

        let caseload = derive_caseload(&manager, &locations);
        assert_eq!(caseload.status(), HydrationStatus::Unhydrated);

        caseload.hydrate();
        assert_eq!(caseload.status(), HydrationStatus::Loading);
        assert!(caseload.active_key().is_none());

        store.flush();
        assert_eq!(caseload.status(), HydrationStatus::Hydrated);
        let data = caseload.current_data().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].id, "c1");
    }

    #[test]
    fn test_requery_on_upstream_change() {
        let (store, manager, locations) = setup();
        store.insert("locations", "L1", json!({"id": "F1"}));
        let caseload = derive_caseload(&manager, &locations);
        caseload.hydrate();
        store.flush();
        let first_key = caseload.active_key().unwrap();

        store.insert("locations", "L2", json!({"id": "F2"}));
        store.flush();
        let second_key = caseload.active_key().unwrap();

        assert_ne!(first_key, second_key);
        assert!(!manager.contains(&first_key));
        assert_eq!(store.listener_count_for(&first_key), 0);
        assert_eq!(store.listener_count_for(&second_key), 1);
    }

    #[test]
    fn test_same_derived_query_keeps_listener() {
        let (store, manager, locations) = setup();
        store.insert("locations", "L1", json!({"id": "F1"}));
        let caseload = derive_caseload(&manager, &locations);
        caseload.hydrate();
        store.flush();
        let calls = store.subscribe_calls();

        // Upstream data changes but derives the same query.
        store.insert("locations", "L1", json!({"id": "F1", "name": "North"}));
        store.flush();
        assert_eq!(store.subscribe_calls(), calls);
    }

    #[test]
    fn test_upstream_failure_propagates() {
        let (store, manager, locations) = setup();
        let caseload = derive_caseload(&manager, &locations);
        caseload.hydrate();
        store.emit_error(locations.key(), SyncError::transport("permission-denied", "no"));
        store.flush();

        assert!(caseload.status().is_failed());
        assert!(matches!(
            caseload.current_error(),
            Some(SyncError::UpstreamFailed(_))
        ));
        assert!(caseload.active_key().is_none());
        assert_eq!(store.listener_count(), 1);
    }

    #[test]
    fn test_malformed_upstream_is_configuration_error() {
        let (store, manager, locations) = setup();
        store.insert("locations", "L1", json!({"name": "no id"}));
        let caseload = derive_caseload(&manager, &locations);
        caseload.hydrate();
        store.flush();

        assert!(matches!(
            caseload.current_error(),
            Some(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn test_no_query_is_empty_and_hydrated() {
        let (store, manager, locations) = setup();
        let caseload = derive_caseload(&manager, &locations);
        caseload.hydrate();
        store.flush();

        assert_eq!(caseload.status(), HydrationStatus::Hydrated);
        assert_eq!(caseload.current_data().unwrap().len(), 0);
        assert!(caseload.active_key().is_none());
    }

    #[test]
    fn test_dependents_share_listener() {
        let (store, manager, locations) = setup();
        store.insert("locations", "L1", json!({"id": "F1"}));
        let a = derive_caseload(&manager, &locations);
        let b = derive_caseload(&manager, &locations);
        a.hydrate();
        b.hydrate();
        store.flush();

        let key = a.active_key().unwrap();
        assert_eq!(b.active_key(), Some(key.clone()));
        assert_eq!(manager.ref_count(&key), 2);
        assert_eq!(store.listener_count_for(&key), 1);

        drop(a);
        assert_eq!(manager.ref_count(&key), 1);
        b.dispose();
        assert!(!manager.contains(&key));
    }

    #[test]
    fn test_graph_edges_recorded() {
        let (_, manager, locations) = setup();
        let caseload = derive_caseload(&manager, &locations);
        assert_eq!(
            manager.graph().dependencies_of(caseload.node_id()),
            vec![locations.node_id()]
        );
        caseload.dispose();
        assert!(manager.graph().dependents_of(locations.node_id()).is_empty());
    }

    #[test]
    fn test_requires_upstream() {
        let (_, manager, _) = setup();
        let result = DerivedSubscription::new(&manager, Vec::new(), |_| Ok(None));
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }
}
