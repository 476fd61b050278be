//! Leaf subscription: one live query against the store.

use crate::error::{Result, SyncError};
use crate::store::{DocumentStore, ListenerCallback, ListenerEvent, ListenerHandle};
use crate::types::{NodeId, Query, Snapshot, SubscriptionKey};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use super::pipeline::RecordPipeline;
use super::types::{HydrationStatus, Hydratable, Observer, ObserverId, ObserverSet, StatusChange};

/// Listener lifecycle of a subscription.
enum Listener {
    /// Never opened.
    Idle,
    /// `store.subscribe` is running; callbacks may already arrive.
    Opening,
    Open(ListenerHandle),
    /// Unsubscribed. Terminal.
    Closed,
}

struct State {
    status: HydrationStatus,
    data: Option<Snapshot>,
    error: Option<SyncError>,
    listener: Listener,
    /// Bumped whenever a listener is opened or closed; callbacks carrying an
    /// older generation are discarded.
    generation: u64,
}

/// A live query with hydration tracking.
///
/// Created through [`SubscriptionManager::acquire`](super::SubscriptionManager::acquire)
/// so that each key has at most one listener. The listener is opened by the
/// first `hydrate()` and closed by `unsubscribe()`; after that the
/// subscription is disposed and keeps its last state.
pub struct Subscription {
    node: NodeId,
    key: SubscriptionKey,
    query: Query,
    store: Arc<dyn DocumentStore>,
    pipeline: RecordPipeline,
    state: Mutex<State>,
    observers: ObserverSet,
    me: Weak<Subscription>,
}

impl Subscription {
    /// Create an unhydrated subscription for `query`.
    pub fn new(store: Arc<dyn DocumentStore>, query: Query) -> Result<Arc<Self>> {
        Self::with_pipeline(store, query, RecordPipeline::default())
    }

    /// Create a subscription whose snapshots go through `pipeline`.
    pub fn with_pipeline(
        store: Arc<dyn DocumentStore>,
        query: Query,
        pipeline: RecordPipeline,
    ) -> Result<Arc<Self>> {
        query.validate()?;
        let key = query.key();
        Ok(Arc::new_cyclic(|me| Subscription {
            node: NodeId::next(),
            key,
            query,
            store,
            pipeline,
            state: Mutex::new(State {
                status: HydrationStatus::Unhydrated,
                data: None,
                error: None,
                listener: Listener::Idle,
                generation: 0,
            }),
            observers: ObserverSet::default(),
            me: me.clone(),
        }))
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Latest data, if any snapshot has been applied.
    pub fn data(&self) -> Option<Snapshot> {
        self.state.lock().data.clone()
    }

    pub fn error(&self) -> Option<SyncError> {
        self.state.lock().error.clone()
    }

    /// Whether a listener is open (or opening).
    pub fn is_active(&self) -> bool {
        matches!(
            self.state.lock().listener,
            Listener::Opening | Listener::Open(_)
        )
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state.lock().listener, Listener::Closed)
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Open the store listener if none is open.
    ///
    /// Moves `Unhydrated` to `Loading`. A no-op while a listener is open and
    /// after `unsubscribe()`.
    pub fn subscribe(&self) {
        let (generation, change) = {
            let mut state = self.state.lock();
            if !matches!(state.listener, Listener::Idle) {
                return;
            }
            state.listener = Listener::Opening;
            state.generation += 1;
            let previous = state.status.clone();
            if previous == HydrationStatus::Unhydrated {
                state.status = HydrationStatus::Loading;
            }
            let change = StatusChange {
                node: self.node,
                previous,
                current: state.status.clone(),
            };
            (state.generation, change)
        };

        debug!(key = %self.key, generation, "opening listener");
        if change.is_transition() {
            self.observers.notify(&change);
        }

        // The store may deliver synchronously, so no lock is held here.
        let handle = self.store.subscribe(&self.query, self.listener_callback(generation));

        let mut state = self.state.lock();
        if state.generation == generation && matches!(state.listener, Listener::Opening) {
            state.listener = Listener::Open(handle);
        } else {
            drop(state);
            debug!(key = %self.key, "unsubscribed while opening, cancelling listener");
            handle.cancel();
        }
    }

    /// Cancel the listener and dispose the subscription. Safe to call more
    /// than once.
    pub fn unsubscribe(&self) {
        let previous = {
            let mut state = self.state.lock();
            if matches!(state.listener, Listener::Closed) {
                return;
            }
            state.generation += 1;
            std::mem::replace(&mut state.listener, Listener::Closed)
        };
        debug!(key = %self.key, "closing listener");
        if let Listener::Open(handle) = previous {
            handle.cancel();
        }
    }

    fn accepts(&self, generation: u64) -> bool {
        Self::is_live(&self.state.lock(), generation)
    }

    fn is_live(state: &State, generation: u64) -> bool {
        state.generation == generation
            && matches!(state.listener, Listener::Opening | Listener::Open(_))
    }

    fn listener_callback(&self, generation: u64) -> ListenerCallback {
        let me = self.me.clone();
        Arc::new(move |event: ListenerEvent| {
            if let Some(subscription) = me.upgrade() {
                subscription.apply(generation, event);
            }
        })
    }

    /// Apply one listener event. Events from a cancelled or replaced listener
    /// are dropped.
    fn apply(&self, generation: u64, event: ListenerEvent) {
        if !self.accepts(generation) {
            trace!(key = %self.key, generation, "discarding stale listener event");
            return;
        }
        let outcome = match event {
            ListenerEvent::Snapshot(records) => Ok(self.pipeline.apply(records)),
            ListenerEvent::Error(e) => Err(e),
        };

        let change = {
            let mut state = self.state.lock();
            // Re-checked: the pipeline ran without the lock.
            if !Self::is_live(&state, generation) {
                return;
            }
            let previous = state.status.clone();
            match outcome {
                Ok(snapshot) => {
                    state.data = Some(snapshot);
                    state.error = None;
                    state.status = HydrationStatus::Hydrated;
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "subscription failed");
                    state.error = Some(e.clone());
                    state.status = HydrationStatus::Failed(e);
                }
            }
            StatusChange {
                node: self.node,
                previous,
                current: state.status.clone(),
            }
        };
        if change.is_transition() {
            debug!(
                key = %self.key,
                from = change.previous.label(),
                to = change.current.label(),
                "status changed"
            );
        }
        self.observers.notify(&change);
    }
}

impl Hydratable for Subscription {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn status(&self) -> HydrationStatus {
        self.state.lock().status.clone()
    }

    fn hydrate(&self) {
        self.subscribe();
    }

    fn current_data(&self) -> Option<Snapshot> {
        self.data()
    }

    fn current_error(&self) -> Option<SyncError> {
        self.error()
    }

    fn observe(&self, observer: Observer) -> ObserverId {
        self.observers.add(observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Subscription")
            .field("node", &self.node)
            .field("key", &self.key)
            .field("status", &state.status)
            .field("records", &state.data.as_ref().map(|d| d.len()))
            .finish()
    }
}
