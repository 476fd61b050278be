//! Hydration status, change notifications and the `Hydratable` seam.

use crate::error::SyncError;
use crate::types::{NodeId, Snapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where a subscription is in its hydration lifecycle.
///
/// `Unhydrated -> Loading -> {Hydrated, Failed}`. A snapshot received while
/// `Hydrated` keeps the status and replaces the data; a snapshot received
/// while `Failed` moves to `Hydrated`.
#[derive(Clone, Debug, PartialEq)]
pub enum HydrationStatus {
    Unhydrated,
    Loading,
    Hydrated,
    Failed(SyncError),
}

impl HydrationStatus {
    pub fn is_hydrated(&self) -> bool {
        matches!(self, HydrationStatus::Hydrated)
    }

    /// True for `Loading` and `Unhydrated`.
    pub fn is_pending(&self) -> bool {
        matches!(self, HydrationStatus::Loading | HydrationStatus::Unhydrated)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, HydrationStatus::Failed(_))
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            HydrationStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            HydrationStatus::Unhydrated => "unhydrated",
            HydrationStatus::Loading => "loading",
            HydrationStatus::Hydrated => "hydrated",
            HydrationStatus::Failed(_) => "failed",
        }
    }

    /// Combine several statuses into one.
    ///
    /// Any `Failed` wins (the first one in iteration order supplies the
    /// error), then any `Loading`/`Unhydrated` yields `Loading`, otherwise
    /// `Hydrated`. An empty input is `Hydrated`.
    pub fn composite<I>(statuses: I) -> HydrationStatus
    where
        I: IntoIterator<Item = HydrationStatus>,
    {
        let mut pending = false;
        for status in statuses {
            match status {
                HydrationStatus::Failed(e) => return HydrationStatus::Failed(e),
                HydrationStatus::Loading | HydrationStatus::Unhydrated => pending = true,
                HydrationStatus::Hydrated => {}
            }
        }
        if pending {
            HydrationStatus::Loading
        } else {
            HydrationStatus::Hydrated
        }
    }
}

/// Notification sent to observers.
///
/// Fired on every status transition and on every data replacement, so
/// `previous == current` is possible (a new snapshot while hydrated).
#[derive(Clone, Debug)]
pub struct StatusChange {
    pub node: NodeId,
    pub previous: HydrationStatus,
    pub current: HydrationStatus,
}

impl StatusChange {
    pub fn is_transition(&self) -> bool {
        self.previous != self.current
    }
}

/// Identifier returned by `observe`, used to detach.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Observer callback. Runs synchronously in the tick that caused the change.
pub type Observer = Arc<dyn Fn(&StatusChange) + Send + Sync>;

/// Anything whose hydration can be requested and observed.
///
/// Implemented by leaf subscriptions, derived subscriptions and hydrators,
/// which lets each of them be an input to the others.
pub trait Hydratable: Send + Sync {
    /// Node in the dependency graph.
    fn node_id(&self) -> NodeId;

    fn status(&self) -> HydrationStatus;

    /// Request hydration. Returns immediately and is idempotent.
    fn hydrate(&self);

    /// Last good data, kept while failed.
    fn current_data(&self) -> Option<Snapshot>;

    fn current_error(&self) -> Option<SyncError>;

    fn observe(&self, observer: Observer) -> ObserverId;

    fn unobserve(&self, id: ObserverId);
}

/// Registered observers of one node.
#[derive(Default)]
pub(crate) struct ObserverSet {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
}

impl ObserverSet {
    pub(crate) fn add(&self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.observers.lock().push((id, observer));
        id
    }

    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.lock().len()
    }

    /// Call every observer. The list is copied first so observers may
    /// register or detach from inside the callback.
    pub(crate) fn notify(&self, change: &StatusChange) {
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer(change);
        }
    }
}
