//! Tracking a write until the read subscription reflects it.
//!
//! Writes and snapshot delivery are not synchronized: a write can succeed
//! while the listener still shows the old document. An
//! [`UpdateTrackingSubscription`] holds one expectation ("field `status` of
//! record `p1` becomes `DENIED`") and resolves it from the subscription's
//! snapshots, its errors, or the clock.

use crate::clock::Clock;
use crate::error::SyncError;
use crate::store::DocumentStore;
use crate::types::{DocumentPath, Record, Timestamp};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use super::manager::SubscriptionManager;
use super::subscription::Subscription;
use super::types::{Hydratable, ObserverId, StatusChange};

/// Resolved tickets remembered for `status` lookups.
const HISTORY_LIMIT: usize = 32;

/// Outcome of one tracked update.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateStatus {
    Pending,
    /// The subscription's data showed the expected value.
    Confirmed,
    /// The deadline passed first. Carries a `SyncError::Timeout`.
    TimedOut(SyncError),
    /// The subscription (or the write) failed while pending.
    Failed(SyncError),
    /// A later `track_update` replaced this one.
    Superseded,
}

impl UpdateStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, UpdateStatus::Pending)
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            UpdateStatus::TimedOut(e) | UpdateStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Handle for one tracked update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpdateTicket(pub u64);

/// The value a field must show for an update to count as landed.
#[derive(Clone, Debug, PartialEq)]
pub struct Expectation {
    /// Dotted field path.
    pub field_path: String,
    /// Expected value; `null` also matches a missing field.
    pub value: Value,
    /// Only this record must match. `None` accepts any record.
    pub record_id: Option<String>,
}

impl Expectation {
    pub fn new(field_path: impl Into<String>, value: Value) -> Self {
        Self {
            field_path: field_path.into(),
            value,
            record_id: None,
        }
    }

    pub fn for_record(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn is_satisfied_by(&self, records: &[Record]) -> bool {
        records
            .iter()
            .filter(|r| self.record_id.as_ref().map_or(true, |id| &r.id == id))
            .any(|r| match r.field(&self.field_path) {
                Some(v) => v == &self.value,
                None => self.value.is_null(),
            })
    }
}

/// The expectation currently being waited on.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingUpdate {
    pub ticket: UpdateTicket,
    pub expectation: Expectation,
    pub submitted_at: Timestamp,
    pub deadline: Timestamp,
}

/// Callback fired when a ticket leaves `Pending`.
pub type UpdateObserver = Arc<dyn Fn(UpdateTicket, &UpdateStatus) + Send + Sync>;

struct TrackerState {
    next_ticket: u64,
    pending: Option<PendingUpdate>,
    history: VecDeque<(UpdateTicket, UpdateStatus)>,
}

impl TrackerState {
    fn remember(&mut self, ticket: UpdateTicket, status: UpdateStatus) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back((ticket, status));
    }
}

/// Watches one read subscription for the effect of a write.
///
/// At most one expectation is pending; a new `track_update` supersedes the
/// previous one.
pub struct UpdateTrackingSubscription {
    me: Weak<Self>,
    subscription: Arc<Subscription>,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
    state: Mutex<TrackerState>,
    observer: ObserverId,
    listeners: Mutex<Vec<UpdateObserver>>,
}

impl UpdateTrackingSubscription {
    /// Track updates against `subscription`, using the manager's store,
    /// clock and default timeout.
    pub fn new(manager: &SubscriptionManager, subscription: Arc<Subscription>) -> Arc<Self> {
        let store = manager.store().clone();
        let clock = manager.clock().clone();
        let default_timeout = manager.config().default_update_timeout();
        Arc::new_cyclic(|me: &Weak<Self>| {
            let weak = me.clone();
            let observer = subscription.observe(Arc::new(move |change: &StatusChange| {
                if let Some(tracker) = weak.upgrade() {
                    tracker.on_change(change);
                }
            }));
            UpdateTrackingSubscription {
                me: me.clone(),
                subscription,
                store,
                clock,
                default_timeout,
                state: Mutex::new(TrackerState {
                    next_ticket: 1,
                    pending: None,
                    history: VecDeque::new(),
                }),
                observer,
                listeners: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    /// The expectation being waited on, if any.
    pub fn pending(&self) -> Option<PendingUpdate> {
        self.state.lock().pending.clone()
    }

    /// Register a callback for resolved tickets.
    pub fn on_resolved(&self, observer: UpdateObserver) {
        self.listeners.lock().push(observer);
    }

    /// Start waiting for `expectation`, superseding any pending one.
    ///
    /// Hydrates the subscription if needed. If its current data already
    /// satisfies the expectation the ticket is confirmed immediately. The
    /// clock times the ticket out at its deadline without any `poll`.
    pub fn track_update(&self, expectation: Expectation, timeout: Option<Duration>) -> UpdateTicket {
        self.subscription.hydrate();
        let now = self.clock.now();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = now.after(timeout.as_millis() as u64);

        let (ticket, superseded) = {
            let mut state = self.state.lock();
            let ticket = UpdateTicket(state.next_ticket);
            state.next_ticket += 1;
            let superseded = state.pending.replace(PendingUpdate {
                ticket,
                expectation,
                submitted_at: now,
                deadline,
            });
            if let Some(ref old) = superseded {
                state.remember(old.ticket, UpdateStatus::Superseded);
            }
            (ticket, superseded)
        };

        if let Some(old) = superseded {
            debug!(ticket = old.ticket.0, "update superseded");
            self.notify(old.ticket, &UpdateStatus::Superseded);
        }
        debug!(
            key = %self.subscription.key(),
            ticket = ticket.0,
            timeout_ms = timeout.as_millis() as u64,
            "tracking update"
        );
        let me = self.me.clone();
        self.clock.schedule(
            deadline,
            Box::new(move || {
                if let Some(tracker) = me.upgrade() {
                    tracker.on_deadline(ticket);
                }
            }),
        );
        self.evaluate(None);
        ticket
    }

    /// Write `update` to `path` and track `expectation`.
    ///
    /// A rejected write fails the ticket at once.
    pub fn submit(
        &self,
        path: &DocumentPath,
        update: Value,
        expectation: Expectation,
        timeout: Option<Duration>,
    ) -> UpdateTicket {
        let ticket = self.track_update(expectation, timeout);
        if let Err(e) = self.store.write(path, update) {
            warn!(path = %path, error = %e, "write rejected");
            self.resolve_if_pending(ticket, UpdateStatus::Failed(e));
        }
        ticket
    }

    /// Check the deadline and current data. Returns the resolution if this
    /// call resolved the pending ticket.
    pub fn poll(&self) -> Option<(UpdateTicket, UpdateStatus)> {
        self.evaluate(None)
    }

    /// Status of `ticket`. Tickets that are neither pending nor remembered
    /// report `Superseded`.
    pub fn status(&self, ticket: UpdateTicket) -> UpdateStatus {
        self.poll();
        let state = self.state.lock();
        if state.pending.as_ref().map(|p| p.ticket) == Some(ticket) {
            return UpdateStatus::Pending;
        }
        state
            .history
            .iter()
            .rev()
            .find(|(t, _)| *t == ticket)
            .map(|(_, status)| status.clone())
            .unwrap_or(UpdateStatus::Superseded)
    }

    fn on_deadline(&self, ticket: UpdateTicket) {
        let current = self.state.lock().pending.as_ref().map(|p| p.ticket);
        if current == Some(ticket) {
            self.evaluate(None);
        }
    }

    fn on_change(&self, change: &StatusChange) {
        self.evaluate(change.current.error().cloned());
    }

    fn evaluate(&self, failure: Option<SyncError>) -> Option<(UpdateTicket, UpdateStatus)> {
        let now = self.clock.now();
        let data = self.subscription.data();
        let (ticket, outcome) = {
            let mut state = self.state.lock();
            let pending = state.pending.as_ref()?;
            let outcome = if now >= pending.deadline {
                UpdateStatus::TimedOut(SyncError::Timeout {
                    path: pending.expectation.field_path.clone(),
                    waited_ms: now.since(pending.submitted_at),
                })
            } else if let Some(e) = failure {
                UpdateStatus::Failed(e)
            } else if data
                .as_ref()
                .map_or(false, |d| pending.expectation.is_satisfied_by(d))
            {
                UpdateStatus::Confirmed
            } else {
                return None;
            };
            let ticket = pending.ticket;
            state.pending = None;
            state.remember(ticket, outcome.clone());
            (ticket, outcome)
        };
        self.log_outcome(ticket, &outcome);
        self.notify(ticket, &outcome);
        Some((ticket, outcome))
    }

    fn resolve_if_pending(&self, ticket: UpdateTicket, outcome: UpdateStatus) {
        {
            let mut state = self.state.lock();
            if state.pending.as_ref().map(|p| p.ticket) != Some(ticket) {
                return;
            }
            state.pending = None;
            state.remember(ticket, outcome.clone());
        }
        self.log_outcome(ticket, &outcome);
        self.notify(ticket, &outcome);
    }

    fn log_outcome(&self, ticket: UpdateTicket, outcome: &UpdateStatus) {
        match outcome {
            UpdateStatus::Confirmed => {
                debug!(key = %self.subscription.key(), ticket = ticket.0, "update confirmed")
            }
            UpdateStatus::TimedOut(e) | UpdateStatus::Failed(e) => {
                warn!(key = %self.subscription.key(), ticket = ticket.0, error = %e, "update not confirmed")
            }
            _ => {}
        }
    }

    fn notify(&self, ticket: UpdateTicket, status: &UpdateStatus) {
        let listeners: Vec<UpdateObserver> = self.listeners.lock().clone();
        for listener in listeners {
            listener(ticket, status);
        }
    }
}

impl Drop for UpdateTrackingSubscription {
    fn drop(&mut self) {
        self.subscription.unobserve(self.observer);
    }
}

impl fmt::Debug for UpdateTrackingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateTrackingSubscription")
            .field("key", self.subscription.key())
            .field("pending", &self.state.lock().pending)
            .finish()
    }
}
