//! In-memory document store with caller-controlled delivery.

use super::{DocumentStore, ListenerCallback, ListenerEvent, ListenerHandle, ListenerId};
use crate::error::{Result, SyncError};
use crate::types::{merge_value, DocumentPath, Query, Record, SubscriptionKey};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// When queued listener events reach their callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Events wait until `flush()` or `deliver_next()`.
    #[default]
    Manual,
    /// Events are delivered before the triggering call returns.
    Immediate,
}

/// Cancelled listeners retained for buffered events, oldest evicted first.
const CANCELLED_LIMIT: usize = 256;

struct Listener {
    query: Query,
    callback: ListenerCallback,
}

struct Cancelled {
    listener: Listener,
    /// Set once `redeliver_to_cancelled` has queued its last event.
    redelivered: bool,
}

#[derive(Default)]
struct Inner {
    /// collection -> id -> document
    documents: BTreeMap<String, BTreeMap<String, Value>>,
    listeners: BTreeMap<ListenerId, Listener>,
    /// Cancelled listeners, kept so buffered events can still reach them.
    /// Dropped once redelivered with nothing left queued.
    cancelled: BTreeMap<ListenerId, Cancelled>,
    /// Events in the queue per listener.
    queued: BTreeMap<ListenerId, usize>,
    next_id: u64,
    subscribe_calls: u64,
    write_failure: Option<SyncError>,
}

impl Inner {
    fn snapshot_for(&self, query: &Query) -> Vec<Record> {
        let Some(docs) = self.documents.get(&query.collection) else {
            return Vec::new();
        };
        docs.iter()
            .filter(|(id, doc)| query.matches(&query.collection, id, doc))
            .map(|(id, doc)| Record::new(id.clone(), doc.clone()))
            .collect()
    }

    fn callback_for(&self, id: ListenerId) -> Option<ListenerCallback> {
        self.listeners
            .get(&id)
            .or_else(|| self.cancelled.get(&id).map(|c| &c.listener))
            .map(|l| l.callback.clone())
    }

    /// Account for one event of `id` leaving the queue.
    fn dequeued(&mut self, id: ListenerId) {
        let drained = match self.queued.get_mut(&id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => true,
        };
        if drained {
            self.queued.remove(&id);
            if self.cancelled.get(&id).map_or(false, |c| c.redelivered) {
                self.cancelled.remove(&id);
            }
        }
    }
}

/// Deterministic in-memory [`DocumentStore`].
///
/// Every listener event goes through a FIFO queue, so the order in which
/// callbacks fire is exactly the order in which changes were made.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    mode: DeliveryMode,
    queue_tx: Sender<(ListenerId, ListenerEvent)>,
    queue_rx: Receiver<(ListenerId, ListenerEvent)>,
}

impl MemoryStore {
    /// Create a store with manual delivery.
    pub fn new() -> Self {
        Self::with_mode(DeliveryMode::Manual)
    }

    pub fn with_mode(mode: DeliveryMode) -> Self {
        let (queue_tx, queue_rx) = unbounded();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            })),
            mode,
            queue_tx,
            queue_rx,
        }
    }

    // --- Documents ---

    /// Replace a document and notify affected listeners.
    pub fn insert(&self, collection: &str, id: &str, doc: Value) {
        let before = {
            let mut inner = self.inner.lock();
            inner
                .documents
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), doc.clone())
        };
        self.changed(collection, id, before.as_ref(), Some(&doc));
    }

    /// Delete a document and notify affected listeners.
    pub fn remove(&self, collection: &str, id: &str) -> Option<Value> {
        let before = {
            let mut inner = self.inner.lock();
            inner
                .documents
                .get_mut(collection)
                .and_then(|docs| docs.remove(id))
        };
        if before.is_some() {
            self.changed(collection, id, before.as_ref(), None);
        }
        before
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .documents
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Make every following `write` fail with `error` (`None` to clear).
    pub fn fail_writes(&self, error: Option<SyncError>) {
        self.inner.lock().write_failure = error;
    }

    /// Queue an error for every live listener on `key`.
    pub fn emit_error(&self, key: &SubscriptionKey, error: SyncError) -> usize {
        let targets: Vec<ListenerId> = {
            let inner = self.inner.lock();
            inner
                .listeners
                .iter()
                .filter(|(_, l)| &l.query.key() == key)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &targets {
            self.enqueue(*id, ListenerEvent::Error(error.clone()));
        }
        self.maybe_flush();
        targets.len()
    }

    // --- Delivery ---

    /// Deliver one queued event. Returns false if the queue was empty.
    pub fn deliver_next(&self) -> bool {
        let Ok((id, event)) = self.queue_rx.try_recv() else {
            return false;
        };
        let callback = {
            let mut inner = self.inner.lock();
            let callback = inner.callback_for(id);
            inner.dequeued(id);
            callback
        };
        if let Some(callback) = callback {
            callback(event);
        }
        true
    }

    /// Deliver queued events until the queue is empty, including events
    /// queued by the callbacks themselves.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        while self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    /// Number of queued events.
    pub fn pending(&self) -> usize {
        self.queue_rx.len()
    }

    /// Queue one more snapshot for every cancelled listener, as a transport
    /// with buffered events would. A listener is forgotten once this last
    /// event has been delivered.
    pub fn redeliver_to_cancelled(&self) -> usize {
        let events: Vec<(ListenerId, Vec<Record>)> = {
            let mut inner = self.inner.lock();
            let events: Vec<_> = inner
                .cancelled
                .iter()
                .map(|(id, c)| (*id, inner.snapshot_for(&c.listener.query)))
                .collect();
            for cancelled in inner.cancelled.values_mut() {
                cancelled.redelivered = true;
            }
            events
        };
        let count = events.len();
        for (id, records) in events {
            self.enqueue(id, ListenerEvent::Snapshot(records));
        }
        self.maybe_flush();
        count
    }

    // --- Introspection ---

    /// Number of live (uncancelled) listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Number of live listeners for one key.
    pub fn listener_count_for(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .lock()
            .listeners
            .values()
            .filter(|l| &l.query.key() == key)
            .count()
    }

    /// Number of cancelled listeners still reachable by buffered events.
    pub fn cancelled_count(&self) -> usize {
        self.inner.lock().cancelled.len()
    }

    /// Total number of `subscribe` calls ever made.
    pub fn subscribe_calls(&self) -> u64 {
        self.inner.lock().subscribe_calls
    }

    // --- Internals ---

    fn enqueue(&self, id: ListenerId, event: ListenerEvent) {
        *self.inner.lock().queued.entry(id).or_default() += 1;
        // The receiver lives as long as `self`, so the send cannot fail.
        let _ = self.queue_tx.send((id, event));
    }

    fn maybe_flush(&self) {
        if self.mode == DeliveryMode::Immediate {
            self.flush();
        }
    }

    fn changed(&self, collection: &str, id: &str, before: Option<&Value>, after: Option<&Value>) {
        let events: Vec<(ListenerId, Vec<Record>)> = {
            let inner = self.inner.lock();
            inner
                .listeners
                .iter()
                .filter(|(_, l)| {
                    before.map_or(false, |doc| l.query.matches(collection, id, doc))
                        || after.map_or(false, |doc| l.query.matches(collection, id, doc))
                })
                .map(|(lid, l)| (*lid, inner.snapshot_for(&l.query)))
                .collect()
        };
        for (lid, records) in events {
            self.enqueue(lid, ListenerEvent::Snapshot(records));
        }
        self.maybe_flush();
    }

    fn cancel_listener(inner: &Weak<Mutex<Inner>>, id: ListenerId) {
        if let Some(inner) = inner.upgrade() {
            let mut inner = inner.lock();
            if let Some(listener) = inner.listeners.remove(&id) {
                if inner.cancelled.len() >= CANCELLED_LIMIT {
                    inner.cancelled.pop_first();
                }
                inner.cancelled.insert(
                    id,
                    Cancelled {
                        listener,
                        redelivered: false,
                    },
                );
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn subscribe(&self, query: &Query, callback: ListenerCallback) -> ListenerHandle {
        let (id, initial) = {
            let mut inner = self.inner.lock();
            let id = ListenerId(inner.next_id);
            inner.next_id += 1;
            inner.subscribe_calls += 1;
            let initial = inner.snapshot_for(query);
            inner.listeners.insert(
                id,
                Listener {
                    query: query.clone(),
                    callback,
                },
            );
            (id, initial)
        };
        self.enqueue(id, ListenerEvent::Snapshot(initial));

        let weak = Arc::downgrade(&self.inner);
        let handle = ListenerHandle::new(id, move || MemoryStore::cancel_listener(&weak, id));
        self.maybe_flush();
        handle
    }

    fn write(&self, path: &DocumentPath, update: Value) -> Result<()> {
        let (before, after) = {
            let mut inner = self.inner.lock();
            if let Some(ref err) = inner.write_failure {
                return Err(err.clone());
            }
            let slot = inner
                .documents
                .entry(path.collection.clone())
                .or_default()
                .entry(path.id.clone())
                .or_insert(Value::Null);
            let before = if slot.is_null() { None } else { Some(slot.clone()) };
            merge_value(slot, update);
            (before, slot.clone())
        };
        self.changed(&path.collection, &path.id, before.as_ref(), Some(&after));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (ListenerCallback, Arc<Mutex<Vec<ListenerEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ListenerCallback =
            Arc::new(move |event: ListenerEvent| sink.lock().push(event));
        (callback, seen)
    }

    #[test]
    fn test_initial_snapshot_is_queued() {
        let store = MemoryStore::new();
        store.insert("clients", "c1", json!({"officerId": "O1"}));
        store.insert("clients", "c2", json!({"officerId": "O2"}));

        let (callback, seen) = recorder();
        let query = Query::collection("clients").where_eq("officerId", json!("O1"));
        let _handle = store.subscribe(&query, callback);

        assert!(seen.lock().is_empty());
        assert_eq!(store.flush(), 1);
        match &seen.lock()[0] {
            ListenerEvent::Snapshot(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].id, "c1");
            }
            other => panic!("Expected snapshot, got {:?}", other),
        };
    }

    #[test]
    fn test_unrelated_change_not_delivered() {
        let store = MemoryStore::new();
        let (callback, seen) = recorder();
        let query = Query::collection("clients").where_eq("officerId", json!("O1"));
        let _handle = store.subscribe(&query, callback);
        store.flush();

        store.insert("clients", "c9", json!({"officerId": "O2"}));
        store.insert("residents", "r1", json!({"officerId": "O1"}));
        assert_eq!(store.flush(), 0);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_document_leaving_query_is_delivered() {
        let store = MemoryStore::new();
        store.insert("clients", "c1", json!({"officerId": "O1"}));
        let (callback, seen) = recorder();
        let query = Query::collection("clients").where_eq("officerId", json!("O1"));
        let _handle = store.subscribe(&query, callback);
        store.flush();

        store.insert("clients", "c1", json!({"officerId": "O2"}));
        store.flush();
        assert_eq!(seen.lock().last(), Some(&ListenerEvent::Snapshot(vec![])));
    }

    #[test]
    fn test_cancel_and_drop() {
        let store = MemoryStore::new();
        let (callback, _) = recorder();
        let handle = store.subscribe(&Query::collection("a"), callback.clone());
        let dropped = store.subscribe(&Query::collection("b"), callback);
        assert_eq!(store.listener_count(), 2);

        handle.cancel();
        drop(dropped);
        assert_eq!(store.listener_count(), 0);
        assert_eq!(store.subscribe_calls(), 2);
    }

    #[test]
    fn test_buffered_event_reaches_cancelled_listener() {
        let store = MemoryStore::new();
        let (callback, seen) = recorder();
        let handle = store.subscribe(&Query::collection("a"), callback);
        handle.cancel();

        store.flush();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(store.redeliver_to_cancelled(), 1);
        store.flush();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_cancelled_listener_forgotten_after_redelivery() {
        let store = MemoryStore::new();
        let (callback, seen) = recorder();
        let handle = store.subscribe(&Query::collection("a"), callback);
        handle.cancel();
        assert_eq!(store.cancelled_count(), 1);

        // Buffered initial snapshot and the redelivered one both arrive.
        assert_eq!(store.redeliver_to_cancelled(), 1);
        assert_eq!(store.cancelled_count(), 1);
        assert_eq!(store.flush(), 2);
        assert_eq!(seen.lock().len(), 2);

        assert_eq!(store.cancelled_count(), 0);
        assert_eq!(store.redeliver_to_cancelled(), 0);
    }

    #[test]
    fn test_cancelled_listeners_are_capped() {
        let store = MemoryStore::new();
        let (callback, _) = recorder();
        for _ in 0..CANCELLED_LIMIT + 10 {
            store.subscribe(&Query::collection("a"), callback.clone()).cancel();
        }
        assert_eq!(store.cancelled_count(), CANCELLED_LIMIT);
    }

    #[test]
    fn test_write_merges_and_notifies() {
        let store = MemoryStore::with_mode(DeliveryMode::Immediate);
        store.insert("updates", "p1", json!({"status": "PENDING", "note": "x"}));
        let (callback, seen) = recorder();
        let _handle = store.subscribe(&Query::document("updates", "p1"), callback);

        store
            .write(&DocumentPath::new("updates", "p1"), json!({"status": "DENIED"}))
            .unwrap();
        assert_eq!(
            store.get("updates", "p1"),
            Some(json!({"status": "DENIED", "note": "x"}))
        );
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_write_failure() {
        let store = MemoryStore::new();
        store.fail_writes(Some(SyncError::transport("permission-denied", "read only")));
        let result = store.write(&DocumentPath::new("a", "1"), json!({"x": 1}));
        assert!(matches!(result, Err(SyncError::Transport { .. })));
        assert_eq!(store.get("a", "1"), None);
    }

    #[test]
    fn test_emit_error() {
        let store = MemoryStore::new();
        let (callback, seen) = recorder();
        let query = Query::collection("a");
        let _handle = store.subscribe(&query, callback);
        store.flush();

        let err = SyncError::transport("unavailable", "offline");
        assert_eq!(store.emit_error(&query.key(), err.clone()), 1);
        store.flush();
        assert_eq!(seen.lock().last(), Some(&ListenerEvent::Error(err)));
    }
}
