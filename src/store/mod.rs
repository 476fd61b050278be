//! Capability interface to the remote document store.
//!
//! The engine never talks to a concrete database SDK. It needs two things:
//! - open a live query and receive `{data} | {error}` on every change
//! - write a merge update to one document
//!
//! [`MemoryStore`] is a deterministic implementation whose deliveries are
//! driven by the caller, used by the tests and benchmarks.

mod memory;

pub use memory::{DeliveryMode, MemoryStore};

use crate::error::{Result, SyncError};
use crate::types::{DocumentPath, Query, Record};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Identifier of one store listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

/// What a listener receives on change.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenerEvent {
    /// Complete result set of the query.
    Snapshot(Vec<Record>),
    /// The listener failed.
    Error(SyncError),
}

/// Callback invoked by the store for every listener event.
pub type ListenerCallback = Arc<dyn Fn(ListenerEvent) + Send + Sync>;

/// Exclusive handle to a live listener.
///
/// Cancelling consumes the handle. Dropping an uncancelled handle cancels the
/// listener.
pub struct ListenerHandle {
    id: ListenerId,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn new(id: ListenerId, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Stop the listener.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// The two operations the engine needs from a document store.
pub trait DocumentStore: Send + Sync {
    /// Open a live query. The callback may run on any later call into the
    /// store, and may run once more after cancellation if the transport had
    /// an event buffered.
    fn subscribe(&self, query: &Query, callback: ListenerCallback) -> ListenerHandle;

    /// Merge `update` into the document at `path`.
    fn write(&self, path: &DocumentPath, update: Value) -> Result<()>;
}
