//! # Live Hydrate
//!
//! Keeps in-memory views of a document store live and tells the UI when
//! they are ready.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: one live query each, moving through
//!   `unhydrated -> loading -> hydrated | failed`
//! - **Derived subscriptions**: queries computed from other subscriptions
//! - **Manager**: refcounted registry so each query has one listener
//! - **Update tracking**: confirms a write is visible before reporting done
//! - **Hydrators**: one composite status over everything a view needs
//!
//! ## Example
//!
//! ```ignore
//! use live_hydrate::{Hydrator, MemoryStore, Query, SubscriptionManager};
//!
//! let store = Arc::new(MemoryStore::new());
//! let manager = SubscriptionManager::new(store.clone());
//!
//! let hydrator = Hydrator::builder(&manager)
//!     .shared(Query::collection("clients").where_eq("officerId", json!("o1")))
//!     .build();
//!
//! hydrator.ensure_hydrated()?;
//! if hydrator.status().is_hydrated() {
//!     render(hydrator.current_data());
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod hydrator;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock, TimerTask};
pub use config::EngineConfig;
pub use error::{Result, SyncError};
pub use hydrator::{Hydrator, HydratorBuilder};
pub use store::{
    DeliveryMode, DocumentStore, ListenerCallback, ListenerEvent, ListenerHandle, ListenerId,
    MemoryStore,
};
pub use subscriptions::{
    DependencyGraph, DeriveFn, DerivedSubscription, Expectation, HydrationStatus, Hydratable,
    Observer, ObserverId, PendingUpdate, RecordPipeline, StatusChange, Subscription,
    SubscriptionManager, UpdateStatus, UpdateTicket, UpdateTrackingSubscription,
};
pub use types::*;
