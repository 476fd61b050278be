//! Live subscriptions and their bookkeeping.
//!
//! - [`Subscription`]: one store listener with a hydration state machine
//! - [`DerivedSubscription`]: a query built from other subscriptions' data
//! - [`UpdateTrackingSubscription`]: waits for a write to show up in reads
//! - [`SubscriptionManager`]: refcounted registry, one listener per key
//!
//! Status changes are pushed to observers synchronously, in the call that
//! applied them, so a dependent never reads an upstream's previous state.
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(store);
//! let locations = manager.acquire_query(&Query::collection("locations"))?;
//!
//! let caseload = DerivedSubscription::new(
//!     &manager,
//!     vec![locations.clone() as Arc<dyn Hydratable>],
//!     |inputs| {
//!         let ids: Vec<Value> = inputs[0].iter().map(|r| json!(r.id)).collect();
//!         Ok((!ids.is_empty()).then(|| Query::collection("clients").where_in("facilityId", ids)))
//!     },
//! )?;
//! caseload.hydrate();
//! ```

mod derived;
mod graph;
mod manager;
mod pipeline;
mod subscription;
mod types;
mod update;

pub use derived::{DeriveFn, DerivedSubscription};
pub use graph::DependencyGraph;
pub use manager::SubscriptionManager;
pub use pipeline::{RecordHook, RecordPipeline, Transform, Validator};
pub use subscription::Subscription;
pub(crate) use types::ObserverSet;
pub use types::{HydrationStatus, Hydratable, Observer, ObserverId, StatusChange};
pub use update::{
    Expectation, PendingUpdate, UpdateObserver, UpdateStatus, UpdateTicket,
    UpdateTrackingSubscription,
};
