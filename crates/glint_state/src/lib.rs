//! Glint State Core
//!
//! Process-wide (or provider-scoped) state management for component UI
//! frameworks:
//!
//! - **State container**: one immutable snapshot per manager; every change
//!   is a shallow merge producing a fresh snapshot
//! - **Subscriptions**: observers declare the property keys they depend
//!   on, and only those whose keys intersect a change are re-rendered
//! - **Reducers & dispatchers**: named pure functions exposed as
//!   asynchronous mutators that reducers can call on each other by name
//!
//! The UI-binding layer (hooks, HOCs, provider components) lives outside
//! this crate: it calls plain functions here and hands in plain re-render
//! triggers.
//!
//! # Example
//!
//! ```rust
//! use glint_state::{GlobalStateManager, PartialUpdate, State};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let manager = GlobalStateManager::new(State::from_entries([("count", json!(0))]));
//!
//! // A mounted subtree subscribes with its dependency keys.
//! let renders = Arc::new(AtomicUsize::new(0));
//! let probe = Arc::clone(&renders);
//! let _sub = manager.subscribe(move || { probe.fetch_add(1, Ordering::SeqCst); }, ["count"]);
//!
//! // Apply a change; the future settles with the new snapshot.
//! let state = pollster::block_on(manager.set(PartialUpdate::single("count", 1))).unwrap();
//! assert_eq!(state.get("count"), Some(&json!(1)));
//! assert_eq!(renders.load(Ordering::SeqCst), 1);
//! ```

pub mod container;
pub mod dispatcher;
pub mod error;
pub mod global;
pub mod manager;
pub mod registry;
pub mod state;
pub mod subscription;

pub use container::StateContainer;
pub use dispatcher::{Dispatcher, Dispatchers, StateFuture};
pub use error::StateError;
pub use global::{add_reducer, add_reducers, default_manager, get_global, reset_global, set_global};
pub use manager::{
    CallbackHandle, CallbackId, ChangeCallback, ChangeRequest, GlobalStateManager,
    PersistentCallback, RemovalHandle, SubscriptionHandle,
};
pub use registry::{Reducer, ReducerFuture, ReducerRef, ReducerRegistry};
pub use state::{PartialUpdate, State, Update, UpdaterFn};
pub use subscription::{ObserverId, SubscriptionTable, Trigger};
