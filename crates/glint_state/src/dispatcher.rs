//! Asynchronous mutators derived from registered reducers.
//!
//! For every reducer registered under name `N`, the manager builds a
//! [`Dispatcher`] whose body is exactly `apply_change(Reduce { Name(N),
//! args })`. The set of all dispatchers forms a live [`Dispatchers`] map
//! which is passed into every reducer invocation and callback, so reducers
//! can call one another by name.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::StateError;
use crate::manager::{ChangeRequest, GlobalStateManager};
use crate::state::State;

/// Future of a settled state change.
pub type StateFuture = Pin<Box<dyn Future<Output = Result<State, StateError>> + Send + 'static>>;

pub(crate) fn ready_state(result: Result<State, StateError>) -> StateFuture {
    Box::pin(std::future::ready(result))
}

type DispatchCall = dyn Fn(Vec<Value>) -> StateFuture + Send + Sync;

/// Asynchronous mutator for one registered reducer.
///
/// Calling it applies the reducer to the state current at invocation time
/// and yields the resulting snapshot. The underlying function is stable
/// for the lifetime of the registration: clones taken at different times
/// compare equal under [`same_as`](Dispatcher::same_as).
#[derive(Clone)]
pub struct Dispatcher {
    name: Arc<str>,
    call: Arc<DispatchCall>,
}

impl Dispatcher {
    /// The reducer name this dispatcher was derived from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply the underlying reducer against the current state.
    pub fn call(&self, args: Vec<Value>) -> StateFuture {
        (self.call)(args)
    }

    /// Whether two handles wrap the same registration.
    pub fn same_as(&self, other: &Dispatcher) -> bool {
        Arc::ptr_eq(&self.call, &other.call)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dispatcher").field(&self.name).finish()
    }
}

/// Live name → dispatcher map shared by one manager instance.
///
/// Clones share the same underlying map, so a handle captured by a
/// reducer or callback observes registrations and removals made after
/// capture. Each manager owns an independent map; there is no process
/// global here.
#[derive(Clone, Default)]
pub struct Dispatchers {
    map: Arc<RwLock<FxHashMap<String, Dispatcher>>>,
}

impl Dispatchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Dispatcher> {
        self.map.read().unwrap().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.read().unwrap().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }

    /// Registered names, sorted for deterministic inspection.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke the dispatcher registered under `name`.
    pub fn call(&self, name: &str, args: Vec<Value>) -> StateFuture {
        match self.get(name) {
            Some(dispatcher) => dispatcher.call(args),
            None => ready_state(Err(StateError::UnknownReducer(name.to_owned()))),
        }
    }

    pub(crate) fn insert(&self, name: String, dispatcher: Dispatcher) {
        self.map.write().unwrap().insert(name, dispatcher);
    }

    pub(crate) fn remove(&self, name: &str) -> bool {
        self.map.write().unwrap().remove(name).is_some()
    }
}

impl fmt::Debug for Dispatchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Derive the dispatcher for the reducer registered under `name`.
///
/// The closure holds a weak handle to the manager internals so the
/// dispatcher map cannot keep its own manager alive; a dispatcher that
/// outlives its manager fails with `UnknownReducer`.
pub(crate) fn build(manager: &GlobalStateManager, name: &str) -> Dispatcher {
    let weak = manager.downgrade();
    let name: Arc<str> = name.into();
    let call_name = Arc::clone(&name);
    let call: Arc<DispatchCall> = Arc::new(move |args| match weak.upgrade() {
        Some(inner) => GlobalStateManager::from_inner(inner)
            .apply_change(ChangeRequest::reduce(call_name.as_ref(), args), None),
        None => ready_state(Err(StateError::UnknownReducer(call_name.to_string()))),
    });
    Dispatcher { name, call }
}
