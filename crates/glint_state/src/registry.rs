//! Named pure transformation functions over the global state.
//!
//! A [`Reducer`] takes the current snapshot, the live dispatcher map, and
//! call arguments, and produces either a state update or nothing (a
//! no-op). Reducers are stored by name in a [`ReducerRegistry`];
//! [`ReducerRef`] lets callers dispatch either a registered name or an
//! ad-hoc, unregistered reducer for one-off use.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::dispatcher::Dispatchers;
use crate::error::StateError;
use crate::state::{PartialUpdate, State, Update, value_kind};

/// Future returned by a reducer invocation. `Ok(None)` is a no-op.
pub type ReducerFuture =
    Pin<Box<dyn Future<Output = Result<Option<Update>, StateError>> + Send + 'static>>;

type ReducerCall = dyn Fn(State, Dispatchers, Vec<Value>) -> ReducerFuture + Send + Sync;

/// A named pure transformation `(state, dispatchers, args) -> update`.
///
/// Reducers must not mutate the incoming snapshot (snapshots are immutable
/// anyway) and may invoke the dispatchers they are handed; each such call
/// is an independent `apply_change` with its own notification pass.
/// Cloning shares the underlying function.
#[derive(Clone)]
pub struct Reducer {
    call: Arc<ReducerCall>,
}

impl Reducer {
    /// Wrap a synchronous reducer.
    pub fn from_fn<F>(reducer: F) -> Self
    where
        F: Fn(&State, &Dispatchers, &[Value]) -> Result<Option<Update>, StateError>
            + Send
            + Sync
            + 'static,
    {
        let call: Arc<ReducerCall> = Arc::new(move |state, dispatchers, args| {
            let outcome = reducer(&state, &dispatchers, &args);
            let settled: ReducerFuture = Box::pin(std::future::ready(outcome));
            settled
        });
        Self { call }
    }

    /// Wrap a synchronous reducer returning raw JSON.
    ///
    /// `null` means no-op, an object becomes a partial update, and
    /// anything else fails with [`StateError::InvalidUpdate`].
    pub fn from_value_fn<F>(reducer: F) -> Self
    where
        F: Fn(&State, &Dispatchers, &[Value]) -> Value + Send + Sync + 'static,
    {
        Self::from_fn(move |state, dispatchers, args| {
            match reducer(state, dispatchers, args) {
                Value::Null => Ok(None),
                Value::Object(map) => {
                    Ok(Some(Update::Partial(map.into_iter().collect::<PartialUpdate>())))
                }
                other => Err(StateError::InvalidUpdate(value_kind(&other))),
            }
        })
    }

    /// Wrap an asynchronous reducer, which may await the dispatchers it
    /// is handed.
    pub fn from_async<F, Fut>(reducer: F) -> Self
    where
        F: Fn(State, Dispatchers, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Update>, StateError>> + Send + 'static,
    {
        let call: Arc<ReducerCall> = Arc::new(move |state, dispatchers, args| {
            let pending: ReducerFuture = Box::pin(reducer(state, dispatchers, args));
            pending
        });
        Self { call }
    }

    /// Apply the reducer to `state`.
    pub fn invoke(&self, state: State, dispatchers: Dispatchers, args: Vec<Value>) -> ReducerFuture {
        (self.call)(state, dispatchers, args)
    }

    /// Whether two handles share the same underlying function.
    pub fn same_as(&self, other: &Reducer) -> bool {
        Arc::ptr_eq(&self.call, &other.call)
    }
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reducer(..)")
    }
}

/// Reference to a reducer: a registered name or an ad-hoc function.
#[derive(Clone, Debug)]
pub enum ReducerRef {
    Name(String),
    Inline(Reducer),
}

impl From<&str> for ReducerRef {
    fn from(name: &str) -> Self {
        ReducerRef::Name(name.to_owned())
    }
}

impl From<String> for ReducerRef {
    fn from(name: String) -> Self {
        ReducerRef::Name(name)
    }
}

impl From<Reducer> for ReducerRef {
    fn from(reducer: Reducer) -> Self {
        ReducerRef::Inline(reducer)
    }
}

/// Name → reducer store for one manager instance.
#[derive(Default)]
pub struct ReducerRegistry {
    reducers: FxHashMap<String, Reducer>,
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `reducer` under `name`.
    ///
    /// Names are not silently replaced: registering an existing name
    /// fails with [`StateError::DuplicateName`], and the caller must
    /// remove the old registration first.
    pub fn register(&mut self, name: impl Into<String>, reducer: Reducer) -> Result<(), StateError> {
        let name = name.into();
        if self.reducers.contains_key(&name) {
            return Err(StateError::DuplicateName(name));
        }
        tracing::debug!(%name, "reducer registered");
        self.reducers.insert(name, reducer);
        Ok(())
    }

    /// Remove the registration under `name`, if any.
    pub fn remove(&mut self, name: &str) -> bool {
        let removed = self.reducers.remove(name).is_some();
        if removed {
            tracing::debug!(%name, "reducer removed");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.reducers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }

    /// Resolve a reference to a callable reducer.
    ///
    /// Names are looked up; inline reducers pass through unchanged.
    pub fn resolve(&self, reference: &ReducerRef) -> Result<Reducer, StateError> {
        match reference {
            ReducerRef::Name(name) => self
                .reducers
                .get(name)
                .cloned()
                .ok_or_else(|| StateError::UnknownReducer(name.clone())),
            ReducerRef::Inline(reducer) => Ok(reducer.clone()),
        }
    }
}
