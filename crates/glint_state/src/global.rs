//! Process-wide default state manager.
//!
//! One pre-constructed [`GlobalStateManager`] with process lifetime,
//! created empty on first use. Provider-scoped managers are ordinary
//! additional instances with their own container, registry, and dispatcher
//! map; nothing here is special-cased beyond lazy construction.
//!
//! This follows the same `OnceLock` singleton pattern as the rest of the
//! project's context-level resources.

use std::sync::OnceLock;

use crate::dispatcher::StateFuture;
use crate::error::StateError;
use crate::manager::{GlobalStateManager, RemovalHandle};
use crate::registry::Reducer;
use crate::state::{State, Update};

static DEFAULT: OnceLock<GlobalStateManager> = OnceLock::new();

/// The process-wide default manager.
pub fn default_manager() -> &'static GlobalStateManager {
    DEFAULT.get_or_init(|| {
        tracing::debug!("default state manager created");
        GlobalStateManager::new(State::new())
    })
}

/// Current snapshot of the default manager.
pub fn get_global() -> State {
    default_manager().state()
}

/// Apply an update to the default manager.
pub fn set_global(update: impl Into<Update>) -> StateFuture {
    default_manager().set(update)
}

/// Register a reducer on the default manager.
pub fn add_reducer(name: impl Into<String>, reducer: Reducer) -> Result<RemovalHandle, StateError> {
    default_manager().add_reducer(name, reducer)
}

/// Register a batch of reducers on the default manager.
pub fn add_reducers<N, I>(reducers: I) -> Result<RemovalHandle, StateError>
where
    N: Into<String>,
    I: IntoIterator<Item = (N, Reducer)>,
{
    default_manager().add_reducers(reducers)
}

/// Restore the default manager's initial (empty) snapshot. Registrations
/// and subscriptions survive.
pub fn reset_global() {
    default_manager().reset();
}
