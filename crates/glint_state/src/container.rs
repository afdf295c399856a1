//! The authoritative state snapshot for one manager instance.

use std::sync::Mutex;

use rustc_hash::FxHashSet;

use crate::state::{PartialUpdate, State};

/// Holds the current snapshot and the snapshot the container was
/// constructed with.
///
/// There is exactly one authoritative snapshot per container at any
/// instant. All mutation goes through [`set`](StateContainer::set) (or the
/// internal [`commit`](StateContainer::commit)), which performs a shallow
/// merge and swaps the current snapshot under a lock; readers holding an
/// older snapshot are unaffected. The changed-key set of a merge is exactly
/// the keys present in the update, whether or not the values differ.
pub struct StateContainer {
    initial: State,
    current: Mutex<State>,
}

impl StateContainer {
    pub fn new(initial: State) -> Self {
        Self {
            current: Mutex::new(initial.clone()),
            initial,
        }
    }

    /// The current snapshot.
    pub fn get(&self) -> State {
        self.current.lock().unwrap().clone()
    }

    /// The snapshot this container was constructed with.
    pub fn initial(&self) -> &State {
        &self.initial
    }

    /// Merge `update` into the current snapshot and return the result.
    ///
    /// This is the raw merge primitive: it does not notify anyone. The
    /// manager's `apply_change` is the notifying path.
    pub fn set(&self, update: &PartialUpdate) -> State {
        self.commit(update).0
    }

    /// Merge `update`, returning the new snapshot and the changed keys.
    pub(crate) fn commit(&self, update: &PartialUpdate) -> (State, FxHashSet<String>) {
        let mut current = self.current.lock().unwrap();
        let next = current.merged(update);
        *current = next.clone();
        let changed = update.changed_keys();
        tracing::trace!(changed = changed.len(), "state merged");
        (next, changed)
    }

    /// Restore the originally configured initial snapshot.
    ///
    /// Subscriptions and reducer registrations live elsewhere and are
    /// unaffected; this only swaps the snapshot back.
    pub fn reset(&self) {
        let mut current = self.current.lock().unwrap();
        *current = self.initial.clone();
        tracing::debug!("state container reset");
    }
}
