//! Observer registry with dependency-key filtering.
//!
//! The UI-binding layer registers an observer per mounted subtree: a
//! re-render trigger plus the set of state properties the subtree reads.
//! When a change commits, only observers whose dependency set intersects
//! the changed keys are triggered. Iteration order equals registration
//! order, so re-render order is deterministic and testable.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

new_key_type! {
    /// Unique identifier for a registered observer.
    pub struct ObserverId;
}

/// Re-render trigger owned by the UI-binding layer.
pub type Trigger = Arc<dyn Fn() + Send + Sync>;

struct ObserverEntry {
    trigger: Trigger,
    /// `None` means "notify on any change".
    keys: Option<FxHashSet<String>>,
}

/// Maps each observer to the state properties it depends on.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: SlotMap<ObserverId, ObserverEntry>,
    /// Registration order; `entries` alone does not guarantee one.
    order: Vec<ObserverId>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer depending on `keys`.
    ///
    /// An empty `keys` means "depends on everything", same as
    /// [`subscribe_all`](Self::subscribe_all).
    pub fn subscribe<I, K>(&mut self, trigger: Trigger, keys: I) -> ObserverId
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: FxHashSet<String> = keys.into_iter().map(Into::into).collect();
        self.insert(trigger, (!keys.is_empty()).then_some(keys))
    }

    /// Register a whole-state observer, notified on any change.
    pub fn subscribe_all(&mut self, trigger: Trigger) -> ObserverId {
        self.insert(trigger, None)
    }

    fn insert(&mut self, trigger: Trigger, keys: Option<FxHashSet<String>>) -> ObserverId {
        let id = self.entries.insert(ObserverEntry { trigger, keys });
        self.order.push(id);
        tracing::trace!(?id, "observer subscribed");
        id
    }

    /// Idempotent removal.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        if self.entries.remove(id).is_some() {
            self.order.retain(|existing| *existing != id);
            tracing::trace!(?id, "observer unsubscribed");
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Observers whose dependency set is unset or intersects `changed`,
    /// in registration order. Each observer appears at most once no
    /// matter how many of its keys matched.
    pub fn affected(&self, changed: &FxHashSet<String>) -> SmallVec<[(ObserverId, Trigger); 4]> {
        let mut hits = SmallVec::new();
        for &id in &self.order {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            let matched = match &entry.keys {
                None => true,
                Some(keys) => keys.iter().any(|key| changed.contains(key)),
            };
            if matched {
                hits.push((id, Arc::clone(&entry.trigger)));
            }
        }
        hits
    }
}
