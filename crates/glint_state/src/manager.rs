//! The global state manager: composition of container, subscriptions,
//! registry, and dispatcher map behind one cloneable handle.
//!
//! `apply_change` is the single mutation entry point. A change is either a
//! concrete update (applied eagerly, before the returned future resolves)
//! or a reducer invocation (resolved and applied inside the future). The
//! merge-and-notify sequence never spans an await, so a second in-flight
//! change can interleave only between whole commits, never observe a half
//! one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

use crate::container::StateContainer;
use crate::dispatcher::{self, Dispatchers, StateFuture, ready_state};
use crate::error::StateError;
use crate::registry::{Reducer, ReducerRef, ReducerRegistry};
use crate::state::{PartialUpdate, State, Update};
use crate::subscription::{ObserverId, SubscriptionTable, Trigger};

new_key_type! {
    /// Identifier for a persistent change callback.
    pub struct CallbackId;
}

/// One-shot callback supplied per change call.
///
/// Invoked exactly once after the change has committed and observers were
/// notified, with the new snapshot, the live dispatcher map, and the
/// update that was applied. A returned update is applied as an immediate
/// follow-up commit with its own notification pass.
pub type ChangeCallback =
    Box<dyn FnOnce(&State, &Dispatchers, &PartialUpdate) -> Option<Update> + Send>;

/// Persistent callback invoked after every non-empty commit.
pub type PersistentCallback =
    Arc<dyn Fn(&State, &Dispatchers, &PartialUpdate) -> Option<Update> + Send + Sync>;

/// Input to [`GlobalStateManager::apply_change`].
pub enum ChangeRequest {
    /// A concrete update, applied as-is.
    Update(Update),
    /// Apply a reducer (registered name or ad-hoc function) to the state
    /// current at application time.
    Reduce {
        reducer: ReducerRef,
        args: Vec<Value>,
    },
}

impl ChangeRequest {
    pub fn reduce(reducer: impl Into<ReducerRef>, args: Vec<Value>) -> Self {
        ChangeRequest::Reduce {
            reducer: reducer.into(),
            args,
        }
    }
}

impl From<Update> for ChangeRequest {
    fn from(update: Update) -> Self {
        ChangeRequest::Update(update)
    }
}

impl From<PartialUpdate> for ChangeRequest {
    fn from(partial: PartialUpdate) -> Self {
        ChangeRequest::Update(partial.into())
    }
}

pub(crate) struct ManagerInner {
    container: StateContainer,
    subscriptions: Mutex<SubscriptionTable>,
    reducers: Mutex<ReducerRegistry>,
    dispatchers: Dispatchers,
    callbacks: Mutex<SlotMap<CallbackId, PersistentCallback>>,
}

/// Process-wide or provider-scoped state manager.
///
/// Cloning yields another handle to the same instance. Independent
/// instances (one per provider scope, plus the process-wide default in
/// [`crate::global`]) share no state and no dispatcher map.
#[derive(Clone)]
pub struct GlobalStateManager {
    inner: Arc<ManagerInner>,
}

impl GlobalStateManager {
    pub fn new(initial: State) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                container: StateContainer::new(initial),
                subscriptions: Mutex::new(SubscriptionTable::new()),
                reducers: Mutex::new(ReducerRegistry::new()),
                dispatchers: Dispatchers::new(),
                callbacks: Mutex::new(SlotMap::with_key()),
            }),
        }
    }

    /// Construct with an initial reducer set, as a provider does.
    pub fn with_reducers<N, I>(initial: State, reducers: I) -> Result<Self, StateError>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Reducer)>,
    {
        let manager = Self::new(initial);
        for (name, reducer) in reducers {
            manager.add_reducer(name, reducer)?;
        }
        Ok(manager)
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ManagerInner> {
        Arc::downgrade(&self.inner)
    }

    /// The current snapshot.
    pub fn state(&self) -> State {
        self.inner.container.get()
    }

    /// The underlying container (raw, non-notifying get/set/reset).
    pub fn container(&self) -> &StateContainer {
        &self.inner.container
    }

    /// Restore the initial snapshot.
    ///
    /// Reducer registrations, dispatcher identities, persistent callbacks,
    /// and subscriptions all survive; only the snapshot is replaced.
    pub fn reset(&self) {
        self.inner.container.reset();
    }

    /// Handle to the live dispatcher map.
    pub fn dispatchers(&self) -> Dispatchers {
        self.inner.dispatchers.clone()
    }

    // =========================================================================
    // Reducer registration
    // =========================================================================

    /// Register `reducer` under `name` and derive its dispatcher.
    ///
    /// Fails with [`StateError::DuplicateName`] if the name is taken.
    /// The returned handle removes this one registration; the second
    /// `remove()` call is a no-op returning `false`.
    pub fn add_reducer(
        &self,
        name: impl Into<String>,
        reducer: Reducer,
    ) -> Result<RemovalHandle, StateError> {
        let name = name.into();
        {
            let mut registry = self.inner.reducers.lock().unwrap();
            registry.register(name.clone(), reducer)?;
            self.inner
                .dispatchers
                .insert(name.clone(), dispatcher::build(self, &name));
        }
        Ok(RemovalHandle {
            manager: self.downgrade(),
            names: SmallVec::from_iter([name]),
            spent: AtomicBool::new(false),
        })
    }

    /// Register a batch of reducers.
    ///
    /// Atomic from the caller's perspective: if any name collides (with an
    /// existing registration or within the batch), nothing is registered.
    /// The combined handle's `remove()` reports `true` only if every
    /// individual removal succeeded.
    pub fn add_reducers<N, I>(&self, reducers: I) -> Result<RemovalHandle, StateError>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Reducer)>,
    {
        let batch: Vec<(String, Reducer)> = reducers
            .into_iter()
            .map(|(name, reducer)| (name.into(), reducer))
            .collect();
        let mut names: SmallVec<[String; 1]> = SmallVec::new();
        {
            let mut registry = self.inner.reducers.lock().unwrap();
            for (name, _) in &batch {
                if registry.contains(name) || names.contains(name) {
                    return Err(StateError::DuplicateName(name.clone()));
                }
                names.push(name.clone());
            }
            for (name, reducer) in batch {
                registry
                    .register(name.clone(), reducer)
                    .expect("names were checked free above");
                self.inner
                    .dispatchers
                    .insert(name.clone(), dispatcher::build(self, &name));
            }
        }
        Ok(RemovalHandle {
            manager: self.downgrade(),
            names,
            spent: AtomicBool::new(false),
        })
    }

    /// Remove one registration and its dispatcher. Other dispatchers keep
    /// their identity.
    pub fn remove_reducer(&self, name: &str) -> bool {
        let removed = self.inner.reducers.lock().unwrap().remove(name);
        self.inner.dispatchers.remove(name);
        removed
    }

    /// Resolve a reducer reference against this manager's registry.
    pub fn resolve(&self, reference: &ReducerRef) -> Result<Reducer, StateError> {
        self.inner.reducers.lock().unwrap().resolve(reference)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register an observer depending on `keys`.
    pub fn subscribe<I, K>(
        &self,
        trigger: impl Fn() + Send + Sync + 'static,
        keys: I,
    ) -> SubscriptionHandle
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let id = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .subscribe(Arc::new(trigger) as Trigger, keys);
        self.handle_for(id)
    }

    /// Register a whole-state observer, notified on any change.
    pub fn subscribe_all(&self, trigger: impl Fn() + Send + Sync + 'static) -> SubscriptionHandle {
        let id = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .subscribe_all(Arc::new(trigger) as Trigger);
        self.handle_for(id)
    }

    fn handle_for(&self, id: ObserverId) -> SubscriptionHandle {
        SubscriptionHandle {
            manager: self.downgrade(),
            id,
            spent: AtomicBool::new(false),
        }
    }

    /// Idempotent removal by observer id.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.subscriptions.lock().unwrap().unsubscribe(id)
    }

    /// Register a persistent callback invoked after every non-empty
    /// commit. A returned update is applied as a follow-up commit.
    pub fn add_callback(
        &self,
        callback: impl Fn(&State, &Dispatchers, &PartialUpdate) -> Option<Update> + Send + Sync + 'static,
    ) -> CallbackHandle {
        let id = self
            .inner
            .callbacks
            .lock()
            .unwrap()
            .insert(Arc::new(callback) as PersistentCallback);
        CallbackHandle {
            manager: self.downgrade(),
            id,
            spent: AtomicBool::new(false),
        }
    }

    fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.lock().unwrap().remove(id).is_some()
    }

    // =========================================================================
    // State changes
    // =========================================================================

    /// Apply a plain update with no callback. Shorthand for
    /// [`apply_change`](Self::apply_change).
    pub fn set(&self, update: impl Into<Update>) -> StateFuture {
        self.apply_change(ChangeRequest::Update(update.into()), None)
    }

    /// Apply a state change and resolve with the snapshot after this
    /// call's merge.
    ///
    /// Plain updates commit eagerly, before this function returns its
    /// (already settled) future; two plain updates therefore merge in call
    /// order. Reducer requests resolve the reference now but run the
    /// reducer inside the future, against the snapshot current at that
    /// point. Errors reject the future and leave the state untouched with
    /// no observer notified.
    pub fn apply_change(
        &self,
        request: impl Into<ChangeRequest>,
        callback: Option<ChangeCallback>,
    ) -> StateFuture {
        match request.into() {
            ChangeRequest::Update(update) => ready_state(Ok(self.commit(update, callback))),
            ChangeRequest::Reduce { reducer, args } => {
                let resolved = self.resolve(&reducer);
                let manager = self.clone();
                Box::pin(async move {
                    let reducer = resolved?;
                    let outcome = reducer
                        .invoke(manager.state(), manager.dispatchers(), args)
                        .await?;
                    let update = match outcome {
                        Some(update) => update,
                        // No-op: empty changed-key set, current state kept.
                        None => Update::Partial(PartialUpdate::new()),
                    };
                    Ok(manager.commit(update, callback))
                })
            }
        }
    }

    /// Merge, notify, run callbacks. Runs without internal awaits; locks
    /// are released before any user code (trigger or callback) is invoked,
    /// so re-entrant subscribes and dispatches cannot deadlock.
    fn commit(&self, update: Update, callback: Option<ChangeCallback>) -> State {
        let partial = update.resolve(&self.inner.container.get());
        let (new_state, changed) = self.inner.container.commit(&partial);
        tracing::debug!(changed = changed.len(), "state change committed");

        if !changed.is_empty() {
            let affected = self.inner.subscriptions.lock().unwrap().affected(&changed);
            tracing::trace!(observers = affected.len(), "notifying observers");
            for (_, trigger) in affected {
                trigger();
            }

            let callbacks: SmallVec<[PersistentCallback; 2]> = self
                .inner
                .callbacks
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for persistent in callbacks {
                if let Some(follow_up) = persistent(&new_state, &self.inner.dispatchers, &partial) {
                    self.commit(follow_up, None);
                }
            }
        }

        if let Some(callback) = callback {
            if let Some(follow_up) = callback(&new_state, &self.inner.dispatchers, &partial) {
                self.commit(follow_up, None);
            }
        }

        new_state
    }
}

/// Undoes one or more reducer registrations.
///
/// The second `remove()` call is a no-op returning `false`. For a batch
/// handle, `true` means every individual removal succeeded.
#[derive(Debug)]
pub struct RemovalHandle {
    manager: Weak<ManagerInner>,
    names: SmallVec<[String; 1]>,
    spent: AtomicBool,
}

impl RemovalHandle {
    pub fn remove(&self) -> bool {
        if self.spent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };
        let manager = GlobalStateManager::from_inner(inner);
        let mut all_removed = true;
        for name in &self.names {
            all_removed &= manager.remove_reducer(name);
        }
        all_removed
    }

    /// The registrations this handle covers.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Undoes one subscription. The second `unsubscribe()` is a no-op
/// returning `false`. Dropping the handle does not unsubscribe; the
/// binding layer unsubscribes explicitly at unmount.
#[derive(Debug)]
pub struct SubscriptionHandle {
    manager: Weak<ManagerInner>,
    id: ObserverId,
    spent: AtomicBool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn unsubscribe(&self) -> bool {
        if self.spent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };
        GlobalStateManager::from_inner(inner).unsubscribe(self.id)
    }
}

/// Undoes one persistent callback registration.
#[derive(Debug)]
pub struct CallbackHandle {
    manager: Weak<ManagerInner>,
    id: CallbackId,
    spent: AtomicBool,
}

impl CallbackHandle {
    pub fn remove(&self) -> bool {
        if self.spent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };
        GlobalStateManager::from_inner(inner).remove_callback(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> GlobalStateManager {
        GlobalStateManager::new(State::from_entries([("x", json!(false)), ("y", json!(1))]))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&count);
        (count, move || {
            probe.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn plain_updates_commit_eagerly_in_call_order() {
        let manager = manager();
        // Neither future is awaited before the second call.
        let first = manager.set(PartialUpdate::single("x", 1));
        let second = manager.set(PartialUpdate::single("x", 2));
        assert_eq!(manager.state().get("x"), Some(&json!(2)));

        assert_eq!(pollster::block_on(first).unwrap().get("x"), Some(&json!(1)));
        assert_eq!(pollster::block_on(second).unwrap().get("x"), Some(&json!(2)));
    }

    #[test]
    fn compute_updates_resolve_against_the_latest_snapshot() {
        let manager = manager();
        pollster::block_on(manager.set(PartialUpdate::single("y", 10))).unwrap();

        let state = pollster::block_on(manager.set(Update::compute(|state| {
            let y = state.get("y").and_then(Value::as_i64).unwrap_or(0);
            PartialUpdate::single("y", y + 1)
        })))
        .unwrap();
        assert_eq!(state.get("y"), Some(&json!(11)));
    }

    #[test]
    fn empty_dependency_set_subscribes_to_everything() {
        let manager = manager();
        let (notified, trigger) = counter();
        let _sub = manager.subscribe(trigger, Vec::<String>::new());

        pollster::block_on(manager.set(PartialUpdate::single("x", true))).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_runs_once_after_notifications() {
        let manager = manager();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let in_trigger = Arc::clone(&order);
        let _sub = manager.subscribe(
            move || in_trigger.lock().unwrap().push("notify"),
            ["x"],
        );

        let in_callback = Arc::clone(&order);
        let callback: ChangeCallback = Box::new(move |state, _dispatchers, applied| {
            assert_eq!(state.get("x"), Some(&json!(true)));
            assert_eq!(applied.keys().collect::<Vec<_>>(), vec!["x"]);
            in_callback.lock().unwrap().push("callback");
            None
        });

        let state = pollster::block_on(
            manager.apply_change(PartialUpdate::single("x", true), Some(callback)),
        )
        .unwrap();
        assert_eq!(state.get("x"), Some(&json!(true)));
        assert_eq!(*order.lock().unwrap(), vec!["notify", "callback"]);
    }

    #[test]
    fn callback_follow_up_update_is_applied() {
        let manager = manager();
        let callback: ChangeCallback =
            Box::new(|_, _, _| Some(PartialUpdate::single("y", 2).into()));

        let settled = pollster::block_on(
            manager.apply_change(PartialUpdate::single("x", true), Some(callback)),
        )
        .unwrap();
        // The future resolves with the snapshot after *this* call's merge.
        assert_eq!(settled.get("y"), Some(&json!(1)));
        assert_eq!(manager.state().get("y"), Some(&json!(2)));
    }

    #[test]
    fn failed_reducer_leaves_state_untouched_and_notifies_nobody() {
        let manager = manager();
        let (notified, trigger) = counter();
        let _sub = manager.subscribe_all(trigger);
        let before = manager.state();

        let failing = Reducer::from_fn(|_, _, _| Err(StateError::InvalidUpdate("a number")));
        let err =
            pollster::block_on(manager.apply_change(ChangeRequest::reduce(failing, vec![]), None))
                .unwrap_err();

        assert_eq!(err, StateError::InvalidUpdate("a number"));
        assert_eq!(manager.state(), before);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn noop_reducer_keeps_state_and_still_runs_the_callback() {
        let manager = manager();
        let (notified, trigger) = counter();
        let _sub = manager.subscribe_all(trigger);

        let noop = Reducer::from_fn(|_, _, _| Ok(None));
        let callback_ran = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&callback_ran);
        let callback: ChangeCallback = Box::new(move |_, _, applied| {
            assert!(applied.is_empty());
            probe.fetch_add(1, Ordering::SeqCst);
            None
        });

        let before = manager.state();
        let settled = pollster::block_on(
            manager.apply_change(ChangeRequest::reduce(noop, vec![]), Some(callback)),
        )
        .unwrap();

        assert_eq!(settled, before);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert_eq!(callback_ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_handle_removes_once() {
        let manager = manager();
        let handle = manager
            .add_reducer("bump", Reducer::from_fn(|_, _, _| Ok(None)))
            .unwrap();
        assert!(manager.dispatchers().contains("bump"));

        assert!(handle.remove());
        assert!(!manager.dispatchers().contains("bump"));
        assert!(manager.resolve(&"bump".into()).is_err());
        // Second call is a no-op.
        assert!(!handle.remove());
    }

    #[test]
    fn registration_results_support_debug_unwrapping() {
        let manager = manager();
        let handle = manager
            .add_reducer("bump", Reducer::from_fn(|_, _, _| Ok(None)))
            .unwrap();
        // unwrap_err on the Result requires the handle itself to be Debug.
        let err = manager
            .add_reducer("bump", Reducer::from_fn(|_, _, _| Ok(None)))
            .unwrap_err();
        assert_eq!(err, StateError::DuplicateName("bump".to_owned()));
        assert!(format!("{handle:?}").contains("bump"));
    }

    #[test]
    fn add_reducers_is_atomic_on_collision() {
        let manager = manager();
        manager
            .add_reducer("taken", Reducer::from_fn(|_, _, _| Ok(None)))
            .unwrap();

        let err = manager
            .add_reducers([
                ("fresh", Reducer::from_fn(|_, _, _| Ok(None))),
                ("taken", Reducer::from_fn(|_, _, _| Ok(None))),
            ])
            .unwrap_err();
        assert_eq!(err, StateError::DuplicateName("taken".to_owned()));

        // No partial registration left behind.
        assert!(manager.resolve(&"fresh".into()).is_err());
        assert!(!manager.dispatchers().contains("fresh"));
    }

    #[test]
    fn batch_removal_reports_overall_success() {
        let manager = manager();
        let handle = manager
            .add_reducers([
                ("a", Reducer::from_fn(|_, _, _| Ok(None))),
                ("b", Reducer::from_fn(|_, _, _| Ok(None))),
            ])
            .unwrap();

        // One of the two was already removed out-of-band.
        assert!(manager.remove_reducer("a"));
        assert!(!handle.remove());
        // Both are gone regardless.
        assert!(manager.resolve(&"b".into()).is_err());
    }

    #[test]
    fn dispatcher_identity_is_stable_for_a_registration() {
        let manager = manager();
        manager
            .add_reducer("bump", Reducer::from_fn(|_, _, _| Ok(None)))
            .unwrap();

        let first = manager.dispatchers().get("bump").unwrap();
        let second = manager.dispatchers().get("bump").unwrap();
        assert!(first.same_as(&second));

        // Re-registering after removal yields a new identity.
        manager.remove_reducer("bump");
        manager
            .add_reducer("bump", Reducer::from_fn(|_, _, _| Ok(None)))
            .unwrap();
        let third = manager.dispatchers().get("bump").unwrap();
        assert!(!first.same_as(&third));
    }

    #[test]
    fn persistent_callbacks_fire_until_removed() {
        let manager = manager();
        let seen = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&seen);
        let handle = manager.add_callback(move |_, _, _| {
            probe.fetch_add(1, Ordering::SeqCst);
            None
        });

        pollster::block_on(manager.set(PartialUpdate::single("x", 1))).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(handle.remove());
        assert!(!handle.remove());
        pollster::block_on(manager.set(PartialUpdate::single("x", 2))).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_reducers_populates_the_dispatcher_map() {
        let manager = GlobalStateManager::with_reducers(
            State::new(),
            [
                ("a", Reducer::from_fn(|_, _, _| Ok(None))),
                ("b", Reducer::from_fn(|_, _, _| Ok(None))),
            ],
        )
        .unwrap();
        assert_eq!(
            manager.dispatchers().names(),
            vec!["a".to_owned(), "b".to_owned()]
        );
    }
}
