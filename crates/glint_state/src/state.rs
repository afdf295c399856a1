//! State snapshots and partial updates.
//!
//! A [`State`] is an immutable snapshot mapping property names to JSON
//! values. Mutation always goes through [`State::merged`], which produces a
//! fresh snapshot; a handle taken before an update keeps observing the old
//! values. Merging is shallow: one level of keys, nested objects replaced
//! wholesale. Reducers rely on being able to fully replace a nested value,
//! so this policy is load-bearing and must not be "improved" to a deep
//! merge.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::StateError;

/// Names the JSON kind of a value for error messages.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Immutable state snapshot.
///
/// Cloning is cheap (an `Arc` bump). Two snapshots compare equal when
/// their property maps are equal, regardless of sharing.
#[derive(Clone, Default, PartialEq)]
pub struct State {
    entries: Arc<FxHashMap<String, Value>>,
}

impl State {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from key/value pairs.
    pub fn from_entries<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: Arc::new(map),
        }
    }

    /// Build a snapshot from a JSON object.
    pub fn from_value(value: Value) -> Result<Self, StateError> {
        match value {
            Value::Object(map) => Ok(Self {
                entries: Arc::new(map.into_iter().collect()),
            }),
            other => Err(StateError::InvalidUpdate(value_kind(&other))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// New snapshot with exactly `update`'s keys overwritten.
    ///
    /// Keys absent from `update` are untouched. A key present with
    /// `Value::Null` overwrites like any other value.
    pub fn merged(&self, update: &PartialUpdate) -> State {
        if update.is_empty() {
            return self.clone();
        }
        let mut map = (*self.entries).clone();
        for (key, value) in update.iter() {
            map.insert(key.to_owned(), value.clone());
        }
        State {
            entries: Arc::new(map),
        }
    }

    /// The snapshot as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl Serialize for State {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for State {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            entries: Arc::new(FxHashMap::deserialize(deserializer)?),
        })
    }
}

/// A set of property values to overwrite in the next snapshot.
///
/// Presence implies "changed": a key carried by the update counts toward
/// the changed-key set even when the new value equals the old one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartialUpdate {
    entries: FxHashMap<String, Value>,
}

impl PartialUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-key update.
    pub fn single(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().with(key, value)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Build an update from a JSON object.
    pub fn from_value(value: Value) -> Result<Self, StateError> {
        match value {
            Value::Object(map) => Ok(Self {
                entries: map.into_iter().collect(),
            }),
            other => Err(StateError::InvalidUpdate(value_kind(&other))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The changed-key set this update implies: exactly its keys.
    pub fn changed_keys(&self) -> FxHashSet<String> {
        self.entries.keys().cloned().collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for PartialUpdate {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// An updater function: computes a partial update from the snapshot
/// current at commit time rather than at call time.
pub type UpdaterFn = Box<dyn FnOnce(&State) -> PartialUpdate + Send>;

/// How a state change is expressed.
///
/// `Partial` captures values at call time. `Compute` defers to commit
/// time: the updater receives whatever snapshot is current when the merge
/// actually happens, which guards against stale closures when a change is
/// issued across an asynchronous gap.
pub enum Update {
    Partial(PartialUpdate),
    Compute(UpdaterFn),
}

impl Update {
    /// An update computed against the snapshot current at commit time.
    pub fn compute<F>(updater: F) -> Self
    where
        F: FnOnce(&State) -> PartialUpdate + Send + 'static,
    {
        Update::Compute(Box::new(updater))
    }

    /// Build an update from a JSON object.
    pub fn from_value(value: Value) -> Result<Self, StateError> {
        PartialUpdate::from_value(value).map(Update::Partial)
    }

    /// Resolve to concrete key/value pairs against `state`.
    pub(crate) fn resolve(self, state: &State) -> PartialUpdate {
        match self {
            Update::Partial(partial) => partial,
            Update::Compute(updater) => updater(state),
        }
    }
}

impl From<PartialUpdate> for Update {
    fn from(partial: PartialUpdate) -> Self {
        Update::Partial(partial)
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Partial(partial) => f.debug_tuple("Partial").field(partial).finish(),
            Update::Compute(_) => f.write_str("Compute(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merged_overwrites_only_update_keys() {
        let state = State::from_entries([("x", json!(false)), ("y", json!(1))]);
        let next = state.merged(&PartialUpdate::single("x", true));

        assert_eq!(next.get("x"), Some(&json!(true)));
        assert_eq!(next.get("y"), Some(&json!(1)));
        // The original snapshot is untouched.
        assert_eq!(state.get("x"), Some(&json!(false)));
    }

    #[test]
    fn merged_is_idempotent() {
        let state = State::from_entries([("x", json!(0)), ("y", json!("a"))]);
        let update = PartialUpdate::single("x", 7);

        let once = state.merged(&update);
        let twice = once.merged(&update);
        assert_eq!(once, twice);
    }

    #[test]
    fn null_value_still_counts_as_present() {
        let state = State::from_entries([("x", json!(1))]);
        let update = PartialUpdate::single("x", Value::Null);

        assert_eq!(update.changed_keys().len(), 1);
        let next = state.merged(&update);
        assert_eq!(next.get("x"), Some(&Value::Null));
    }

    #[test]
    fn nested_objects_are_replaced_wholesale() {
        let state = State::from_entries([("cfg", json!({"a": 1, "b": 2}))]);
        let next = state.merged(&PartialUpdate::single("cfg", json!({"a": 3})));

        // Shallow merge: "b" is gone, not deep-merged.
        assert_eq!(next.get("cfg"), Some(&json!({"a": 3})));
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert_eq!(
            PartialUpdate::from_value(json!([1, 2])),
            Err(StateError::InvalidUpdate("an array"))
        );
        assert_eq!(
            State::from_value(json!("nope")).unwrap_err(),
            StateError::InvalidUpdate("a string")
        );
        assert!(PartialUpdate::from_value(json!({"x": 1})).is_ok());
    }

    #[test]
    fn compute_update_sees_the_state_it_is_resolved_against() {
        let update = Update::compute(|state: &State| {
            let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
            PartialUpdate::single("count", count + 1)
        });

        let state = State::from_entries([("count", json!(41))]);
        let partial = update.resolve(&state);
        assert_eq!(partial.get("count"), Some(&json!(42)));
    }

    #[test]
    fn snapshot_serializes_as_an_object() {
        let state = State::from_entries([("x", json!(true))]);
        let text = serde_json::to_string(&state).unwrap();
        let back: State = serde_json::from_str(&text).unwrap();
        assert_eq!(back, state);
    }
}
