//! Error kinds for the state core.

use thiserror::Error;

/// Errors surfaced by the state core.
///
/// Registry errors (`DuplicateName`, `UnknownReducer` from `resolve`) are
/// synchronous. Errors on the reducer path reject the future returned by
/// `apply_change`; the state container is never left half merged, and no
/// observer is notified for a failed change.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StateError {
    /// A reducer name is already registered on this manager.
    #[error("reducer `{0}` is already registered; remove it before registering again")]
    DuplicateName(String),

    /// A reducer name has no registration.
    #[error("no reducer registered under `{0}`")]
    UnknownReducer(String),

    /// A raw JSON value stood in for a state update but was neither null
    /// nor an object.
    #[error("invalid state update: expected a JSON object, got {0}")]
    InvalidUpdate(&'static str),
}
