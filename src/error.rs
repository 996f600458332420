//! Error types surfaced by weak map operations.

use crate::handle_hash_map::ReserveError;
use crate::value::Value;

/// An error thrown by host code (a callback) and propagated verbatim.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HostError {
    /// Human-readable description, used as the display text.
    pub message: String,
    /// The value the host threw.
    pub thrown: Value,
}

impl HostError {
    pub fn new(message: impl Into<String>, thrown: Value) -> Self {
        Self {
            message: message.into(),
            thrown,
        }
    }
}

/// The collector refused to account more memory to an owner.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("allocation of {requested} bytes refused")]
pub struct AllocError {
    /// Bytes the refused reservation asked for.
    pub requested: usize,
}

/// Failure of a weak map operation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum WeakMapError {
    /// The key cannot be held weakly; carries the rendered key.
    #[error("invalid value used as weak map key: {0}")]
    InvalidKey(String),

    /// The computed-insert callback is neither callable nor undefined.
    #[error("{0} is not a function")]
    NotCallable(String),

    /// The receiver is not a weak map object.
    #[error("receiver is not a WeakMap: {0}")]
    IncompatibleReceiver(String),

    /// Table growth was refused or could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// The callback threw; the host error is passed through unchanged.
    #[error("callback failed: {0}")]
    CallbackFailure(HostError),
}

impl From<AllocError> for WeakMapError {
    fn from(_: AllocError) -> Self {
        WeakMapError::OutOfMemory
    }
}

impl From<ReserveError> for WeakMapError {
    fn from(_: ReserveError) -> Self {
        WeakMapError::OutOfMemory
    }
}
