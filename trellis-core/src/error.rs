//! Error types for trellis-core.
//!
//! Computation bodies signal failure by unwinding. The engine catches the
//! unwind at the computation boundary and converts its payload with
//! [`ReactiveError::from_panic`], so handlers always see a `ReactiveError`.

use std::any::Any;

use thiserror::Error;

use crate::graph::NodeId;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactiveError {
    #[error("reactive node {0:?} has been disposed")]
    Disposed(NodeId),

    #[error("computation {0:?} has not produced a value")]
    Uninitialized(NodeId),

    #[error("value stored in node {0:?} does not have the requested type")]
    TypeMismatch(NodeId),

    #[error("computation panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),

    #[error("computation {0:?} re-entered its own body")]
    Reentrant(NodeId),

    #[error("Potential Infinite Loop Detected ({pending} pending updates)")]
    InfiniteLoop { pending: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ReactiveError>;

impl ReactiveError {
    /// Shorthand for [`ReactiveError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Abort the running computation with this error.
    ///
    /// The error unwinds to the nearest computation boundary and is routed to
    /// the error handlers registered along the owner chain.
    pub fn raise(self) -> ! {
        std::panic::panic_any(self)
    }

    /// Whether the error must bypass error handlers.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InfiniteLoop { .. })
    }

    /// Convert an unwind payload into an error.
    ///
    /// Fatal payloads are handed back untouched so the caller can resume
    /// unwinding with them.
    pub(crate) fn from_panic(
        payload: Box<dyn Any + Send>,
    ) -> std::result::Result<Self, Box<dyn Any + Send>> {
        let payload = match payload.downcast::<ReactiveError>() {
            Ok(err) if err.is_fatal() => return Err(err),
            Ok(err) => return Ok(*err),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<String>() {
            Ok(message) => return Ok(Self::Panicked(*message)),
            Err(payload) => payload,
        };
        match payload.downcast::<&'static str>() {
            Ok(message) => Ok(Self::Panicked((*message).to_string())),
            Err(_) => Ok(Self::Panicked("unknown panic payload".to_string())),
        }
    }
}

impl From<serde_json::Error> for ReactiveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
