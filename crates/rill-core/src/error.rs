//! Error types for the reactive-stream core.
//!
//! The taxonomy separates unrecoverable core bugs ([`FlowError::Protocol`])
//! from recoverable pipeline failures ([`FlowError::Upstream`]), overflow
//! terminations ([`FlowError::Overflow`]), and spent retry budgets
//! ([`FlowError::RetryExhausted`]). Every error is cheaply cloneable so a
//! single terminal failure can be multicast to many subscribers.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Result type for flow operations.
pub type Result<T> = std::result::Result<T, FlowError>;

// ---------------------------------------------------------------------------
// FlowError
// ---------------------------------------------------------------------------

/// Terminal error delivered through `on_error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// The demand/signal-order contract was broken. Indicates a bug in a
    /// producer or operator; never recoverable.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The source or an operator's transform failed.
    ///
    /// Recoverable through the error-recovery operators. The original error
    /// is retained for predicate matching via [`upstream_is`](Self::upstream_is).
    #[error("upstream failure: {0}")]
    Upstream(Arc<dyn Error + Send + Sync + 'static>),

    /// A backpressure policy of "error" fired because production outran demand.
    #[error("overflow: producer exceeded downstream demand")]
    Overflow,

    /// A retry budget was exhausted; wraps the last upstream failure.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Total subscription attempts made (initial + retries).
        attempts: u64,
        /// The failure observed on the final attempt.
        last: Arc<FlowError>,
    },
}

impl FlowError {
    /// Wraps an arbitrary error as an upstream failure.
    pub fn upstream<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Upstream(Arc::new(error))
    }

    /// Creates an upstream failure from a plain message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Upstream(Arc::new(MessageError(message.into())))
    }

    /// Returns `true` if this is an upstream failure whose original error
    /// downcasts to `E`. Used by retry predicates to match error types.
    #[must_use]
    pub fn upstream_is<E>(&self) -> bool
    where
        E: Error + 'static,
    {
        self.upstream_as::<E>().is_some()
    }

    /// Downcasts the wrapped upstream error to `E`, if possible.
    #[must_use]
    pub fn upstream_as<E>(&self) -> Option<&E>
    where
        E: Error + 'static,
    {
        match self {
            Self::Upstream(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns `true` for [`FlowError::Overflow`].
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow)
    }

    /// Returns `true` for [`FlowError::Protocol`].
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns `true` for [`FlowError::RetryExhausted`].
    #[must_use]
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Wraps this error as the last failure of an exhausted retry budget.
    #[must_use]
    pub fn into_retry_exhausted(self, attempts: u64) -> Self {
        Self::RetryExhausted {
            attempts,
            last: Arc::new(self),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageError
// ---------------------------------------------------------------------------

/// A plain-text upstream failure, used by [`FlowError::failed`] and
/// message-only error sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageError(pub String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for MessageError {}

// ---------------------------------------------------------------------------
// MapFailure
// ---------------------------------------------------------------------------

/// Error returned from a fallible transform, carrying the element back.
///
/// Handing the element back lets `on_error_continue` report the offending
/// value to its handler without requiring `Clone` on the element type.
#[derive(Debug)]
pub struct MapFailure<T> {
    /// The element that could not be transformed.
    pub value: T,
    /// The failure that occurred.
    pub error: FlowError,
}

impl<T> MapFailure<T> {
    /// Creates a new failure for `value`.
    pub fn new(error: FlowError, value: T) -> Self {
        Self { value, error }
    }

    /// Consumes the failure and returns the element that could not be
    /// transformed.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: fmt::Debug> fmt::Display for MapFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transform failed: {}", self.error)
    }
}

impl<T: fmt::Debug> Error for MapFailure<T> {}

// ===========================================================================
// Tests
// ===========================================================================
