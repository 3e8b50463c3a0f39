//! Signal variants delivered through a subscription.
//!
//! Within one subscription the total order is: any number of `Next`,
//! followed by at most one of `Error` or `Complete`.

use crate::error::FlowError;

/// A single event observed by a subscriber.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    /// An element emitted by the producer.
    Next(T),
    /// Terminal failure. No signal follows.
    Error(FlowError),
    /// Terminal success. No signal follows.
    Complete,
}

impl<T> Signal<T> {
    /// Returns `true` if this signal terminates the sequence.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }

    /// Returns the element if this is a `Next` signal.
    pub fn into_next(self) -> Option<T> {
        match self {
            Self::Next(value) => Some(value),
            _ => None,
        }
    }
}
