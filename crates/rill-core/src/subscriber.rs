//! Subscriber contract.
//!
//! [`Subscriber`] is the capability surface a consumer exposes to a
//! producer. Every hook has a default so test doubles and callback
//! subscribers override only what they need. The [`SubscriberContext`]
//! travels from the final subscriber back up through operator wrappers at
//! subscribe time; it carries the `on_error_continue` handler that
//! continuation-aware operators consult.

use std::any::Any;
use std::sync::Arc;

use crate::error::FlowError;
use crate::subscription::{Subscription, UNBOUNDED};

/// Handler invoked by `on_error_continue` with the failure and the
/// type-erased offending element.
pub type ContinueHandler = Arc<dyn Fn(&FlowError, &(dyn Any + Send)) + Send + Sync>;

// ---------------------------------------------------------------------------
// SubscriberContext
// ---------------------------------------------------------------------------

/// Assembly-time context propagated upstream through operator wrappers.
#[derive(Clone, Default)]
pub struct SubscriberContext {
    continue_handler: Option<ContinueHandler>,
}

impl SubscriberContext {
    /// Returns a copy of this context carrying `handler` for per-element
    /// error continuation.
    #[must_use]
    pub fn with_continue_handler(mut self, handler: ContinueHandler) -> Self {
        self.continue_handler = Some(handler);
        self
    }

    /// Returns the installed continuation handler, if any.
    #[must_use]
    pub fn continue_handler(&self) -> Option<&ContinueHandler> {
        self.continue_handler.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Consumer-side hooks for one subscription.
///
/// Producers guarantee: `on_subscribe` first, then zero or more `on_next`
/// within granted demand, then at most one of `on_error`/`on_complete`.
/// Nothing is delivered after cancellation.
pub trait Subscriber<T>: Send {
    /// Called once before any other signal, delivering the demand lever.
    ///
    /// The default requests unbounded demand, which is what the callback
    /// convenience surface wants. Override to exercise backpressure.
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        subscription.request(UNBOUNDED);
    }

    /// Called for each element within granted demand.
    fn on_next(&mut self, value: T);

    /// Called once on terminal failure.
    ///
    /// The default logs the error so an uncaught terminal failure is never a
    /// silent drop.
    fn on_error(&mut self, error: FlowError) {
        tracing::error!(%error, "unhandled terminal error reached subscriber");
    }

    /// Called once on terminal success.
    fn on_complete(&mut self) {}

    /// Context visible to upstream operators at subscribe time.
    ///
    /// Operator wrappers forward the downstream context so handlers
    /// installed near the subscriber reach the operators that honor them.
    fn context(&self) -> SubscriberContext {
        SubscriberContext::default()
    }
}

impl<T> Subscriber<T> for Box<dyn Subscriber<T>> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        (**self).on_subscribe(subscription);
    }
    fn on_next(&mut self, value: T) {
        (**self).on_next(value);
    }
    fn on_error(&mut self, error: FlowError) {
        (**self).on_error(error);
    }
    fn on_complete(&mut self) {
        (**self).on_complete();
    }
    fn context(&self) -> SubscriberContext {
        (**self).context()
    }
}

// ---------------------------------------------------------------------------
// CallbackSubscriber
// ---------------------------------------------------------------------------

/// Closure-backed subscriber used by the `subscribe_fn` convenience surface.
///
/// Demand defaults to unbounded via the trait's `on_subscribe` default.
pub struct CallbackSubscriber<T> {
    on_next: Box<dyn FnMut(T) + Send>,
    on_error: Option<Box<dyn FnMut(FlowError) + Send>>,
    on_complete: Option<Box<dyn FnMut() + Send>>,
}

impl<T> CallbackSubscriber<T> {
    /// Creates a subscriber that only observes elements.
    pub fn new(on_next: impl FnMut(T) + Send + 'static) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error: None,
            on_complete: None,
        }
    }

    /// Adds a terminal-error callback.
    #[must_use]
    pub fn with_on_error(mut self, on_error: impl FnMut(FlowError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(on_error));
        self
    }

    /// Adds a completion callback.
    #[must_use]
    pub fn with_on_complete(mut self, on_complete: impl FnMut() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }
}

impl<T: Send> Subscriber<T> for CallbackSubscriber<T> {
    fn on_next(&mut self, value: T) {
        (self.on_next)(value);
    }

    fn on_error(&mut self, error: FlowError) {
        match self.on_error.as_mut() {
            Some(callback) => callback(error),
            None => tracing::error!(%error, "unhandled terminal error reached subscriber"),
        }
    }

    fn on_complete(&mut self) {
        if let Some(callback) = self.on_complete.as_mut() {
            callback();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_default_on_subscribe_requests_unbounded() {
        struct Probe;
        impl Subscriber<i32> for Probe {
            fn on_next(&mut self, _value: i32) {}
        }

        #[derive(Default)]
        struct Recording(AtomicU64);
        impl Subscription for Recording {
            fn request(&self, n: u64) {
                self.0.store(n, Ordering::Release);
            }
            fn cancel(&self) {}
        }

        let subscription = Arc::new(Recording::default());
        Probe.on_subscribe(Arc::clone(&subscription) as Arc<dyn Subscription>);
        assert_eq!(subscription.0.load(Ordering::Acquire), UNBOUNDED);
    }

    #[test]
    fn test_callback_subscriber_routes_signals() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(Mutex::new(false));

        let s = Arc::clone(&seen);
        let c = Arc::clone(&completed);
        let mut subscriber = CallbackSubscriber::new(move |v: i32| s.lock().unwrap().push(v))
            .with_on_complete(move || *c.lock().unwrap() = true);

        subscriber.on_next(1);
        subscriber.on_next(2);
        subscriber.on_complete();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(*completed.lock().unwrap());
    }

    #[test]
    fn test_callback_subscriber_error_callback() {
        let captured = Arc::new(Mutex::new(None));
        let c = Arc::clone(&captured);
        let mut subscriber = CallbackSubscriber::new(|_: i32| {})
            .with_on_error(move |e| *c.lock().unwrap() = Some(e));

        subscriber.on_error(FlowError::Overflow);
        assert!(captured.lock().unwrap().as_ref().unwrap().is_overflow());
    }

    #[test]
    fn test_context_carries_continue_handler() {
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let handler: ContinueHandler = Arc::new(move |_error, _value| {
            h.fetch_add(1, Ordering::AcqRel);
        });

        let ctx = SubscriberContext::default().with_continue_handler(handler);
        let installed = ctx.continue_handler().expect("handler installed");
        installed(&FlowError::failed("x"), &3i32);
        assert_eq!(hits.load(Ordering::Acquire), 1);

        assert!(SubscriberContext::default().continue_handler().is_none());
    }
}
