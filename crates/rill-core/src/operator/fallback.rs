//! Fallback stages: alternative sources and error rewriting.
//!
//! The switching stages hand downstream a [`RelaySubscription`] once, then
//! move the subscriber itself from the primary source to the fallback at the
//! moment of the switch. Outstanding demand rides the relay, so downstream
//! never observes the handoff.

use std::any::Any;
use std::sync::Arc;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::source::RawFlow;
use crate::subscriber::{ContinueHandler, Subscriber, SubscriberContext};
use crate::subscription::{RelaySubscription, Subscription};

/// Tail-position subscriber attached to a fallback source after a switch.
///
/// The relay already carries downstream's subscription; this only swaps the
/// new upstream in and keeps the produced count honest.
struct HandoffSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    relay: Arc<RelaySubscription>,
}

impl<T: Send + 'static> Subscriber<T> for HandoffSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.relay.swap_upstream(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.relay.produced(1);
        self.downstream.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }

    fn context(&self) -> SubscriberContext {
        self.downstream.context()
    }
}

// ---------------------------------------------------------------------------
// SwitchIfEmptyFlow
// ---------------------------------------------------------------------------

/// Switches to an alternative source on empty completion.
pub(crate) struct SwitchIfEmptyFlow<T> {
    source: Flow<T>,
    alternative: Flow<T>,
}

impl<T> SwitchIfEmptyFlow<T> {
    pub(crate) fn new(source: Flow<T>, alternative: Flow<T>) -> Self {
        Self {
            source,
            alternative,
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for SwitchIfEmptyFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(SwitchSubscriber {
            downstream: Some(downstream),
            relay: RelaySubscription::new(),
            alternative: Some(self.alternative.clone()),
            emitted: false,
        }));
    }
}

struct SwitchSubscriber<T> {
    downstream: Option<Box<dyn Subscriber<T>>>,
    relay: Arc<RelaySubscription>,
    alternative: Option<Flow<T>>,
    emitted: bool,
}

impl<T: Send + 'static> Subscriber<T> for SwitchSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.relay.swap_upstream(subscription);
        if let Some(downstream) = self.downstream.as_mut() {
            let relay = Arc::clone(&self.relay) as Arc<dyn Subscription>;
            downstream.on_subscribe(relay);
        }
    }

    fn on_next(&mut self, value: T) {
        self.emitted = true;
        self.relay.produced(1);
        if let Some(downstream) = self.downstream.as_mut() {
            downstream.on_next(value);
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if let Some(downstream) = self.downstream.as_mut() {
            downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if self.emitted {
            if let Some(downstream) = self.downstream.as_mut() {
                downstream.on_complete();
            }
            return;
        }
        // Empty primary: move downstream onto the alternative. The relay's
        // outstanding demand replays when the alternative's subscription
        // arrives.
        if let (Some(downstream), Some(alternative)) =
            (self.downstream.take(), self.alternative.take())
        {
            alternative.subscribe_boxed(Box::new(HandoffSubscriber {
                downstream,
                relay: Arc::clone(&self.relay),
            }));
        }
    }

    fn context(&self) -> SubscriberContext {
        self.downstream
            .as_ref()
            .map(Subscriber::context)
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ResumeFlow
// ---------------------------------------------------------------------------

/// Continues with a fallback source derived from a terminal error.
pub(crate) struct ResumeFlow<T> {
    source: Flow<T>,
    fallback: Arc<dyn Fn(&FlowError) -> Flow<T> + Send + Sync>,
}

impl<T> ResumeFlow<T> {
    pub(crate) fn new(
        source: Flow<T>,
        fallback: impl Fn(&FlowError) -> Flow<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            fallback: Arc::new(fallback),
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for ResumeFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(ResumeSubscriber {
            downstream: Some(downstream),
            relay: RelaySubscription::new(),
            fallback: Arc::clone(&self.fallback),
        }));
    }
}

struct ResumeSubscriber<T> {
    downstream: Option<Box<dyn Subscriber<T>>>,
    relay: Arc<RelaySubscription>,
    fallback: Arc<dyn Fn(&FlowError) -> Flow<T> + Send + Sync>,
}

impl<T: Send + 'static> Subscriber<T> for ResumeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.relay.swap_upstream(subscription);
        if let Some(downstream) = self.downstream.as_mut() {
            let relay = Arc::clone(&self.relay) as Arc<dyn Subscription>;
            downstream.on_subscribe(relay);
        }
    }

    fn on_next(&mut self, value: T) {
        self.relay.produced(1);
        if let Some(downstream) = self.downstream.as_mut() {
            downstream.on_next(value);
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if let Some(downstream) = self.downstream.take() {
            let fallback = (self.fallback)(&error);
            fallback.subscribe_boxed(Box::new(HandoffSubscriber {
                downstream,
                relay: Arc::clone(&self.relay),
            }));
        }
    }

    fn on_complete(&mut self) {
        if let Some(downstream) = self.downstream.as_mut() {
            downstream.on_complete();
        }
    }

    fn context(&self) -> SubscriberContext {
        self.downstream
            .as_ref()
            .map(Subscriber::context)
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ErrorMapFlow
// ---------------------------------------------------------------------------

/// Rewrites a terminal error in flight.
pub(crate) struct ErrorMapFlow<T> {
    source: Flow<T>,
    f: Arc<dyn Fn(FlowError) -> FlowError + Send + Sync>,
}

impl<T> ErrorMapFlow<T> {
    pub(crate) fn new(
        source: Flow<T>,
        f: impl Fn(FlowError) -> FlowError + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            f: Arc::new(f),
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for ErrorMapFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(ErrorMapSubscriber {
            downstream,
            f: Arc::clone(&self.f),
        }));
    }
}

struct ErrorMapSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    f: Arc<dyn Fn(FlowError) -> FlowError + Send + Sync>,
}

impl<T: Send + 'static> Subscriber<T> for ErrorMapSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        self.downstream.on_error((self.f)(error));
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }

    fn context(&self) -> SubscriberContext {
        self.downstream.context()
    }
}

// ---------------------------------------------------------------------------
// ContinueFlow
// ---------------------------------------------------------------------------

/// Installs a per-element continuation handler into the subscriber context.
///
/// The stage itself forwards every signal; continuation-aware operators
/// upstream consult the context and skip failed elements instead of
/// terminating.
pub(crate) struct ContinueFlow<T> {
    source: Flow<T>,
    handler: ContinueHandler,
}

impl<T> ContinueFlow<T> {
    pub(crate) fn new(
        source: Flow<T>,
        handler: impl Fn(&FlowError, &(dyn Any + Send)) + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            handler: Arc::new(handler),
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for ContinueFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(ContinueSubscriber {
            downstream,
            handler: Arc::clone(&self.handler),
        }));
    }
}

struct ContinueSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    handler: ContinueHandler,
}

impl<T: Send + 'static> Subscriber<T> for ContinueSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&mut self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }

    fn context(&self) -> SubscriberContext {
        // The nearest handler wins when stages nest.
        self.downstream
            .context()
            .with_continue_handler(Arc::clone(&self.handler))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use crate::error::{FlowError, MapFailure};
    use crate::testkit::TestSubscriber;
    use crate::Flow;

    #[test]
    fn test_switch_if_empty_takes_alternative() {
        let probe = TestSubscriber::unbounded();
        Flow::<&str>::empty()
            .switch_if_empty(Flow::from_iter(vec!["fallback"]))
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec!["fallback"]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_switch_if_empty_ignored_when_primary_emits() {
        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec!["a"])
            .switch_if_empty(Flow::from_iter(vec!["fallback"]))
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec!["a"]);
    }

    #[test]
    fn test_switch_if_empty_is_lazy() {
        let subscribed = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&subscribed);
        let alternative = Flow::defer(move || {
            s.fetch_add(1, Ordering::AcqRel);
            Flow::just("fallback")
        });

        Flow::from_iter(vec!["a"])
            .switch_if_empty(alternative)
            .subscribe(TestSubscriber::unbounded());
        assert_eq!(subscribed.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_switch_if_empty_carries_outstanding_demand() {
        let probe = TestSubscriber::with_initial_request(2);
        Flow::<i32>::empty()
            .switch_if_empty(Flow::range(1, 10).map(|n| i32::try_from(n).unwrap()))
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(!probe.is_completed());
    }

    #[test]
    fn test_on_error_resume_switches_to_fallback() {
        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec!["A", "B"])
            .concat_with(Flow::error(FlowError::failed("boom")))
            .on_error_resume(|_| Flow::from_iter(vec!["D", "E"]))
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec!["A", "B", "D", "E"]);
        assert!(probe.is_completed());
        assert!(probe.error().is_none());
    }

    #[test]
    fn test_on_error_return_emits_default() {
        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec!["A", "B", "C"])
            .concat_with(Flow::error(FlowError::failed("boom")))
            .on_error_return("D")
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec!["A", "B", "C", "D"]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_on_error_map_rewrites_error() {
        let probe = TestSubscriber::<i32>::unbounded();
        Flow::error(FlowError::failed("raw"))
            .on_error_map(|e| FlowError::Protocol(format!("wrapped: {e}")))
            .subscribe(probe.clone());
        assert!(probe.error().expect("error").is_protocol());
    }

    #[test]
    fn test_on_error_continue_skips_failed_elements() {
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);

        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec![1i32, 2, 3, 4])
            .try_map(|n| {
                if n % 2 == 0 {
                    Err(MapFailure::new(FlowError::failed("even"), n))
                } else {
                    Ok(n * 10)
                }
            })
            .on_error_continue(move |_error, value| {
                if value.downcast_ref::<i32>().is_some() {
                    s.fetch_add(1, Ordering::AcqRel);
                }
            })
            .subscribe(probe.clone());

        assert_eq!(probe.values(), vec![10, 30]);
        assert!(probe.is_completed());
        assert_eq!(seen.load(Ordering::Acquire), 2);
    }
}
