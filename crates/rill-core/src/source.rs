//! Leaf producers: the cold sources every pipeline bottoms out in.
//!
//! [`IterFlow`] adapts any cloneable `IntoIterator` into a demand-driven
//! producer. Each subscription clones the iterator, so the source is cold:
//! re-subscription re-executes it from the start.
//!
//! # Drain protocol
//!
//! Emission runs in a serialized drain loop guarded by a work-in-progress
//! counter: whichever thread wins the counter emits on behalf of everyone,
//! and reentrant `request` calls (from inside `on_next`) only bump demand.
//! This keeps a single producer issuing signals for a given subscription at
//! any moment.

use std::iter::Peekable;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::subscriber::Subscriber;
use crate::subscription::{Demand, InertSubscription, Subscription};

/// Assembly-time description of a publisher; subscribing is the only
/// side-effecting action.
pub(crate) trait RawFlow<T>: Send + Sync {
    /// Attaches a subscriber, delivering `on_subscribe` before anything else.
    fn subscribe_raw(self: Arc<Self>, subscriber: Box<dyn Subscriber<T>>);
}

// ---------------------------------------------------------------------------
// IterFlow
// ---------------------------------------------------------------------------

/// Cold source over a cloneable iterator.
pub(crate) struct IterFlow<I> {
    iter: I,
}

impl<I> IterFlow<I> {
    pub(crate) fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I, T> RawFlow<T> for IterFlow<I>
where
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send,
    T: Send + 'static,
{
    fn subscribe_raw(self: Arc<Self>, subscriber: Box<dyn Subscriber<T>>) {
        IterProducer::start(self.iter.clone().into_iter(), subscriber);
    }
}

struct IterProducer<I: Iterator> {
    state: Mutex<IterState<I>>,
    demand: Demand,
    /// Work-in-progress counter serializing the drain loop.
    wip: AtomicU64,
}

struct IterState<I: Iterator> {
    iter: Peekable<I>,
    subscriber: Box<dyn Subscriber<I::Item>>,
    done: bool,
}

impl<I> IterProducer<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn start(iter: I, subscriber: Box<dyn Subscriber<I::Item>>) {
        let producer = Arc::new(Self {
            state: Mutex::new(IterState {
                iter: iter.peekable(),
                subscriber,
                done: false,
            }),
            demand: Demand::new(),
            wip: AtomicU64::new(1),
        });

        // The wip counter starts claimed: requests made inside on_subscribe
        // only accumulate demand, and the loop below drains them.
        {
            let mut state = producer.state.lock();
            let subscription =
                Arc::new(IterSubscription(Arc::clone(&producer))) as Arc<dyn Subscription>;
            state.subscriber.on_subscribe(subscription);
        }
        producer.drain_loop(1);
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        self.drain_loop(1);
    }

    fn drain_loop(&self, claimed: u64) {
        let mut missed = claimed;
        loop {
            self.emit_available();
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }

    fn emit_available(&self) {
        loop {
            if self.demand.is_cancelled() {
                return;
            }
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            if self.demand.is_violated() {
                state.done = true;
                state
                    .subscriber
                    .on_error(FlowError::Protocol("request(0) is not allowed".into()));
                drop(state);
                self.demand.cancel();
                return;
            }
            if state.iter.peek().is_none() {
                state.done = true;
                state.subscriber.on_complete();
                return;
            }
            if !self.demand.try_claim() {
                return;
            }
            let Some(value) = state.iter.next() else {
                return;
            };
            state.subscriber.on_next(value);
        }
    }
}

/// Subscription handle for an [`IterProducer`].
struct IterSubscription<I: Iterator>(Arc<IterProducer<I>>);

impl<I> Subscription for IterSubscription<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn request(&self, n: u64) {
        self.0.demand.add(n);
        // Reentrant calls (from inside on_next) only bump the wip counter.
        self.0.drain();
    }

    fn cancel(&self) {
        self.0.demand.cancel();
    }
}

// ---------------------------------------------------------------------------
// ErrorFlow / DeferFlow
// ---------------------------------------------------------------------------

/// Source that terminates with an error on subscribe.
pub(crate) struct ErrorFlow {
    error: FlowError,
}

impl ErrorFlow {
    pub(crate) fn new(error: FlowError) -> Self {
        Self { error }
    }
}

impl<T: Send + 'static> RawFlow<T> for ErrorFlow {
    fn subscribe_raw(self: Arc<Self>, mut subscriber: Box<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Arc::new(InertSubscription));
        subscriber.on_error(self.error.clone());
    }
}

/// Source resolved lazily at subscribe time.
pub(crate) struct DeferFlow<T> {
    factory: Box<dyn Fn() -> crate::Flow<T> + Send + Sync>,
}

impl<T> DeferFlow<T> {
    pub(crate) fn new(factory: impl Fn() -> crate::Flow<T> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for DeferFlow<T> {
    fn subscribe_raw(self: Arc<Self>, subscriber: Box<dyn Subscriber<T>>) {
        (self.factory)().subscribe_boxed(subscriber);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use crate::testkit::TestSubscriber;
    use crate::Flow;

    #[test]
    fn test_iter_source_emits_all_with_unbounded_demand() {
        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec![1, 2, 3]).subscribe(probe.clone());
        assert!(probe.is_completed());
        assert_eq!(probe.values(), vec![1, 2, 3]);
    }

    #[test]
    fn test_iter_source_honors_bounded_demand() {
        let probe = TestSubscriber::with_initial_request(2);
        Flow::range(1, 100).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(!probe.is_completed());

        probe.request(1);
        assert_eq!(probe.values(), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_source_completes_without_demand() {
        let probe = TestSubscriber::<i32>::with_initial_request(0);
        Flow::<i32>::empty().subscribe(probe.clone());
        assert!(probe.is_completed());
        assert!(probe.values().is_empty());
    }

    #[test]
    fn test_cold_source_replays_per_subscription() {
        let flow = Flow::from_iter(vec!["a", "b"]);
        for _ in 0..2 {
            let probe = TestSubscriber::unbounded();
            flow.clone().subscribe(probe.clone());
            assert_eq!(probe.values(), vec!["a", "b"]);
        }
    }

    #[test]
    fn test_request_zero_is_a_protocol_error() {
        let probe = TestSubscriber::with_initial_request(1);
        Flow::range(1, 10).subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1]);

        probe.raw_request(0);
        let error = probe.error().expect("protocol violation");
        assert!(error.is_protocol());
    }

    #[test]
    fn test_error_source_signals_terminal_error() {
        let probe = TestSubscriber::<i32>::unbounded();
        Flow::error(crate::FlowError::failed("boom")).subscribe(probe.clone());
        assert_eq!(probe.error().unwrap().to_string(), "upstream failure: boom");
    }

    #[test]
    fn test_defer_resolves_at_subscribe_time() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        let flow = Flow::defer(move || {
            c.fetch_add(1, Ordering::AcqRel);
            Flow::just(7)
        });
        assert_eq!(calls.load(Ordering::Acquire), 0);

        let probe = TestSubscriber::unbounded();
        flow.clone().subscribe(probe.clone());
        assert_eq!(probe.values(), vec![7]);
        assert_eq!(calls.load(Ordering::Acquire), 1);

        flow.subscribe(TestSubscriber::unbounded());
        assert_eq!(calls.load(Ordering::Acquire), 2);
    }
}
