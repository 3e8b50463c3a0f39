//! Overflow policies for fast producers: drop, buffer, error.
//!
//! Each stage requests unbounded demand upstream and gates deliveries on
//! the downstream [`Demand`] ledger. What happens to an element that
//! arrives without demand is the policy: hand it to a drop callback, park
//! it in a bounded buffer, or kill the sequence with
//! [`FlowError::Overflow`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::source::RawFlow;
use crate::subscriber::{Subscriber, SubscriberContext};
use crate::subscription::{Demand, Subscription, UNBOUNDED};

/// What a full [`BufferFlow`] evicts when one more element arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Evict the oldest buffered element to make room for the newest.
    DropOldest,
    /// Discard the newly arrived element, keeping the buffer as is.
    DropLatest,
}

// ---------------------------------------------------------------------------
// DropFlow
// ---------------------------------------------------------------------------

/// Discards elements arriving without downstream demand.
pub(crate) struct DropFlow<T> {
    source: Flow<T>,
    on_drop: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T> DropFlow<T> {
    pub(crate) fn new(source: Flow<T>, on_drop: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            source,
            on_drop: Arc::new(on_drop),
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for DropFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(DropSubscriber {
            downstream,
            demand: Arc::new(Demand::new()),
            on_drop: Arc::clone(&self.on_drop),
            upstream: None,
            done: false,
        }));
    }
}

struct DropSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    demand: Arc<Demand>,
    on_drop: Arc<dyn Fn(&T) + Send + Sync>,
    upstream: Option<Arc<dyn Subscription>>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for DropSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.upstream = Some(Arc::clone(&subscription));
        self.downstream.on_subscribe(Arc::new(GateSubscription {
            demand: Arc::clone(&self.demand),
            upstream: Arc::clone(&subscription),
        }));
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: T) {
        if self.done || self.demand.is_cancelled() {
            return;
        }
        if self.demand.is_violated() {
            self.fail(FlowError::Protocol("request(0) is not allowed".into()));
            return;
        }
        if self.demand.try_claim() {
            self.downstream.on_next(value);
        } else {
            (self.on_drop)(&value);
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if !self.done {
            self.done = true;
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.downstream.on_complete();
        }
    }

    fn context(&self) -> SubscriberContext {
        self.downstream.context()
    }
}

impl<T: Send + 'static> DropSubscriber<T> {
    fn fail(&mut self, error: FlowError) {
        self.done = true;
        if let Some(upstream) = self.upstream.take() {
            upstream.cancel();
        }
        self.downstream.on_error(error);
    }
}

/// Downstream-facing subscription for the gating stages: requests feed the
/// local ledger, cancellation propagates upstream.
struct GateSubscription {
    demand: Arc<Demand>,
    upstream: Arc<dyn Subscription>,
}

impl Subscription for GateSubscription {
    fn request(&self, n: u64) {
        self.demand.add(n);
    }

    fn cancel(&self) {
        self.demand.cancel();
        self.upstream.cancel();
    }
}

// ---------------------------------------------------------------------------
// ErrorOnOverflowFlow
// ---------------------------------------------------------------------------

/// Terminates with [`FlowError::Overflow`] on the first element that
/// arrives without demand.
pub(crate) struct ErrorOnOverflowFlow<T> {
    source: Flow<T>,
}

impl<T> ErrorOnOverflowFlow<T> {
    pub(crate) fn new(source: Flow<T>) -> Self {
        Self { source }
    }
}

impl<T: Send + 'static> RawFlow<T> for ErrorOnOverflowFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(ErrorOnOverflowSubscriber {
            downstream,
            demand: Arc::new(Demand::new()),
            upstream: None,
            done: false,
        }));
    }
}

struct ErrorOnOverflowSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    demand: Arc<Demand>,
    upstream: Option<Arc<dyn Subscription>>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for ErrorOnOverflowSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.upstream = Some(Arc::clone(&subscription));
        self.downstream.on_subscribe(Arc::new(GateSubscription {
            demand: Arc::clone(&self.demand),
            upstream: Arc::clone(&subscription),
        }));
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: T) {
        if self.done || self.demand.is_cancelled() {
            return;
        }
        if self.demand.try_claim() {
            self.downstream.on_next(value);
        } else {
            self.done = true;
            if let Some(upstream) = self.upstream.take() {
                upstream.cancel();
            }
            self.downstream.on_error(FlowError::Overflow);
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if !self.done {
            self.done = true;
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.downstream.on_complete();
        }
    }

    fn context(&self) -> SubscriberContext {
        self.downstream.context()
    }
}

// ---------------------------------------------------------------------------
// BufferFlow
// ---------------------------------------------------------------------------

/// Parks elements past demand in a bounded buffer, evicting per an
/// [`OverflowStrategy`] when full.
pub(crate) struct BufferFlow<T> {
    source: Flow<T>,
    capacity: usize,
    strategy: OverflowStrategy,
    on_evict: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T> BufferFlow<T> {
    pub(crate) fn new(
        source: Flow<T>,
        capacity: usize,
        strategy: OverflowStrategy,
        on_evict: impl Fn(&T) + Send + Sync + 'static,
    ) -> Self {
        assert!(capacity > 0, "buffer capacity must be at least 1");
        Self {
            source,
            capacity,
            strategy,
            on_evict: Arc::new(on_evict),
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for BufferFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        let context = downstream.context();
        let coordinator = Arc::new(BufferCoordinator {
            demand: Demand::new(),
            wip: AtomicU64::new(1),
            capacity: self.capacity,
            strategy: self.strategy,
            on_evict: Arc::clone(&self.on_evict),
            context,
            state: Mutex::new(BufferState {
                downstream,
                queue: VecDeque::new(),
                upstream: None,
                completed: false,
                error: None,
                done: false,
            }),
        });

        {
            let subscription = Arc::new(BufferSubscription(Arc::clone(&coordinator)));
            let mut state = coordinator.state.lock();
            state.downstream.on_subscribe(subscription);
        }

        self.source.clone().subscribe_boxed(Box::new(BufferSubscriber {
            coordinator: Arc::clone(&coordinator),
        }));

        coordinator.drain_loop(1);
    }
}

struct BufferCoordinator<T> {
    demand: Demand,
    wip: AtomicU64,
    capacity: usize,
    strategy: OverflowStrategy,
    on_evict: Arc<dyn Fn(&T) + Send + Sync>,
    context: SubscriberContext,
    state: Mutex<BufferState<T>>,
}

struct BufferState<T> {
    downstream: Box<dyn Subscriber<T>>,
    queue: VecDeque<T>,
    upstream: Option<Arc<dyn Subscription>>,
    completed: bool,
    error: Option<FlowError>,
    done: bool,
}

impl<T: Send + 'static> BufferCoordinator<T> {
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
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            if self.demand.is_cancelled() {
                state.done = true;
                self.teardown(state);
                return;
            }
            if self.demand.is_violated() {
                state.done = true;
                state
                    .downstream
                    .on_error(FlowError::Protocol("request(0) is not allowed".into()));
                self.teardown(state);
                return;
            }
            if let Some(error) = state.error.take() {
                state.done = true;
                state.downstream.on_error(error);
                self.teardown(state);
                return;
            }
            if state.queue.is_empty() {
                if state.completed {
                    state.done = true;
                    state.downstream.on_complete();
                }
                return;
            }
            if !self.demand.try_claim() {
                return;
            }
            let Some(value) = state.queue.pop_front() else {
                return;
            };
            state.downstream.on_next(value);
        }
    }

    fn teardown(&self, mut state: parking_lot::MutexGuard<'_, BufferState<T>>) {
        let upstream = state.upstream.take();
        drop(state);
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct BufferSubscription<T>(Arc<BufferCoordinator<T>>);

impl<T: Send + 'static> Subscription for BufferSubscription<T> {
    fn request(&self, n: u64) {
        self.0.demand.add(n);
        self.0.drain();
    }

    fn cancel(&self) {
        self.0.demand.cancel();
        self.0.drain();
    }
}

struct BufferSubscriber<T> {
    coordinator: Arc<BufferCoordinator<T>>,
}

impl<T: Send + 'static> Subscriber<T> for BufferSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                drop(state);
                subscription.cancel();
                return;
            }
            state.upstream = Some(Arc::clone(&subscription));
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: T) {
        let evicted = {
            let mut state = self.coordinator.state.lock();
            if state.done {
                return;
            }
            if state.queue.len() < self.coordinator.capacity {
                state.queue.push_back(value);
                None
            } else {
                match self.coordinator.strategy {
                    OverflowStrategy::DropOldest => {
                        let evicted = state.queue.pop_front();
                        state.queue.push_back(value);
                        evicted
                    }
                    OverflowStrategy::DropLatest => Some(value),
                }
            }
        };
        if let Some(evicted) = evicted {
            (self.coordinator.on_evict)(&evicted);
        }
        self.coordinator.drain();
    }

    fn on_error(&mut self, error: FlowError) {
        {
            let mut state = self.coordinator.state.lock();
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.coordinator.drain();
    }

    fn on_complete(&mut self) {
        self.coordinator.state.lock().completed = true;
        self.coordinator.drain();
    }

    fn context(&self) -> SubscriberContext {
        self.coordinator.context.clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::OverflowStrategy;
    use crate::testkit::TestSubscriber;
    use crate::Flow;

    #[test]
    fn test_drop_discards_undemanded_elements() {
        let dropped = Arc::new(AtomicU64::new(0));
        let d = Arc::clone(&dropped);

        let probe = TestSubscriber::with_initial_request(3);
        Flow::range(1, 10)
            .on_backpressure_drop(move |_| {
                d.fetch_add(1, Ordering::AcqRel);
            })
            .subscribe(probe.clone());

        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert_eq!(dropped.load(Ordering::Acquire), 7);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_buffer_parks_elements_until_demand() {
        let probe = TestSubscriber::with_initial_request(2);
        Flow::range(1, 6)
            .on_backpressure_buffer(10, OverflowStrategy::DropOldest, |_| {})
            .subscribe(probe.clone());

        assert_eq!(probe.values(), vec![1, 2]);
        probe.request(10);
        assert_eq!(probe.values(), vec![1, 2, 3, 4, 5, 6]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_buffer_drop_oldest_keeps_newest() {
        let evicted = Arc::new(AtomicU64::new(0));
        let e = Arc::clone(&evicted);

        let probe = TestSubscriber::with_initial_request(0);
        Flow::range(1, 5)
            .on_backpressure_buffer(2, OverflowStrategy::DropOldest, move |_| {
                e.fetch_add(1, Ordering::AcqRel);
            })
            .subscribe(probe.clone());

        assert_eq!(evicted.load(Ordering::Acquire), 3);
        probe.request(2);
        assert_eq!(probe.values(), vec![4, 5]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_buffer_drop_latest_keeps_oldest() {
        let probe = TestSubscriber::with_initial_request(0);
        Flow::range(1, 5)
            .on_backpressure_buffer(2, OverflowStrategy::DropLatest, |_| {})
            .subscribe(probe.clone());

        probe.request(2);
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_error_on_overflow_terminates() {
        let probe = TestSubscriber::with_initial_request(2);
        Flow::range(1, 10).on_backpressure_error().subscribe(probe.clone());

        assert_eq!(probe.values(), vec![1, 2]);
        assert!(probe.error().expect("overflow error").is_overflow());
    }

    #[test]
    fn test_error_on_overflow_passes_through_within_demand() {
        let probe = TestSubscriber::unbounded();
        Flow::range(1, 5).on_backpressure_error().subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2, 3, 4, 5]);
        assert!(probe.is_completed());
    }
}
