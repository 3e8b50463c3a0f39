//! Multi-source combinators: concat, sequential merge, zip.
//!
//! Concat moves the downstream subscriber from source to source behind a
//! [`RelaySubscription`]. The eager combinators (sequential merge, zip) run
//! a coordinator with per-source spill queues and the serialized drain
//! protocol used everywhere else in the crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::source::RawFlow;
use crate::subscriber::{Subscriber, SubscriberContext};
use crate::subscription::{Demand, RelaySubscription, Subscription, UNBOUNDED};

// ---------------------------------------------------------------------------
// ConcatFlow
// ---------------------------------------------------------------------------

/// Subscribes sources one after another, each only when its predecessor
/// completes.
pub(crate) struct ConcatFlow<T> {
    sources: Vec<Flow<T>>,
}

impl<T> ConcatFlow<T> {
    pub(crate) fn new(sources: Vec<Flow<T>>) -> Self {
        Self { sources }
    }
}

impl<T: Send + 'static> RawFlow<T> for ConcatFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        let mut remaining = self.sources.clone().into_iter();
        let relay = RelaySubscription::new();
        match remaining.next() {
            Some(first) => first.subscribe_boxed(Box::new(ConcatStage {
                downstream: Some(downstream),
                remaining,
                relay,
                announce: true,
            })),
            None => {
                let mut downstream = downstream;
                downstream.on_subscribe(relay as Arc<dyn Subscription>);
                downstream.on_complete();
            }
        }
    }
}

struct ConcatStage<T> {
    downstream: Option<Box<dyn Subscriber<T>>>,
    remaining: std::vec::IntoIter<Flow<T>>,
    relay: Arc<RelaySubscription>,
    /// Only the first stage announces the subscription downstream.
    announce: bool,
}

impl<T: Send + 'static> Subscriber<T> for ConcatStage<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.relay.swap_upstream(subscription);
        if self.announce {
            if let Some(downstream) = self.downstream.as_mut() {
                let relay = Arc::clone(&self.relay) as Arc<dyn Subscription>;
                downstream.on_subscribe(relay);
            }
        }
    }

    fn on_next(&mut self, value: T) {
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
        let Some(downstream) = self.downstream.take() else {
            return;
        };
        if self.relay.is_cancelled() {
            return;
        }
        let mut remaining = std::mem::replace(&mut self.remaining, Vec::new().into_iter());
        match remaining.next() {
            Some(next) => next.subscribe_boxed(Box::new(ConcatStage {
                downstream: Some(downstream),
                remaining,
                relay: Arc::clone(&self.relay),
                announce: false,
            })),
            None => {
                let mut downstream = downstream;
                downstream.on_complete();
            }
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
// MergeSequentialFlow
// ---------------------------------------------------------------------------

/// Subscribes all sources eagerly but emits strictly in source order.
pub(crate) struct MergeSequentialFlow<T> {
    sources: Vec<Flow<T>>,
}

impl<T> MergeSequentialFlow<T> {
    pub(crate) fn new(sources: Vec<Flow<T>>) -> Self {
        Self { sources }
    }
}

impl<T: Send + 'static> RawFlow<T> for MergeSequentialFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        let context = downstream.context();
        let coordinator = Arc::new(MergeSeqCoordinator {
            demand: Demand::new(),
            wip: AtomicU64::new(1),
            context,
            state: Mutex::new(MergeSeqState {
                downstream,
                slots: self
                    .sources
                    .iter()
                    .map(|_| Slot {
                        queue: VecDeque::new(),
                        done: false,
                        subscription: None,
                    })
                    .collect(),
                cursor: 0,
                error: None,
                done: false,
            }),
        });

        {
            let subscription = Arc::new(MergeSeqSubscription(Arc::clone(&coordinator)));
            let mut state = coordinator.state.lock();
            state.downstream.on_subscribe(subscription);
        }

        for (index, source) in self.sources.iter().enumerate() {
            source.clone().subscribe_boxed(Box::new(MergeSeqSubscriber {
                coordinator: Arc::clone(&coordinator),
                index,
            }));
        }

        coordinator.drain_loop(1);
    }
}

struct MergeSeqCoordinator<T> {
    demand: Demand,
    wip: AtomicU64,
    context: SubscriberContext,
    state: Mutex<MergeSeqState<T>>,
}

struct MergeSeqState<T> {
    downstream: Box<dyn Subscriber<T>>,
    slots: Vec<Slot<T>>,
    cursor: usize,
    error: Option<FlowError>,
    done: bool,
}

struct Slot<T> {
    queue: VecDeque<T>,
    done: bool,
    subscription: Option<Arc<dyn Subscription>>,
}

impl<T: Send + 'static> MergeSeqCoordinator<T> {
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
            if state.cursor == state.slots.len() {
                state.done = true;
                state.downstream.on_complete();
                return;
            }
            let cursor = state.cursor;
            if state.slots[cursor].queue.is_empty() {
                if state.slots[cursor].done {
                    state.cursor += 1;
                    continue;
                }
                // Head-of-line source is still producing.
                return;
            }
            if !self.demand.try_claim() {
                return;
            }
            let Some(value) = state.slots[cursor].queue.pop_front() else {
                return;
            };
            state.downstream.on_next(value);
        }
    }

    fn teardown(&self, mut state: parking_lot::MutexGuard<'_, MergeSeqState<T>>) {
        let subscriptions: Vec<_> = state
            .slots
            .iter_mut()
            .filter_map(|slot| slot.subscription.take())
            .collect();
        drop(state);
        for subscription in subscriptions {
            subscription.cancel();
        }
    }
}

struct MergeSeqSubscription<T>(Arc<MergeSeqCoordinator<T>>);

impl<T: Send + 'static> Subscription for MergeSeqSubscription<T> {
    fn request(&self, n: u64) {
        self.0.demand.add(n);
        self.0.drain();
    }

    fn cancel(&self) {
        self.0.demand.cancel();
        self.0.drain();
    }
}

struct MergeSeqSubscriber<T> {
    coordinator: Arc<MergeSeqCoordinator<T>>,
    index: usize,
}

impl<T: Send + 'static> Subscriber<T> for MergeSeqSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                drop(state);
                subscription.cancel();
                return;
            }
            state.slots[self.index].subscription = Some(Arc::clone(&subscription));
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: T) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                return;
            }
            state.slots[self.index].queue.push_back(value);
        }
        self.coordinator.drain();
    }

    fn on_error(&mut self, error: FlowError) {
        {
            let mut state = self.coordinator.state.lock();
            state.slots[self.index].subscription = None;
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.coordinator.drain();
    }

    fn on_complete(&mut self) {
        {
            let mut state = self.coordinator.state.lock();
            state.slots[self.index].subscription = None;
            state.slots[self.index].done = true;
        }
        self.coordinator.drain();
    }

    fn context(&self) -> SubscriberContext {
        self.coordinator.context.clone()
    }
}

// ---------------------------------------------------------------------------
// ZipFlow
// ---------------------------------------------------------------------------

/// Index-aligns two sources, completing with the shorter one.
pub(crate) struct ZipFlow<T, U, O> {
    left: Flow<T>,
    right: Flow<U>,
    combiner: Arc<dyn Fn(T, U) -> O + Send + Sync>,
}

impl<T, U, O> ZipFlow<T, U, O> {
    pub(crate) fn new(
        left: Flow<T>,
        right: Flow<U>,
        combiner: impl Fn(T, U) -> O + Send + Sync + 'static,
    ) -> Self {
        Self {
            left,
            right,
            combiner: Arc::new(combiner),
        }
    }
}

impl<T, U, O> RawFlow<O> for ZipFlow<T, U, O>
where
    T: Send + 'static,
    U: Send + 'static,
    O: Send + 'static,
{
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<O>>) {
        let context = downstream.context();
        let coordinator = Arc::new(ZipCoordinator {
            demand: Demand::new(),
            wip: AtomicU64::new(1),
            combiner: Arc::clone(&self.combiner),
            context,
            state: Mutex::new(ZipState {
                downstream,
                left: ZipSide::new(),
                right: ZipSide::new(),
                done: false,
                error: None,
            }),
        });

        {
            let subscription = Arc::new(ZipSubscription(Arc::clone(&coordinator)));
            let mut state = coordinator.state.lock();
            state.downstream.on_subscribe(subscription);
        }

        self.left.clone().subscribe_boxed(Box::new(ZipLeftSubscriber {
            coordinator: Arc::clone(&coordinator),
        }));
        self.right.clone().subscribe_boxed(Box::new(ZipRightSubscriber {
            coordinator: Arc::clone(&coordinator),
        }));

        coordinator.drain_loop(1);
    }
}

struct ZipCoordinator<T, U, O> {
    demand: Demand,
    wip: AtomicU64,
    combiner: Arc<dyn Fn(T, U) -> O + Send + Sync>,
    context: SubscriberContext,
    state: Mutex<ZipState<T, U, O>>,
}

struct ZipState<T, U, O> {
    downstream: Box<dyn Subscriber<O>>,
    left: ZipSide<T>,
    right: ZipSide<U>,
    done: bool,
    error: Option<FlowError>,
}

struct ZipSide<T> {
    queue: VecDeque<T>,
    done: bool,
    subscription: Option<Arc<dyn Subscription>>,
}

impl<T> ZipSide<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            done: false,
            subscription: None,
        }
    }

    /// A side that completed with an empty queue can never pair again.
    fn exhausted(&self) -> bool {
        self.done && self.queue.is_empty()
    }
}

impl<T, U, O> ZipCoordinator<T, U, O>
where
    T: Send + 'static,
    U: Send + 'static,
    O: Send + 'static,
{
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
            if !state.left.queue.is_empty() && !state.right.queue.is_empty() {
                if !self.demand.try_claim() {
                    return;
                }
                let (Some(left), Some(right)) =
                    (state.left.queue.pop_front(), state.right.queue.pop_front())
                else {
                    return;
                };
                let combined = (self.combiner)(left, right);
                state.downstream.on_next(combined);
                continue;
            }
            if state.left.exhausted() || state.right.exhausted() {
                state.done = true;
                state.downstream.on_complete();
                self.teardown(state);
                return;
            }
            return;
        }
    }

    fn teardown(&self, mut state: parking_lot::MutexGuard<'_, ZipState<T, U, O>>) {
        let left = state.left.subscription.take();
        let right = state.right.subscription.take();
        drop(state);
        if let Some(left) = left {
            left.cancel();
        }
        if let Some(right) = right {
            right.cancel();
        }
    }
}

struct ZipSubscription<T, U, O>(Arc<ZipCoordinator<T, U, O>>);

impl<T, U, O> Subscription for ZipSubscription<T, U, O>
where
    T: Send + 'static,
    U: Send + 'static,
    O: Send + 'static,
{
    fn request(&self, n: u64) {
        self.0.demand.add(n);
        self.0.drain();
    }

    fn cancel(&self) {
        self.0.demand.cancel();
        self.0.drain();
    }
}

struct ZipLeftSubscriber<T, U, O> {
    coordinator: Arc<ZipCoordinator<T, U, O>>,
}

impl<T, U, O> Subscriber<T> for ZipLeftSubscriber<T, U, O>
where
    T: Send + 'static,
    U: Send + 'static,
    O: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                drop(state);
                subscription.cancel();
                return;
            }
            state.left.subscription = Some(Arc::clone(&subscription));
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: T) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                return;
            }
            state.left.queue.push_back(value);
        }
        self.coordinator.drain();
    }

    fn on_error(&mut self, error: FlowError) {
        {
            let mut state = self.coordinator.state.lock();
            state.left.subscription = None;
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.coordinator.drain();
    }

    fn on_complete(&mut self) {
        {
            let mut state = self.coordinator.state.lock();
            state.left.subscription = None;
            state.left.done = true;
        }
        self.coordinator.drain();
    }

    fn context(&self) -> SubscriberContext {
        self.coordinator.context.clone()
    }
}

struct ZipRightSubscriber<T, U, O> {
    coordinator: Arc<ZipCoordinator<T, U, O>>,
}

impl<T, U, O> Subscriber<U> for ZipRightSubscriber<T, U, O>
where
    T: Send + 'static,
    U: Send + 'static,
    O: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                drop(state);
                subscription.cancel();
                return;
            }
            state.right.subscription = Some(Arc::clone(&subscription));
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: U) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                return;
            }
            state.right.queue.push_back(value);
        }
        self.coordinator.drain();
    }

    fn on_error(&mut self, error: FlowError) {
        {
            let mut state = self.coordinator.state.lock();
            state.right.subscription = None;
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.coordinator.drain();
    }

    fn on_complete(&mut self) {
        {
            let mut state = self.coordinator.state.lock();
            state.right.subscription = None;
            state.right.done = true;
        }
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
    use std::time::Duration;

    use crate::testkit::TestSubscriber;
    use crate::Flow;

    #[test]
    fn test_concat_preserves_source_order() {
        let probe = TestSubscriber::unbounded();
        Flow::concat(vec![
            Flow::from_iter(vec!["A", "B", "C"]),
            Flow::from_iter(vec!["D", "E", "F"]),
        ])
        .subscribe(probe.clone());
        assert_eq!(probe.values(), vec!["A", "B", "C", "D", "E", "F"]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_concat_of_nothing_completes() {
        let probe = TestSubscriber::<i32>::unbounded();
        Flow::concat(vec![]).subscribe(probe.clone());
        assert!(probe.is_completed());
    }

    #[test]
    fn test_concat_demand_spans_sources() {
        let probe = TestSubscriber::with_initial_request(4);
        Flow::concat(vec![
            Flow::from_iter(vec![1, 2]),
            Flow::from_iter(vec![3, 4, 5]),
        ])
        .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2, 3, 4]);
        assert!(!probe.is_completed());
    }

    #[test]
    fn test_concat_stops_on_error() {
        let probe = TestSubscriber::unbounded();
        Flow::concat(vec![
            Flow::from_iter(vec![1]),
            Flow::error(crate::FlowError::failed("middle")),
            Flow::from_iter(vec![2]),
        ])
        .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1]);
        assert!(probe.error().is_some());
    }

    #[test]
    fn test_merge_sequential_orders_by_source_not_arrival() {
        // The first source is slower; its elements must still come first.
        let slow = Flow::from_iter(vec!["A", "B"]).delay_elements(Duration::from_millis(20));
        let fast = Flow::from_iter(vec!["C", "D"]);

        let probe = TestSubscriber::unbounded();
        Flow::merge_sequential(vec![slow, fast]).subscribe(probe.clone());

        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.values(), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_merge_interleaves_by_arrival() {
        let slow = Flow::from_iter(vec!["A", "B"]).delay_elements(Duration::from_millis(20));
        let fast = Flow::from_iter(vec!["C", "D"]);

        let probe = TestSubscriber::unbounded();
        Flow::merge(vec![slow, fast]).subscribe(probe.clone());

        assert!(probe.await_terminal(Duration::from_secs(2)));
        let values = probe.values();
        assert_eq!(values.len(), 4);
        // The fast source finishes before the slow one's first delayed element.
        assert!(values.starts_with(&["C", "D"]));
    }

    #[test]
    fn test_zip_pairs_by_index() {
        let probe = TestSubscriber::unbounded();
        Flow::zip(
            Flow::from_iter(vec!["A", "B", "C"]),
            Flow::from_iter(vec!["D", "E", "F"]),
            |a, b| format!("{a}{b}"),
        )
        .subscribe(probe.clone());
        assert_eq!(probe.values(), vec!["AD", "BE", "CF"]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_zip_completes_with_shorter_source() {
        let probe = TestSubscriber::unbounded();
        Flow::zip(
            Flow::from_iter(vec![1, 2, 3]),
            Flow::from_iter(vec![10, 20]),
            |a, b| a + b,
        )
        .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![11, 22]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_zip3_combines_three_sources() {
        let probe = TestSubscriber::unbounded();
        Flow::zip3(
            Flow::from_iter(vec!["A", "B", "C"]),
            Flow::from_iter(vec!["D", "E", "F"]),
            Flow::from_iter(vec!["1", "2", "3"]),
            |a, b, c| format!("{a}{b}{c}"),
        )
        .subscribe(probe.clone());
        assert_eq!(probe.values(), vec!["AD1", "BE2", "CF3"]);
    }
}
