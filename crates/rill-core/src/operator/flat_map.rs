//! Inner-flow expansion: `flat_map` and `concat_map`.
//!
//! A single coordinator owns the downstream subscriber, a spill queue for
//! inner emissions arriving past demand, and the registry of live inner
//! subscriptions. Emission runs through the same serialized drain protocol
//! as the leaf sources: one work-in-progress counter, one emitter at a time.
//!
//! `concat_map` is the concurrency-1 configuration: inner flows subscribe
//! one at a time in upstream order, so per-source ordering is total.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::source::RawFlow;
use crate::subscriber::{Subscriber, SubscriberContext};
use crate::subscription::{Demand, Subscription, UNBOUNDED};

/// Expands each upstream element into an inner flow and merges the results.
pub(crate) struct FlatMapFlow<T, U> {
    source: Flow<T>,
    f: Arc<dyn Fn(T) -> Flow<U> + Send + Sync>,
    concurrency: usize,
}

impl<T, U> FlatMapFlow<T, U> {
    /// Merge with up to `concurrency` inner flows active at once; downstream
    /// order is arrival order.
    pub(crate) fn unordered(
        source: Flow<T>,
        f: impl Fn(T) -> Flow<U> + Send + Sync + 'static,
        concurrency: usize,
    ) -> Self {
        assert!(concurrency > 0, "concurrency must be at least 1");
        Self {
            source,
            f: Arc::new(f),
            concurrency,
        }
    }

    /// One inner flow at a time, fully drained, in upstream order.
    pub(crate) fn sequential(
        source: Flow<T>,
        f: impl Fn(T) -> Flow<U> + Send + Sync + 'static,
    ) -> Self {
        Self::unordered(source, f, 1)
    }
}

impl<T, U> RawFlow<U> for FlatMapFlow<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<U>>) {
        let context = downstream.context();
        let coordinator = Arc::new(Coordinator {
            demand: Demand::new(),
            // Pre-claimed: requests issued inside on_subscribe only
            // accumulate until the drain below runs.
            wip: AtomicU64::new(1),
            bounded: self.concurrency != usize::MAX,
            context,
            state: Mutex::new(CoordState {
                downstream,
                queue: VecDeque::new(),
                outer: None,
                inners: SmallVec::new(),
                next_inner_id: 0,
                active: 0,
                outer_done: false,
                error: None,
                done: false,
            }),
        });

        {
            let subscription = Arc::new(FlatMapSubscription(Arc::clone(&coordinator)));
            let mut state = coordinator.state.lock();
            state.subscriber_on_subscribe(subscription);
        }

        let outer_demand = u64::try_from(self.concurrency).unwrap_or(UNBOUNDED);
        self.source.clone().subscribe_boxed(Box::new(OuterSubscriber {
            coordinator: Arc::clone(&coordinator),
            f: Arc::clone(&self.f),
            outer_demand,
        }));

        coordinator.drain_loop(1);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Coordinator<U> {
    demand: Demand,
    wip: AtomicU64,
    bounded: bool,
    context: SubscriberContext,
    state: Mutex<CoordState<U>>,
}

struct CoordState<U> {
    downstream: Box<dyn Subscriber<U>>,
    /// Inner emissions not yet claimed by downstream demand.
    queue: VecDeque<U>,
    outer: Option<Arc<dyn Subscription>>,
    inners: SmallVec<[(u64, Arc<dyn Subscription>); 4]>,
    next_inner_id: u64,
    active: usize,
    outer_done: bool,
    error: Option<FlowError>,
    done: bool,
}

impl<U> CoordState<U> {
    fn subscriber_on_subscribe(&mut self, subscription: Arc<dyn Subscription + 'static>) {
        self.downstream.on_subscribe(subscription);
    }

    fn unregister_inner(&mut self, id: u64) {
        self.inners.retain(|(inner_id, _)| *inner_id != id);
    }
}

impl<U: Send + 'static> Coordinator<U> {
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
                if state.outer_done && state.active == 0 {
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

    /// Cancels every live subscription. Consumes the state guard so the
    /// cancellations run unlocked.
    fn teardown(&self, mut state: parking_lot::MutexGuard<'_, CoordState<U>>) {
        let inners = std::mem::take(&mut state.inners);
        let outer = state.outer.take();
        drop(state);
        for (_, subscription) in inners {
            subscription.cancel();
        }
        if let Some(outer) = outer {
            outer.cancel();
        }
    }
}

struct FlatMapSubscription<U>(Arc<Coordinator<U>>);

impl<U: Send + 'static> Subscription for FlatMapSubscription<U> {
    fn request(&self, n: u64) {
        self.0.demand.add(n);
        self.0.drain();
    }

    fn cancel(&self) {
        self.0.demand.cancel();
        self.0.drain();
    }
}

// ---------------------------------------------------------------------------
// Outer subscriber
// ---------------------------------------------------------------------------

struct OuterSubscriber<T, U> {
    coordinator: Arc<Coordinator<U>>,
    f: Arc<dyn Fn(T) -> Flow<U> + Send + Sync>,
    outer_demand: u64,
}

impl<T, U> Subscriber<T> for OuterSubscriber<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                drop(state);
                subscription.cancel();
                return;
            }
            state.outer = Some(Arc::clone(&subscription));
        }
        subscription.request(self.outer_demand);
    }

    fn on_next(&mut self, value: T) {
        let inner = (self.f)(value);
        let id = {
            let mut state = self.coordinator.state.lock();
            if state.done {
                return;
            }
            state.active += 1;
            let id = state.next_inner_id;
            state.next_inner_id += 1;
            id
        };
        inner.subscribe_boxed(Box::new(InnerSubscriber {
            coordinator: Arc::clone(&self.coordinator),
            id,
        }));
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
        self.coordinator.state.lock().outer_done = true;
        self.coordinator.drain();
    }

    fn context(&self) -> SubscriberContext {
        self.coordinator.context.clone()
    }
}

// ---------------------------------------------------------------------------
// Inner subscriber
// ---------------------------------------------------------------------------

struct InnerSubscriber<U> {
    coordinator: Arc<Coordinator<U>>,
    id: u64,
}

impl<U: Send + 'static> Subscriber<U> for InnerSubscriber<U> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                drop(state);
                subscription.cancel();
                return;
            }
            state.inners.push((self.id, Arc::clone(&subscription)));
        }
        // Inners run at full tilt; the spill queue absorbs whatever
        // downstream has not claimed yet.
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: U) {
        {
            let mut state = self.coordinator.state.lock();
            if state.done {
                return;
            }
            state.queue.push_back(value);
        }
        self.coordinator.drain();
    }

    fn on_error(&mut self, error: FlowError) {
        {
            let mut state = self.coordinator.state.lock();
            state.unregister_inner(self.id);
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.coordinator.drain();
    }

    fn on_complete(&mut self) {
        let replenish = {
            let mut state = self.coordinator.state.lock();
            state.unregister_inner(self.id);
            state.active -= 1;
            if self.coordinator.bounded && !state.outer_done && !state.done {
                state.outer.clone()
            } else {
                None
            }
        };
        // Requested unlocked: the outer source may hand the next element
        // back synchronously.
        if let Some(outer) = replenish {
            outer.request(1);
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
