//! Rail-based parallelism: split, relocate, rejoin.
//!
//! [`ParallelFlow`] is the intermediate form between
//! [`Flow::parallel`](crate::Flow::parallel) and
//! [`sequential`](ParallelFlow::sequential): a set of rails fed round-robin
//! from one upstream subscription. The dispatcher only subscribes the
//! upstream once every rail has a subscriber, so no rail misses the head of
//! the sequence. Each rail supports exactly one subscriber.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::scheduler::Scheduler;
use crate::source::RawFlow;
use crate::subscriber::{Subscriber, SubscriberContext};
use crate::subscription::{Demand, InertSubscription, Subscription, UNBOUNDED};

/// A flow split into independent rails.
pub struct ParallelFlow<T> {
    rails: Vec<Flow<T>>,
}

impl<T: Send + 'static> ParallelFlow<T> {
    /// Splits `source` round-robin into `rails` rails.
    pub(crate) fn split(source: Flow<T>, rails: usize) -> Self {
        assert!(rails > 0, "rail count must be at least 1");
        let dispatcher = Arc::new(RailDispatcher {
            source,
            rail_count: rails,
            connected: AtomicBool::new(false),
            wip: AtomicU64::new(0),
            state: Mutex::new(DispatchState {
                slots: (0..rails).map(|_| None).collect(),
                attached: 0,
                upstream: None,
                next_rail: 0,
                completed: false,
                error: None,
                done: false,
            }),
        });
        let rails = (0..rails)
            .map(|index| {
                Flow::from_raw(RailFlow {
                    dispatcher: Arc::clone(&dispatcher),
                    index,
                })
            })
            .collect();
        Self { rails }
    }

    /// Number of rails.
    #[must_use]
    pub fn rails(&self) -> usize {
        self.rails.len()
    }

    /// Relocates each rail's delivery onto its own worker of `scheduler`.
    #[must_use]
    pub fn run_on(self, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            rails: self
                .rails
                .into_iter()
                .map(|rail| rail.publish_on(Arc::clone(&scheduler)))
                .collect(),
        }
    }

    /// Transforms every element, on whichever rail it rides.
    pub fn map<U, F>(self, f: F) -> ParallelFlow<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        ParallelFlow {
            rails: self
                .rails
                .into_iter()
                .map(|rail| {
                    let f = Arc::clone(&f);
                    rail.map(move |value| f(value))
                })
                .collect(),
        }
    }

    /// Rejoins the rails into a single flow; cross-rail order is arrival
    /// order.
    #[must_use]
    pub fn sequential(self) -> Flow<T> {
        Flow::merge(self.rails)
    }
}

// ---------------------------------------------------------------------------
// RailDispatcher
// ---------------------------------------------------------------------------

struct RailDispatcher<T> {
    source: Flow<T>,
    rail_count: usize,
    connected: AtomicBool,
    wip: AtomicU64,
    state: Mutex<DispatchState<T>>,
}

struct DispatchState<T> {
    slots: Vec<Option<RailSlot<T>>>,
    attached: usize,
    upstream: Option<Arc<dyn Subscription>>,
    next_rail: usize,
    completed: bool,
    error: Option<FlowError>,
    done: bool,
}

struct RailSlot<T> {
    queue: VecDeque<T>,
    demand: Arc<Demand>,
    subscriber: Box<dyn Subscriber<T>>,
    terminated: bool,
}

impl<T: Send + 'static> RailDispatcher<T> {
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
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        loop {
            let mut progressed = false;
            for index in 0..state.slots.len() {
                let Some(slot) = state.slots[index].as_mut() else {
                    continue;
                };
                while !slot.queue.is_empty() && slot.demand.try_claim() {
                    let Some(value) = slot.queue.pop_front() else {
                        break;
                    };
                    slot.subscriber.on_next(value);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        if let Some(error) = state.error.take() {
            state.done = true;
            for slot in state.slots.iter_mut().flatten() {
                if !slot.terminated && !slot.demand.is_cancelled() {
                    slot.terminated = true;
                    slot.subscriber.on_error(error.clone());
                }
            }
            let upstream = state.upstream.take();
            drop(state);
            if let Some(upstream) = upstream {
                upstream.cancel();
            }
            return;
        }

        if state.completed && state.slots.iter().flatten().all(|s| s.queue.is_empty()) {
            state.done = true;
            for slot in state.slots.iter_mut().flatten() {
                if !slot.terminated && !slot.demand.is_cancelled() {
                    slot.terminated = true;
                    slot.subscriber.on_complete();
                }
            }
        }
    }

    /// Cancels the upstream once every rail has cancelled.
    fn maybe_cancel_upstream(&self) {
        let upstream = {
            let mut state = self.state.lock();
            let all_cancelled = state
                .slots
                .iter()
                .flatten()
                .all(|slot| slot.demand.is_cancelled());
            if all_cancelled && state.attached == self.rail_count {
                state.done = true;
                state.upstream.take()
            } else {
                None
            }
        };
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct RailFlow<T> {
    dispatcher: Arc<RailDispatcher<T>>,
    index: usize,
}

impl<T: Send + 'static> RawFlow<T> for RailFlow<T> {
    fn subscribe_raw(self: Arc<Self>, mut subscriber: Box<dyn Subscriber<T>>) {
        let demand = Arc::new(Demand::new());
        let ready = {
            let mut state = self.dispatcher.state.lock();
            if state.slots[self.index].is_some() {
                drop(state);
                subscriber.on_subscribe(Arc::new(InertSubscription));
                subscriber.on_error(FlowError::Protocol(
                    "rail already has a subscriber".into(),
                ));
                return;
            }
            state.slots[self.index] = Some(RailSlot {
                queue: VecDeque::new(),
                demand: Arc::clone(&demand),
                subscriber,
                terminated: false,
            });
            state.attached += 1;
            state.attached == self.dispatcher.rail_count
        };

        let subscription = Arc::new(RailSubscription {
            dispatcher: Arc::clone(&self.dispatcher),
            demand,
        });
        // Reaching back into the slot keeps on_subscribe off the dispatch
        // path; requests made here only feed the rail's ledger.
        {
            let mut state = self.dispatcher.state.lock();
            if let Some(slot) = state.slots[self.index].as_mut() {
                slot.subscriber.on_subscribe(subscription);
            }
        }

        if ready && !self.dispatcher.connected.swap(true, Ordering::AcqRel) {
            self.dispatcher
                .source
                .clone()
                .subscribe_boxed(Box::new(RailUpstreamSubscriber {
                    dispatcher: Arc::clone(&self.dispatcher),
                }));
        }
    }
}

struct RailSubscription<T> {
    dispatcher: Arc<RailDispatcher<T>>,
    demand: Arc<Demand>,
}

impl<T: Send + 'static> Subscription for RailSubscription<T> {
    fn request(&self, n: u64) {
        self.demand.add(n);
        self.dispatcher.drain();
    }

    fn cancel(&self) {
        self.demand.cancel();
        self.dispatcher.maybe_cancel_upstream();
    }
}

struct RailUpstreamSubscriber<T> {
    dispatcher: Arc<RailDispatcher<T>>,
}

impl<T: Send + 'static> Subscriber<T> for RailUpstreamSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.dispatcher.state.lock();
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
        {
            let mut state = self.dispatcher.state.lock();
            if state.done {
                return;
            }
            let rail = state.next_rail;
            state.next_rail = (rail + 1) % self.dispatcher.rail_count;
            if let Some(slot) = state.slots[rail].as_mut() {
                slot.queue.push_back(value);
            }
        }
        self.dispatcher.drain();
    }

    fn on_error(&mut self, error: FlowError) {
        {
            let mut state = self.dispatcher.state.lock();
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.dispatcher.drain();
    }

    fn on_complete(&mut self) {
        self.dispatcher.state.lock().completed = true;
        self.dispatcher.drain();
    }

    fn context(&self) -> SubscriberContext {
        SubscriberContext::default()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use crate::scheduler::Schedulers;
    use crate::testkit::TestSubscriber;
    use crate::Flow;

    #[test]
    fn test_parallel_sequential_round_trip_keeps_all_elements() {
        let probe = TestSubscriber::unbounded();
        Flow::range(1, 20)
            .parallel(4)
            .map(|n| n * 2)
            .sequential()
            .subscribe(probe.clone());

        assert!(probe.await_terminal(Duration::from_secs(2)));
        let values: HashSet<i64> = probe.values().into_iter().collect();
        let expected: HashSet<i64> = (1..=20).map(|n| n * 2).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_parallel_run_on_uses_multiple_threads() {
        let probe = TestSubscriber::unbounded();
        Flow::range(1, 32)
            .parallel(4)
            .run_on(Schedulers::parallel())
            .map(|n| (n, std::thread::current().id()))
            .sequential()
            .subscribe(probe.clone());

        assert!(probe.await_terminal(Duration::from_secs(5)));
        let values = probe.values();
        assert_eq!(values.len(), 32);
        let threads: HashSet<_> = values.iter().map(|(_, id)| *id).collect();
        if crate::scheduler::default_parallelism() > 1 {
            assert!(threads.len() > 1, "expected work on more than one thread");
        }
    }

    #[test]
    fn test_rails_wait_for_all_subscribers() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let runs = Arc::new(AtomicU64::new(0));
        let r = Arc::clone(&runs);
        let source = Flow::defer(move || {
            r.fetch_add(1, Ordering::AcqRel);
            Flow::from_iter(vec![1, 2])
        });

        let parallel = source.parallel(2);
        let mut rails = parallel.rails.into_iter();
        let first_rail = rails.next().expect("rail");
        let second_rail = rails.next().expect("rail");

        let first = TestSubscriber::unbounded();
        first_rail.subscribe(first.clone());
        // One rail attached: upstream must not start yet.
        assert_eq!(runs.load(Ordering::Acquire), 0);

        let second = TestSubscriber::unbounded();
        second_rail.subscribe(second.clone());
        assert_eq!(runs.load(Ordering::Acquire), 1);
        assert_eq!(first.values(), vec![1]);
        assert_eq!(second.values(), vec![2]);
    }
}
