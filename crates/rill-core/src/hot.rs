//! Hot multicast: one upstream subscription broadcast to many subscribers.
//!
//! [`ConnectableFlow`] decouples subscribing from starting: subscribers
//! attach first, and the upstream runs once [`connect`](ConnectableFlow::connect)
//! is called (manually, or automatically via `auto_connect`/`ref_count`).
//! Late subscribers join mid-stream and only see subsequent elements; a
//! subscriber without demand when an element arrives misses it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::source::RawFlow;
use crate::subscriber::Subscriber;
use crate::subscription::{Demand, InertSubscription, Subscription, UNBOUNDED};

/// A cold flow made connectable: `connect` subscribes the upstream once and
/// broadcasts its signals to every attached subscriber.
pub struct ConnectableFlow<T> {
    source: Flow<T>,
    core: Arc<HotCore<T>>,
}

impl<T> Clone for ConnectableFlow<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + Send + 'static> ConnectableFlow<T> {
    pub(crate) fn new(source: Flow<T>) -> Self {
        Self {
            source,
            core: Arc::new(HotCore::new(false)),
        }
    }

    /// Subscribes the upstream now. Idempotent for the lifetime of the
    /// current session.
    pub fn connect(&self) {
        self.core.connect(&self.source);
    }

    /// A subscribable handle that never triggers connection by itself.
    #[must_use]
    pub fn flow(&self) -> Flow<T> {
        Flow::from_raw(HotFlow {
            source: self.source.clone(),
            core: Arc::clone(&self.core),
            threshold: None,
        })
    }

    /// Connects automatically once `min_subscribers` have attached, then
    /// stays connected for good.
    ///
    /// `min_subscribers == 0` connects eagerly, before any subscriber
    /// attaches; everyone is a late subscriber to an already-live session.
    #[must_use]
    pub fn auto_connect(self, min_subscribers: usize) -> Flow<T> {
        if min_subscribers == 0 {
            self.core.connect(&self.source);
        }
        Flow::from_raw(HotFlow {
            source: self.source,
            core: self.core,
            threshold: Some(min_subscribers.max(1)),
        })
    }

    /// Connects at `min_subscribers` live subscribers and disconnects when
    /// the count drops back to zero; a later wave of subscribers starts a
    /// fresh upstream session.
    ///
    /// # Panics
    ///
    /// Panics if `min_subscribers` is zero: a session counted by live
    /// subscribers cannot start without one.
    #[must_use]
    pub fn ref_count(self, min_subscribers: usize) -> Flow<T> {
        assert!(
            min_subscribers > 0,
            "ref_count needs at least one subscriber"
        );
        Flow::from_raw(HotFlow {
            source: self.source,
            core: Arc::new(HotCore::new(true)),
            threshold: Some(min_subscribers),
        })
    }
}

// ---------------------------------------------------------------------------
// HotFlow
// ---------------------------------------------------------------------------

struct HotFlow<T> {
    source: Flow<T>,
    core: Arc<HotCore<T>>,
    /// Subscriber count that triggers connection; `None` is manual-only.
    threshold: Option<usize>,
}

impl<T: Clone + Send + 'static> RawFlow<T> for HotFlow<T> {
    fn subscribe_raw(self: Arc<Self>, subscriber: Box<dyn Subscriber<T>>) {
        let count = match self.core.register(subscriber) {
            Some(count) => count,
            // Terminal already delivered to the late subscriber.
            None => return,
        };
        if self.threshold.is_some_and(|threshold| count >= threshold) {
            self.core.connect(&self.source);
        }
    }
}

// ---------------------------------------------------------------------------
// HotCore
// ---------------------------------------------------------------------------

enum Phase {
    Unconnected,
    Connected,
    /// `None` is successful completion.
    Terminated(Option<FlowError>),
}

struct HotCore<T> {
    state: Mutex<HotState<T>>,
    connected: AtomicBool,
    /// Disconnect and reset when the last live subscriber leaves.
    reset_on_zero: bool,
    next_slot_id: AtomicU64,
}

struct HotState<T> {
    phase: Phase,
    slots: Vec<Arc<SlotCore<T>>>,
    upstream: Option<Arc<dyn Subscription>>,
}

/// One attached subscriber with its private demand ledger.
struct SlotCore<T> {
    id: u64,
    demand: Demand,
    subscriber: Mutex<Box<dyn Subscriber<T>>>,
}

impl<T: Clone + Send + 'static> HotCore<T> {
    fn new(reset_on_zero: bool) -> Self {
        Self {
            state: Mutex::new(HotState {
                phase: Phase::Unconnected,
                slots: Vec::new(),
                upstream: None,
            }),
            connected: AtomicBool::new(false),
            reset_on_zero,
            next_slot_id: AtomicU64::new(0),
        }
    }

    /// Attaches a subscriber. Returns the live count, or `None` if the
    /// session already terminated (the terminal is replayed immediately).
    fn register(self: &Arc<Self>, subscriber: Box<dyn Subscriber<T>>) -> Option<usize> {
        let slot = Arc::new(SlotCore {
            id: self.next_slot_id.fetch_add(1, Ordering::AcqRel),
            demand: Demand::new(),
            subscriber: Mutex::new(subscriber),
        });

        let terminal = {
            let mut state = self.state.lock();
            match &state.phase {
                Phase::Terminated(error) => Some(error.clone()),
                _ => {
                    state.slots.push(Arc::clone(&slot));
                    None
                }
            }
        };

        if let Some(error) = terminal {
            let mut subscriber = slot.subscriber.lock();
            subscriber.on_subscribe(Arc::new(InertSubscription));
            match error {
                Some(error) => subscriber.on_error(error),
                None => subscriber.on_complete(),
            }
            return None;
        }

        let subscription = Arc::new(HotSubscription {
            core: Arc::clone(self),
            slot: Arc::clone(&slot),
        });
        slot.subscriber.lock().on_subscribe(subscription);
        Some(self.state.lock().slots.len())
    }

    fn connect(self: &Arc<Self>, source: &Flow<T>) {
        if self.connected.swap(true, Ordering::AcqRel) {
            return;
        }
        source.clone().subscribe_boxed(Box::new(HotUpstreamSubscriber {
            core: Arc::clone(self),
        }));
    }

    fn broadcast(&self, value: &T) {
        let slots = self.state.lock().slots.clone();
        for slot in slots {
            if slot.demand.is_cancelled() {
                continue;
            }
            if slot.demand.try_claim() {
                slot.subscriber.lock().on_next(value.clone());
            } else {
                tracing::warn!(slot = slot.id, "dropping element for subscriber without demand");
            }
        }
    }

    fn terminate(&self, error: Option<FlowError>) {
        let slots = {
            let mut state = self.state.lock();
            state.phase = Phase::Terminated(error.clone());
            state.upstream = None;
            std::mem::take(&mut state.slots)
        };
        for slot in slots {
            if slot.demand.is_cancelled() {
                continue;
            }
            let mut subscriber = slot.subscriber.lock();
            match &error {
                Some(error) => subscriber.on_error(error.clone()),
                None => subscriber.on_complete(),
            }
        }
    }

    /// Detaches a cancelled slot; in `ref_count` mode the session shuts
    /// down and resets once the last slot leaves.
    fn remove_slot(&self, id: u64) {
        let upstream = {
            let mut state = self.state.lock();
            state.slots.retain(|slot| slot.id != id);
            if self.reset_on_zero
                && state.slots.is_empty()
                && matches!(state.phase, Phase::Connected)
            {
                state.phase = Phase::Unconnected;
                self.connected.store(false, Ordering::Release);
                state.upstream.take()
            } else {
                None
            }
        };
        if let Some(upstream) = upstream {
            tracing::debug!("last subscriber left, disconnecting upstream");
            upstream.cancel();
        }
    }
}

struct HotSubscription<T> {
    core: Arc<HotCore<T>>,
    slot: Arc<SlotCore<T>>,
}

impl<T: Clone + Send + 'static> Subscription for HotSubscription<T> {
    fn request(&self, n: u64) {
        self.slot.demand.add(n);
    }

    fn cancel(&self) {
        if self.slot.demand.is_cancelled() {
            return;
        }
        self.slot.demand.cancel();
        self.core.remove_slot(self.slot.id);
    }
}

struct HotUpstreamSubscriber<T> {
    core: Arc<HotCore<T>>,
}

impl<T: Clone + Send + 'static> Subscriber<T> for HotUpstreamSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.core.state.lock();
            state.phase = Phase::Connected;
            state.upstream = Some(Arc::clone(&subscription));
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, value: T) {
        self.core.broadcast(&value);
    }

    fn on_error(&mut self, error: FlowError) {
        self.core.terminate(Some(error));
    }

    fn on_complete(&mut self) {
        self.core.terminate(None);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::testkit::TestSubscriber;
    use crate::Flow;

    /// A deferred source counting how many times the upstream actually ran.
    fn counting_source(runs: &Arc<AtomicU64>) -> Flow<i32> {
        let r = Arc::clone(runs);
        Flow::defer(move || {
            r.fetch_add(1, Ordering::AcqRel);
            Flow::from_iter(vec![1, 2, 3])
        })
    }

    #[test]
    fn test_connect_broadcasts_to_all_subscribers() {
        let runs = Arc::new(AtomicU64::new(0));
        let connectable = counting_source(&runs).publish();

        let first = TestSubscriber::unbounded();
        let second = TestSubscriber::unbounded();
        connectable.flow().subscribe(first.clone());
        connectable.flow().subscribe(second.clone());

        // Nothing runs until connect.
        assert_eq!(runs.load(Ordering::Acquire), 0);
        assert!(first.values().is_empty());

        connectable.connect();
        assert_eq!(runs.load(Ordering::Acquire), 1);
        assert_eq!(first.values(), vec![1, 2, 3]);
        assert_eq!(second.values(), vec![1, 2, 3]);
        assert!(first.is_completed());
        assert!(second.is_completed());
    }

    #[test]
    fn test_late_subscriber_after_terminal_gets_terminal() {
        let connectable = Flow::from_iter(vec![1, 2]).publish();
        connectable.flow().subscribe(TestSubscriber::unbounded());
        connectable.connect();

        let late = TestSubscriber::unbounded();
        connectable.flow().subscribe(late.clone());
        assert!(late.values().is_empty());
        assert!(late.is_completed());
    }

    #[test]
    fn test_auto_connect_waits_for_threshold() {
        let runs = Arc::new(AtomicU64::new(0));
        let flow = counting_source(&runs).publish().auto_connect(2);

        let first = TestSubscriber::unbounded();
        flow.clone().subscribe(first.clone());
        assert_eq!(runs.load(Ordering::Acquire), 0);

        let second = TestSubscriber::unbounded();
        flow.subscribe(second.clone());
        assert_eq!(runs.load(Ordering::Acquire), 1);
        assert_eq!(first.values(), vec![1, 2, 3]);
        assert_eq!(second.values(), vec![1, 2, 3]);
    }

    #[test]
    fn test_auto_connect_zero_connects_eagerly() {
        let runs = Arc::new(AtomicU64::new(0));
        let flow = counting_source(&runs).publish().auto_connect(0);

        // The upstream ran before anyone subscribed.
        assert_eq!(runs.load(Ordering::Acquire), 1);

        // Everyone arriving later is a late subscriber to a finished session.
        let late = TestSubscriber::unbounded();
        flow.subscribe(late.clone());
        assert!(late.values().is_empty());
        assert!(late.is_completed());
    }

    #[test]
    #[should_panic(expected = "ref_count needs at least one subscriber")]
    fn test_ref_count_rejects_zero_threshold() {
        let _ = Flow::from_iter(vec![1]).publish().ref_count(0);
    }

    #[test]
    fn test_ref_count_disconnects_and_restarts() {
        let runs = Arc::new(AtomicU64::new(0));
        // A source that never terminates on its own.
        let r = Arc::clone(&runs);
        let source = Flow::defer(move || {
            r.fetch_add(1, Ordering::AcqRel);
            Flow::from_iter(vec![0i32]).delay_elements(Duration::from_secs(3600))
        });
        let flow = source.publish().ref_count(2);

        let first = TestSubscriber::unbounded();
        let second = TestSubscriber::unbounded();
        flow.clone().subscribe(first.clone());
        assert_eq!(runs.load(Ordering::Acquire), 0);
        flow.clone().subscribe(second.clone());
        assert_eq!(runs.load(Ordering::Acquire), 1);

        // Both leave: the session tears down.
        first.cancel();
        second.cancel();

        // A fresh pair triggers a new upstream run.
        let third = TestSubscriber::unbounded();
        let fourth = TestSubscriber::unbounded();
        flow.clone().subscribe(third.clone());
        flow.subscribe(fourth.clone());
        assert_eq!(runs.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_subscriber_without_demand_misses_elements() {
        let connectable = Flow::from_iter(vec![1, 2, 3]).publish();
        let eager = TestSubscriber::unbounded();
        let stalled = TestSubscriber::with_initial_request(1);
        connectable.flow().subscribe(eager.clone());
        connectable.flow().subscribe(stalled.clone());

        connectable.connect();
        assert_eq!(eager.values(), vec![1, 2, 3]);
        assert_eq!(stalled.values(), vec![1]);
    }
}
