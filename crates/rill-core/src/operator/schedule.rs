//! Thread-relocation stages: `publish_on`, `subscribe_on`, `delay_elements`.
//!
//! Each subscription pins one [`Worker`], so relocated signals keep their
//! order. Cancellation is a flag checked when a task fires: work already
//! queued is skipped, not retracted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::scheduler::{Scheduler, Schedulers, Worker};
use crate::source::RawFlow;
use crate::subscriber::{Subscriber, SubscriberContext};
use crate::subscription::Subscription;

/// Downstream handle shared between the relocating subscriber and the tasks
/// it schedules.
struct Relocated<T> {
    subscriber: Mutex<Box<dyn Subscriber<T>>>,
    cancelled: AtomicBool,
}

impl<T> Relocated<T> {
    fn new(subscriber: Box<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new(Self {
            subscriber: Mutex::new(subscriber),
            cancelled: AtomicBool::new(false),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Pass-through subscription that flips the shared cancel flag so queued
/// tasks die quietly.
struct RelocatedSubscription<T> {
    upstream: Arc<dyn Subscription>,
    shared: Arc<Relocated<T>>,
}

impl<T: Send + 'static> Subscription for RelocatedSubscription<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

// ---------------------------------------------------------------------------
// PublishOnFlow
// ---------------------------------------------------------------------------

/// Relocates downstream signal delivery onto a scheduler worker.
pub(crate) struct PublishOnFlow<T> {
    source: Flow<T>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T> PublishOnFlow<T> {
    pub(crate) fn new(source: Flow<T>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { source, scheduler }
    }
}

impl<T: Send + 'static> RawFlow<T> for PublishOnFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        let context = downstream.context();
        self.source.clone().subscribe_boxed(Box::new(PublishOnSubscriber {
            shared: Relocated::new(downstream),
            worker: self.scheduler.create_worker(),
            context,
        }));
    }
}

struct PublishOnSubscriber<T> {
    shared: Arc<Relocated<T>>,
    worker: Arc<dyn Worker>,
    context: SubscriberContext,
}

impl<T: Send + 'static> Subscriber<T> for PublishOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let subscription = Arc::new(RelocatedSubscription {
            upstream: subscription,
            shared: Arc::clone(&self.shared),
        });
        self.shared.subscriber.lock().on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        let shared = Arc::clone(&self.shared);
        self.worker.schedule(Box::new(move || {
            if !shared.is_cancelled() {
                shared.subscriber.lock().on_next(value);
            }
        }));
    }

    fn on_error(&mut self, error: FlowError) {
        let shared = Arc::clone(&self.shared);
        self.worker.schedule(Box::new(move || {
            if !shared.is_cancelled() {
                shared.subscriber.lock().on_error(error);
            }
        }));
    }

    fn on_complete(&mut self) {
        let shared = Arc::clone(&self.shared);
        self.worker.schedule(Box::new(move || {
            if !shared.is_cancelled() {
                shared.subscriber.lock().on_complete();
            }
        }));
    }

    fn context(&self) -> SubscriberContext {
        self.context.clone()
    }
}

// ---------------------------------------------------------------------------
// SubscribeOnFlow
// ---------------------------------------------------------------------------

/// Relocates the subscription phase onto a scheduler worker.
pub(crate) struct SubscribeOnFlow<T> {
    source: Flow<T>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T> SubscribeOnFlow<T> {
    pub(crate) fn new(source: Flow<T>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { source, scheduler }
    }
}

impl<T: Send + 'static> RawFlow<T> for SubscribeOnFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        let source = self.source.clone();
        let worker = self.scheduler.create_worker();
        worker.schedule(Box::new(move || {
            source.subscribe_boxed(downstream);
        }));
    }
}

// ---------------------------------------------------------------------------
// DelayFlow
// ---------------------------------------------------------------------------

/// Paces emissions: each element lands `delay` after the previous delivery.
pub(crate) struct DelayFlow<T> {
    source: Flow<T>,
    delay: Duration,
}

impl<T> DelayFlow<T> {
    pub(crate) fn new(source: Flow<T>, delay: Duration) -> Self {
        Self { source, delay }
    }
}

impl<T: Send + 'static> RawFlow<T> for DelayFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        let context = downstream.context();
        self.source.clone().subscribe_boxed(Box::new(DelaySubscriber {
            shared: Relocated::new(downstream),
            worker: Schedulers::parallel().create_worker(),
            delay: self.delay,
            last_deadline: None,
            context,
        }));
    }
}

struct DelaySubscriber<T> {
    shared: Arc<Relocated<T>>,
    worker: Arc<dyn Worker>,
    delay: Duration,
    /// Deadline of the most recently scheduled element.
    last_deadline: Option<Instant>,
    context: SubscriberContext,
}

impl<T> DelaySubscriber<T> {
    /// Computes the next pacing deadline and the wait from now to reach it.
    fn next_slot(&mut self) -> Duration {
        let now = Instant::now();
        let base = self.last_deadline.filter(|d| *d > now).unwrap_or(now);
        let deadline = base + self.delay;
        self.last_deadline = Some(deadline);
        deadline - now
    }

    /// Wait until after the last scheduled element.
    fn terminal_slot(&self) -> Duration {
        let now = Instant::now();
        self.last_deadline
            .filter(|d| *d > now)
            .map_or(Duration::ZERO, |d| d - now)
    }
}

impl<T: Send + 'static> Subscriber<T> for DelaySubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let subscription = Arc::new(RelocatedSubscription {
            upstream: subscription,
            shared: Arc::clone(&self.shared),
        });
        self.shared.subscriber.lock().on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        let wait = self.next_slot();
        let shared = Arc::clone(&self.shared);
        self.worker.schedule_after(
            wait,
            Box::new(move || {
                if !shared.is_cancelled() {
                    shared.subscriber.lock().on_next(value);
                }
            }),
        );
    }

    fn on_error(&mut self, error: FlowError) {
        // Errors jump the pacing queue.
        let shared = Arc::clone(&self.shared);
        self.worker.schedule(Box::new(move || {
            if !shared.is_cancelled() {
                shared.subscriber.lock().on_error(error);
            }
        }));
    }

    fn on_complete(&mut self) {
        let wait = self.terminal_slot();
        let shared = Arc::clone(&self.shared);
        self.worker.schedule_after(
            wait,
            Box::new(move || {
                if !shared.is_cancelled() {
                    shared.subscriber.lock().on_complete();
                }
            }),
        );
    }

    fn context(&self) -> SubscriberContext {
        self.context.clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::scheduler::Schedulers;
    use crate::testkit::TestSubscriber;
    use crate::Flow;

    #[test]
    fn test_publish_on_moves_delivery_off_caller() {
        let caller = std::thread::current().id();
        let delivery_thread = Arc::new(parking_lot::Mutex::new(None));

        let d = Arc::clone(&delivery_thread);
        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec![1, 2, 3])
            .map(move |n| {
                *d.lock() = Some(std::thread::current().id());
                n
            })
            .publish_on(Schedulers::parallel())
            .subscribe(probe.clone());

        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.values(), vec![1, 2, 3]);
        // Upstream production stayed on the caller.
        assert_eq!(delivery_thread.lock().expect("map ran"), caller);
    }

    #[test]
    fn test_subscribe_on_moves_production_off_caller() {
        let caller = std::thread::current().id();
        let production_thread = Arc::new(parking_lot::Mutex::new(None));

        let p = Arc::clone(&production_thread);
        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec![1])
            .map(move |n| {
                *p.lock() = Some(std::thread::current().id());
                n
            })
            .subscribe_on(Schedulers::bounded_elastic())
            .subscribe(probe.clone());

        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_ne!(production_thread.lock().expect("map ran"), caller);
    }

    #[test]
    fn test_delay_elements_paces_and_preserves_order() {
        let probe = TestSubscriber::unbounded();
        let start = Instant::now();
        Flow::from_iter(vec![1, 2, 3])
            .delay_elements(Duration::from_millis(15))
            .subscribe(probe.clone());

        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(probe.values(), vec![1, 2, 3]);
    }

    #[test]
    fn test_publish_on_cancel_skips_queued_signals() {
        let probe = TestSubscriber::<i64>::with_initial_request(0);
        Flow::range(1, 1000)
            .publish_on(Schedulers::parallel())
            .subscribe(probe.clone());

        probe.cancel();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(probe.value_count(), 0);
    }
}
