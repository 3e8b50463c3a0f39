//! Resubscription stages: retry on error, repeat on completion.
//!
//! Both stages rebuild the upstream pipeline from its cold description and
//! move the downstream subscriber onto the fresh subscription behind a
//! [`RelaySubscription`], so outstanding demand survives the handoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::scheduler::{Schedulers, Worker};
use crate::source::RawFlow;
use crate::subscriber::{Subscriber, SubscriberContext};
use crate::subscription::{RelaySubscription, Subscription};

// ---------------------------------------------------------------------------
// RetrySpec
// ---------------------------------------------------------------------------

/// Retry policy: attempt budget, per-attempt delay, and error filter.
#[derive(Clone)]
pub struct RetrySpec {
    max_attempts: Option<u64>,
    backoff: Backoff,
    predicate: Option<Arc<dyn Fn(&FlowError) -> bool + Send + Sync>>,
    wrap_exhausted: bool,
}

#[derive(Clone)]
enum Backoff {
    None,
    Fixed(Duration),
    Custom(Arc<dyn Fn(u64) -> Duration + Send + Sync>),
}

impl RetrySpec {
    /// A budget of `attempts` resubscriptions beyond the first try.
    #[must_use]
    pub fn max_attempts(attempts: u64) -> Self {
        Self {
            max_attempts: Some(attempts),
            backoff: Backoff::None,
            predicate: None,
            wrap_exhausted: false,
        }
    }

    /// No resubscription budget: retry for as long as errors keep matching.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::None,
            predicate: None,
            wrap_exhausted: false,
        }
    }

    /// Waits `delay` before every resubscription.
    #[must_use]
    pub fn fixed_delay(mut self, delay: Duration) -> Self {
        self.backoff = Backoff::Fixed(delay);
        self
    }

    /// Computes the delay before resubscription `attempt` (1-based).
    #[must_use]
    pub fn delay_fn(mut self, f: impl Fn(u64) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Backoff::Custom(Arc::new(f));
        self
    }

    /// Only errors matching `predicate` are retried; everything else
    /// propagates immediately without consuming an attempt.
    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&FlowError) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Wraps the final failure in [`FlowError::RetryExhausted`] once the
    /// budget is spent.
    #[must_use]
    pub(crate) fn wrapping_exhausted(mut self) -> Self {
        self.wrap_exhausted = true;
        self
    }

    fn retryable(&self, error: &FlowError) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(error))
    }

    fn budget_allows(&self, retries_done: u64) -> bool {
        self.max_attempts.map_or(true, |max| retries_done < max)
    }

    fn delay_before(&self, attempt: u64) -> Duration {
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Custom(f) => f(attempt),
        }
    }
}

// ---------------------------------------------------------------------------
// CycleLoop
// ---------------------------------------------------------------------------

/// Serializes resubscription across cycles of one subscription chain.
///
/// A terminal handler never subscribes the next cycle directly: it parks the
/// cycle here, and the frame that owns the loop performs parked subscribes
/// iteratively once the current signal frame unwinds. Stack depth stays
/// constant no matter how many cycles run (same missed-count protocol as the
/// producer drain loops).
struct CycleLoop<T> {
    wip: AtomicU64,
    parked: Mutex<Option<(Flow<T>, Box<dyn Subscriber<T>>)>>,
}

impl<T: Send + 'static> CycleLoop<T> {
    fn new() -> Self {
        Self {
            wip: AtomicU64::new(0),
            parked: Mutex::new(None),
        }
    }

    fn resubscribe(&self, source: Flow<T>, subscriber: Box<dyn Subscriber<T>>) {
        *self.parked.lock() = Some((source, subscriber));
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            // An outer frame owns the loop and will pick this cycle up.
            return;
        }
        let mut missed = 1;
        loop {
            let parked = self.parked.lock().take();
            if let Some((source, subscriber)) = parked {
                source.subscribe_boxed(subscriber);
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RetryFlow
// ---------------------------------------------------------------------------

/// Resubscribes the cold upstream on terminal error, per a [`RetrySpec`].
pub(crate) struct RetryFlow<T> {
    source: Flow<T>,
    spec: RetrySpec,
}

impl<T> RetryFlow<T> {
    pub(crate) fn new(source: Flow<T>, spec: RetrySpec) -> Self {
        Self { source, spec }
    }
}

impl<T: Send + 'static> RawFlow<T> for RetryFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        let core = Arc::new(RetryCore {
            source: self.source.clone(),
            spec: self.spec.clone(),
            relay: RelaySubscription::new(),
            worker: OnceLock::new(),
            cycle: CycleLoop::new(),
        });
        core.source.clone().subscribe_boxed(Box::new(RetrySubscriber {
            core,
            downstream: Some(downstream),
            retries: 0,
            announce: true,
        }));
    }
}

struct RetryCore<T> {
    source: Flow<T>,
    spec: RetrySpec,
    relay: Arc<RelaySubscription>,
    /// Timer worker for delayed resubscription, minted on first use.
    worker: OnceLock<Arc<dyn Worker>>,
    cycle: CycleLoop<T>,
}

impl<T> RetryCore<T> {
    fn worker(&self) -> Arc<dyn Worker> {
        Arc::clone(
            self.worker
                .get_or_init(|| Schedulers::parallel().create_worker()),
        )
    }
}

struct RetrySubscriber<T> {
    core: Arc<RetryCore<T>>,
    downstream: Option<Box<dyn Subscriber<T>>>,
    /// Resubscriptions performed so far.
    retries: u64,
    announce: bool,
}

impl<T: Send + 'static> Subscriber<T> for RetrySubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.core.relay.swap_upstream(subscription);
        if self.announce {
            if let Some(downstream) = self.downstream.as_mut() {
                let relay = Arc::clone(&self.core.relay) as Arc<dyn Subscription>;
                downstream.on_subscribe(relay);
            }
        }
    }

    fn on_next(&mut self, value: T) {
        self.core.relay.produced(1);
        if let Some(downstream) = self.downstream.as_mut() {
            downstream.on_next(value);
        }
    }

    fn on_error(&mut self, error: FlowError) {
        let Some(mut downstream) = self.downstream.take() else {
            return;
        };
        if self.core.relay.is_cancelled() {
            return;
        }
        let spec = &self.core.spec;
        if spec.retryable(&error) && spec.budget_allows(self.retries) {
            let attempt = self.retries + 1;
            tracing::debug!(attempt, %error, "resubscribing after failure");
            let next = RetrySubscriber {
                core: Arc::clone(&self.core),
                downstream: Some(downstream),
                retries: attempt,
                announce: false,
            };
            let delay = spec.delay_before(attempt);
            if delay.is_zero() {
                self.core
                    .cycle
                    .resubscribe(self.core.source.clone(), Box::new(next));
            } else {
                let core = Arc::clone(&self.core);
                self.core.worker().schedule_after(
                    delay,
                    Box::new(move || {
                        if core.relay.is_cancelled() {
                            return;
                        }
                        core.cycle.resubscribe(core.source.clone(), Box::new(next));
                    }),
                );
            }
        } else {
            let error = if spec.wrap_exhausted && spec.retryable(&error) {
                error.into_retry_exhausted(self.retries + 1)
            } else {
                error
            };
            downstream.on_error(error);
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
// RepeatFlow
// ---------------------------------------------------------------------------

/// Resubscribes the cold upstream on successful completion.
pub(crate) struct RepeatFlow<T> {
    source: Flow<T>,
    /// Additional subscriptions after the first; `None` repeats forever.
    times: Option<u64>,
}

impl<T> RepeatFlow<T> {
    pub(crate) fn new(source: Flow<T>, times: Option<u64>) -> Self {
        Self { source, times }
    }
}

impl<T: Send + 'static> RawFlow<T> for RepeatFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(RepeatSubscriber {
            source: self.source.clone(),
            times: self.times,
            relay: RelaySubscription::new(),
            cycle: Arc::new(CycleLoop::new()),
            downstream: Some(downstream),
            repeats: 0,
            announce: true,
        }));
    }
}

struct RepeatSubscriber<T> {
    source: Flow<T>,
    times: Option<u64>,
    relay: Arc<RelaySubscription>,
    cycle: Arc<CycleLoop<T>>,
    downstream: Option<Box<dyn Subscriber<T>>>,
    repeats: u64,
    announce: bool,
}

impl<T: Send + 'static> Subscriber<T> for RepeatSubscriber<T> {
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
        let Some(mut downstream) = self.downstream.take() else {
            return;
        };
        if self.relay.is_cancelled() {
            return;
        }
        if self.times.map_or(true, |times| self.repeats < times) {
            let next = RepeatSubscriber {
                source: self.source.clone(),
                times: self.times,
                relay: Arc::clone(&self.relay),
                cycle: Arc::clone(&self.cycle),
                downstream: Some(downstream),
                repeats: self.repeats + 1,
                announce: false,
            };
            self.cycle.resubscribe(self.source.clone(), Box::new(next));
        } else {
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

// ===========================================================================
// Tests
// ===========================================================================
