//! Zero-or-one valued sequence.
//!
//! [`Single`] shares the [`Flow`] machinery with the cardinality narrowed
//! to at most one element. It exists for API clarity at call sites that
//! promise a scalar result; the backpressure contract is unchanged (the
//! value is only delivered against requested demand).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FlowError;
use crate::flow::Flow;
use crate::source::RawFlow;
use crate::subscriber::{Subscriber, SubscriberContext};
use crate::subscription::{Demand, Subscription, UNBOUNDED};

/// A cold, push-based sequence of at most one `T`.
pub struct Single<T> {
    flow: Flow<T>,
}

impl<T> Clone for Single<T> {
    fn clone(&self) -> Self {
        Self {
            flow: self.flow.clone(),
        }
    }
}

impl<T: Send + 'static> Single<T> {
    pub(crate) fn from_flow(flow: Flow<T>) -> Self {
        Self { flow }
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// A single of exactly one element.
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_flow(Flow::just(value))
    }

    /// Completes without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_flow(Flow::empty())
    }

    /// Terminates with `error` on subscribe.
    #[must_use]
    pub fn error(error: FlowError) -> Self {
        Self::from_flow(Flow::error(error))
    }

    /// Evaluates `f` once per subscription, emitting its result.
    pub fn from_callable(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        Self::from_flow(Flow::defer(move || {
            let f = Arc::clone(&f);
            Flow::from_iter(CallableIter {
                f,
                produced: false,
            })
        }))
    }

    /// Resolved by `factory` at subscribe time, once per subscription.
    pub fn defer(factory: impl Fn() -> Self + Send + Sync + 'static) -> Self {
        Self::from_flow(Flow::defer(move || factory().flow))
    }

    /// Gathers every element of `source` into one list.
    pub(crate) fn collecting(source: Flow<T>) -> Single<Vec<T>> {
        Single::from_flow(Flow::from_raw(CollectFlow { source }))
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    /// Transforms the element, if one is emitted.
    pub fn map<U, F>(self, f: F) -> Single<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Single::from_flow(self.flow.map(f))
    }

    /// Keeps the element only if it matches `predicate`; otherwise the
    /// single completes empty.
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::from_flow(self.flow.filter(predicate))
    }

    /// Chains an asynchronous continuation producing another single.
    pub fn flat_map<U, F>(self, f: F) -> Single<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Single<U> + Send + Sync + 'static,
    {
        Single::from_flow(self.flow.flat_map(move |value| f(value).flow))
    }

    /// Expands the element into a multi-valued flow.
    pub fn flat_map_many<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flow<U> + Send + Sync + 'static,
    {
        self.flow.flat_map(f)
    }

    /// Combines this single's element with another's.
    pub fn zip_with<U, O, F>(self, other: Single<U>, combiner: F) -> Single<O>
    where
        U: Send + 'static,
        O: Send + 'static,
        F: Fn(T, U) -> O + Send + Sync + 'static,
    {
        Single::from_flow(Flow::zip(self.flow, other.flow, combiner))
    }

    /// Switches to `alternative` on empty completion.
    #[must_use]
    pub fn switch_if_empty(self, alternative: Self) -> Self {
        Self::from_flow(self.flow.switch_if_empty(alternative.flow))
    }

    /// Emits `value` on empty completion.
    #[must_use]
    pub fn default_if_empty(self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_flow(self.flow.default_if_empty(value))
    }

    /// Relocates subscription-time work onto `scheduler`.
    #[must_use]
    pub fn subscribe_on(self, scheduler: Arc<dyn crate::scheduler::Scheduler>) -> Self {
        Self::from_flow(self.flow.subscribe_on(scheduler))
    }

    /// Logs every signal at debug level under `label`.
    #[must_use]
    pub fn log(self, label: &str) -> Self
    where
        T: std::fmt::Debug,
    {
        Self::from_flow(self.flow.log(label))
    }

    /// Widens back to a [`Flow`].
    #[must_use]
    pub fn into_flow(self) -> Flow<T> {
        self.flow
    }

    // -----------------------------------------------------------------------
    // Subscribe surface
    // -----------------------------------------------------------------------

    /// Subscribes with a full [`Subscriber`].
    pub fn subscribe(self, subscriber: impl Subscriber<T> + 'static) {
        self.flow.subscribe(subscriber);
    }

    /// Subscribes with a value callback and unbounded demand.
    pub fn subscribe_fn(self, on_next: impl FnMut(T) + Send + 'static) {
        self.flow.subscribe_fn(on_next);
    }
}

/// One-shot iterator over a lazily evaluated callable.
struct CallableIter<T> {
    f: Arc<dyn Fn() -> T + Send + Sync>,
    produced: bool,
}

impl<T> Clone for CallableIter<T> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
            produced: false,
        }
    }
}

impl<T> Iterator for CallableIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.produced {
            return None;
        }
        self.produced = true;
        Some((self.f)())
    }
}

// ---------------------------------------------------------------------------
// CollectFlow
// ---------------------------------------------------------------------------

/// Buffers an entire upstream flow and emits it as one list.
struct CollectFlow<T> {
    source: Flow<T>,
}

impl<T: Send + 'static> RawFlow<Vec<T>> for CollectFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<Vec<T>>>) {
        let context = downstream.context();
        let coordinator = Arc::new(CollectCoordinator {
            demand: Demand::new(),
            wip: AtomicU64::new(1),
            context,
            state: Mutex::new(CollectState {
                downstream,
                buffer: Vec::new(),
                upstream: None,
                completed: false,
                error: None,
                done: false,
            }),
        });

        {
            let subscription = Arc::new(CollectSubscription(Arc::clone(&coordinator)));
            let mut state = coordinator.state.lock();
            state.downstream.on_subscribe(subscription);
        }

        self.source.clone().subscribe_boxed(Box::new(CollectSubscriber {
            coordinator: Arc::clone(&coordinator),
        }));

        coordinator.drain_loop(1);
    }
}

struct CollectCoordinator<T> {
    demand: Demand,
    wip: AtomicU64,
    context: SubscriberContext,
    state: Mutex<CollectState<T>>,
}

struct CollectState<T> {
    downstream: Box<dyn Subscriber<Vec<T>>>,
    buffer: Vec<T>,
    upstream: Option<Arc<dyn Subscription>>,
    completed: bool,
    error: Option<FlowError>,
    done: bool,
}

impl<T: Send + 'static> CollectCoordinator<T> {
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
        if self.demand.is_cancelled() {
            state.done = true;
            let upstream = state.upstream.take();
            drop(state);
            if let Some(upstream) = upstream {
                upstream.cancel();
            }
            return;
        }
        if self.demand.is_violated() {
            state.done = true;
            state
                .downstream
                .on_error(FlowError::Protocol("request(0) is not allowed".into()));
            let upstream = state.upstream.take();
            drop(state);
            if let Some(upstream) = upstream {
                upstream.cancel();
            }
            return;
        }
        if let Some(error) = state.error.take() {
            state.done = true;
            state.downstream.on_error(error);
            return;
        }
        if state.completed && self.demand.try_claim() {
            state.done = true;
            let list = std::mem::take(&mut state.buffer);
            state.downstream.on_next(list);
            state.downstream.on_complete();
        }
    }
}

struct CollectSubscription<T>(Arc<CollectCoordinator<T>>);

impl<T: Send + 'static> Subscription for CollectSubscription<T> {
    fn request(&self, n: u64) {
        self.0.demand.add(n);
        self.0.drain();
    }

    fn cancel(&self) {
        self.0.demand.cancel();
        self.0.drain();
    }
}

struct CollectSubscriber<T> {
    coordinator: Arc<CollectCoordinator<T>>,
}

impl<T: Send + 'static> Subscriber<T> for CollectSubscriber<T> {
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
        let mut state = self.coordinator.state.lock();
        if !state.done {
            state.buffer.push(value);
        }
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
