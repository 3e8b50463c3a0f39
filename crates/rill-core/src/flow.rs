//! Multi-valued reactive sequence.
//!
//! A [`Flow`] is an immutable, assembly-time description of a pipeline:
//! operators compose descriptions, and nothing executes until `subscribe`.
//! Flows are cold — every subscription runs the pipeline from scratch —
//! unless multicast through [`publish`](Flow::publish).

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::backpressure::{BufferFlow, DropFlow, ErrorOnOverflowFlow, OverflowStrategy};
use crate::combine::{ConcatFlow, MergeSequentialFlow, ZipFlow};
use crate::error::{FlowError, MapFailure};
use crate::hot::ConnectableFlow;
use crate::operator::fallback::{
    ContinueFlow, ErrorMapFlow, ResumeFlow, SwitchIfEmptyFlow,
};
use crate::operator::flat_map::FlatMapFlow;
use crate::operator::map::{FilterFlow, LogFlow, TakeFlow, TryMapFlow};
use crate::operator::retry::{RepeatFlow, RetryFlow, RetrySpec};
use crate::operator::schedule::{DelayFlow, PublishOnFlow, SubscribeOnFlow};
use crate::parallel::ParallelFlow;
use crate::scheduler::Scheduler;
use crate::single::Single;
use crate::source::{DeferFlow, ErrorFlow, IterFlow, RawFlow};
use crate::subscriber::{CallbackSubscriber, Subscriber};

/// A cold, push-based, backpressure-aware sequence of `T`.
pub struct Flow<T> {
    inner: Arc<dyn RawFlow<T>>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Flow<T> {
    pub(crate) fn from_raw(raw: impl RawFlow<T> + 'static) -> Self {
        Self {
            inner: Arc::new(raw),
        }
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// A flow of exactly one element.
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_iter(std::iter::once(value))
    }

    /// A cold flow over any cloneable iterator; re-subscription re-runs it.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send,
    {
        Self::from_raw(IterFlow::new(iter))
    }

    /// An empty flow: completes without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_iter(std::iter::empty::<T>())
    }

    /// A flow that terminates with `error` on subscribe.
    #[must_use]
    pub fn error(error: FlowError) -> Self {
        Self::from_raw(ErrorFlow::new(error))
    }

    /// A flow resolved by `factory` at subscribe time, once per subscription.
    pub fn defer(factory: impl Fn() -> Self + Send + Sync + 'static) -> Self {
        Self::from_raw(DeferFlow::new(factory))
    }

    // -----------------------------------------------------------------------
    // Subscribe surface
    // -----------------------------------------------------------------------

    /// Subscribes with a full [`Subscriber`]; demand is whatever the
    /// subscriber requests in `on_subscribe`.
    pub fn subscribe(self, subscriber: impl Subscriber<T> + 'static) {
        self.subscribe_boxed(Box::new(subscriber));
    }

    /// Subscribes with an element callback and unbounded demand.
    ///
    /// Terminal errors are logged; use [`CallbackSubscriber`] directly to
    /// observe them.
    pub fn subscribe_fn(self, on_next: impl FnMut(T) + Send + 'static) {
        self.subscribe(CallbackSubscriber::new(on_next));
    }

    pub(crate) fn subscribe_boxed(self, subscriber: Box<dyn Subscriber<T>>) {
        self.inner.subscribe_raw(subscriber);
    }

    // -----------------------------------------------------------------------
    // Operator stages
    // -----------------------------------------------------------------------

    /// Transforms each element 1:1.
    pub fn map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Transforms each element with a fallible function.
    ///
    /// A failure becomes a terminal error and cancels upstream, unless an
    /// `on_error_continue` handler downstream elects to skip the element.
    /// The failed element rides back inside [`MapFailure`] so the handler
    /// can observe it.
    pub fn try_map<U, F>(self, f: F) -> Flow<U>
    where
        T: Any,
        U: Send + 'static,
        F: Fn(T) -> Result<U, MapFailure<T>> + Send + Sync + 'static,
    {
        Flow::from_raw(TryMapFlow::new(self, f))
    }

    /// Keeps elements matching `predicate`, transparently re-requesting one
    /// upstream element for each one dropped.
    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::from_raw(FilterFlow::new(self, predicate))
    }

    /// Maps each element to an inner flow and merges inner emissions with no
    /// cross-source ordering guarantee and unbounded concurrency.
    pub fn flat_map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flow<U> + Send + Sync + 'static,
    {
        Flow::from_raw(FlatMapFlow::unordered(self, f, usize::MAX))
    }

    /// [`flat_map`](Self::flat_map) with a cap on simultaneously active
    /// inner subscriptions.
    pub fn flat_map_with<U, F>(self, concurrency: usize, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flow<U> + Send + Sync + 'static,
    {
        Flow::from_raw(FlatMapFlow::unordered(self, f, concurrency))
    }

    /// Sequential [`flat_map`](Self::flat_map): one inner flow at a time,
    /// each consumed fully, in upstream-emission order.
    pub fn concat_map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flow<U> + Send + Sync + 'static,
    {
        Flow::from_raw(FlatMapFlow::sequential(self, f))
    }

    /// Applies an assembly-time flow-to-flow function; equivalent to
    /// inlining `f` at the call site.
    pub fn transform<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + 'static,
        F: FnOnce(Self) -> Flow<U>,
    {
        f(self)
    }

    /// Switches to `alternative` if this flow completes without emitting.
    ///
    /// The alternative is only subscribed after an empty completion is
    /// observed, never speculatively.
    #[must_use]
    pub fn switch_if_empty(self, alternative: Self) -> Self {
        Self::from_raw(SwitchIfEmptyFlow::new(self, alternative))
    }

    /// Emits `value` if this flow completes without emitting.
    #[must_use]
    pub fn default_if_empty(self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        let fallback = Self::just(value);
        self.switch_if_empty(fallback)
    }

    /// Emits at most `n` elements, then cancels upstream and completes.
    #[must_use]
    pub fn take(self, n: u64) -> Self {
        Self::from_raw(TakeFlow::new(self, n))
    }

    /// Paces emissions: each element is delivered `delay` after the
    /// previous one, on a worker of the shared parallel scheduler.
    #[must_use]
    pub fn delay_elements(self, delay: Duration) -> Self {
        Self::from_raw(DelayFlow::new(self, delay))
    }

    /// Logs every signal at debug level under `label`.
    #[must_use]
    pub fn log(self, label: &str) -> Self
    where
        T: std::fmt::Debug,
    {
        Self::from_raw(LogFlow::new(self, label.to_string()))
    }

    /// Collects all elements into a single list.
    pub fn collect_list(self) -> Single<Vec<T>> {
        Single::collecting(self)
    }

    // -----------------------------------------------------------------------
    // Combinators
    // -----------------------------------------------------------------------

    /// Concatenates flows: each source is subscribed only after the previous
    /// one completes, preserving per-source order end-to-end.
    #[must_use]
    pub fn concat(sources: Vec<Self>) -> Self {
        Self::from_raw(ConcatFlow::new(sources))
    }

    /// Merges flows subscribed concurrently; downstream order is arrival
    /// order.
    #[must_use]
    pub fn merge(sources: Vec<Self>) -> Self {
        Flow::from_iter(SourceList::new(sources)).flat_map(|flow| flow)
    }

    /// Subscribes to all flows concurrently but emits strictly in source
    /// order: everything from the first source before anything from the
    /// second, even if the second finishes first.
    #[must_use]
    pub fn merge_sequential(sources: Vec<Self>) -> Self {
        Self::from_raw(MergeSequentialFlow::new(sources))
    }

    /// Pairs elements of two flows by index, completing with the shorter.
    pub fn zip<U, O, F>(left: Self, right: Flow<U>, combiner: F) -> Flow<O>
    where
        U: Send + 'static,
        O: Send + 'static,
        F: Fn(T, U) -> O + Send + Sync + 'static,
    {
        Flow::from_raw(ZipFlow::new(left, right, combiner))
    }

    /// Index-aligns three flows.
    pub fn zip3<U, V, O, F>(a: Self, b: Flow<U>, c: Flow<V>, combiner: F) -> Flow<O>
    where
        U: Send + 'static,
        V: Send + 'static,
        O: Send + 'static,
        F: Fn(T, U, V) -> O + Send + Sync + 'static,
    {
        let combiner = Arc::new(combiner);
        let paired = Flow::zip(a, b, |a, b| (a, b));
        Flow::zip(paired, c, move |(a, b), c| combiner(a, b, c))
    }

    /// This flow, then `other` once it completes.
    #[must_use]
    pub fn concat_with(self, other: Self) -> Self {
        Self::concat(vec![self, other])
    }

    /// This flow merged with `other` by arrival order.
    #[must_use]
    pub fn merge_with(self, other: Self) -> Self {
        Self::merge(vec![self, other])
    }

    /// This flow zipped pairwise with `other`.
    pub fn zip_with<U, O, F>(self, other: Flow<U>, combiner: F) -> Flow<O>
    where
        U: Send + 'static,
        O: Send + 'static,
        F: Fn(T, U) -> O + Send + Sync + 'static,
    {
        Self::zip(self, other, combiner)
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Relocates downstream signal delivery onto a worker of `scheduler`.
    ///
    /// Every signal is re-scheduled as it occurs; order is preserved because
    /// the subscription pins to a single FIFO worker.
    #[must_use]
    pub fn publish_on(self, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_raw(PublishOnFlow::new(self, scheduler))
    }

    /// Relocates subscription-time work (the upstream subscribe call and any
    /// synchronous production inside it) onto a worker of `scheduler`.
    ///
    /// When chained, every hop executes, so the subscription phase lands on
    /// the scheduler nearest the source.
    #[must_use]
    pub fn subscribe_on(self, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_raw(SubscribeOnFlow::new(self, scheduler))
    }

    /// Splits this flow round-robin into `rails` independent rails.
    #[must_use]
    pub fn parallel(self, rails: usize) -> ParallelFlow<T> {
        ParallelFlow::split(self, rails)
    }

    // -----------------------------------------------------------------------
    // Error recovery
    // -----------------------------------------------------------------------

    /// On terminal error, emits `value` and completes, swallowing the error.
    #[must_use]
    pub fn on_error_return(self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.on_error_resume(move |_| Self::just(value.clone()))
    }

    /// On terminal error, continues with the flow produced by `fallback`.
    pub fn on_error_resume<F>(self, fallback: F) -> Self
    where
        F: Fn(&FlowError) -> Self + Send + Sync + 'static,
    {
        Self::from_raw(ResumeFlow::new(self, fallback))
    }

    /// Rewrites a terminal error before it propagates.
    pub fn on_error_map<F>(self, f: F) -> Self
    where
        F: Fn(FlowError) -> FlowError + Send + Sync + 'static,
    {
        Self::from_raw(ErrorMapFlow::new(self, f))
    }

    /// Installs a per-element continuation handler for upstream operators
    /// that support it (`try_map`).
    ///
    /// When an upstream transform fails, the element is skipped, `handler`
    /// observes the error and the type-erased element, and the sequence
    /// continues. Skipping does not re-request: emission resumes on the next
    /// downstream request.
    pub fn on_error_continue<H>(self, handler: H) -> Self
    where
        H: Fn(&FlowError, &(dyn Any + Send)) + Send + Sync + 'static,
    {
        Self::from_raw(ContinueFlow::new(self, handler))
    }

    /// Re-subscribes the entire upstream pipeline from scratch on terminal
    /// error, up to `attempts` additional times.
    #[must_use]
    pub fn retry(self, attempts: u64) -> Self {
        Self::from_raw(RetryFlow::new(self, RetrySpec::max_attempts(attempts)))
    }

    /// Retries according to `spec`: predicate-filtered, optionally delayed,
    /// wrapping the last failure in
    /// [`FlowError::RetryExhausted`] once the budget is spent.
    #[must_use]
    pub fn retry_when(self, spec: RetrySpec) -> Self {
        Self::from_raw(RetryFlow::new(self, spec.wrapping_exhausted()))
    }

    /// Re-subscribes indefinitely on successful completion.
    #[must_use]
    pub fn repeat(self) -> Self {
        Self::from_raw(RepeatFlow::new(self, None))
    }

    /// Re-subscribes up to `times` additional times on successful completion.
    #[must_use]
    pub fn repeat_times(self, times: u64) -> Self {
        Self::from_raw(RepeatFlow::new(self, Some(times)))
    }

    // -----------------------------------------------------------------------
    // Hot sources & overflow policies
    // -----------------------------------------------------------------------

    /// Turns this cold flow into a connectable hot multicast source.
    #[must_use]
    pub fn publish(self) -> ConnectableFlow<T>
    where
        T: Clone,
    {
        ConnectableFlow::new(self)
    }

    /// Requests unbounded upstream and discards elements arriving without
    /// downstream demand, invoking `on_drop` for each.
    pub fn on_backpressure_drop<F>(self, on_drop: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self::from_raw(DropFlow::new(self, on_drop))
    }

    /// Buffers up to `capacity` elements past demand; on overflow, evicts
    /// per `strategy` and hands the evicted element to `on_evict`.
    pub fn on_backpressure_buffer<F>(
        self,
        capacity: usize,
        strategy: OverflowStrategy,
        on_evict: F,
    ) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self::from_raw(BufferFlow::new(self, capacity, strategy, on_evict))
    }

    /// Terminates with [`FlowError::Overflow`] when an element arrives
    /// without downstream demand.
    #[must_use]
    pub fn on_backpressure_error(self) -> Self {
        Self::from_raw(ErrorOnOverflowFlow::new(self))
    }
}

/// Cloneable wrapper letting a `Vec<Flow<T>>` act as a cold iterator source
/// for [`Flow::merge`].
struct SourceList<T> {
    sources: Vec<Flow<T>>,
}

impl<T> SourceList<T> {
    fn new(sources: Vec<Flow<T>>) -> Self {
        Self { sources }
    }
}

impl<T> Clone for SourceList<T> {
    fn clone(&self) -> Self {
        Self {
            sources: self.sources.clone(),
        }
    }
}

impl<T> IntoIterator for SourceList<T> {
    type Item = Flow<T>;
    type IntoIter = std::vec::IntoIter<Flow<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.into_iter()
    }
}

impl Flow<i64> {
    /// A flow counting from `start` over `count` consecutive integers.
    #[must_use]
    pub fn range(start: i64, count: usize) -> Self {
        let end = start.saturating_add(i64::try_from(count).unwrap_or(i64::MAX));
        Self::from_iter(start..end)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
