//! Element-wise stages: transform, filter, limit, log.

use std::any::Any;
use std::sync::Arc;

use crate::error::MapFailure;
use crate::flow::Flow;
use crate::signal::Signal;
use crate::source::RawFlow;
use crate::subscriber::{Subscriber, SubscriberContext};
use crate::subscription::Subscription;

// ---------------------------------------------------------------------------
// TryMapFlow
// ---------------------------------------------------------------------------

/// Fallible 1:1 transform stage.
pub(crate) struct TryMapFlow<T, U> {
    source: Flow<T>,
    f: Arc<dyn Fn(T) -> Result<U, MapFailure<T>> + Send + Sync>,
}

impl<T, U> TryMapFlow<T, U> {
    pub(crate) fn new(
        source: Flow<T>,
        f: impl Fn(T) -> Result<U, MapFailure<T>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            f: Arc::new(f),
        }
    }
}

impl<T, U> RawFlow<U> for TryMapFlow<T, U>
where
    T: Send + Any + 'static,
    U: Send + 'static,
{
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<U>>) {
        let context = downstream.context();
        self.source.clone().subscribe_boxed(Box::new(TryMapSubscriber {
            downstream,
            f: Arc::clone(&self.f),
            context,
            upstream: None,
            done: false,
        }));
    }
}

struct TryMapSubscriber<T, U> {
    downstream: Box<dyn Subscriber<U>>,
    f: Arc<dyn Fn(T) -> Result<U, MapFailure<T>> + Send + Sync>,
    context: SubscriberContext,
    upstream: Option<Arc<dyn Subscription>>,
    done: bool,
}

impl<T, U> Subscriber<T> for TryMapSubscriber<T, U>
where
    T: Send + Any + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.upstream = Some(Arc::clone(&subscription));
        // Demand is 1:1, so the upstream subscription is handed through.
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            return;
        }
        match (self.f)(value) {
            Ok(mapped) => self.downstream.on_next(mapped),
            Err(failure) => {
                if let Some(handler) = self.context.continue_handler() {
                    // Skip-and-continue: the element is dropped and no
                    // replacement is requested; emission resumes on the next
                    // downstream request.
                    let value: &(dyn Any + Send) = &failure.value;
                    handler(&failure.error, value);
                } else {
                    self.done = true;
                    if let Some(upstream) = self.upstream.take() {
                        upstream.cancel();
                    }
                    self.downstream.on_error(failure.error);
                }
            }
        }
    }

    fn on_error(&mut self, error: crate::FlowError) {
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
        self.context.clone()
    }
}

// ---------------------------------------------------------------------------
// FilterFlow
// ---------------------------------------------------------------------------

/// Predicate stage; amplifies demand by re-requesting for dropped elements.
pub(crate) struct FilterFlow<T> {
    source: Flow<T>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> FilterFlow<T> {
    pub(crate) fn new(source: Flow<T>, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            source,
            predicate: Arc::new(predicate),
        }
    }
}

impl<T: Send + 'static> RawFlow<T> for FilterFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(FilterSubscriber {
            downstream,
            predicate: Arc::clone(&self.predicate),
            upstream: None,
        }));
    }
}

struct FilterSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    upstream: Option<Arc<dyn Subscription>>,
}

impl<T: Send + 'static> Subscriber<T> for FilterSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.upstream = Some(Arc::clone(&subscription));
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        if (self.predicate)(&value) {
            self.downstream.on_next(value);
        } else if let Some(upstream) = &self.upstream {
            // The dropped element consumed one unit of upstream demand that
            // never reached downstream; replace it.
            upstream.request(1);
        }
    }

    fn on_error(&mut self, error: crate::FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }

    fn context(&self) -> SubscriberContext {
        self.downstream.context()
    }
}

// ---------------------------------------------------------------------------
// TakeFlow
// ---------------------------------------------------------------------------

/// Emits the first `n` elements, then cancels upstream and completes.
pub(crate) struct TakeFlow<T> {
    source: Flow<T>,
    limit: u64,
}

impl<T> TakeFlow<T> {
    pub(crate) fn new(source: Flow<T>, limit: u64) -> Self {
        Self { source, limit }
    }
}

impl<T: Send + 'static> RawFlow<T> for TakeFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(TakeSubscriber {
            downstream,
            remaining: self.limit,
            upstream: None,
            done: false,
        }));
    }
}

struct TakeSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    remaining: u64,
    upstream: Option<Arc<dyn Subscription>>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.remaining == 0 {
            subscription.cancel();
            self.done = true;
            self.downstream
                .on_subscribe(Arc::new(crate::subscription::InertSubscription));
            self.downstream.on_complete();
            return;
        }
        self.upstream = Some(Arc::clone(&subscription));
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            return;
        }
        self.remaining -= 1;
        self.downstream.on_next(value);
        if self.remaining == 0 {
            self.done = true;
            if let Some(upstream) = self.upstream.take() {
                upstream.cancel();
            }
            self.downstream.on_complete();
        }
    }

    fn on_error(&mut self, error: crate::FlowError) {
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
// LogFlow
// ---------------------------------------------------------------------------

/// Signal tap emitting `tracing` debug events under a label.
pub(crate) struct LogFlow<T> {
    source: Flow<T>,
    label: String,
}

impl<T> LogFlow<T> {
    pub(crate) fn new(source: Flow<T>, label: String) -> Self {
        Self { source, label }
    }
}

impl<T: Send + std::fmt::Debug + 'static> RawFlow<T> for LogFlow<T> {
    fn subscribe_raw(self: Arc<Self>, downstream: Box<dyn Subscriber<T>>) {
        self.source.clone().subscribe_boxed(Box::new(LogSubscriber {
            downstream,
            label: self.label.clone(),
        }));
    }
}

struct LogSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    label: String,
}

impl<T: std::fmt::Debug> LogSubscriber<T> {
    fn tap(&self, signal: &Signal<&T>) {
        match signal {
            Signal::Next(value) => {
                tracing::debug!(label = %self.label, value = ?value, "on_next");
            }
            Signal::Error(error) => {
                tracing::debug!(label = %self.label, %error, "on_error");
            }
            Signal::Complete => {
                tracing::debug!(label = %self.label, "on_complete");
            }
        }
    }
}

impl<T: Send + std::fmt::Debug + 'static> Subscriber<T> for LogSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        tracing::debug!(label = %self.label, "on_subscribe");
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.tap(&Signal::Next(&value));
        self.downstream.on_next(value);
    }

    fn on_error(&mut self, error: crate::FlowError) {
        self.tap(&Signal::Error(error.clone()));
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.tap(&Signal::Complete);
        self.downstream.on_complete();
    }

    fn context(&self) -> SubscriberContext {
        self.downstream.context()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use crate::error::{FlowError, MapFailure};
    use crate::testkit::TestSubscriber;
    use crate::Flow;

    #[test]
    fn test_try_map_failure_terminates_by_default() {
        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec!["A", "B", "C"])
            .try_map(|s| {
                if s == "B" {
                    Err(MapFailure::new(FlowError::failed("bad element"), s))
                } else {
                    Ok(s.to_lowercase())
                }
            })
            .subscribe(probe.clone());

        assert_eq!(probe.values(), vec!["a"]);
        assert!(probe.error().is_some());
        assert!(!probe.is_completed());
    }

    #[test]
    fn test_filter_re_requests_for_dropped_elements() {
        // With demand 3, the filter must pull extra upstream elements to
        // deliver 3 passing ones.
        let probe = TestSubscriber::with_initial_request(3);
        Flow::range(1, 100)
            .filter(|n| n % 2 == 0)
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![2, 4, 6]);
    }

    #[test]
    fn test_take_zero_completes_immediately() {
        let probe = TestSubscriber::unbounded();
        Flow::range(1, 10).take(0).subscribe(probe.clone());
        assert!(probe.values().is_empty());
        assert!(probe.is_completed());
    }

    #[test]
    fn test_take_then_error_is_suppressed_after_completion() {
        let probe = TestSubscriber::unbounded();
        Flow::from_iter(vec![1, 2, 3])
            .concat_with(Flow::error(FlowError::failed("late")))
            .take(3)
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_completed());
        assert!(probe.error().is_none());
    }
}
