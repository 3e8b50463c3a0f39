//! Test instrumentation for pipelines.
//!
//! [`TestSubscriber`] is a cloneable probe: attach one end to a pipeline,
//! keep the clone, and assert on what arrived. Demand is explicit, so
//! backpressure behavior is testable signal by signal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FlowError;
use crate::subscriber::Subscriber;
use crate::subscription::{Subscription, UNBOUNDED};

/// A recording subscriber for tests.
///
/// All clones share one state: the clone passed to `subscribe` records, the
/// clone kept by the test inspects and drives demand.
pub struct TestSubscriber<T> {
    shared: Arc<Shared<T>>,
    initial_request: u64,
}

struct Shared<T> {
    state: Mutex<ProbeState<T>>,
    terminal: Condvar,
}

struct ProbeState<T> {
    values: Vec<T>,
    error: Option<FlowError>,
    completed: bool,
    subscription: Option<Arc<dyn Subscription>>,
}

impl<T> Clone for TestSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            initial_request: self.initial_request,
        }
    }
}

impl<T> TestSubscriber<T> {
    /// A probe that requests unbounded demand on subscribe.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_initial_request(UNBOUNDED)
    }

    /// A probe that requests exactly `n` elements on subscribe.
    ///
    /// With `n == 0` no request is issued at all; drive demand later with
    /// [`request`](Self::request).
    #[must_use]
    pub fn with_initial_request(n: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ProbeState {
                    values: Vec::new(),
                    error: None,
                    completed: false,
                    subscription: None,
                }),
                terminal: Condvar::new(),
            }),
            initial_request: n,
        }
    }

    /// Elements received so far.
    #[must_use]
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.shared.state.lock().values.clone()
    }

    /// Number of elements received so far.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.shared.state.lock().values.len()
    }

    /// The terminal error, if one arrived.
    #[must_use]
    pub fn error(&self) -> Option<FlowError> {
        self.shared.state.lock().error.clone()
    }

    /// Whether `on_complete` arrived.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().completed
    }

    /// Requests `n` more elements.
    ///
    /// # Panics
    ///
    /// Panics if no subscription arrived yet or `n` is zero; use
    /// [`raw_request`](Self::raw_request) to exercise protocol violations.
    pub fn request(&self, n: u64) {
        assert!(n > 0, "use raw_request to send request(0)");
        self.raw_request(n);
    }

    /// Forwards `request(n)` verbatim, including invalid `n`.
    ///
    /// # Panics
    ///
    /// Panics if no subscription arrived yet.
    pub fn raw_request(&self, n: u64) {
        let subscription = self
            .shared
            .state
            .lock()
            .subscription
            .clone()
            .expect("no subscription");
        subscription.request(n);
    }

    /// Cancels the subscription.
    pub fn cancel(&self) {
        let subscription = self.shared.state.lock().subscription.clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Blocks until a terminal signal arrives, up to `timeout`.
    ///
    /// Returns `true` if the pipeline terminated in time.
    pub fn await_terminal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.error.is_none() && !state.completed {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared.terminal.wait_for(&mut state, deadline - now);
        }
        true
    }

    /// Blocks until at least `n` elements arrived, up to `timeout`.
    ///
    /// Returns `true` if the count was reached in time.
    pub fn await_values(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.state.lock().values.len() >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl<T> Default for TestSubscriber<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.shared.state.lock().subscription = Some(Arc::clone(&subscription));
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&mut self, value: T) {
        self.shared.state.lock().values.push(value);
    }

    fn on_error(&mut self, error: FlowError) {
        self.shared.state.lock().error = Some(error);
        self.shared.terminal.notify_all();
    }

    fn on_complete(&mut self) {
        self.shared.state.lock().completed = true;
        self.shared.terminal.notify_all();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
