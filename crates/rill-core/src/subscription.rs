//! Subscription contract and demand accounting.
//!
//! A [`Subscription`] is the subscriber's lever over a producer: `request(n)`
//! grants demand, `cancel()` stops the sequence. The [`Demand`] ledger backs
//! every producer in the crate: an atomic pending counter with an unbounded
//! sentinel, consumed one unit at a time through a CAS loop.
//!
//! # Thread Safety
//!
//! The pending counter is shared between the subscriber side (which adds via
//! `request`) and the producer side (which decrements via `try_claim`). The
//! CAS loop in `try_claim` keeps the count correct under concurrent access.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Demand sentinel meaning "effectively unbounded".
///
/// Once the pending counter saturates here it is never decremented again.
pub const UNBOUNDED: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Per-subscriber control handle delivered through `on_subscribe`.
///
/// `request(0)` is a protocol violation; producers surface it as
/// [`FlowError::Protocol`](crate::FlowError::Protocol). `cancel()` is
/// idempotent and stops emission within one scheduling step; emissions
/// already dispatched are not retracted.
pub trait Subscription: Send + Sync {
    /// Grants `n` more elements of demand (`n >= 1`).
    fn request(&self, n: u64);

    /// Cancels the subscription. Idempotent.
    fn cancel(&self);
}

/// A subscription with nothing to produce, handed out by sources that
/// terminate during `subscribe` (empty and error sources).
#[derive(Debug, Default)]
pub struct InertSubscription;

impl Subscription for InertSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

// ---------------------------------------------------------------------------
// Demand
// ---------------------------------------------------------------------------

/// Per-subscription demand ledger and cancellation flag.
///
/// The producer calls [`try_claim`](Self::try_claim) before each emission;
/// if it returns `false` the element must be withheld (or handed to an
/// overflow policy). The subscriber side adds demand via [`add`](Self::add).
#[derive(Debug, Default)]
pub struct Demand {
    /// Pending demand; saturates at [`UNBOUNDED`].
    pending: AtomicU64,
    /// Set once `cancel` has been observed.
    cancelled: AtomicBool,
    /// Set when a `request(0)` violation was observed.
    violated: AtomicBool,
}

impl Demand {
    /// Creates a ledger with zero pending demand.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` units of demand, saturating at [`UNBOUNDED`].
    ///
    /// `n == 0` marks the ledger as violated instead; the owning producer
    /// reports the violation as a terminal protocol error.
    pub fn add(&self, n: u64) {
        if n == 0 {
            self.violated.store(true, Ordering::Release);
            return;
        }
        loop {
            let current = self.pending.load(Ordering::Acquire);
            if current == UNBOUNDED {
                return;
            }
            let next = current.saturating_add(n);
            if self
                .pending
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Attempts to consume one unit of demand.
    ///
    /// Returns `true` if demand was available (and decremented), `false` if
    /// pending demand was 0 or the subscription is cancelled. Unbounded
    /// demand is never decremented.
    #[inline]
    #[must_use]
    pub fn try_claim(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        loop {
            let current = self.pending.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if current == UNBOUNDED {
                return true;
            }
            if self
                .pending
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Returns the current pending demand.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Returns `true` once demand has saturated to the unbounded sentinel.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.pending() == UNBOUNDED
    }

    /// Marks the subscription cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` if the subscription has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `true` if a `request(0)` violation was recorded.
    #[must_use]
    pub fn is_violated(&self) -> bool {
        self.violated.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// RelaySubscription
// ---------------------------------------------------------------------------

/// A subscription whose upstream target can be swapped mid-flight.
///
/// Resubscribing operators (retry, repeat, `on_error_resume`,
/// `switch_if_empty`, sequential concat) hand this to the downstream
/// subscriber once, then point it at each successive upstream. Outstanding
/// demand (requested minus produced) is carried over on every swap so the
/// downstream never has to re-request.
#[derive(Default)]
pub struct RelaySubscription {
    state: Mutex<RelayState>,
    cancelled: AtomicBool,
}

#[derive(Default)]
struct RelayState {
    upstream: Option<Arc<dyn Subscription>>,
    /// Requested-minus-produced, saturating at [`UNBOUNDED`].
    outstanding: u64,
}

impl RelaySubscription {
    /// Creates a relay with no upstream attached.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Points the relay at a new upstream subscription.
    ///
    /// If the relay was already cancelled the new upstream is cancelled
    /// immediately. Otherwise any outstanding demand is replayed into it.
    pub fn swap_upstream(&self, upstream: Arc<dyn Subscription>) {
        if self.is_cancelled() {
            upstream.cancel();
            return;
        }
        let outstanding = {
            let mut state = self.state.lock();
            state.upstream = Some(Arc::clone(&upstream));
            state.outstanding
        };
        // Replayed outside the lock: the upstream may emit synchronously and
        // re-enter `produced`.
        if outstanding > 0 {
            upstream.request(outstanding);
        }
    }

    /// Records `n` elements delivered downstream, shrinking outstanding demand.
    pub fn produced(&self, n: u64) {
        let mut state = self.state.lock();
        if state.outstanding != UNBOUNDED {
            state.outstanding = state.outstanding.saturating_sub(n);
        }
    }

    /// Returns `true` if the relay has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Subscription for RelaySubscription {
    fn request(&self, n: u64) {
        let upstream = {
            let mut state = self.state.lock();
            if n > 0 && state.outstanding != UNBOUNDED {
                state.outstanding = state.outstanding.saturating_add(n);
            }
            state.upstream.clone()
        };
        // Forwarded outside the lock; `n == 0` is passed through so the
        // producer's ledger records the violation.
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let upstream = self.state.lock().upstream.take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demand_request_and_claim() {
        let demand = Demand::new();
        assert_eq!(demand.pending(), 0);
        assert!(!demand.try_claim());

        demand.add(5);
        assert_eq!(demand.pending(), 5);
        for _ in 0..5 {
            assert!(demand.try_claim());
        }
        assert!(!demand.try_claim());
        assert_eq!(demand.pending(), 0);
    }

    #[test]
    fn test_demand_unbounded_never_decrements() {
        let demand = Demand::new();
        demand.add(UNBOUNDED);
        assert!(demand.is_unbounded());
        for _ in 0..1000 {
            assert!(demand.try_claim());
        }
        assert!(demand.is_unbounded());
    }

    #[test]
    fn test_demand_saturates_instead_of_wrapping() {
        let demand = Demand::new();
        demand.add(UNBOUNDED - 1);
        demand.add(100);
        assert!(demand.is_unbounded());
    }

    #[test]
    fn test_demand_zero_request_is_violation() {
        let demand = Demand::new();
        assert!(!demand.is_violated());
        demand.add(0);
        assert!(demand.is_violated());
        assert_eq!(demand.pending(), 0);
    }

    #[test]
    fn test_demand_cancel_blocks_claims() {
        let demand = Demand::new();
        demand.add(10);
        demand.cancel();
        assert!(demand.is_cancelled());
        assert!(!demand.try_claim());
    }

    #[test]
    fn test_demand_concurrent_claims() {
        let demand = Arc::new(Demand::new());

        let d = Arc::clone(&demand);
        let requester = std::thread::spawn(move || {
            for _ in 0..100 {
                d.add(100);
            }
        });

        let d = Arc::clone(&demand);
        let consumer = std::thread::spawn(move || {
            let mut consumed = 0u64;
            loop {
                if d.try_claim() {
                    consumed += 1;
                    if consumed == 10_000 {
                        break;
                    }
                }
                std::thread::yield_now();
            }
            consumed
        });

        requester.join().unwrap();
        assert_eq!(consumer.join().unwrap(), 10_000);
        assert_eq!(demand.pending(), 0);
    }

    #[derive(Default)]
    struct RecordingSubscription {
        requested: AtomicU64,
        cancelled: AtomicBool,
    }

    impl Subscription for RecordingSubscription {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::AcqRel);
        }
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::Release);
        }
    }

    #[test]
    fn test_relay_replays_outstanding_demand_on_swap() {
        let relay = RelaySubscription::new();
        relay.request(10);
        relay.produced(3);

        let upstream = Arc::new(RecordingSubscription::default());
        relay.swap_upstream(Arc::clone(&upstream) as Arc<dyn Subscription>);
        assert_eq!(upstream.requested.load(Ordering::Acquire), 7);
    }

    #[test]
    fn test_relay_forwards_requests_to_current_upstream() {
        let relay = RelaySubscription::new();
        let upstream = Arc::new(RecordingSubscription::default());
        relay.swap_upstream(Arc::clone(&upstream) as Arc<dyn Subscription>);

        relay.request(4);
        assert_eq!(upstream.requested.load(Ordering::Acquire), 4);
    }

    #[test]
    fn test_relay_cancel_reaches_upstream_and_future_swaps() {
        let relay = RelaySubscription::new();
        let first = Arc::new(RecordingSubscription::default());
        relay.swap_upstream(Arc::clone(&first) as Arc<dyn Subscription>);

        relay.cancel();
        assert!(first.cancelled.load(Ordering::Acquire));

        // A late swap (e.g. retry racing a cancel) is cancelled immediately.
        let second = Arc::new(RecordingSubscription::default());
        relay.swap_upstream(Arc::clone(&second) as Arc<dyn Subscription>);
        assert!(second.cancelled.load(Ordering::Acquire));
    }

    #[test]
    fn test_relay_unbounded_survives_swaps() {
        let relay = RelaySubscription::new();
        relay.request(UNBOUNDED);
        relay.produced(50);

        let upstream = Arc::new(RecordingSubscription::default());
        relay.swap_upstream(Arc::clone(&upstream) as Arc<dyn Subscription>);
        assert_eq!(upstream.requested.load(Ordering::Acquire), UNBOUNDED);
    }
}
