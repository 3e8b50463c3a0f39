//! Execution contexts for relocating pipeline work.
//!
//! A [`Scheduler`] hands out [`Worker`]s: FIFO serial executors that a
//! pipeline stage pins one subscription to, so per-source signal order is
//! preserved across a thread hop. Three kinds are provided:
//!
//! - **immediate**: runs tasks inline on the caller, never suspends
//! - **parallel**: fixed-size rotating pool for CPU-bound work
//! - **bounded-elastic**: grow-on-demand pool with idle-timeout release for
//!   blocking, I/O-bound work
//!
//! Schedulers are selected programmatically via [`Schedulers`] or by name
//! (`"immediate"`, `"parallel"`, `"bounded-elastic"`).

mod core;
mod elastic;
mod pool;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub use elastic::BoundedElasticScheduler;
pub use pool::ParallelScheduler;

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send>;

/// Default thread count for the shared parallel scheduler.
#[must_use]
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// Default thread cap multiplier for the bounded-elastic scheduler.
pub const DEFAULT_ELASTIC_SIZE_FACTOR: usize = 10;

/// Default idle timeout before a bounded-elastic thread is released.
pub const DEFAULT_ELASTIC_IDLE_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Scheduler / Worker
// ---------------------------------------------------------------------------

/// An execution context that can mint serial workers.
pub trait Scheduler: Send + Sync {
    /// Creates a worker: a FIFO serial executor owned by one subscription.
    ///
    /// Tasks scheduled on a single worker run in submission order, one at a
    /// time. Distinct workers may run concurrently.
    fn create_worker(&self) -> Arc<dyn Worker>;

    /// The scheduler's registry name.
    fn name(&self) -> &'static str;
}

/// A FIFO serial executor minted by a [`Scheduler`].
pub trait Worker: Send + Sync {
    /// Enqueues a task for execution.
    fn schedule(&self, task: Task);

    /// Enqueues a task to run no earlier than `delay` from now.
    fn schedule_after(&self, delay: Duration, task: Task);
}

// ---------------------------------------------------------------------------
// ImmediateScheduler
// ---------------------------------------------------------------------------

/// Inline scheduler: tasks run on the calling thread, immediately.
///
/// `schedule_after` blocks the caller for the delay; the inline scheduler
/// owns no timer thread.
#[derive(Debug, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        Arc::new(ImmediateWorker)
    }

    fn name(&self) -> &'static str {
        "immediate"
    }
}

struct ImmediateWorker;

impl Worker for ImmediateWorker {
    fn schedule(&self, task: Task) {
        task();
    }

    fn schedule_after(&self, delay: Duration, task: Task) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        task();
    }
}

// ---------------------------------------------------------------------------
// Schedulers registry
// ---------------------------------------------------------------------------

/// Named access to the shared scheduler instances.
pub struct Schedulers;

impl Schedulers {
    /// The inline scheduler.
    #[must_use]
    pub fn immediate() -> Arc<dyn Scheduler> {
        static IMMEDIATE: OnceLock<Arc<ImmediateScheduler>> = OnceLock::new();
        Arc::clone(IMMEDIATE.get_or_init(|| Arc::new(ImmediateScheduler))) as Arc<dyn Scheduler>
    }

    /// The shared fixed-size parallel pool (one thread per core).
    #[must_use]
    pub fn parallel() -> Arc<dyn Scheduler> {
        static PARALLEL: OnceLock<Arc<ParallelScheduler>> = OnceLock::new();
        Arc::clone(
            PARALLEL.get_or_init(|| Arc::new(ParallelScheduler::new(default_parallelism()))),
        ) as Arc<dyn Scheduler>
    }

    /// The shared bounded-elastic pool for blocking work.
    #[must_use]
    pub fn bounded_elastic() -> Arc<dyn Scheduler> {
        static ELASTIC: OnceLock<Arc<BoundedElasticScheduler>> = OnceLock::new();
        Arc::clone(ELASTIC.get_or_init(|| {
            Arc::new(BoundedElasticScheduler::new(
                DEFAULT_ELASTIC_SIZE_FACTOR * default_parallelism(),
                DEFAULT_ELASTIC_IDLE_TTL,
            ))
        })) as Arc<dyn Scheduler>
    }

    /// Resolves a scheduler by registry name.
    ///
    /// Recognized names: `"immediate"`, `"parallel"`, `"bounded-elastic"`.
    #[must_use]
    pub fn by_name(name: &str) -> Option<Arc<dyn Scheduler>> {
        match name {
            "immediate" => Some(Self::immediate()),
            "parallel" => Some(Self::parallel()),
            "bounded-elastic" => Some(Self::bounded_elastic()),
            _ => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
