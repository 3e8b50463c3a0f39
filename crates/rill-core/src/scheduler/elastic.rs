//! Bounded-elastic pool for blocking, I/O-bound pipeline work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::core::WorkerCore;
use super::{Scheduler, Task, Worker};

/// A grow-on-demand pool with bounded growth and idle-timeout release.
///
/// Each `create_worker` call gets its own queue up to `cap` queues; beyond
/// the cap, queues are reused round-robin so extra subscriptions queue
/// behind existing ones instead of growing the pool. Service threads are
/// spawned lazily on the first task and exit after `idle_ttl` without work;
/// the next task respawns one.
pub struct BoundedElasticScheduler {
    cores: Mutex<Vec<Arc<WorkerCore>>>,
    next: AtomicUsize,
    cap: usize,
    idle_ttl: Duration,
    spawned: Arc<AtomicUsize>,
}

impl BoundedElasticScheduler {
    /// Creates a pool capped at `cap` queues with the given idle timeout.
    ///
    /// # Panics
    ///
    /// Panics if `cap` is zero.
    #[must_use]
    pub fn new(cap: usize, idle_ttl: Duration) -> Self {
        assert!(cap > 0, "cap must be at least 1");
        Self {
            cores: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            cap,
            idle_ttl,
            spawned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Maximum number of queues (and therefore threads) this pool grows to.
    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }
}

impl Scheduler for BoundedElasticScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        let mut cores = self.cores.lock();
        let core = if cores.len() < self.cap {
            let core = Arc::new(WorkerCore::new());
            cores.push(Arc::clone(&core));
            core
        } else {
            let index = self.next.fetch_add(1, Ordering::AcqRel) % cores.len();
            Arc::clone(&cores[index])
        };
        drop(cores);
        Arc::new(ElasticWorker {
            core,
            idle_ttl: self.idle_ttl,
            spawned: Arc::clone(&self.spawned),
        })
    }

    fn name(&self) -> &'static str {
        "bounded-elastic"
    }
}

struct ElasticWorker {
    core: Arc<WorkerCore>,
    idle_ttl: Duration,
    spawned: Arc<AtomicUsize>,
}

impl ElasticWorker {
    /// Spawns a service thread for the core if none is running.
    fn ensure_thread(&self) {
        if !self.core.mark_running() {
            return;
        }
        let id = self.spawned.fetch_add(1, Ordering::AcqRel);
        let ttl = self.idle_ttl;
        let core = Arc::clone(&self.core);
        std::thread::Builder::new()
            .name(format!("rill-elastic-{id}"))
            .spawn(move || {
                tracing::debug!(worker = id, "elastic worker started");
                let exit = core.run(Some(ttl));
                tracing::debug!(worker = id, ?exit, "elastic worker released");
            })
            .expect("failed to spawn elastic worker");
    }
}

impl Worker for ElasticWorker {
    fn schedule(&self, task: Task) {
        if self.core.push(task) {
            self.ensure_thread();
        }
    }

    fn schedule_after(&self, delay: Duration, task: Task) {
        if self.core.push_after(delay, task) {
            self.ensure_thread();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
