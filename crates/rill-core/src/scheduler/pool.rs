//! Fixed-size rotating worker pool for CPU-bound pipeline work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::core::WorkerCore;
use super::{Scheduler, Task, Worker};

/// A fixed set of resident threads, one queue each.
///
/// `create_worker` assigns cores round-robin, so each subscription pins to
/// one thread (per-source FIFO order) while distinct subscriptions spread
/// across the pool.
pub struct ParallelScheduler {
    cores: Vec<Arc<WorkerCore>>,
    next: AtomicUsize,
}

impl ParallelScheduler {
    /// Spawns a pool with `parallelism` resident threads.
    ///
    /// # Panics
    ///
    /// Panics if `parallelism` is zero.
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        assert!(parallelism > 0, "parallelism must be at least 1");
        let cores: Vec<Arc<WorkerCore>> =
            (0..parallelism).map(|_| Arc::new(WorkerCore::new())).collect();

        for (index, core) in cores.iter().enumerate() {
            assert!(core.mark_running());
            let core = Arc::clone(core);
            std::thread::Builder::new()
                .name(format!("rill-parallel-{index}"))
                .spawn(move || {
                    tracing::debug!(worker = index, "parallel worker started");
                    core.run(None);
                    tracing::debug!(worker = index, "parallel worker stopped");
                })
                .expect("failed to spawn parallel worker");
        }

        Self {
            cores,
            next: AtomicUsize::new(0),
        }
    }

    /// Number of resident threads.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.cores.len()
    }
}

impl Scheduler for ParallelScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        let index = self.next.fetch_add(1, Ordering::AcqRel) % self.cores.len();
        Arc::new(PoolWorker {
            core: Arc::clone(&self.cores[index]),
        })
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

impl Drop for ParallelScheduler {
    fn drop(&mut self) {
        for core in &self.cores {
            core.shutdown();
        }
    }
}

struct PoolWorker {
    core: Arc<WorkerCore>,
}

impl Worker for PoolWorker {
    fn schedule(&self, task: Task) {
        self.core.push(task);
    }

    fn schedule_after(&self, delay: Duration, task: Task) {
        self.core.push_after(delay, task);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
