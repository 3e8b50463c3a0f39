//! Shared worker queue driving both pool flavors.
//!
//! A [`WorkerCore`] owns a FIFO task queue plus a timer heap, serviced by a
//! single thread at a time. The parallel pool keeps its threads resident;
//! the bounded-elastic pool spawns a thread on demand and lets the loop
//! exit after an idle timeout.

use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Task;

/// A delayed task keyed by deadline.
struct TimedTask {
    deadline: Instant,
    /// Submission order, breaks deadline ties FIFO.
    seq: u64,
    task: Task,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reversed so the earliest deadline pops first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct CoreState {
    queue: VecDeque<Task>,
    timers: BinaryHeap<TimedTask>,
    seq: u64,
    shutdown: bool,
    /// A thread is currently servicing this core.
    running: bool,
}

/// The queue half of a worker; see module docs.
pub(crate) struct WorkerCore {
    state: Mutex<CoreState>,
    signal: Condvar,
}

/// Why the service loop returned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Shut down explicitly.
    Shutdown,
    /// Idle timeout elapsed with nothing queued.
    Idle,
}

impl WorkerCore {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CoreState::default()),
            signal: Condvar::new(),
        }
    }

    /// Enqueues a task. Returns `true` if no thread is servicing the core,
    /// in which case the caller is responsible for starting one.
    pub(crate) fn push(&self, task: Task) -> bool {
        let mut state = self.state.lock();
        state.queue.push_back(task);
        let needs_thread = !state.running;
        drop(state);
        self.signal.notify_one();
        needs_thread
    }

    /// Enqueues a task to run no earlier than `delay` from now. Returns
    /// `true` if the caller must start a service thread.
    pub(crate) fn push_after(&self, delay: Duration, task: Task) -> bool {
        let mut state = self.state.lock();
        let seq = state.seq;
        state.seq += 1;
        state.timers.push(TimedTask {
            deadline: Instant::now() + delay,
            seq,
            task,
        });
        let needs_thread = !state.running;
        drop(state);
        self.signal.notify_one();
        needs_thread
    }

    /// Marks the core as being serviced. Must be called before spawning the
    /// thread that runs [`run`](Self::run) so concurrent `push` calls do not
    /// spawn a second one.
    pub(crate) fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            return false;
        }
        state.running = true;
        true
    }

    /// Requests the service loop to exit and wakes it.
    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.signal.notify_all();
    }

    /// Services the queue until shutdown, or until `idle_ttl` elapses with
    /// nothing to do (when a TTL is configured).
    pub(crate) fn run(&self, idle_ttl: Option<Duration>) -> LoopExit {
        loop {
            let task = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        state.running = false;
                        return LoopExit::Shutdown;
                    }

                    // Promote due timers, preserving their deadline order.
                    let now = Instant::now();
                    while state
                        .timers
                        .peek()
                        .is_some_and(|timed| timed.deadline <= now)
                    {
                        let Some(timed) = state.timers.pop() else {
                            break;
                        };
                        state.queue.push_back(timed.task);
                    }

                    if let Some(task) = state.queue.pop_front() {
                        break task;
                    }

                    match (state.timers.peek().map(|timed| timed.deadline), idle_ttl) {
                        (Some(deadline), _) => {
                            self.signal.wait_until(&mut state, deadline);
                        }
                        (None, Some(ttl)) => {
                            let timed_out = self.signal.wait_for(&mut state, ttl).timed_out();
                            if timed_out && state.queue.is_empty() && state.timers.is_empty() {
                                state.running = false;
                                return LoopExit::Idle;
                            }
                        }
                        (None, None) => {
                            self.signal.wait(&mut state);
                        }
                    }
                }
            };
            task();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn spawn_service(core: &Arc<WorkerCore>, ttl: Option<Duration>) -> std::thread::JoinHandle<LoopExit> {
        assert!(core.mark_running());
        let core = Arc::clone(core);
        std::thread::spawn(move || core.run(ttl))
    }

    #[test]
    fn test_worker_core_runs_tasks_in_order() {
        let core = Arc::new(WorkerCore::new());
        let handle = spawn_service(&core, None);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            core.push(Box::new(move || order.lock().push(i)));
        }

        // Give the service thread time to drain, then stop it.
        std::thread::sleep(Duration::from_millis(50));
        core.shutdown();
        assert_eq!(handle.join().unwrap(), LoopExit::Shutdown);
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_core_timer_ordering() {
        let core = Arc::new(WorkerCore::new());
        let handle = spawn_service(&core, None);

        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        core.push_after(Duration::from_millis(40), Box::new(move || o.lock().push("late")));
        let o = Arc::clone(&order);
        core.push_after(Duration::from_millis(10), Box::new(move || o.lock().push("early")));

        std::thread::sleep(Duration::from_millis(120));
        core.shutdown();
        handle.join().unwrap();
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }

    #[test]
    fn test_worker_core_idle_exit_and_restart() {
        let core = Arc::new(WorkerCore::new());
        let ttl = Some(Duration::from_millis(20));
        let handle = spawn_service(&core, ttl);
        assert_eq!(handle.join().unwrap(), LoopExit::Idle);

        // After the idle exit a new push reports that a thread is needed.
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        assert!(core.push(Box::new(move || {
            h.fetch_add(1, Ordering::AcqRel);
        })));
        let handle = spawn_service(&core, ttl);
        assert_eq!(handle.join().unwrap(), LoopExit::Idle);
        assert_eq!(hits.load(Ordering::Acquire), 1);
    }
}
