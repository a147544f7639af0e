//! The worker pool: a fixed set of threads draining one prioritized ready
//! queue.
//!
//! Ready tasks are ordered by priority (higher first), then arrival. Bodies
//! run to completion on one worker; there is no suspension and no
//! cancellation. Message-delivery helpers are submitted at `i32::MAX` so the
//! communication thread is never stuck behind application work.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

struct ReadyEntry {
    priority: i32,
    seq: u64,
    job: Job,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO by sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct PoolState {
    queue: BinaryHeap<ReadyEntry>,
    next_seq: u64,
    shutdown: bool,
    workers: Vec<JoinHandle<()>>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Cloneable handle to the pool.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub(crate) fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let pool = WorkerPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        };
        let handles: Vec<_> = (0..workers)
            .map(|index| {
                let inner = Arc::clone(&pool.inner);
                std::thread::Builder::new()
                    .name(format!("keyflow-worker-{index}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        pool.inner.state.lock().workers = handles;
        pool
    }

    /// Queue a ready task.
    pub(crate) fn submit(&self, priority: i32, job: Job) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            warn!("task submitted after pool shutdown; dropping");
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(ReadyEntry { priority, seq, job });
        drop(state);
        self.inner.available.notify_one();
    }

    /// Stop the workers once the queue drains. Pending jobs still run.
    pub(crate) fn shutdown(&self) {
        let handles = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            std::mem::take(&mut state.workers)
        };
        self.inner.available.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    let mut state = inner.state.lock();
    loop {
        if let Some(entry) = state.queue.pop() {
            drop(state);
            (entry.job)();
            state = inner.state.lock();
        } else if state.shutdown {
            break;
        } else {
            inner.available.wait(&mut state);
        }
    }
}

/// Ready tasks accumulated during a batch delivery (broadcast, key lists)
/// and submitted to the pool in one sweep.
#[derive(Default)]
pub(crate) struct ReadyBatch {
    jobs: Vec<(i32, Job)>,
}

impl ReadyBatch {
    pub(crate) fn push(&mut self, priority: i32, job: Job) {
        self.jobs.push((priority, job));
    }

    pub(crate) fn submit(self, pool: &WorkerPool) {
        for (priority, job) in self.jobs {
            pool.submit(priority, job);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.submit(0, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 32 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown();
    }

    #[test]
    fn drains_queue_before_stopping() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(0, Box::new(move || {
                std::thread::sleep(Duration::from_millis(2));
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn priority_orders_queued_jobs() {
        // One worker, blocked on a gate so the queue builds up; the queued
        // jobs must then run highest-priority first.
        let pool = WorkerPool::new(1);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let gate = Arc::clone(&gate);
            pool.submit(i32::MAX, Box::new(move || {
                let (lock, cvar) = &*gate;
                let mut open = lock.lock();
                while !*open {
                    cvar.wait(&mut open);
                }
            }));
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        for priority in [1, 3, 2] {
            let order = Arc::clone(&order);
            pool.submit(priority, Box::new(move || {
                order.lock().push(priority);
            }));
        }

        {
            let (lock, cvar) = &*gate;
            *lock.lock() = true;
            cvar.notify_all();
        }
        pool.shutdown();
        assert_eq!(*order.lock(), vec![3, 2, 1]);
    }
}
