//! Termination detection and the distributed fence.
//!
//! The runtime tracks outstanding local work through a pluggable
//! [`TerminationDetector`]; the default [`CountingDetector`] keeps the three
//! counters the taskpool epoch needs (created, scheduled, completed) plus a
//! pending-actions gauge that is armed while a source of new local work
//! exists (an active epoch whose main thread may still inject tasks).
//!
//! Global quiescence is decided by rank 0 from per-rank frame totals: when
//! every rank is locally quiescent, globally `sent == received`, and the
//! per-rank totals are unchanged across two consecutive rounds, no frame can
//! still be in flight and no rank can become busy again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use keyflow_errors::KeyflowResult;

use crate::comm_fatal;
use crate::engine::{CommEngine, TagHandler};
use crate::msg::{Rank, Tag};

/// Counter snapshot reported by [`TerminationDetector::counts`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskCounts {
    /// Tasks materialized (partial or ready).
    pub created: u64,
    /// Tasks handed to the worker pool.
    pub scheduled: u64,
    /// Tasks whose body has finished.
    pub completed: u64,
}

/// Tracks outstanding local work. Every scheduling event in the runtime
/// reports here; `fence` and `finalize` wait on [`quiescent`].
///
/// [`quiescent`]: TerminationDetector::quiescent
pub trait TerminationDetector: Send + Sync + 'static {
    /// A task was materialized.
    fn task_created(&self);
    /// A task became ready and was handed to the worker pool.
    fn task_scheduled(&self);
    /// A task's body finished and its inputs were released.
    fn task_completed(&self);
    /// A source of new local work appeared (epoch armed).
    fn arm(&self);
    /// A source of new local work went away (fence/finalize entered).
    fn disarm(&self);
    /// No local work is outstanding and no source of new work is armed.
    fn quiescent(&self) -> bool;
    /// Current counter values.
    fn counts(&self) -> TaskCounts;
}

/// The default counter-based detector.
#[derive(Default)]
pub struct CountingDetector {
    created: AtomicU64,
    scheduled: AtomicU64,
    completed: AtomicU64,
    pending_actions: AtomicI64,
}

impl CountingDetector {
    /// A detector with nothing armed and all counters zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TerminationDetector for CountingDetector {
    fn task_created(&self) {
        self.created.fetch_add(1, Ordering::AcqRel);
    }

    fn task_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::AcqRel);
    }

    fn task_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    fn arm(&self) {
        self.pending_actions.fetch_add(1, Ordering::AcqRel);
    }

    fn disarm(&self) {
        let prev = self.pending_actions.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "disarm without a matching arm");
    }

    fn quiescent(&self) -> bool {
        // Order matters: sample `completed` first so a task completing
        // between the loads can only make the check conservatively fail.
        let completed = self.completed.load(Ordering::Acquire);
        let created = self.created.load(Ordering::Acquire);
        self.pending_actions.load(Ordering::Acquire) == 0 && created == completed
    }

    fn counts(&self) -> TaskCounts {
        TaskCounts {
            created: self.created.load(Ordering::Acquire),
            scheduled: self.scheduled.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
        }
    }
}

#[derive(Serialize, Deserialize)]
enum FenceMsg {
    /// Rank → rank 0: locally quiescent with these data-frame totals.
    Report { round: u64, sent: u64, received: u64 },
    /// Rank 0 → all: verdict for one round.
    Decision { round: u64, done: bool },
}

#[derive(Default)]
struct FenceState {
    /// Next round this rank will report for.
    round: u64,
    /// Rank 0 only: reports collected per round.
    reports: HashMap<u64, Vec<Option<(u64, u64)>>>,
    /// Rank 0 only: totals of the previous round, for the stability check.
    prev: Option<Vec<(u64, u64)>>,
    /// Decisions received, keyed by round.
    decisions: HashMap<u64, bool>,
}

/// Drives the collective fence over the engine's fence channel.
pub struct FenceCoordinator {
    engine: Arc<dyn CommEngine>,
    state: Mutex<FenceState>,
    decided: Condvar,
}

const IDLE_POLL: Duration = Duration::from_micros(200);

impl FenceCoordinator {
    /// Create the coordinator and hook it onto the engine's fence channel.
    pub fn new(engine: Arc<dyn CommEngine>) -> Arc<Self> {
        let coordinator = Arc::new(FenceCoordinator {
            engine: Arc::clone(&engine),
            state: Mutex::new(FenceState::default()),
            decided: Condvar::new(),
        });
        engine.register_handler(Tag::Fence, Arc::clone(&coordinator) as _);
        coordinator
    }

    /// Block until the whole world is quiescent.
    ///
    /// `locally_idle` must return `true` only when this rank has no
    /// outstanding work; it is re-checked every round because an arriving
    /// message can make an idle rank busy again.
    pub fn fence(&self, locally_idle: &dyn Fn() -> bool) -> KeyflowResult<()> {
        if self.engine.size() == 1 {
            while !locally_idle() {
                std::thread::sleep(IDLE_POLL);
            }
            return Ok(());
        }

        loop {
            while !locally_idle() {
                std::thread::sleep(IDLE_POLL);
            }

            let round = self.state.lock().round;
            let stats = self.engine.stats();
            trace!(round, ?stats, "reporting for fence round");
            self.send(
                0,
                &FenceMsg::Report {
                    round,
                    sent: stats.data_sent,
                    received: stats.data_received,
                },
            )?;

            let done = {
                let mut state = self.state.lock();
                while !state.decisions.contains_key(&round) {
                    self.decided.wait(&mut state);
                }
                state.round = round + 1;
                state
                    .decisions
                    .remove(&round)
                    .expect("checked by the wait loop")
            };
            if done {
                debug!(round, "fence complete");
                return Ok(());
            }
            // Not settled yet; don't hammer rank 0 with report rounds.
            std::thread::sleep(IDLE_POLL);
        }
    }

    fn send(&self, target: Rank, msg: &FenceMsg) -> KeyflowResult<()> {
        self.engine
            .send(target, Tag::Fence, bincode::serialize(msg)?)
    }

    fn handle(&self, src: Rank, msg: FenceMsg) -> KeyflowResult<()> {
        match msg {
            FenceMsg::Report {
                round,
                sent,
                received,
            } => {
                let size = self.engine.size();
                // Decide outside the lock: the decision fan-out loops back
                // through this handler on some engines.
                let decision = {
                    let mut state = self.state.lock();
                    let reports = state
                        .reports
                        .entry(round)
                        .or_insert_with(|| vec![None; size]);
                    reports[src as usize] = Some((sent, received));
                    if reports.iter().all(Option::is_some) {
                        let totals: Vec<(u64, u64)> = state
                            .reports
                            .remove(&round)
                            .expect("just observed")
                            .into_iter()
                            .map(|r| r.expect("all present"))
                            .collect();
                        let sent_sum: u64 = totals.iter().map(|(s, _)| s).sum();
                        let recv_sum: u64 = totals.iter().map(|(_, r)| r).sum();
                        let stable = state.prev.as_ref() == Some(&totals);
                        state.prev = Some(totals);
                        Some(sent_sum == recv_sum && stable)
                    } else {
                        None
                    }
                };

                if let Some(done) = decision {
                    debug!(round, done, "fence round decided");
                    if done {
                        self.state.lock().prev = None;
                    }
                    for rank in 0..size as Rank {
                        self.send(rank, &FenceMsg::Decision { round, done })?;
                    }
                }
                Ok(())
            }
            FenceMsg::Decision { round, done } => {
                let mut state = self.state.lock();
                state.decisions.insert(round, done);
                self.decided.notify_all();
                Ok(())
            }
        }
    }
}

impl TagHandler for FenceCoordinator {
    fn on_message(&self, src: Rank, bytes: Vec<u8>) {
        let msg = match bincode::deserialize(&bytes) {
            Ok(msg) => msg,
            Err(err) => comm_fatal("decoding fence message", &err.into()),
        };
        if let Err(err) = self.handle(src, msg) {
            comm_fatal("handling fence message", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCluster;

    #[test]
    fn counting_detector_tracks_outstanding_work() {
        let detector = CountingDetector::new();
        assert!(detector.quiescent());

        detector.arm();
        assert!(!detector.quiescent());
        detector.task_created();
        detector.disarm();
        assert!(!detector.quiescent());

        detector.task_scheduled();
        detector.task_completed();
        assert!(detector.quiescent());
        assert_eq!(
            detector.counts(),
            TaskCounts {
                created: 1,
                scheduled: 1,
                completed: 1
            }
        );
    }

    #[test]
    fn fence_converges_on_idle_cluster() {
        let cluster = LocalCluster::new(3);
        let coordinators: Vec<_> = cluster
            .iter()
            .map(|comm| FenceCoordinator::new(comm.clone()))
            .collect();

        let threads: Vec<_> = coordinators
            .iter()
            .map(|coordinator| {
                let coordinator = Arc::clone(coordinator);
                std::thread::spawn(move || coordinator.fence(&|| true).unwrap())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn fence_waits_for_message_balance() {
        let cluster = LocalCluster::new(2);
        // An unmatched data frame: sent but never dispatched to a handler,
        // so rank 1's received count stays behind.
        cluster[0].send(1, Tag::Am, vec![0]).unwrap();

        let coordinators: Vec<_> = cluster
            .iter()
            .map(|comm| FenceCoordinator::new(comm.clone()))
            .collect();

        let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let threads: Vec<_> = coordinators
            .iter()
            .map(|coordinator| {
                let coordinator = Arc::clone(coordinator);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    coordinator.fence(&|| true).unwrap();
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0, "fence must not pass");

        // Deliver the frame: registering a handler drains the buffer and
        // bumps the received count, after which the fence can complete.
        struct Sink;
        impl TagHandler for Sink {
            fn on_message(&self, _: Rank, _: Vec<u8>) {}
        }
        cluster[1].register_handler(Tag::Am, Arc::new(Sink) as _);
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
