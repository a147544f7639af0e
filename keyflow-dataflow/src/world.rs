//! The process-wide runtime context.
//!
//! A [`World`] owns one rank's communication engine, worker pool, operator
//! registry, and termination machinery. Graph building, `execute`, `fence`,
//! and `finalize` all go through it. Handles are cheap clones of one shared
//! context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, error, info};

use keyflow_comm::local::LocalCluster;
use keyflow_comm::tcp::{TcpComm, TcpConfig};
use keyflow_comm::{
    CommEngine, CountingDetector, Envelope, FenceCoordinator, Rank, RmaManager, Tag, TagHandler,
    TerminationDetector,
};
use keyflow_errors::{KeyflowError, KeyflowResult};

use crate::pool::WorkerPool;

/// Which communication engine backs the world.
#[derive(Clone, Debug, Default, Deserialize)]
pub enum TransportConfig {
    /// A single-rank in-process world.
    #[default]
    Local,
    /// One rank of a TCP mesh.
    Tcp(TcpConfig),
}

/// Configuration for [`World::new`]. Deserializable so a host binary can
/// layer its own file or flag parsing on top; the core reads no environment
/// and has no CLI.
#[derive(Clone, Debug, Deserialize)]
pub struct WorldConfig {
    /// Worker threads for task bodies.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Transport selection.
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_workers() -> usize {
    num_cpus::get()
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            workers: default_workers(),
            transport: TransportConfig::Local,
        }
    }
}

/// The registered receive half of an operator, type-erased for the
/// registry.
pub(crate) trait OpDispatch: Send + Sync {
    fn on_message(&self, src: Rank, envelope: Envelope) -> KeyflowResult<()>;
    fn report_leftovers(&self);
    fn name(&self) -> &str;
}

pub(crate) struct WorldInner {
    engine: Arc<dyn CommEngine>,
    pool: WorkerPool,
    detector: Arc<dyn TerminationDetector>,
    rma: Arc<RmaManager>,
    fence: Arc<FenceCoordinator>,
    registry: DashMap<u64, Arc<dyn OpDispatch>>,
    /// Messages that arrived before their operator registered, in arrival
    /// order per operator. Locked around every registry decision so replay
    /// order is exact.
    stash: Mutex<HashMap<u64, Vec<(Rank, Envelope)>>>,
    next_op_id: AtomicU64,
    epoch: Arc<AtomicU32>,
    executing: AtomicBool,
    finalized: AtomicBool,
}

impl WorldInner {
    fn dispatch_am(&self, src: Rank, envelope: Envelope) {
        let op_id = envelope.header.op_id;
        let mut stash = self.stash.lock();
        match self.registry.get(&op_id) {
            Some(entry) => {
                let dispatch = Arc::clone(entry.value());
                drop(entry);
                drop(stash);
                if let Err(err) = dispatch.on_message(src, envelope) {
                    error!(%err, op = dispatch.name(), "fatal error dispatching active message");
                    std::process::abort();
                }
            }
            None => {
                debug!(op_id, src, "stashing message for unregistered operator");
                stash.entry(op_id).or_default().push((src, envelope));
            }
        }
    }

    fn register_op(&self, id: u64, dispatch: Arc<dyn OpDispatch>) -> KeyflowResult<()> {
        // Replay before publishing in the registry, all under the stash
        // lock: arrivals racing this registration either land in the stash
        // (and are replayed here) or observe the registry afterwards.
        let mut stash = self.stash.lock();
        let pending = stash.remove(&id).unwrap_or_default();
        if !pending.is_empty() {
            debug!(
                op = dispatch.name(),
                count = pending.len(),
                "replaying stashed messages"
            );
        }
        for (src, envelope) in pending {
            dispatch.on_message(src, envelope)?;
        }
        self.registry.insert(id, dispatch);
        Ok(())
    }
}

impl Drop for WorldInner {
    fn drop(&mut self) {
        self.pool.shutdown();
        self.engine.shutdown();
    }
}

struct AmHandler {
    world: Weak<WorldInner>,
}

impl TagHandler for AmHandler {
    fn on_message(&self, src: Rank, bytes: Vec<u8>) {
        let Some(world) = self.world.upgrade() else {
            return;
        };
        match Envelope::decode(&bytes) {
            Ok(envelope) => world.dispatch_am(src, envelope),
            Err(err) => {
                error!(%err, "fatal error decoding active message");
                std::process::abort();
            }
        }
    }
}

/// Handle to the process-wide runtime context for one rank.
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

impl World {
    /// Start the communication engine and worker pool for one rank.
    pub fn new(config: WorldConfig) -> KeyflowResult<World> {
        match config.transport {
            TransportConfig::Local => {
                let mut cluster = LocalCluster::new(1);
                Ok(Self::with_engine(cluster.remove(0), config.workers))
            }
            TransportConfig::Tcp(tcp) => Ok(Self::with_engine(TcpComm::new(tcp)?, config.workers)),
        }
    }

    /// All ranks of an in-process world, for tests and single-process
    /// multi-rank runs. Graphs must be built identically on every rank.
    pub fn local_cluster(ranks: usize, workers: usize) -> Vec<World> {
        LocalCluster::new(ranks)
            .into_iter()
            .map(|engine| Self::with_engine(engine, workers))
            .collect()
    }

    /// Build a world over an externally-constructed engine. This is the
    /// extension point for custom transports; the engine must not have
    /// handlers registered yet.
    pub fn with_engine(engine: Arc<dyn CommEngine>, workers: usize) -> World {
        let detector: Arc<dyn TerminationDetector> = Arc::new(CountingDetector::new());
        let rma = RmaManager::new(Arc::clone(&engine));
        let fence = FenceCoordinator::new(Arc::clone(&engine));
        let inner = Arc::new(WorldInner {
            pool: WorkerPool::new(workers),
            detector,
            rma,
            fence,
            registry: DashMap::new(),
            stash: Mutex::new(HashMap::new()),
            next_op_id: AtomicU64::new(0),
            epoch: Arc::new(AtomicU32::new(0)),
            executing: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            engine: Arc::clone(&engine),
        });
        engine.register_handler(
            Tag::Am,
            Arc::new(AmHandler {
                world: Arc::downgrade(&inner),
            }),
        );
        info!(rank = inner.engine.rank(), size = inner.engine.size(), "world up");
        World { inner }
    }

    /// This process's rank.
    pub fn rank(&self) -> Rank {
        self.inner.engine.rank()
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.inner.engine.size()
    }

    /// Arm the taskpool epoch. After this, `invoke` is legal. Idempotent.
    pub fn execute(&self) -> KeyflowResult<()> {
        if self.inner.executing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.detector.arm();
        info!(rank = self.rank(), "taskpool armed");
        Ok(())
    }

    /// Whether `execute` has armed the taskpool.
    pub fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::Acquire)
    }

    /// Block until every rank is quiescent, then re-arm a fresh epoch so
    /// execution can resume.
    pub fn fence(&self) -> KeyflowResult<()> {
        if !self.is_executing() {
            return Err(KeyflowError::NotExecuting);
        }
        debug!(rank = self.rank(), "entering fence");
        self.inner.detector.disarm();
        let idle = || self.inner.detector.quiescent();
        self.inner.fence.fence(&idle)?;
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.detector.arm();
        debug!(rank = self.rank(), "fence complete; epoch re-armed");
        Ok(())
    }

    /// Drain outstanding work and tear the world down. Idempotent; reports
    /// any never-completed partial task.
    pub fn finalize(&self) -> KeyflowResult<()> {
        if self.inner.finalized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.is_executing() {
            self.inner.detector.disarm();
            let idle = || self.inner.detector.quiescent();
            self.inner.fence.fence(&idle)?;
        }
        for entry in self.inner.registry.iter() {
            entry.value().report_leftovers();
        }
        self.inner.pool.shutdown();
        self.inner.engine.shutdown();
        info!(rank = self.rank(), "world finalized");
        Ok(())
    }

    /// Emulated-RMA transfers and registrations still outstanding on this
    /// rank.
    pub fn pending_rma_operations(&self) -> usize {
        self.inner.rma.pending_operations()
    }

    /// Messages stashed for operators that have not registered yet.
    pub fn stashed_messages(&self) -> usize {
        self.inner.stash.lock().values().map(Vec::len).sum()
    }

    /// This rank's task counters. After a [`fence`](World::fence), created,
    /// scheduled, and completed are all equal.
    pub fn task_counts(&self) -> keyflow_comm::TaskCounts {
        self.inner.detector.counts()
    }

    pub(crate) fn engine(&self) -> Arc<dyn CommEngine> {
        Arc::clone(&self.inner.engine)
    }

    pub(crate) fn detector(&self) -> Arc<dyn TerminationDetector> {
        Arc::clone(&self.inner.detector)
    }

    pub(crate) fn pool(&self) -> WorkerPool {
        self.inner.pool.clone()
    }

    pub(crate) fn rma(&self) -> Arc<RmaManager> {
        Arc::clone(&self.inner.rma)
    }

    pub(crate) fn epoch_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.inner.epoch)
    }

    pub(crate) fn alloc_op_id(&self) -> u64 {
        self.inner.next_op_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn register_op(&self, id: u64, dispatch: Arc<dyn OpDispatch>) -> KeyflowResult<()> {
        self.inner.register_op(id, dispatch)
    }
}
