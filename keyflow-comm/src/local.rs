//! In-process transport: several ranks inside one process, wired by
//! channels, with one dispatch thread per rank.
//!
//! This is the engine the integration tests run the full multi-rank protocol
//! against; it is also a reasonable deployment for single-process worlds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use keyflow_errors::{KeyflowError, KeyflowResult};

use crate::engine::{CommEngine, CommStats, HandlerTable, TagHandler};
use crate::msg::{Rank, Tag};

enum Delivery {
    Frame { src: Rank, tag: Tag, bytes: Vec<u8> },
    Shutdown,
}

/// Factory for a fully-wired set of in-process ranks.
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` ranks that can message each other. Every handle must be
    /// kept alive (and eventually shut down) by its owning world.
    pub fn new(size: usize) -> Vec<Arc<LocalComm>> {
        assert!(size > 0, "a cluster needs at least one rank");
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            receivers.push(rx);
        }

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| LocalComm::start(rank as Rank, senders.clone(), rx))
            .collect()
    }
}

/// One rank's endpoint in a [`LocalCluster`].
pub struct LocalComm {
    rank: Rank,
    peers: Vec<mpsc::Sender<Delivery>>,
    handlers: Arc<HandlerTable>,
    /// Per-target, per-tag send counts; observable so tests can assert on
    /// message locality.
    sent: Vec<[AtomicU64; Tag::COUNT]>,
    data_sent: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalComm {
    fn start(rank: Rank, peers: Vec<mpsc::Sender<Delivery>>, rx: mpsc::Receiver<Delivery>) -> Arc<Self> {
        let size = peers.len();
        let comm = Arc::new(LocalComm {
            rank,
            peers,
            handlers: Arc::new(HandlerTable::new()),
            sent: (0..size).map(|_| Default::default()).collect(),
            data_sent: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        });

        let handlers = Arc::clone(&comm.handlers);
        let dispatcher = std::thread::Builder::new()
            .name(format!("keyflow-local-comm-{rank}"))
            .spawn(move || {
                while let Ok(delivery) = rx.recv() {
                    match delivery {
                        Delivery::Frame { src, tag, bytes } => handlers.dispatch(tag, src, bytes),
                        Delivery::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn comm dispatcher thread");
        *comm.dispatcher.lock() = Some(dispatcher);
        comm
    }

    /// Number of frames this rank has sent to `target` on `tag`.
    pub fn sent_to(&self, target: Rank, tag: Tag) -> u64 {
        self.sent[target as usize][tag.index()].load(Ordering::Acquire)
    }
}

impl CommEngine for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn register_handler(&self, tag: Tag, handler: Arc<dyn TagHandler>) {
        self.handlers.register(tag, handler);
    }

    fn send(&self, target: Rank, tag: Tag, bytes: Vec<u8>) -> KeyflowResult<()> {
        let sender = self
            .peers
            .get(target as usize)
            .ok_or_else(|| KeyflowError::Transport(format!("no such rank {target}")))?;
        self.sent[target as usize][tag.index()].fetch_add(1, Ordering::AcqRel);
        if tag != Tag::Fence {
            self.data_sent.fetch_add(1, Ordering::AcqRel);
            metrics::counter!("keyflow.comm.frames_sent").increment(1);
        }
        sender
            .send(Delivery::Frame {
                src: self.rank,
                tag,
                bytes,
            })
            .map_err(|_| KeyflowError::Transport(format!("rank {target} is gone")))
    }

    fn stats(&self) -> CommStats {
        CommStats {
            data_sent: self.data_sent.load(Ordering::Acquire),
            data_received: self.handlers.data_received(),
        }
    }

    fn shutdown(&self) {
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            // Unblock the dispatcher; ignore failure if it already exited.
            let _ = self.peers[self.rank as usize].send(Delivery::Shutdown);
            let _ = handle.join();
            self.handlers.clear();
        }
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
