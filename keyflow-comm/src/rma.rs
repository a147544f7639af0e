//! Emulated one-sided transfers for split-metadata values.
//!
//! The real protocol this mirrors registers memory regions and issues RMA
//! `get`s against the sender's registration handles. Over a message channel
//! the same contract becomes a three-step loop per chunk:
//!
//! ```text
//!   getter                owner
//!     | -- GetReq{region} -> |   look up the exposed region
//!     | <- GetResp{bytes} -- |   chunk payload
//!     | -- Release{..} ----> |   drop the read lease, deregister
//! ```
//!
//! The sender keeps a read lease on the source data copy from `expose` until
//! the last `Release` arrives, so the payload cannot be mutated or freed
//! while a transfer is in flight. The receiver counts down an *activation*
//! over all chunks of one value and delivers exactly once.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slab::Slab;
use tracing::trace;

use keyflow_errors::{internal_err, KeyflowError, KeyflowResult};

use crate::comm_fatal;
use crate::engine::{CommEngine, TagHandler};
use crate::msg::{Rank, Tag};

/// One bulk chunk of a split-metadata transfer, as shipped inside the
/// `SetArg` message body.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ChunkDesc {
    /// Sender-side region handle to `GetReq` against.
    pub region: u64,
    /// Chunk size in bytes.
    pub nbytes: u64,
    /// Sender-side completion handle released once the chunk has landed.
    pub completion: u64,
}

#[derive(Serialize, Deserialize)]
enum RmaMsg {
    GetReq { region: u64, token: u64 },
    GetResp { token: u64, bytes: Vec<u8> },
    Release { completion: u64 },
}

struct Region {
    read: Box<dyn Fn() -> Vec<u8> + Send + Sync>,
    /// Receivers that have not released yet.
    remaining: usize,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

struct PendingChunk {
    activation: usize,
    index: usize,
}

struct Activation {
    remaining: usize,
    write: Box<dyn FnMut(usize, Vec<u8>) + Send>,
    on_done: Option<Box<dyn FnOnce() + Send>>,
    releases: Vec<(Rank, u64)>,
}

#[derive(Default)]
struct RmaInner {
    regions: Slab<Region>,
    pending: Slab<PendingChunk>,
    activations: Slab<Activation>,
}

/// Both sides of the emulated transfer protocol for one rank.
pub struct RmaManager {
    engine: Arc<dyn CommEngine>,
    inner: Mutex<RmaInner>,
}

impl RmaManager {
    /// Create the manager and hook it onto the engine's RMA channel.
    pub fn new(engine: Arc<dyn CommEngine>) -> Arc<Self> {
        let manager = Arc::new(RmaManager {
            engine: Arc::clone(&engine),
            inner: Mutex::new(RmaInner::default()),
        });
        engine.register_handler(Tag::Rma, Arc::clone(&manager) as _);
        manager
    }

    /// Sender side: expose one chunk of a held value to `receivers` getters.
    ///
    /// `read` must return the chunk's bytes for as long as the region is
    /// registered; `on_release` runs when the last receiver has released and
    /// must drop whatever lease kept `read` valid.
    pub fn expose(
        &self,
        read: Box<dyn Fn() -> Vec<u8> + Send + Sync>,
        on_release: Box<dyn FnOnce() + Send>,
        receivers: usize,
    ) -> u64 {
        debug_assert!(receivers > 0);
        let id = self.inner.lock().regions.insert(Region {
            read,
            remaining: receivers,
            on_release: Some(on_release),
        });
        id as u64
    }

    /// Receiver side: pull every chunk of one value from `owner`.
    ///
    /// `write(index, bytes)` stores one chunk into the destination shell;
    /// `on_done` runs exactly once, after the last chunk, and is followed by
    /// a `Release` to the owner for every chunk.
    pub fn fetch(
        &self,
        owner: Rank,
        chunks: Vec<ChunkDesc>,
        write: impl FnMut(usize, Vec<u8>) + Send + 'static,
        on_done: impl FnOnce() + Send + 'static,
    ) -> KeyflowResult<()> {
        if chunks.is_empty() {
            on_done();
            return Ok(());
        }

        let requests: Vec<(u64, u64)> = {
            let mut inner = self.inner.lock();
            let activation = inner.activations.insert(Activation {
                remaining: chunks.len(),
                write: Box::new(write),
                on_done: Some(Box::new(on_done)),
                releases: chunks.iter().map(|c| (owner, c.completion)).collect(),
            });
            chunks
                .iter()
                .enumerate()
                .map(|(index, chunk)| {
                    let token = inner.pending.insert(PendingChunk { activation, index });
                    (chunk.region, token as u64)
                })
                .collect()
        };

        for (region, token) in requests {
            self.send(owner, &RmaMsg::GetReq { region, token })?;
        }
        Ok(())
    }

    /// Transfers and registrations still outstanding on this rank.
    pub fn pending_operations(&self) -> usize {
        let inner = self.inner.lock();
        inner.regions.len() + inner.pending.len() + inner.activations.len()
    }

    fn send(&self, target: Rank, msg: &RmaMsg) -> KeyflowResult<()> {
        self.engine.send(target, Tag::Rma, bincode::serialize(msg)?)
    }

    fn handle(&self, src: Rank, msg: RmaMsg) -> KeyflowResult<()> {
        match msg {
            RmaMsg::GetReq { region, token } => {
                let bytes = {
                    let inner = self.inner.lock();
                    let region = inner
                        .regions
                        .get(region as usize)
                        .ok_or(KeyflowError::UnknownRegion(region))?;
                    (region.read)()
                };
                trace!(src, nbytes = bytes.len(), "serving RMA get");
                self.send(src, &RmaMsg::GetResp { token, bytes })
            }
            RmaMsg::GetResp { token, bytes } => {
                let finished = {
                    let mut inner = self.inner.lock();
                    let PendingChunk { activation, index } = inner
                        .pending
                        .try_remove(token as usize)
                        .ok_or(KeyflowError::UnknownRegion(token))?;
                    let entry = inner
                        .activations
                        .get_mut(activation)
                        .ok_or_else(|| internal_err!("activation {activation} vanished"))?;
                    (entry.write)(index, bytes);
                    entry.remaining -= 1;
                    if entry.remaining == 0 {
                        let mut entry = inner.activations.remove(activation);
                        Some((
                            entry.on_done.take().expect("activation delivered twice"),
                            entry.releases,
                        ))
                    } else {
                        None
                    }
                };
                if let Some((on_done, releases)) = finished {
                    on_done();
                    for (owner, completion) in releases {
                        self.send(owner, &RmaMsg::Release { completion })?;
                    }
                }
                Ok(())
            }
            RmaMsg::Release { completion } => {
                let on_release = {
                    let mut inner = self.inner.lock();
                    let region = inner
                        .regions
                        .get_mut(completion as usize)
                        .ok_or(KeyflowError::UnknownRegion(completion))?;
                    region.remaining -= 1;
                    if region.remaining == 0 {
                        inner.regions.remove(completion as usize).on_release
                    } else {
                        None
                    }
                };
                if let Some(on_release) = on_release {
                    on_release();
                }
                Ok(())
            }
        }
    }
}

impl TagHandler for RmaManager {
    fn on_message(&self, src: Rank, bytes: Vec<u8>) {
        let msg = match bincode::deserialize(&bytes) {
            Ok(msg) => msg,
            Err(err) => comm_fatal("decoding RMA message", &err.into()),
        };
        if let Err(err) = self.handle(src, msg) {
            comm_fatal("handling RMA message", &err);
        }
    }
}
