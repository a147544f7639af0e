//! The transport abstraction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::{Mutex, RwLock};

use keyflow_errors::KeyflowResult;

use crate::msg::{Rank, Tag};

/// Receives every message arriving on one tag, in arrival order, on the
/// engine's dispatch thread. Handlers must not block; heavyweight work is
/// hopped onto the worker pool by the layer above.
pub trait TagHandler: Send + Sync {
    /// Called once per arriving message.
    fn on_message(&self, src: Rank, bytes: Vec<u8>);
}

/// Data-plane frame totals, used by termination detection. Frames on
/// [`Tag::Fence`] are control traffic and excluded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommStats {
    /// Frames sent on [`Tag::Am`] and [`Tag::Rma`].
    pub data_sent: u64,
    /// Frames delivered to a handler on [`Tag::Am`] and [`Tag::Rma`].
    pub data_received: u64,
}

/// An ordered, reliable, tagged message channel between the ranks of one
/// world.
///
/// Delivery guarantees: per `(sender, receiver)` pair, frames are delivered
/// in send order regardless of tag. Send is non-blocking. A transport
/// failure is fatal; no engine retries.
pub trait CommEngine: Send + Sync + 'static {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the world.
    fn size(&self) -> usize;

    /// Install the handler for one tag. Frames arriving before registration
    /// are buffered and replayed, in order, at registration time.
    fn register_handler(&self, tag: Tag, handler: Arc<dyn TagHandler>);

    /// Queue one frame for `target`. Sending to the own rank loops back
    /// through the normal dispatch path.
    fn send(&self, target: Rank, tag: Tag, bytes: Vec<u8>) -> KeyflowResult<()>;

    /// Current data-plane frame totals.
    fn stats(&self) -> CommStats;

    /// Tear the engine down. Idempotent.
    fn shutdown(&self);
}

/// Per-tag handler registry shared by the engine implementations, including
/// the buffer-before-registration behavior and the received-frame counter.
pub(crate) struct HandlerTable {
    handlers: RwLock<[Option<Arc<dyn TagHandler>>; Tag::COUNT]>,
    /// Frames that arrived before their tag's handler was registered.
    pending: Mutex<Vec<(Tag, Rank, Vec<u8>)>>,
    data_received: AtomicU64,
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        HandlerTable {
            handlers: RwLock::new([None, None, None]),
            pending: Mutex::new(Vec::new()),
            data_received: AtomicU64::new(0),
        }
    }

    pub(crate) fn register(&self, tag: Tag, handler: Arc<dyn TagHandler>) {
        self.handlers.write()[tag.index()] = Some(Arc::clone(&handler));
        // Replay anything that arrived early, preserving arrival order.
        let replay: Vec<_> = {
            let mut pending = self.pending.lock();
            let (matching, rest) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|(t, _, _)| *t == tag);
            *pending = rest;
            matching
        };
        for (tag, src, bytes) in replay {
            self.dispatch(tag, src, bytes);
        }
    }

    pub(crate) fn dispatch(&self, tag: Tag, src: Rank, bytes: Vec<u8>) {
        let handler = self.handlers.read()[tag.index()].clone();
        match handler {
            Some(handler) => {
                if tag != Tag::Fence {
                    self.data_received.fetch_add(1, Ordering::AcqRel);
                    counter!("keyflow.comm.frames_received").increment(1);
                }
                handler.on_message(src, bytes);
            }
            None => self.pending.lock().push((tag, src, bytes)),
        }
    }

    pub(crate) fn data_received(&self) -> u64 {
        self.data_received.load(Ordering::Acquire)
    }

    /// Drop every handler and buffered frame. Handlers hold the engine's
    /// collaborators (and often the engine itself), so engines call this at
    /// shutdown to break the reference cycle.
    pub(crate) fn clear(&self) {
        *self.handlers.write() = [None, None, None];
        self.pending.lock().clear();
    }
}
