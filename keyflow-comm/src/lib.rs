//! Communication layer for the keyflow runtime.
//!
//! Everything that crosses a rank boundary goes through a [`CommEngine`]: an
//! ordered, reliable, tagged message channel. Two engines are provided: an
//! in-process [`LocalCluster`](local::LocalCluster) used by tests and
//! single-process deployments, and a tokio TCP mesh
//! ([`TcpComm`](tcp::TcpComm)) for multi-process runs.
//!
//! On top of the raw channel sit the active-message envelope
//! ([`msg::Envelope`]), an emulated one-sided transfer protocol for
//! split-metadata values ([`rma::RmaManager`]), and the termination-detection
//! machinery that backs `World::fence` ([`termination`]).

pub mod engine;
pub mod local;
pub mod msg;
pub mod rma;
pub mod tcp;
pub mod termination;

pub use engine::{CommEngine, CommStats, TagHandler};
pub use msg::{Envelope, FnId, MsgHeader, Rank, Tag, PARAM_KEY_ONLY};
pub use rma::{ChunkDesc, RmaManager};
pub use termination::{CountingDetector, FenceCoordinator, TaskCounts, TerminationDetector};

/// Abort on an unrecoverable communication-path error.
///
/// There is no caller to return an error to on the message-dispatch path,
/// and the runtime assumes a reliable transport, so anything that goes wrong
/// here is fatal by design.
pub(crate) fn comm_fatal(context: &str, err: &keyflow_errors::KeyflowError) -> ! {
    tracing::error!(%err, "fatal error on communication path: {context}");
    std::process::abort();
}
