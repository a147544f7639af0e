//! TCP mesh transport.
//!
//! Every rank listens on its configured address and owns one outbound
//! connection per peer, dialed lazily with backoff at startup. A connection
//! carries frames in one direction only, which keeps per-channel ordering
//! trivial: the receiving side learns the sender from the frame itself.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_bincode::tokio::{AsyncBincodeReader, AsyncBincodeWriter};
use exponential_backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use keyflow_errors::{KeyflowError, KeyflowResult};

use crate::engine::{CommEngine, CommStats, HandlerTable, TagHandler};
use crate::msg::{Rank, Tag};

/// Addressing for one rank of a TCP world.
#[derive(Clone, Debug, Deserialize)]
pub struct TcpConfig {
    /// This process's rank.
    pub rank: Rank,
    /// Address this rank listens on.
    pub listen: SocketAddr,
    /// Listen addresses of every rank, indexed by rank. `peers[rank]` must
    /// equal `listen`.
    pub peers: Vec<SocketAddr>,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    src: Rank,
    tag: Tag,
    bytes: Vec<u8>,
}

/// A [`CommEngine`] over a mesh of TCP connections.
pub struct TcpComm {
    rank: Rank,
    size: usize,
    handlers: Arc<HandlerTable>,
    outbound: Vec<Option<mpsc::UnboundedSender<WireFrame>>>,
    data_sent: AtomicU64,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl TcpComm {
    /// Start the engine: bind the listener, then dial every peer in the
    /// background. Frames queued before a dial completes are flushed once it
    /// does.
    pub fn new(config: TcpConfig) -> KeyflowResult<Arc<Self>> {
        let size = config.peers.len();
        if config.rank as usize >= size {
            return Err(KeyflowError::Transport(format!(
                "rank {} out of range for a world of {size}",
                config.rank
            )));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("keyflow-tcp-comm-{}", config.rank))
            .enable_all()
            .build()?;

        let handlers = Arc::new(HandlerTable::new());
        let listener = runtime.block_on(TcpListener::bind(config.listen))?;
        info!(rank = config.rank, addr = %config.listen, "listening");

        // Accept loop: one reader task per inbound connection.
        {
            let handlers = Arc::clone(&handlers);
            runtime.spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted comm connection");
                            let handlers = Arc::clone(&handlers);
                            tokio::spawn(read_frames(stream, handlers));
                        }
                        Err(err) => {
                            error!(%err, "accept failed; comm listener exiting");
                            break;
                        }
                    }
                }
            });
        }

        // One outbound writer task per peer.
        let mut outbound = Vec::with_capacity(size);
        for (peer_rank, addr) in config.peers.iter().enumerate() {
            if peer_rank == config.rank as usize {
                outbound.push(None);
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            runtime.spawn(write_frames(*addr, rx));
            outbound.push(Some(tx));
        }

        Ok(Arc::new(TcpComm {
            rank: config.rank,
            size,
            handlers,
            outbound,
            data_sent: AtomicU64::new(0),
            runtime: Mutex::new(Some(runtime)),
        }))
    }
}

async fn read_frames(stream: TcpStream, handlers: Arc<HandlerTable>) {
    let mut reader = AsyncBincodeReader::<TcpStream, WireFrame>::from(stream);
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(frame) => handlers.dispatch(frame.tag, frame.src, frame.bytes),
            Err(err) => {
                // A peer closing cleanly at shutdown also lands here; real
                // mid-run transport failures are fatal one layer up when the
                // counters stop draining.
                debug!(%err, "comm connection closed");
                break;
            }
        }
    }
}

async fn write_frames(addr: SocketAddr, mut rx: mpsc::UnboundedReceiver<WireFrame>) {
    let backoff = Backoff::new(10, Duration::from_millis(50), Duration::from_secs(2));
    let mut stream = None;
    for duration in &backoff {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(err) => match duration {
                Some(wait) => {
                    debug!(%addr, %err, "dial failed; retrying");
                    tokio::time::sleep(wait).await;
                }
                None => {
                    error!(%addr, %err, "could not reach peer");
                    std::process::abort();
                }
            },
        }
    }
    let stream = stream.expect("backoff loop either connects or aborts");
    let _ = stream.set_nodelay(true);

    let mut writer = AsyncBincodeWriter::from(stream).for_async();
    while let Some(frame) = rx.recv().await {
        if let Err(err) = writer.send(frame).await {
            error!(%addr, %err, "comm send failed");
            std::process::abort();
        }
    }
}

impl CommEngine for TcpComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn register_handler(&self, tag: Tag, handler: Arc<dyn TagHandler>) {
        self.handlers.register(tag, handler);
    }

    fn send(&self, target: Rank, tag: Tag, bytes: Vec<u8>) -> KeyflowResult<()> {
        if target as usize >= self.size {
            return Err(KeyflowError::Transport(format!("no such rank {target}")));
        }
        if tag != Tag::Fence {
            self.data_sent.fetch_add(1, Ordering::AcqRel);
            metrics::counter!("keyflow.comm.frames_sent").increment(1);
        }
        if target == self.rank {
            self.handlers.dispatch(tag, self.rank, bytes);
            return Ok(());
        }
        let sender = self.outbound[target as usize]
            .as_ref()
            .expect("outbound slot exists for every non-local rank");
        sender
            .send(WireFrame {
                src: self.rank,
                tag,
                bytes,
            })
            .map_err(|_| KeyflowError::Transport(format!("connection to rank {target} is gone")))
    }

    fn stats(&self) -> CommStats {
        CommStats {
            data_sent: self.data_sent.load(Ordering::Acquire),
            data_received: self.handlers.data_received(),
        }
    }

    fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            self.handlers.clear();
        }
    }
}

impl Drop for TcpComm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
