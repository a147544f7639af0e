//! Error types for the keyflow runtime.
//!
//! Every fallible public operation in the workspace returns
//! [`KeyflowResult`]. The variants mirror the runtime's failure taxonomy:
//! graph-construction (wiring) errors, runtime protocol violations, transport
//! failures, and lookup failures for identifiers that cross the wire.

use thiserror::Error;

/// Result type alias used throughout the keyflow crates.
pub type KeyflowResult<T> = Result<T, KeyflowError>;

/// All errors that can be produced by the runtime.
#[derive(Debug, Error)]
pub enum KeyflowError {
    /// An operator was constructed with the wrong number of terminal names
    /// for its input or output arity.
    #[error("operator {op}: expected {expected} {kind} terminal names, got {got}")]
    TerminalNameArity {
        /// Operator name
        op: String,
        /// `"input"` or `"output"`
        kind: &'static str,
        /// Arity of the terminal tuple
        expected: usize,
        /// Number of names supplied
        got: usize,
    },

    /// An output terminal has no downstream inputs at `make_executable` time.
    #[error("operator {op}: output terminal {terminal:?} is not connected to any input")]
    UnterminatedOutput {
        /// Operator name
        op: String,
        /// Terminal name
        terminal: String,
    },

    /// A terminal was wired after the graph was made executable.
    #[error("operator {op}: cannot connect terminal {terminal:?} after make_executable()")]
    WiringFrozen {
        /// Operator name
        op: String,
        /// Terminal name
        terminal: String,
    },

    /// A non-streaming input received a second value for the same key.
    #[error("operator {op}, key {key}: input {input} is already set")]
    InputAlreadySet {
        /// Operator name
        op: String,
        /// Debug rendering of the key
        key: String,
        /// Input slot index
        input: usize,
    },

    /// An operator was invoked before `make_executable()`.
    #[error("operator {op} is not executable; call make_executable() first")]
    NotExecutable {
        /// Operator name
        op: String,
    },

    /// A task was injected before `World::execute()` armed the taskpool.
    #[error("world is not executing; call execute() before invoking operators")]
    NotExecuting,

    /// A streaming operation targeted an input with no registered reducer.
    #[error("operator {op}: input {input} is not a streaming input")]
    NotStreaming {
        /// Operator name
        op: String,
        /// Input slot index
        input: usize,
    },

    /// `set_argstream_size` was called with a non-positive size.
    #[error("operator {op}, key {key}: stream size must be positive")]
    NonPositiveStreamSize {
        /// Operator name
        op: String,
        /// Debug rendering of the key
        key: String,
    },

    /// `finalize_argstream` was called for a key whose stream never received
    /// a value.
    #[error(
        "operator {op}, key {key}: finalize called on stream input {input} \
         that never received a value"
    )]
    FinalizeEmptyStream {
        /// Operator name
        op: String,
        /// Debug rendering of the key
        key: String,
        /// Input slot index
        input: usize,
    },

    /// A value that does not implement the split-metadata protocol was asked
    /// for its metadata descriptor.
    #[error("type {0} does not implement the split-metadata protocol")]
    NoSplitMetadata(&'static str),

    /// A message arrived for an operator id that is not registered and could
    /// not be stashed.
    #[error("no operator registered under id {0}")]
    UnknownOp(u64),

    /// An RMA message referenced a region handle that is not registered.
    #[error("unknown RMA region {0}")]
    UnknownRegion(u64),

    /// The world backing a handle has already been torn down.
    #[error("world has been finalized")]
    WorldGone,

    /// The communication layer failed. Transport errors are fatal: the
    /// runtime assumes a reliable channel underneath and never retries.
    #[error("transport: {0}")]
    Transport(String),

    /// A wire payload failed to encode or decode.
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    /// An I/O error from the transport layer.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// An unexpected internal invariant failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Construct a [`KeyflowError::Internal`] from format arguments.
#[macro_export]
macro_rules! internal_err {
    ($($args:tt)*) => {
        $crate::KeyflowError::Internal(format!($($args)*))
    };
}

/// Return early with a [`KeyflowError::Internal`] built from format
/// arguments.
#[macro_export]
macro_rules! internal {
    ($($args:tt)*) => {
        return Err($crate::internal_err!($($args)*))
    };
}
