//! Active-message header and envelope.

use serde::{Deserialize, Serialize};

use keyflow_errors::KeyflowResult;

/// A process index within the world, dense in `0..size`.
pub type Rank = u32;

/// `param_id` value for a keyed task with no data inputs: the message body
/// carries only keys and the receiver materializes the task directly.
pub const PARAM_KEY_ONLY: i32 = -1;

/// The pre-registered message channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Active messages addressed to an operator.
    Am,
    /// Emulated one-sided transfer control traffic.
    Rma,
    /// Termination-detection traffic. Not counted as data by [`CommStats`].
    ///
    /// [`CommStats`]: crate::CommStats
    Fence,
}

impl Tag {
    /// Number of tags, for fixed-size per-tag tables.
    pub const COUNT: usize = 3;

    /// Dense index of this tag.
    pub fn index(self) -> usize {
        match self {
            Tag::Am => 0,
            Tag::Rma => 1,
            Tag::Fence => 2,
        }
    }
}

/// Which operator entry point a message targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FnId {
    /// Deliver a value (or a key-only task) to an input.
    SetArg,
    /// Set the stream goal for a key of a streaming input.
    SetStreamSize,
    /// Close a key's stream regardless of its declared size.
    FinalizeStream,
}

/// Header of every active message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgHeader {
    /// Epoch of the sending taskpool.
    pub taskpool_id: u32,
    /// Target operator instance id; identical on every rank by construction
    /// order.
    pub op_id: u64,
    /// Target entry point.
    pub fn_id: FnId,
    /// Target input slot, or [`PARAM_KEY_ONLY`].
    pub param_id: i32,
    /// Number of keys packed at the front of the body.
    pub num_keys: u32,
}

/// One active message: header plus an opaque body the target operator knows
/// how to unpack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Message header.
    pub header: MsgHeader,
    /// Packed keys followed by the packed value (or transfer descriptors).
    pub bytes: Vec<u8>,
}

impl Envelope {
    /// Encode for the wire.
    pub fn encode(&self) -> KeyflowResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire.
    pub fn decode(bytes: &[u8]) -> KeyflowResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
