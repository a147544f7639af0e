//! Key and value traits for the keyflow runtime, plus the refcounted
//! [`DataCopy`] layer that moves values between tasks.
//!
//! Keys identify task instances and values flow along edges. Both are packed
//! with bincode when they cross rank boundaries. Values may additionally opt
//! in to the *split-metadata* protocol, which ships a small descriptor inline
//! and moves the bulk payload through one-sided transfers.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;

use keyflow_errors::{KeyflowError, KeyflowResult};

mod copy;

pub use copy::{CopyHandle, DataCopy};

/// A task-instance key.
///
/// Keys are treated by value: the runtime clones them into tasks and into
/// outgoing messages. The unit type `()` is the *void key*, used by operators
/// with exactly one instance.
pub trait Key:
    Eq
    + std::hash::Hash
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Key for T where
    T: Eq
        + std::hash::Hash
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// A value carried on an edge.
///
/// The serde bounds define the inline wire format; [`Value::SPLIT_METADATA`]
/// and the associated methods opt a type into the split-metadata bulk
/// protocol instead. Implementations for plain types are empty:
///
/// ```
/// # use serde::{Deserialize, Serialize};
/// # use keyflow_data::Value;
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Partial(Vec<f64>);
///
/// impl Value for Partial {}
/// ```
pub trait Value: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Whether this type uses the split-metadata protocol for remote
    /// transfers. When `true`, all four methods below must be implemented.
    const SPLIT_METADATA: bool = false;

    /// The fixed-size descriptor from which an empty shell of this value can
    /// be constructed on the receiving rank.
    fn metadata(&self) -> KeyflowResult<Vec<u8>> {
        Err(KeyflowError::NoSplitMetadata(std::any::type_name::<Self>()))
    }

    /// Construct an empty shell from a descriptor produced by
    /// [`Value::metadata`]. The shell's iovecs must have their final sizes.
    fn from_metadata(_metadata: &[u8]) -> KeyflowResult<Self> {
        Err(KeyflowError::NoSplitMetadata(std::any::type_name::<Self>()))
    }

    /// The bulk payload chunks of this value, in a stable order.
    fn iovecs(&self) -> SmallVec<[&[u8]; 4]> {
        SmallVec::new()
    }

    /// Mutable views of the bulk payload chunks, in the same order as
    /// [`Value::iovecs`]. Used to fill a shell on the receiving rank.
    fn iovecs_mut(&mut self) -> SmallVec<[&mut [u8]; 4]> {
        SmallVec::new()
    }
}

macro_rules! impl_plain_value {
    ($($ty:ty),* $(,)?) => {
        $(impl Value for $ty {})*
    };
}

impl_plain_value!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize,
    f32,
    f64,
    String,
);

impl<T: Value> Value for Vec<T> {}
impl<T: Value> Value for Option<T> {}
impl<A: Value, B: Value> Value for (A, B) {}

/// Size in bytes of `value`'s inline wire encoding.
pub fn payload_size<T: Serialize>(value: &T) -> KeyflowResult<u64> {
    Ok(bincode::serialized_size(value)?)
}

/// Append `value`'s inline wire encoding to `buf`.
pub fn pack_into<T: Serialize>(value: &T, buf: &mut Vec<u8>) -> KeyflowResult<()> {
    bincode::serialize_into(buf, value)?;
    Ok(())
}

/// Decode one value from `reader`, advancing it past the encoding.
pub fn unpack_from<T: DeserializeOwned, R: io::Read>(reader: R) -> KeyflowResult<T> {
    Ok(bincode::deserialize_from(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_sequence() {
        // Keys and values are packed back to back in message bodies; make
        // sure a cursor walks the concatenation correctly.
        let mut buf = Vec::new();
        pack_into(&42u64, &mut buf).unwrap();
        pack_into(&"hello".to_owned(), &mut buf).unwrap();
        pack_into(&vec![1i64, 2, 3], &mut buf).unwrap();

        let mut cursor = io::Cursor::new(&buf[..]);
        assert_eq!(unpack_from::<u64, _>(&mut cursor).unwrap(), 42);
        assert_eq!(unpack_from::<String, _>(&mut cursor).unwrap(), "hello");
        assert_eq!(
            unpack_from::<Vec<i64>, _>(&mut cursor).unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(cursor.position() as usize, buf.len());
    }

    #[test]
    fn plain_values_have_no_metadata() {
        assert!(!u64::SPLIT_METADATA);
        assert!(7u64.metadata().is_err());
        assert!(7u64.iovecs().is_empty());
    }
}
