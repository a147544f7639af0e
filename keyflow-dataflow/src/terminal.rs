//! Input and output terminals.
//!
//! An operator owns its terminals; handles are cheap to clone and safe to
//! wire from the graph-building thread. An [`In`] knows its operator and
//! slot and routes deliveries into it (locally or over the wire, decided by
//! the operator's keymap). An [`Out`] holds the downstream inputs, frozen
//! once the operator is made executable.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use keyflow_data::{Key, Value};
use keyflow_errors::{KeyflowError, KeyflowResult};

use crate::op::{Carrier, OpCore};

/// An operator's input endpoint for values of type `V`, keyed by `K`.
pub struct In<K: Key, V: Value> {
    core: Weak<OpCore<K>>,
    slot: usize,
    _marker: PhantomData<fn() -> V>,
}

impl<K: Key, V: Value> Clone for In<K, V> {
    fn clone(&self) -> Self {
        In {
            core: Weak::clone(&self.core),
            slot: self.slot,
            _marker: PhantomData,
        }
    }
}

impl<K: Key, V: Value> In<K, V> {
    pub(crate) fn new(core: Weak<OpCore<K>>, slot: usize) -> Self {
        In {
            core,
            slot,
            _marker: PhantomData,
        }
    }

    fn core(&self) -> KeyflowResult<Arc<OpCore<K>>> {
        self.core.upgrade().ok_or(KeyflowError::WorldGone)
    }

    /// Deliver `value` for `key`, sharing the source data copy when `value`
    /// refers to one of the running task's inputs.
    pub fn send(&self, key: &K, value: &V) -> KeyflowResult<()> {
        self.core()?.set_arg(self.slot, key, Carrier::Ref(value))
    }

    /// Deliver an owned `value` for `key` without copying it again.
    pub fn send_move(&self, key: &K, value: V) -> KeyflowResult<()> {
        self.core()?.set_arg(self.slot, key, Carrier::Owned(value))
    }

    /// Deliver one `value` to every key in `keys`, with one message per
    /// remote rank and one shared data copy for the local keys.
    pub fn broadcast(&self, keys: &[K], value: &V) -> KeyflowResult<()> {
        self.core()?.broadcast(self.slot, keys, value)
    }

    /// Declare how many values `key`'s stream will fold before the slot is
    /// satisfied. Forwarded to the key's owner if remote.
    pub fn set_stream_size(&self, key: &K, size: usize) -> KeyflowResult<()> {
        self.core()?.set_argstream_size(self.slot, key, size)
    }

    /// Close `key`'s stream at whatever size it has reached. Fails if the
    /// stream never received a value.
    pub fn finalize_stream(&self, key: &K) -> KeyflowResult<()> {
        self.core()?.finalize_argstream(self.slot, key)
    }

    /// Make this input streaming: arrivals for one key fold into a single
    /// accumulator through `reducer`, in arrival order. The reducer runs
    /// under the pending-table bucket lock and must be short.
    pub fn set_reducer(
        &self,
        reducer: impl Fn(&mut V, V) + Send + Sync + 'static,
    ) -> KeyflowResult<()> {
        self.core()?.set_reducer::<V>(self.slot, Box::new(reducer))
    }

    /// Default stream goal applied to every key that has no explicit
    /// [`set_stream_size`](In::set_stream_size).
    pub fn set_static_stream_size(&self, size: usize) -> KeyflowResult<()> {
        self.core()?.set_static_goal(self.slot, size)
    }
}

struct OutInner<K: Key, V: Value> {
    successors: RwLock<Vec<In<K, V>>>,
    frozen: AtomicBool,
}

/// An operator's output endpoint, connected to one or more inputs.
pub struct Out<K: Key, V: Value> {
    op: Arc<str>,
    name: Arc<str>,
    inner: Arc<OutInner<K, V>>,
}

impl<K: Key, V: Value> Clone for Out<K, V> {
    fn clone(&self) -> Self {
        Out {
            op: Arc::clone(&self.op),
            name: Arc::clone(&self.name),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key, V: Value> Out<K, V> {
    pub(crate) fn new(op: &str, name: &str) -> Self {
        Out {
            op: Arc::from(op),
            name: Arc::from(name),
            inner: Arc::new(OutInner {
                successors: RwLock::new(Vec::new()),
                frozen: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn connect_input(&self, input: &In<K, V>) -> KeyflowResult<()> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(KeyflowError::WiringFrozen {
                op: self.op.to_string(),
                terminal: self.name.to_string(),
            });
        }
        self.inner.successors.write().push(input.clone());
        Ok(())
    }

    pub(crate) fn freeze(&self, op: &str) -> KeyflowResult<()> {
        self.inner.frozen.store(true, Ordering::Release);
        if self.inner.successors.read().is_empty() {
            return Err(KeyflowError::UnterminatedOutput {
                op: op.to_owned(),
                terminal: self.name.to_string(),
            });
        }
        Ok(())
    }

    /// Emit an owned value for `key` on this terminal.
    pub fn send(&self, key: K, value: V) -> KeyflowResult<()> {
        trace!(op = %self.op, terminal = %self.name, key = ?key, "send");
        let successors = self.inner.successors.read();
        match successors.split_last() {
            None => Err(KeyflowError::UnterminatedOutput {
                op: self.op.to_string(),
                terminal: self.name.to_string(),
            }),
            Some((last, rest)) => {
                for input in rest {
                    input.send(&key, &value)?;
                }
                last.send_move(&key, value)
            }
        }
    }

    /// Emit a value by reference, so an input of the running task can flow
    /// through without a copy.
    pub fn send_ref(&self, key: &K, value: &V) -> KeyflowResult<()> {
        trace!(op = %self.op, terminal = %self.name, key = ?key, "send_ref");
        for input in self.inner.successors.read().iter() {
            input.send(key, value)?;
        }
        Ok(())
    }

    /// Emit one value to many keys; observationally `send` per key, but with
    /// one message per remote rank.
    pub fn broadcast(&self, keys: &[K], value: &V) -> KeyflowResult<()> {
        trace!(op = %self.op, terminal = %self.name, nkeys = keys.len(), "broadcast");
        for input in self.inner.successors.read().iter() {
            input.broadcast(keys, value)?;
        }
        Ok(())
    }
}
