//! The materialized `(operator, key)` instance.

use std::sync::atomic::AtomicI32;

use parking_lot::Mutex;

use keyflow_data::{CopyHandle, Key};

/// Progress of one streaming input for one key.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct StreamState {
    /// Arrivals required before the slot counts as satisfied.
    pub goal: usize,
    /// Arrivals folded so far.
    pub size: usize,
}

/// Slot and stream state, guarded by the owning bucket's lock while the task
/// is in the pending table and touched single-threaded afterwards.
pub(crate) struct TaskInner {
    pub slots: Box<[Option<CopyHandle>]>,
    pub stream: Box<[StreamState]>,
}

/// A partial task: accumulated inputs for one `(operator, key)`. Ready when
/// `in_count` reaches the operator's input arity.
pub(crate) struct PartialTask<K: Key> {
    pub key: K,
    pub priority: i32,
    /// Inputs that have fully arrived (streams count once, on completion).
    /// Incremented outside the bucket lock; the increment for a deferred
    /// writer arrival happens when the deferral resolves.
    pub in_count: AtomicI32,
    pub inner: Mutex<TaskInner>,
}

pub(crate) type TaskRef<K> = std::sync::Arc<PartialTask<K>>;

impl<K: Key> PartialTask<K> {
    pub(crate) fn new(key: K, priority: i32, numins: usize, goals: &[usize]) -> TaskRef<K> {
        debug_assert_eq!(goals.len(), numins);
        std::sync::Arc::new(PartialTask {
            key,
            priority,
            in_count: AtomicI32::new(0),
            inner: Mutex::new(TaskInner {
                slots: (0..numins).map(|_| None).collect(),
                stream: goals
                    .iter()
                    .map(|&goal| StreamState { goal, size: 0 })
                    .collect(),
            }),
        })
    }
}
