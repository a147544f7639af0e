//! The per-operator pending-task table.
//!
//! A fixed number of buckets, each an independently-locked hash map. The
//! critical section around an arrival is one lookup (plus task creation on
//! the first arrival for a key); streaming reducers also run under the
//! bucket lock, which is why reducers must be short and must not block.

use std::sync::Arc;

use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard};

use keyflow_data::Key;

use crate::task::TaskRef;

const BUCKET_COUNT: usize = 256;

type Bucket<K> = std::collections::HashMap<K, TaskRef<K>, RandomState>;

pub(crate) struct PendingTable<K: Key> {
    buckets: Box<[Mutex<Bucket<K>>]>,
    hasher: RandomState,
}

impl<K: Key> PendingTable<K> {
    pub(crate) fn new() -> Self {
        PendingTable {
            buckets: (0..BUCKET_COUNT)
                .map(|_| Mutex::new(Bucket::default()))
                .collect(),
            hasher: RandomState::new(),
        }
    }

    /// Lock the bucket that owns `key`.
    pub(crate) fn lock_bucket(&self, key: &K) -> MutexGuard<'_, Bucket<K>> {
        let index = self.hasher.hash_one(key) as usize % BUCKET_COUNT;
        self.buckets[index].lock()
    }

    /// Remove `task` if it is still in the table. Pointer identity guards
    /// against removing a newer task that reused the same key.
    pub(crate) fn remove_task(&self, task: &TaskRef<K>) {
        let mut bucket = self.lock_bucket(&task.key);
        if bucket
            .get(&task.key)
            .is_some_and(|entry| Arc::ptr_eq(entry, task))
        {
            bucket.remove(&task.key);
        }
    }

    /// Unsynchronized sweep over all pending tasks. Only used for teardown
    /// diagnostics, when no arrivals can race.
    pub(crate) fn for_all(&self, mut f: impl FnMut(&TaskRef<K>)) {
        for bucket in self.buckets.iter() {
            for task in bucket.lock().values() {
                f(task);
            }
        }
    }
}
