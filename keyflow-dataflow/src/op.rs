//! Operators: the template-task definition and its dispatch engine.
//!
//! An [`Op`] is a keyed task template: input terminals feeding a pending
//! task per key, a body that runs when all inputs have arrived, and output
//! terminals that route emissions onward. The type-erased core
//! ([`OpCore`]) carries what the hot paths need (keymap, priomap, per-slot
//! facts, the pending table, and handles to the world's pool, engine, and
//! detector) while the typed surface lives in the terminal tuples.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use keyflow_comm::{
    ChunkDesc, CommEngine, Envelope, FnId, MsgHeader, Rank, RmaManager, Tag, TerminationDetector,
    PARAM_KEY_ONLY,
};
use keyflow_data::{pack_into, unpack_from, CopyHandle, DataCopy, Key, Value};
use keyflow_errors::{internal_err, KeyflowError, KeyflowResult};

use crate::current;
use crate::pool::{ReadyBatch, WorkerPool};
use crate::recorded;
use crate::slots::{InputSet, OutputSet};
use crate::table::PendingTable;
use crate::task::{PartialTask, TaskRef};
use crate::world::{OpDispatch, World};

/// How a value arrives at a `set_arg` call site.
pub(crate) enum Carrier<'a, V: Value> {
    /// An owned value; the binding adopts it into a fresh data copy.
    Owned(V),
    /// A reference, possibly into one of the running task's bound copies,
    /// in which case the copy itself is handed over instead of a clone.
    Ref(&'a V),
    /// A copy held by a delivery context (key-list or broadcast fan-out).
    Existing(CopyHandle),
}

/// Reducer for one streaming input, stored type-erased on the slot.
struct Reducer<V: Value>(Box<dyn Fn(&mut V, V) + Send + Sync>);

/// Static and configured facts about one input slot.
struct Slot<K: Key> {
    is_const: bool,
    deliver_msg: DeliverMsg<K>,
    reducer: RwLock<Option<Box<dyn std::any::Any + Send + Sync>>>,
    static_goal: AtomicUsize,
}

impl<K: Key> Slot<K> {
    fn has_reducer(&self) -> bool {
        self.reducer.read().is_some()
    }
}

type DeliverMsg<K> = fn(&Arc<OpCore<K>>, usize, Vec<K>, &[u8], Rank) -> KeyflowResult<()>;

/// Per-slot facts collected from the typed input tuple.
#[doc(hidden)]
pub struct SlotDecl<K: Key> {
    pub(crate) is_const: bool,
    #[allow(dead_code)] // recorded for diagnostics; senders re-check the const
    pub(crate) split_metadata: bool,
    pub(crate) deliver_msg: DeliverMsg<K>,
}

type Keymap<K> = Box<dyn Fn(&K) -> Rank + Send + Sync>;
type Priomap<K> = Box<dyn Fn(&K) -> i32 + Send + Sync>;
type BodyFn<K> = Box<dyn Fn(&K, &[CopyHandle]) -> KeyflowResult<()> + Send + Sync>;

/// Type-erased operator core. Public only because the terminal tuples name
/// it in their signatures.
#[doc(hidden)]
pub struct OpCore<K: Key> {
    name: String,
    id: u64,
    rank: Rank,
    engine: Arc<dyn CommEngine>,
    detector: Arc<dyn TerminationDetector>,
    pool: WorkerPool,
    rma: Arc<RmaManager>,
    epoch: Arc<AtomicU32>,
    numins: usize,
    innames: Vec<String>,
    keymap: RwLock<Keymap<K>>,
    priomap: RwLock<Priomap<K>>,
    slots: Box<[Slot<K>]>,
    table: PendingTable<K>,
    body: BodyFn<K>,
    executable: AtomicBool,
}

impl<K: Key> OpCore<K> {
    fn new(
        world: &World,
        name: String,
        innames: Vec<String>,
        decls: Vec<SlotDecl<K>>,
        body: BodyFn<K>,
    ) -> Arc<Self> {
        let size = world.size() as u64;
        let default_keymap: Keymap<K> =
            Box::new(move |key| (keyflow_util::hash64(key) % size) as Rank);
        Arc::new(OpCore {
            name,
            id: world.alloc_op_id(),
            rank: world.rank(),
            engine: world.engine(),
            detector: world.detector(),
            pool: world.pool(),
            rma: world.rma(),
            epoch: world.epoch_handle(),
            numins: decls.len(),
            innames,
            keymap: RwLock::new(default_keymap),
            priomap: RwLock::new(Box::new(|_| 0)),
            slots: decls
                .into_iter()
                .map(|decl| Slot {
                    is_const: decl.is_const,
                    deliver_msg: decl.deliver_msg,
                    reducer: RwLock::new(None),
                    static_goal: AtomicUsize::new(1),
                })
                .collect(),
            table: PendingTable::new(),
            body,
            executable: AtomicBool::new(false),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn keymap_rank(&self, key: &K) -> Rank {
        (self.keymap.read())(key)
    }

    fn priority(&self, key: &K) -> i32 {
        (self.priomap.read())(key)
    }

    pub(crate) fn set_keymap(&self, keymap: Keymap<K>) {
        *self.keymap.write() = keymap;
    }

    pub(crate) fn set_priomap(&self, priomap: Priomap<K>) {
        *self.priomap.write() = priomap;
    }

    pub(crate) fn set_reducer<V: Value>(
        &self,
        slot: usize,
        reducer: Box<dyn Fn(&mut V, V) + Send + Sync>,
    ) -> KeyflowResult<()> {
        *self.slots[slot].reducer.write() = Some(Box::new(Reducer::<V>(reducer)));
        Ok(())
    }

    pub(crate) fn set_static_goal(&self, slot: usize, size: usize) -> KeyflowResult<()> {
        if size == 0 {
            return Err(KeyflowError::NonPositiveStreamSize {
                op: self.name.clone(),
                key: "<static>".to_owned(),
            });
        }
        self.slots[slot].static_goal.store(size, Ordering::Release);
        Ok(())
    }

    fn new_task(&self, key: K) -> TaskRef<K> {
        let priority = self.priority(&key);
        let goals: SmallVec<[usize; 4]> = self
            .slots
            .iter()
            .map(|slot| slot.static_goal.load(Ordering::Acquire))
            .collect();
        self.detector.task_created();
        counter!(recorded::TASKS_CREATED).increment(1);
        trace!(op = %self.name, key = ?key, "creating task");
        PartialTask::new(key, priority, self.numins, &goals)
    }

    /// Route one value: local delivery if this rank owns the key, otherwise
    /// an active message to the owner.
    pub(crate) fn set_arg<V: Value>(
        self: &Arc<Self>,
        slot: usize,
        key: &K,
        carrier: Carrier<'_, V>,
    ) -> KeyflowResult<()> {
        let owner = self.keymap_rank(key);
        if owner == self.rank {
            self.set_arg_local(slot, key, carrier, None)
        } else {
            self.send_remote(slot, owner, key, carrier)
        }
    }

    /// Deliver one value into the pending table. The caller already
    /// established that this rank owns the key.
    fn set_arg_local<V: Value>(
        self: &Arc<Self>,
        slot: usize,
        key: &K,
        carrier: Carrier<'_, V>,
        mut batch: Option<&mut ReadyBatch>,
    ) -> KeyflowResult<()> {
        trace!(
            op = %self.name,
            key = ?key,
            input = %self.innames[slot],
            "received value for input"
        );
        debug_assert_eq!(self.keymap_rank(key), self.rank);
        let slot_info = &self.slots[slot];
        let has_reducer = slot_info.has_reducer();

        // A single, non-streaming input never needs the table.
        if self.numins == 1 && !has_reducer {
            let task = self.new_task(key.clone());
            let (copy, deferred) = self.bind_copy::<V>(slot_info.is_const, carrier, &task);
            task.inner.lock().slots[slot] = Some(copy);
            if !deferred {
                self.release_task(&task, batch.as_deref_mut());
            }
            return Ok(());
        }

        enum Outcome {
            Release,
            Pending,
            Deferred,
        }

        let (task, outcome) = {
            let mut bucket = self.table.lock_bucket(key);
            let task = match bucket.get(key) {
                Some(task) => Arc::clone(task),
                None => {
                    let task = self.new_task(key.clone());
                    bucket.insert(key.clone(), Arc::clone(&task));
                    task
                }
            };

            if has_reducer {
                let mut inner = task.inner.lock();
                self.fold_stream::<V>(slot, &mut inner.slots[slot], carrier)?;
                inner.stream[slot].size += 1;
                let release = inner.stream[slot].size == inner.stream[slot].goal;
                drop(inner);
                (task, if release { Outcome::Release } else { Outcome::Pending })
            } else {
                let mut inner = task.inner.lock();
                if inner.slots[slot].is_some() {
                    return Err(KeyflowError::InputAlreadySet {
                        op: self.name.clone(),
                        key: format!("{key:?}"),
                        input: slot,
                    });
                }
                let (copy, deferred) = self.bind_copy::<V>(slot_info.is_const, carrier, &task);
                inner.slots[slot] = Some(copy);
                drop(inner);
                (task, if deferred { Outcome::Deferred } else { Outcome::Release })
            }
        };

        if matches!(outcome, Outcome::Release) {
            self.release_task(&task, batch);
        }
        Ok(())
    }

    /// Fold one stream arrival into the accumulator slot. Runs under the
    /// bucket lock.
    fn fold_stream<V: Value>(
        &self,
        slot: usize,
        acc: &mut Option<CopyHandle>,
        carrier: Carrier<'_, V>,
    ) -> KeyflowResult<()> {
        match acc {
            None => {
                // First arrival seeds the accumulator. The accumulator is
                // mutated by later folds, so it always gets a private copy.
                let copy = match carrier {
                    Carrier::Owned(value) => DataCopy::new(value),
                    Carrier::Ref(value) => DataCopy::new(value.clone()),
                    Carrier::Existing(copy) => copy.fork(),
                };
                *acc = Some(copy);
            }
            Some(copy) => {
                let rhs: V = match carrier {
                    Carrier::Owned(value) => value,
                    Carrier::Ref(value) => value.clone(),
                    // SAFETY: the delivery context holds a read hold on the
                    // carried copy for the duration of the call.
                    Carrier::Existing(shared) => unsafe { shared.value::<V>() }.clone(),
                };
                let guard = self.slots[slot].reducer.read();
                let reducer = guard
                    .as_ref()
                    .and_then(|any| any.downcast_ref::<Reducer<V>>())
                    .ok_or_else(|| {
                        internal_err!("reducer type mismatch on {}[{slot}]", self.name)
                    })?;
                // SAFETY: the accumulator copy is owned by the pending table
                // alone and the bucket lock serializes all folds.
                (reducer.0)(unsafe { copy.value_mut::<V>() }, rhs);
            }
        }
        Ok(())
    }

    /// Turn a carrier into the copy bound into a task slot, registering for
    /// read or write according to the slot's constness. Returns the copy and
    /// whether the arrival's release is deferred behind a writer grant.
    fn bind_copy<V: Value>(
        self: &Arc<Self>,
        is_const: bool,
        carrier: Carrier<'_, V>,
        task: &TaskRef<K>,
    ) -> (CopyHandle, bool) {
        match carrier {
            Carrier::Owned(value) => (DataCopy::new(value), false),
            Carrier::Ref(value) => {
                match current::find_copy(value as *const V as *const u8) {
                    None => (DataCopy::new(value.clone()), false),
                    Some(copy) => self.adopt_copy::<V>(is_const, copy, Some(value), task),
                }
            }
            Carrier::Existing(copy) => self.adopt_copy::<V>(is_const, copy, None, task),
        }
    }

    fn adopt_copy<V: Value>(
        self: &Arc<Self>,
        is_const: bool,
        copy: CopyHandle,
        source: Option<&V>,
        task: &TaskRef<K>,
    ) -> (CopyHandle, bool) {
        // `source` is the caller's own reference; cloning through it instead
        // of the copy avoids touching a payload some body may hold mutably.
        let clone_value = |copy: &CopyHandle| match source {
            Some(value) => DataCopy::new(value.clone()),
            None => copy.fork(),
        };

        if is_const {
            match copy.try_register_read() {
                Some(handle) => (handle, false),
                // A writer is pending: fork the pre-mutation value.
                None => (clone_value(&copy), false),
            }
        } else {
            let core = Arc::clone(self);
            let deferred_task = Arc::clone(task);
            match copy.register_write(move || core.release_task(&deferred_task, None)) {
                Some(handle) => (handle, true),
                // Other holders exist: mutate a private fork instead.
                None => (clone_value(&copy), false),
            }
        }
    }

    /// Count one completed input arrival; when the task becomes ready, pull
    /// it from the table and hand it to the pool.
    pub(crate) fn release_task(
        self: &Arc<Self>,
        task: &TaskRef<K>,
        batch: Option<&mut ReadyBatch>,
    ) {
        let count = task.in_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(count as usize <= self.numins);
        if count as usize == self.numins {
            self.table.remove_task(task);
            self.schedule(Arc::clone(task), batch);
        }
    }

    fn schedule(self: &Arc<Self>, task: TaskRef<K>, batch: Option<&mut ReadyBatch>) {
        self.detector.task_scheduled();
        counter!(recorded::TASKS_SCHEDULED).increment(1);
        trace!(op = %self.name, key = ?task.key, "submitting task");
        let core = Arc::clone(self);
        let priority = task.priority;
        let job = Box::new(move || core.run_task(task));
        match batch {
            Some(batch) => batch.push(priority, job),
            None => self.pool.submit(priority, job),
        }
    }

    /// Body execution on a worker thread.
    fn run_task(self: &Arc<Self>, task: TaskRef<K>) {
        let copies: SmallVec<[CopyHandle; 4]> = {
            let inner = task.inner.lock();
            inner
                .slots
                .iter()
                .map(|slot| slot.clone().expect("ready task has all inputs bound"))
                .collect()
        };

        trace!(op = %self.name, key = ?task.key, "executing");
        let result = {
            let _scope = current::enter(&copies);
            (self.body)(&task.key, &copies)
        };
        if let Err(err) = result {
            error!(
                op = %self.name,
                key = ?task.key,
                %err,
                "task body failed; aborting"
            );
            std::process::abort();
        }

        for copy in &copies {
            if copy.is_writer_held() {
                copy.finish_write();
            }
            copy.release();
        }
        task.inner.lock().slots.iter_mut().for_each(|slot| *slot = None);

        self.detector.task_completed();
        counter!(recorded::TASKS_EXECUTED).increment(1);
        trace!(op = %self.name, key = ?task.key, "done executing");
    }

    /// Inject a task for an operator with no data inputs.
    pub(crate) fn invoke_keyonly(self: &Arc<Self>, key: &K) -> KeyflowResult<()> {
        debug_assert_eq!(self.numins, 0);
        let owner = self.keymap_rank(key);
        if owner == self.rank {
            let task = self.new_task(key.clone());
            self.schedule(task, None);
            Ok(())
        } else {
            let mut bytes = Vec::new();
            pack_into(key, &mut bytes)?;
            self.send_envelope(owner, FnId::SetArg, PARAM_KEY_ONLY, 1, bytes)
        }
    }

    fn send_envelope(
        &self,
        target: Rank,
        fn_id: FnId,
        param_id: i32,
        num_keys: u32,
        bytes: Vec<u8>,
    ) -> KeyflowResult<()> {
        let envelope = Envelope {
            header: MsgHeader {
                taskpool_id: self.epoch.load(Ordering::Acquire),
                op_id: self.id,
                fn_id,
                param_id,
                num_keys,
            },
            bytes,
        };
        counter!(recorded::MESSAGES_SENT).increment(1);
        self.engine.send(target, Tag::Am, envelope.encode()?)
    }

    fn send_remote<V: Value>(
        self: &Arc<Self>,
        slot: usize,
        owner: Rank,
        key: &K,
        carrier: Carrier<'_, V>,
    ) -> KeyflowResult<()> {
        if V::SPLIT_METADATA {
            let lease = match carrier {
                Carrier::Owned(value) => DataCopy::new(value),
                Carrier::Ref(value) => current::find_copy(value as *const V as *const u8)
                    .and_then(|copy| copy.try_register_read())
                    .unwrap_or_else(|| DataCopy::new(value.clone())),
                Carrier::Existing(copy) => copy.register_read(),
            };
            return self.splitmd_send::<V>(slot, vec![(owner, vec![key.clone()])], lease);
        }

        let mut bytes = Vec::new();
        pack_into(key, &mut bytes)?;
        match &carrier {
            Carrier::Owned(value) => pack_into(value, &mut bytes)?,
            Carrier::Ref(value) => pack_into(*value, &mut bytes)?,
            // SAFETY: the delivery context holds a read hold on the copy.
            Carrier::Existing(copy) => pack_into(unsafe { copy.value::<V>() }, &mut bytes)?,
        }
        self.send_envelope(owner, FnId::SetArg, slot as i32, 1, bytes)
    }

    /// Ship a split-metadata value to one or more remote ranks: descriptor
    /// and transfer handles inline, bulk chunks pulled by the receivers.
    /// `lease` is one read hold on the source copy, consumed here.
    fn splitmd_send<V: Value>(
        self: &Arc<Self>,
        slot: usize,
        groups: Vec<(Rank, Vec<K>)>,
        lease: CopyHandle,
    ) -> KeyflowResult<()> {
        let receivers = groups.len();
        // SAFETY: `lease` is a read hold taken by the caller.
        let (metadata, iov_sizes) = {
            let value = unsafe { lease.value::<V>() };
            let sizes: Vec<usize> = value.iovecs().iter().map(|chunk| chunk.len()).collect();
            (value.metadata()?, sizes)
        };

        let chunks: Vec<ChunkDesc> = iov_sizes
            .iter()
            .enumerate()
            .map(|(index, &nbytes)| {
                // Each exposed region carries its own read hold, dropped when
                // the last receiver releases.
                let region_lease = lease.register_read();
                let read_handle = region_lease.clone();
                let region = self.rma.expose(
                    // SAFETY: `read_handle` keeps a read hold for the
                    // region's whole registration.
                    Box::new(move || unsafe { read_handle.value::<V>() }.iovecs()[index].to_vec()),
                    Box::new(move || region_lease.release()),
                    receivers,
                );
                ChunkDesc {
                    region,
                    nbytes: nbytes as u64,
                    completion: region,
                }
            })
            .collect();

        for (owner, keys) in groups {
            let mut bytes = Vec::new();
            for key in &keys {
                pack_into(key, &mut bytes)?;
            }
            pack_into(&metadata, &mut bytes)?;
            pack_into(&self.rank, &mut bytes)?;
            pack_into(&chunks, &mut bytes)?;
            self.send_envelope(owner, FnId::SetArg, slot as i32, keys.len() as u32, bytes)?;
        }

        lease.release();
        Ok(())
    }

    /// One value to many keys: partition by owner, one message per remote
    /// rank, one shared copy for the local keys.
    pub(crate) fn broadcast<V: Value>(
        self: &Arc<Self>,
        slot: usize,
        keys: &[K],
        value: &V,
    ) -> KeyflowResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut local: Vec<K> = Vec::new();
        let mut remote: BTreeMap<Rank, Vec<K>> = BTreeMap::new();
        for key in keys {
            let owner = self.keymap_rank(key);
            if owner == self.rank {
                local.push(key.clone());
            } else {
                remote.entry(owner).or_default().push(key.clone());
            }
        }

        let src_copy = current::find_copy(value as *const V as *const u8);

        if !remote.is_empty() {
            if V::SPLIT_METADATA {
                let lease = src_copy
                    .as_ref()
                    .and_then(|copy| copy.try_register_read())
                    .unwrap_or_else(|| DataCopy::new(value.clone()));
                self.splitmd_send::<V>(slot, remote.into_iter().collect(), lease)?;
            } else {
                let mut value_bytes = Vec::new();
                pack_into(value, &mut value_bytes)?;
                for (owner, owner_keys) in &remote {
                    let mut bytes = Vec::new();
                    for key in owner_keys {
                        pack_into(key, &mut bytes)?;
                    }
                    bytes.extend_from_slice(&value_bytes);
                    self.send_envelope(
                        *owner,
                        FnId::SetArg,
                        slot as i32,
                        owner_keys.len() as u32,
                        bytes,
                    )?;
                }
            }
        }

        if !local.is_empty() {
            let copy = src_copy
                .and_then(|copy| copy.try_register_read())
                .unwrap_or_else(|| DataCopy::new(value.clone()));
            let mut batch = ReadyBatch::default();
            for key in &local {
                self.set_arg_local::<V>(slot, key, Carrier::Existing(copy.clone()), Some(&mut batch))?;
            }
            copy.release();
            batch.submit(&self.pool);
        }
        Ok(())
    }

    /// Deliver one received value to a batch of keys, all owned here.
    fn deliver_keylist<V: Value>(self: &Arc<Self>, slot: usize, keys: Vec<K>, copy: CopyHandle) {
        let mut batch = ReadyBatch::default();
        for key in &keys {
            if let Err(err) =
                self.set_arg_local::<V>(slot, key, Carrier::Existing(copy.clone()), Some(&mut batch))
            {
                error!(op = %self.name, key = ?key, %err, "message delivery failed; aborting");
                std::process::abort();
            }
        }
        copy.release();
        batch.submit(&self.pool);
    }

    /// Key-list delivery, hopping onto an urgent pool task when a reducer is
    /// involved or the batch is larger than one, to keep the communication
    /// thread responsive.
    fn deliver_keylist_dispatch<V: Value>(
        self: &Arc<Self>,
        slot: usize,
        keys: Vec<K>,
        copy: CopyHandle,
    ) {
        let needs_task = self.slots[slot].has_reducer() || keys.len() > 1;
        if !needs_task {
            self.deliver_keylist::<V>(slot, keys, copy);
            return;
        }
        let core = Arc::clone(self);
        self.detector.task_created();
        counter!(recorded::TASKS_CREATED).increment(1);
        self.detector.task_scheduled();
        counter!(recorded::TASKS_SCHEDULED).increment(1);
        self.pool.submit(
            i32::MAX,
            Box::new(move || {
                core.deliver_keylist::<V>(slot, keys, copy);
                core.detector.task_completed();
                counter!(recorded::TASKS_EXECUTED).increment(1);
            }),
        );
    }

    fn argstream_slot_check(&self, slot: usize) -> KeyflowResult<()> {
        if !self.slots[slot].has_reducer() {
            return Err(KeyflowError::NotStreaming {
                op: self.name.clone(),
                input: slot,
            });
        }
        Ok(())
    }

    /// Declare the stream goal for one key, forwarding to the owner rank if
    /// necessary.
    pub(crate) fn set_argstream_size(
        self: &Arc<Self>,
        slot: usize,
        key: &K,
        size: usize,
    ) -> KeyflowResult<()> {
        self.argstream_slot_check(slot)?;
        if size == 0 {
            return Err(KeyflowError::NonPositiveStreamSize {
                op: self.name.clone(),
                key: format!("{key:?}"),
            });
        }
        let owner = self.keymap_rank(key);
        if owner == self.rank {
            self.argstream_size_local(slot, key, size)
        } else {
            debug!(op = %self.name, key = ?key, slot, size, "forwarding stream size to owner");
            let mut bytes = Vec::new();
            pack_into(key, &mut bytes)?;
            pack_into(&(size as u64), &mut bytes)?;
            self.send_envelope(owner, FnId::SetStreamSize, slot as i32, 1, bytes)
        }
    }

    fn argstream_size_local(
        self: &Arc<Self>,
        slot: usize,
        key: &K,
        size: usize,
    ) -> KeyflowResult<()> {
        debug!(op = %self.name, key = ?key, slot, size, "setting stream size");
        let task = {
            let mut bucket = self.table.lock_bucket(key);
            let task = match bucket.get(key) {
                Some(task) => Arc::clone(task),
                None => {
                    let task = self.new_task(key.clone());
                    bucket.insert(key.clone(), Arc::clone(&task));
                    task
                }
            };
            let mut inner = task.inner.lock();
            inner.stream[slot].goal = size;
            let release = inner.stream[slot].size == size;
            drop(inner);
            release.then_some(task)
        };
        if let Some(task) = task {
            self.release_task(&task, None);
        }
        Ok(())
    }

    /// Close one key's stream regardless of its declared goal. The stream
    /// must have received at least one value.
    pub(crate) fn finalize_argstream(self: &Arc<Self>, slot: usize, key: &K) -> KeyflowResult<()> {
        self.argstream_slot_check(slot)?;
        let owner = self.keymap_rank(key);
        if owner != self.rank {
            debug!(op = %self.name, key = ?key, slot, "forwarding stream finalize to owner");
            let mut bytes = Vec::new();
            pack_into(key, &mut bytes)?;
            return self.send_envelope(owner, FnId::FinalizeStream, slot as i32, 1, bytes);
        }

        debug!(op = %self.name, key = ?key, slot, "finalizing stream");
        let empty_stream = || KeyflowError::FinalizeEmptyStream {
            op: self.name.clone(),
            key: format!("{key:?}"),
            input: slot,
        };
        let task = {
            let bucket = self.table.lock_bucket(key);
            let task = bucket.get(key).map(Arc::clone).ok_or_else(empty_stream)?;
            let mut inner = task.inner.lock();
            if inner.stream[slot].size == 0 {
                return Err(empty_stream());
            }
            inner.stream[slot].goal = inner.stream[slot].size;
            drop(inner);
            task
        };
        self.release_task(&task, None);
        Ok(())
    }

    fn report_leftovers(&self) {
        self.table.for_all(|task| {
            warn!(op = %self.name, key = ?task.key, "unexecuted task left over");
        });
    }
}

/// Message-delivery entry point for one slot, monomorphized over the slot's
/// value type and installed as a plain function pointer.
#[doc(hidden)]
pub fn deliver_msg<K: Key, V: Value>(
    core: &Arc<OpCore<K>>,
    slot: usize,
    keys: Vec<K>,
    bytes: &[u8],
    src: Rank,
) -> KeyflowResult<()> {
    let mut cursor = io::Cursor::new(bytes);
    if V::SPLIT_METADATA {
        let metadata: Vec<u8> = unpack_from(&mut cursor)?;
        let remote: Rank = unpack_from(&mut cursor)?;
        let chunks: Vec<ChunkDesc> = unpack_from(&mut cursor)?;
        debug_assert_eq!(remote, src);

        let shell = V::from_metadata(&metadata)?;
        if chunks.is_empty() {
            let copy = DataCopy::new(shell);
            core.deliver_keylist_dispatch::<V>(slot, keys, copy);
            return Ok(());
        }

        // The shell is filled chunk by chunk as transfers complete, then
        // delivered exactly once by the activation's completion.
        let shell = Arc::new(parking_lot::Mutex::new(Some(shell)));
        let write_shell = Arc::clone(&shell);
        let core = Arc::clone(core);
        core.rma.clone().fetch(
            remote,
            chunks,
            move |index, bytes| {
                let mut guard = write_shell.lock();
                let value = guard.as_mut().expect("chunk after delivery");
                value.iovecs_mut()[index].copy_from_slice(&bytes);
            },
            move || {
                let value = shell.lock().take().expect("shell delivered twice");
                let copy = DataCopy::new(value);
                core.deliver_keylist_dispatch::<V>(slot, keys, copy);
            },
        )
    } else {
        let value: V = unpack_from(&mut cursor)?;
        core.deliver_keylist_dispatch::<V>(slot, keys, DataCopy::new(value));
        Ok(())
    }
}

/// The registered receive half of an operator.
pub(crate) struct OpDispatchImpl<K: Key> {
    pub(crate) core: Arc<OpCore<K>>,
}

impl<K: Key> OpDispatch for OpDispatchImpl<K> {
    fn on_message(&self, src: Rank, envelope: Envelope) -> KeyflowResult<()> {
        let header = &envelope.header;
        let mut cursor = io::Cursor::new(&envelope.bytes[..]);
        let mut keys: Vec<K> = Vec::with_capacity(header.num_keys as usize);
        for _ in 0..header.num_keys {
            keys.push(unpack_from(&mut cursor)?);
        }

        match header.fn_id {
            FnId::SetArg => {
                if header.param_id == PARAM_KEY_ONLY {
                    for key in &keys {
                        self.core.invoke_keyonly(key)?;
                    }
                    return Ok(());
                }
                let slot = self.slot(header.param_id)?;
                let rest = &envelope.bytes[cursor.position() as usize..];
                (self.core.slots[slot].deliver_msg)(&self.core, slot, keys, rest, src)
            }
            FnId::SetStreamSize => {
                let slot = self.slot(header.param_id)?;
                let key = keys
                    .pop()
                    .ok_or_else(|| internal_err!("stream-size message without a key"))?;
                let size: u64 = unpack_from(&mut cursor)?;
                self.core.argstream_size_local(slot, &key, size as usize)
            }
            FnId::FinalizeStream => {
                let slot = self.slot(header.param_id)?;
                let key = keys
                    .pop()
                    .ok_or_else(|| internal_err!("stream-finalize message without a key"))?;
                self.core.finalize_argstream(slot, &key)
            }
        }
    }

    fn report_leftovers(&self) {
        self.core.report_leftovers();
    }

    fn name(&self) -> &str {
        self.core.name()
    }
}

impl<K: Key> OpDispatchImpl<K> {
    fn slot(&self, param_id: i32) -> KeyflowResult<usize> {
        let slot = param_id as usize;
        if param_id < 0 || slot >= self.core.numins {
            return Err(internal_err!(
                "message for {} names input {param_id}, which does not exist",
                self.core.name
            ));
        }
        Ok(slot)
    }
}

/// A template-task operator.
///
/// `K` is the key type, `Ins` the tuple of input slot markers
/// ([`Read`]/[`Write`]), and `Outs` the tuple of output terminals. See the
/// crate-level example for the full lifecycle.
///
/// [`Read`]: crate::Read
/// [`Write`]: crate::Write
pub struct Op<K: Key, Ins: InputSet<K>, Outs: OutputSet> {
    core: Arc<OpCore<K>>,
    ins: Ins::Terminals,
    outs: Outs,
    world: World,
}

impl<K: Key, Ins: InputSet<K>, Outs: OutputSet> Op<K, Ins, Outs> {
    /// Build an operator. Terminal name lists must match the input and
    /// output arities; the default keymap hashes keys across ranks and the
    /// default priority is 0.
    pub fn new<B>(
        world: &World,
        name: impl Into<String>,
        innames: &[&str],
        outnames: &[&str],
        body: B,
    ) -> KeyflowResult<Self>
    where
        B: for<'a> Fn(&'a K, Ins::Refs<'a>, &'a Outs) -> KeyflowResult<()>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if innames.len() != Ins::ARITY {
            return Err(KeyflowError::TerminalNameArity {
                op: name,
                kind: "input",
                expected: Ins::ARITY,
                got: innames.len(),
            });
        }
        if outnames.len() != Outs::ARITY {
            return Err(KeyflowError::TerminalNameArity {
                op: name,
                kind: "output",
                expected: Outs::ARITY,
                got: outnames.len(),
            });
        }

        let outnames: Vec<String> = outnames.iter().map(|s| (*s).to_owned()).collect();
        let outs = Outs::create(&name, &outnames);
        let outs_for_body = outs.clone();
        let runner: BodyFn<K> = Box::new(move |key, copies| {
            // SAFETY: the scheduler grants slot access between task release
            // and input release, which brackets this call.
            let refs = unsafe { Ins::make_refs(copies) };
            body(key, refs, &outs_for_body)
        });

        let core = OpCore::new(
            world,
            name,
            innames.iter().map(|s| (*s).to_owned()).collect(),
            Ins::slot_decls(),
            runner,
        );
        let ins = Ins::terminals(&core);
        debug!(op = %core.name(), id = core.id(), "operator created");
        Ok(Op {
            core,
            ins,
            outs,
            world: world.clone(),
        })
    }

    /// The operator's name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The input terminal tuple, for wiring and stream control.
    pub fn inputs(&self) -> &Ins::Terminals {
        &self.ins
    }

    /// The output terminal tuple, for wiring.
    pub fn outputs(&self) -> &Outs {
        &self.outs
    }

    /// Replace the keymap deciding which rank owns each key.
    pub fn set_keymap(&self, keymap: impl Fn(&K) -> Rank + Send + Sync + 'static) {
        self.core.set_keymap(Box::new(keymap));
    }

    /// Replace the priority map consulted when a task becomes ready.
    pub fn set_priomap(&self, priomap: impl Fn(&K) -> i32 + Send + Sync + 'static) {
        self.core.set_priomap(Box::new(priomap));
    }

    /// Freeze the wiring and register this operator for remote dispatch.
    /// Messages that raced ahead of registration are replayed in arrival
    /// order.
    pub fn make_executable(&self) -> KeyflowResult<()> {
        self.outs.freeze(self.core.name())?;
        self.core.executable.store(true, Ordering::Release);
        self.world.register_op(
            self.core.id(),
            Arc::new(OpDispatchImpl {
                core: Arc::clone(&self.core),
            }),
        )
    }

    /// Inject one task's arguments for `key`. Legal once the operator is
    /// executable and the world is executing; the key's owner may be remote.
    pub fn invoke(&self, key: K, args: Ins::Values) -> KeyflowResult<()> {
        if !self.core.executable.load(Ordering::Acquire) {
            return Err(KeyflowError::NotExecutable {
                op: self.core.name().to_owned(),
            });
        }
        if !self.world.is_executing() {
            return Err(KeyflowError::NotExecuting);
        }
        Ins::invoke(&self.core, &key, args)
    }
}
