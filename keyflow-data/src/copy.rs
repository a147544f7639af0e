//! The refcounted data-copy layer.
//!
//! A [`DataCopy`] holds exactly one user value and tracks who may touch it
//! through a single atomic counter:
//!
//! * `readers > 0`: shared immutable; the count is the number of holders.
//! * `readers == i32::MIN`: one writer holds exclusive mutable access and
//!   no further readers may attach to this copy.
//! * `readers == 0`: transient teardown state.
//!
//! A writer registration succeeds only when it finds `readers == 1`, i.e. the
//! registering context is the sole holder. The task carrying the writer is
//! then *deferred*: it is handed to the scheduler only when that sole holder
//! releases, so a reader can never observe a partially-written value. Any
//! registration that loses the race clones the value into a fresh copy
//! instead.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// `readers` value marking an exclusive writer.
const WRITER: i32 = i32::MIN;

/// Clonable type-erased payload. Serialization is not needed here: packing
/// always happens in contexts that know the concrete value type.
trait AnyValue: Any + Send + Sync {
    fn clone_boxed(&self) -> Box<dyn AnyValue>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Clone + Send + Sync + 'static> AnyValue for T {
    fn clone_boxed(&self) -> Box<dyn AnyValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Shared handle to a [`DataCopy`].
pub type CopyHandle = Arc<DataCopy>;

/// Refcounted container of one value, with reader/writer discipline.
///
/// The `Arc` in [`CopyHandle`] keeps the allocation alive; the `readers`
/// counter tracks *protocol* holds (task slot bindings and transfer leases),
/// which is what gates mutable access.
pub struct DataCopy {
    readers: AtomicI32,
    payload: UnsafeCell<Box<dyn AnyValue>>,
    /// Release callback for a task whose writer registration succeeded.
    /// Invoked (once) when the previous sole holder releases.
    deferred: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

// SAFETY: access to `payload` is gated by the `readers` protocol. Shared
// references are only produced while the copy is in the shared state (or by
// the single writer itself), and the exclusive reference is only produced by
// the one context that successfully flipped `readers` to `WRITER`.
unsafe impl Send for DataCopy {}
unsafe impl Sync for DataCopy {}

impl DataCopy {
    /// Wrap `value` in a fresh copy. The creating context holds the initial
    /// reference and must eventually [`release`](DataCopy::release) it (task
    /// slot bindings take the hold over when they adopt a fresh copy).
    pub fn new<T: Clone + Send + Sync + 'static>(value: T) -> CopyHandle {
        Arc::new(DataCopy {
            readers: AtomicI32::new(1),
            payload: UnsafeCell::new(Box::new(value)),
            deferred: Mutex::new(None),
        })
    }

    /// Register another reader, unless a writer already holds this copy.
    ///
    /// Returns `None` when the copy is writer-held; the caller must then
    /// [`fork`](DataCopy::fork) (or clone from its own reference) instead.
    pub fn try_register_read(self: &CopyHandle) -> Option<CopyHandle> {
        let mut current = self.readers.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return None;
            }
            match self.readers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Arc::clone(self)),
                Err(observed) => current = observed,
            }
        }
    }

    /// Register a reader, forking a fresh copy if a writer is pending.
    pub fn register_read(self: &CopyHandle) -> CopyHandle {
        self.try_register_read().unwrap_or_else(|| self.fork())
    }

    /// Try to take exclusive mutable ownership of this copy.
    ///
    /// Succeeds only when the registering context is the sole holder
    /// (`readers == 1`). On success the release of the writer's task is
    /// deferred: `deferred` runs when that holder releases, which is the
    /// window in which later readers may still fork the pre-mutation value.
    ///
    /// Returns `None` when other holders exist; the caller must fork.
    pub fn register_write(
        self: &CopyHandle,
        deferred: impl FnOnce() + Send + 'static,
    ) -> Option<CopyHandle> {
        // Install the callback before flipping the counter: a release that
        // observes the writer state must find the callback present.
        let mut slot = self.deferred.lock();
        debug_assert!(slot.is_none(), "second writer registered on a copy");
        *slot = Some(Box::new(deferred));
        if self
            .readers
            .compare_exchange(1, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(Arc::clone(self))
        } else {
            *slot = None;
            None
        }
    }

    /// Clone the payload into a fresh, independently-held copy.
    ///
    /// Callers must guarantee that no writer is concurrently mutating the
    /// payload. The runtime upholds this: a successful writer registration
    /// defers the writer's task until the sole prior holder releases, and a
    /// holder that is still able to call `fork` is exactly such a prior
    /// holder.
    pub fn fork(self: &CopyHandle) -> CopyHandle {
        // SAFETY: see above; no exclusive writer can be running while a
        // holder forks, so a shared read of the payload is valid.
        let cloned = unsafe { (*self.payload.get()).clone_boxed() };
        Arc::new(DataCopy {
            readers: AtomicI32::new(1),
            payload: UnsafeCell::new(cloned),
            deferred: Mutex::new(None),
        })
    }

    /// Drop one protocol hold on this copy.
    ///
    /// If a deferred writer is registered, its release callback fires here:
    /// the releasing context was the sole holder that gated the writer.
    pub fn release(&self) {
        let mut current = self.readers.load(Ordering::Acquire);
        while current > 0 {
            match self.readers.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        let deferred = self.deferred.lock().take();
        if let Some(callback) = deferred {
            callback();
        }
    }

    /// Reset a writer-held copy back to the shared state with one hold (the
    /// completing writer's own, released immediately afterwards). Followers
    /// that fork-replaced themselves never see this copy again; followers
    /// arriving later observe a valid shared refcount.
    pub fn finish_write(&self) {
        debug_assert_eq!(self.readers.load(Ordering::Acquire), WRITER);
        self.readers.store(1, Ordering::Release);
    }

    /// Whether a writer currently holds this copy.
    pub fn is_writer_held(&self) -> bool {
        self.readers.load(Ordering::Acquire) < 0
    }

    /// Current reader count (diagnostics and tests).
    pub fn readers(&self) -> i32 {
        self.readers.load(Ordering::Acquire)
    }

    /// Address of the contained value, used to match a reference passed to
    /// `send` against the copies bound to the running task.
    pub fn payload_ptr(&self) -> *const u8 {
        // SAFETY: reading the box pointer itself, not the payload.
        let payload: &dyn AnyValue = unsafe { &**self.payload.get() };
        payload.as_any() as *const dyn Any as *const u8
    }

    /// Shared access to the contained value.
    ///
    /// # Safety
    ///
    /// The caller must hold a read registration (or be the deferred writer
    /// before its body runs) and `T` must be the contained type.
    pub unsafe fn value<T: 'static>(&self) -> &T {
        (*self.payload.get())
            .as_any()
            .downcast_ref::<T>()
            // Slot types are fixed at wiring time, so a mismatch here is a
            // runtime bug, not a user error.
            .expect("data copy payload type mismatch")
    }

    /// Exclusive access to the contained value.
    ///
    /// # Safety
    ///
    /// The caller must be the registered writer (or otherwise hold the copy
    /// exclusively, e.g. a reducer folding under its bucket lock while the
    /// table holds the only reference) and `T` must be the contained type.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn value_mut<T: 'static>(&self) -> &mut T {
        (*self.payload.get())
            .as_any_mut()
            .downcast_mut::<T>()
            .expect("data copy payload type mismatch")
    }
}

impl fmt::Debug for DataCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCopy")
            .field("readers", &self.readers())
            .finish_non_exhaustive()
    }
}
