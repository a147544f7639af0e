//! Thread-local record of the task a worker is currently running.
//!
//! `send` and `broadcast` take the value by reference; if that reference
//! points into one of the running task's bound data copies, the runtime can
//! hand the copy itself to the successor instead of cloning the value. The
//! frames form a stack so that message-delivery helpers running nested under
//! another task save and restore correctly.

use std::cell::RefCell;

use smallvec::SmallVec;

use keyflow_data::CopyHandle;

type Frame = SmallVec<[CopyHandle; 4]>;

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Guard for one task's scope; pops the frame on drop.
pub(crate) struct TaskScope(());

/// Mark `copies` as the running task's inputs for the current thread.
pub(crate) fn enter(copies: &[CopyHandle]) -> TaskScope {
    FRAMES.with(|frames| {
        frames.borrow_mut().push(copies.iter().cloned().collect());
    });
    TaskScope(())
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Find the running task's copy whose payload lives at `ptr`, if any.
pub(crate) fn find_copy(ptr: *const u8) -> Option<CopyHandle> {
    FRAMES.with(|frames| {
        let frames = frames.borrow();
        let top = frames.last()?;
        top.iter().find(|copy| copy.payload_ptr() == ptr).cloned()
    })
}

#[cfg(test)]
mod tests {
    use keyflow_data::DataCopy;

    use super::*;

    #[test]
    fn finds_only_copies_of_the_innermost_frame() {
        let outer = DataCopy::new(1u64);
        let inner = DataCopy::new(2u64);

        let _outer_scope = enter(std::slice::from_ref(&outer));
        assert!(find_copy(outer.payload_ptr()).is_some());

        {
            let _inner_scope = enter(std::slice::from_ref(&inner));
            // The nested frame shadows the outer task's copies.
            assert!(find_copy(outer.payload_ptr()).is_none());
            let found = find_copy(inner.payload_ptr()).unwrap();
            assert!(std::sync::Arc::ptr_eq(&found, &inner));
        }

        assert!(find_copy(outer.payload_ptr()).is_some());
        assert!(find_copy(std::ptr::null()).is_none());
    }
}
