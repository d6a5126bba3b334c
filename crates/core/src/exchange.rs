//! Exchange heap
//!
//! Boxes that belong to no task. They come straight from the process-wide
//! allocator, carry the untracked ref-count sentinel, and are never linked
//! into any task's live list, so they can be handed between tasks freely.

use crate::boxed::{BoxHeader, RefCount};
use crate::error::RuntimeError;
use crate::kernel;
use crate::tydesc::{TypeDesc, box_footprint};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

static EXCHANGE_LIVE: AtomicUsize = AtomicUsize::new(0);

/// Allocate a zeroed exchange box for `td` with a `body_size` byte body.
pub fn exchange_alloc(
    td: &TypeDesc,
    body_size: usize,
) -> Result<NonNull<BoxHeader>, RuntimeError> {
    let (total, align) = box_footprint(td, body_size)?;
    let header = kernel::allocate_zeroed(total, align)?.cast::<BoxHeader>();
    unsafe {
        (*header.as_ptr()).init(td, RefCount::Untracked);
    }
    EXCHANGE_LIVE.fetch_add(1, Ordering::Relaxed);
    Ok(header)
}

/// Release an exchange box. Null is ignored.
///
/// # Safety
/// `header` must come from [`exchange_alloc`]; passing a task-local box is
/// undefined behavior.
pub unsafe fn exchange_free(header: *mut BoxHeader) {
    if header.is_null() {
        return;
    }
    debug_assert!(
        unsafe { !(*header).is_tracked() },
        "task-local box passed to exchange free"
    );
    unsafe { kernel::release(header.cast()) };
    EXCHANGE_LIVE.fetch_sub(1, Ordering::Relaxed);
}

/// Exchange boxes allocated and not yet freed, across all tasks
pub fn exchange_live() -> usize {
    EXCHANGE_LIVE.load(Ordering::Relaxed)
}
