//! Task-local boxed heap
//!
//! Every box a task allocates through `upcall_malloc` is linked into an
//! intrusive doubly-linked list threaded through the box headers, newest at
//! the head. The list is what lets the runtime find boxes a task still owns
//! when it dies: whatever is left on it when the heap is dropped is reported
//! and freed ("annihilated").
//!
//! Exchange boxes carry the untracked ref-count sentinel and are never linked
//! here. Walks skip any header bearing it.

use std::ptr::{self, NonNull};
use taskrt_core::{BoxHeader, RefCount, RuntimeError, TypeDesc, box_footprint, kernel};

/// Live list of one task's boxes
#[derive(Debug)]
pub struct LocalHeap {
    live: *mut BoxHeader,
    live_count: usize,
}

// Only ever touched by the thread running the owning task
unsafe impl Send for LocalHeap {}

impl Default for LocalHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHeap {
    pub const fn new() -> Self {
        Self {
            live: ptr::null_mut(),
            live_count: 0,
        }
    }

    /// Allocate a zeroed box with ref-count 1 and link it at the head of the
    /// live list.
    pub fn alloc(
        &mut self,
        td: &TypeDesc,
        body_size: usize,
    ) -> Result<NonNull<BoxHeader>, RuntimeError> {
        let (total, align) = box_footprint(td, body_size)?;
        let header = kernel::allocate_zeroed(total, align)?.cast::<BoxHeader>();
        unsafe {
            let h = header.as_ptr();
            (*h).init(td, RefCount::Tracked(1));
            (*h).next = self.live;
            if !self.live.is_null() {
                (*self.live).prev = h;
            }
        }
        self.live = header.as_ptr();
        self.live_count += 1;
        Ok(header)
    }

    /// Unlink a box and return its memory. Null is ignored.
    ///
    /// # Safety
    /// `header` must have been allocated by this heap and not freed yet.
    pub unsafe fn free(&mut self, header: *mut BoxHeader) {
        if header.is_null() {
            return;
        }
        unsafe {
            debug_assert!((*header).is_tracked(), "exchange box passed to local free");
            let h = &mut *header;
            if h.prev.is_null() {
                debug_assert!(self.live == header, "box is not on this heap");
                self.live = h.next;
            } else {
                (*h.prev).next = h.next;
            }
            if !h.next.is_null() {
                (*h.next).prev = h.prev;
            }
            kernel::release(header.cast());
        }
        self.live_count -= 1;
    }

    /// Boxes currently linked
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_null()
    }

    /// Walk the live list, newest first
    pub fn iter(&self) -> LiveBoxes<'_> {
        LiveBoxes {
            next: self.live,
            _heap: std::marker::PhantomData,
        }
    }

    /// Whether `header` is linked on this heap
    pub fn contains(&self, header: *const BoxHeader) -> bool {
        self.iter().any(|h| h.as_ptr() as *const BoxHeader == header)
    }

    /// Free every box still linked. Returns how many there were.
    pub fn annihilate(&mut self) -> usize {
        let mut freed = 0;
        while !self.live.is_null() {
            let head = self.live;
            unsafe { self.free(head) };
            freed += 1;
        }
        freed
    }
}

impl Drop for LocalHeap {
    fn drop(&mut self) {
        if self.live_count > 0 {
            tracing::warn!(
                target: "taskrt::mem",
                "annihilating {} box(es) leaked by a dead task",
                self.live_count
            );
            self.annihilate();
        }
    }
}

/// Iterator over a heap's live boxes
pub struct LiveBoxes<'a> {
    next: *mut BoxHeader,
    _heap: std::marker::PhantomData<&'a LocalHeap>,
}

impl Iterator for LiveBoxes<'_> {
    type Item = NonNull<BoxHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current) = NonNull::new(self.next) {
            unsafe {
                self.next = (*current.as_ptr()).next;
                if (*current.as_ptr()).is_tracked() {
                    return Some(current);
                }
            }
        }
        None
    }
}
