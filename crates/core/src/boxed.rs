//! Boxed object header
//!
//! Every allocation handed to generated code, task-local or exchange, starts
//! with a [`BoxHeader`]. Generated code reads and writes `ref_count` directly,
//! so the field keeps its raw signed layout; the runtime itself goes through
//! [`RefCount`], which turns the `-1` sentinel into an explicit variant.

use crate::tydesc::{TypeDesc, body_offset};
use std::ptr;

/// Raw ref-count value marking an exchange box
pub const UNTRACKED_REF_COUNT: isize = -1;

/// Header prepended to every box.
#[repr(C)]
#[derive(Debug)]
pub struct BoxHeader {
    /// Reference count, or [`UNTRACKED_REF_COUNT`] for exchange boxes
    pub ref_count: isize,
    /// Type descriptor of the body
    pub td: *const TypeDesc,
    /// Previous box on the owning heap's live list
    pub prev: *mut BoxHeader,
    /// Next box on the owning heap's live list
    pub next: *mut BoxHeader,
}

/// Reference-tracking state of a box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCount {
    /// Owned by a task-local heap, with this many references
    Tracked(usize),
    /// Owned by the exchange heap; never on a live list
    Untracked,
}

impl BoxHeader {
    /// Tracking state decoded from the raw field
    #[inline]
    pub fn ref_count(&self) -> RefCount {
        match self.ref_count {
            UNTRACKED_REF_COUNT => RefCount::Untracked,
            n => {
                debug_assert!(n >= 0, "corrupt box ref-count {}", n);
                RefCount::Tracked(n as usize)
            }
        }
    }

    #[inline]
    pub fn set_ref_count(&mut self, count: RefCount) {
        self.ref_count = match count {
            RefCount::Tracked(n) => n as isize,
            RefCount::Untracked => UNTRACKED_REF_COUNT,
        };
    }

    #[inline]
    pub fn is_tracked(&self) -> bool {
        matches!(self.ref_count(), RefCount::Tracked(_))
    }

    /// Install a fresh header: descriptor set, links cleared.
    pub fn init(&mut self, td: *const TypeDesc, count: RefCount) {
        self.set_ref_count(count);
        self.td = td;
        self.prev = ptr::null_mut();
        self.next = ptr::null_mut();
    }

    /// Pointer to the body of the box.
    ///
    /// # Safety
    /// `header` must point to a live box whose `td` is valid.
    #[inline]
    pub unsafe fn body(header: *mut BoxHeader) -> *mut u8 {
        unsafe {
            let align = (*(*header).td).body_align();
            header.cast::<u8>().add(body_offset(align))
        }
    }
}
