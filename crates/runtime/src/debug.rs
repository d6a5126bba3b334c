//! Box origin tracking
//!
//! With the `track-origins` feature, every task-local box remembers the
//! backtrace of the allocation that produced it, so a leak reported at task
//! teardown can be traced back to its source. Without the feature the
//! tracker is zero-sized and every call compiles to nothing; callers never
//! need to check which build they are in.

use crate::task::Task;
use taskrt_core::BoxHeader;

#[cfg(feature = "track-origins")]
use std::{backtrace::Backtrace, cell::RefCell, collections::HashMap};

/// Per-task map from box to allocation backtrace
#[derive(Default)]
pub struct OriginTracker {
    #[cfg(feature = "track-origins")]
    origins: RefCell<HashMap<usize, Backtrace>>,
}

impl OriginTracker {
    #[cfg(feature = "track-origins")]
    pub fn track(&self, header: *const BoxHeader) {
        self.origins
            .borrow_mut()
            .insert(header as usize, Backtrace::force_capture());
    }

    #[cfg(not(feature = "track-origins"))]
    #[inline(always)]
    pub fn track(&self, _header: *const BoxHeader) {}

    #[cfg(feature = "track-origins")]
    pub fn untrack(&self, header: *const BoxHeader) {
        self.origins.borrow_mut().remove(&(header as usize));
    }

    #[cfg(not(feature = "track-origins"))]
    #[inline(always)]
    pub fn untrack(&self, _header: *const BoxHeader) {}

    /// Formatted allocation backtrace of `header`, if one was recorded
    #[cfg(feature = "track-origins")]
    pub fn origin_of(&self, header: *const BoxHeader) -> Option<String> {
        self.origins
            .borrow()
            .get(&(header as usize))
            .map(|bt| bt.to_string())
    }

    #[cfg(not(feature = "track-origins"))]
    pub fn origin_of(&self, _header: *const BoxHeader) -> Option<String> {
        None
    }

    /// Number of boxes with a recorded origin
    pub fn len(&self) -> usize {
        #[cfg(feature = "track-origins")]
        {
            self.origins.borrow().len()
        }
        #[cfg(not(feature = "track-origins"))]
        {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for OriginTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginTracker")
            .field("tracked", &self.len())
            .finish()
    }
}

/// Record where `header` was allocated
#[inline]
pub fn track_origin(task: &Task, header: *const BoxHeader) {
    task.origins().track(header);
}

/// Forget `header`; called on every free
#[inline]
pub fn untrack_origin(task: &Task, header: *const BoxHeader) {
    task.origins().untrack(header);
}

/// Allocation backtrace of one of `task`'s boxes
pub fn origin_of(task: &Task, header: *const BoxHeader) -> Option<String> {
    task.origins().origin_of(header)
}
