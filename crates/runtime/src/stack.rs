//! Guest stack chain
//!
//! A task's guest stack is a chain of mmap-backed segments. Generated code
//! checks its stack pointer against a published limit in each prologue; when
//! a frame would cross it, the prologue calls `upcall_new_stack`, which lands
//! in [`SegmentChain::grow`]. The matching epilogue calls `upcall_del_stack`.
//!
//! Layout of one segment (addresses grow upwards):
//!
//! ```text
//! limit ─┬─ guard page (unmapped)
//!        ├─ RED_ZONE   room for the runtime to run the overflow upcall
//!        ├─ frames ... published limit = limit + RED_ZONE
//!        ├─ frame_base copied argument block ends here
//! base  ─┘
//! ```
//!
//! The most recently retired segment is kept as a spare, so a function that
//! straddles a segment boundary in a loop does not map and unmap on every
//! iteration.

use crate::config::RuntimeConfig;
use corosensei::stack::{DefaultStack, Stack, StackPointer};
use std::cell::Cell;
use std::ptr;
use taskrt_core::RuntimeError;

/// Bytes reserved at the low end of every segment for the overflow upcall
pub const RED_ZONE: usize = 20 * 1024;

/// Alignment of a frame base and of the copied argument block
pub const ARGS_ALIGN: usize = 16;

thread_local! {
    /// Guard boundary for the guest stack running on this thread
    static STACK_LIMIT: Cell<usize> = const { Cell::new(0) };
}

/// Publish `limit` as the overflow boundary for this thread
#[inline]
pub fn record_stack_limit(limit: usize) {
    STACK_LIMIT.with(|l| l.set(limit));
}

/// Current published overflow boundary (0 when no task is entered)
#[inline]
pub fn stack_limit() -> usize {
    STACK_LIMIT.with(|l| l.get())
}

/// Approximate stack pointer of the caller
#[inline(never)]
pub fn current_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

#[inline]
pub(crate) const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Address range `[limit, base)` of one stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBounds {
    pub limit: usize,
    pub base: usize,
}

impl SegmentBounds {
    fn of(stack: &impl Stack) -> Self {
        Self {
            limit: stack.limit().get(),
            base: stack.base().get(),
        }
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.limit && addr < self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.base - self.limit
    }
}

/// Borrowed view of a region of a stack that some other owner keeps mapped.
///
/// Switching onto a stack that already has live frames on it must start
/// below them; this hands the switch primitive a base other than the
/// mapping's top.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackRef {
    base: StackPointer,
    limit: StackPointer,
}

impl StackRef {
    /// Region `[limit, base)`. Returns `None` if it is empty or unaligned.
    pub(crate) fn new(base: usize, limit: usize) -> Option<Self> {
        if base <= limit || base % ARGS_ALIGN != 0 {
            return None;
        }
        Some(Self {
            base: StackPointer::new(base)?,
            limit: StackPointer::new(limit)?,
        })
    }
}

unsafe impl Stack for StackRef {
    #[inline]
    fn base(&self) -> StackPointer {
        self.base
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        self.limit
    }
}

/// Map a fresh stack of at least `size` bytes
pub(crate) fn map_stack(size: usize) -> Result<DefaultStack, RuntimeError> {
    DefaultStack::new(size).map_err(|source| RuntimeError::StackAllocation { size, source })
}

struct GuestSegment {
    stack: DefaultStack,
    frame_base: usize,
}

impl GuestSegment {
    fn bounds(&self) -> SegmentBounds {
        SegmentBounds::of(&self.stack)
    }
}

/// The segments making up one task's guest stack, root first
pub struct SegmentChain {
    segments: Vec<GuestSegment>,
    spare: Option<DefaultStack>,
    total_size: usize,
    min_segment: usize,
    max_total: usize,
}

impl SegmentChain {
    /// Map the root segment.
    pub fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let stack = map_stack(config.min_stack_size)?;
        let bounds = SegmentBounds::of(&stack);
        let root = GuestSegment {
            frame_base: align_down(bounds.base, ARGS_ALIGN),
            stack,
        };
        Ok(Self {
            segments: vec![root],
            spare: None,
            total_size: bounds.size(),
            min_segment: config.min_stack_size,
            max_total: config.max_stack_size,
        })
    }

    /// Make a new segment current, big enough for a `requested` byte frame
    /// plus the `args_size` byte argument block at `args_addr`, which is
    /// copied to the top of the new segment. Returns the new frame base.
    ///
    /// # Safety
    /// `args_addr` must be readable for `args_size` bytes (or null with a
    /// zero size).
    pub unsafe fn grow(
        &mut self,
        requested: usize,
        args_addr: *const u8,
        args_size: usize,
    ) -> Result<usize, RuntimeError> {
        let overflow = RuntimeError::StackOverflow {
            requested,
            limit: self.max_total,
        };
        let needed = requested
            .checked_add(args_size)
            .and_then(|n| n.checked_add(RED_ZONE + ARGS_ALIGN))
            .ok_or(overflow)?;

        let (stack, reused) = match self.spare.take() {
            Some(spare) if SegmentBounds::of(&spare).size() >= needed => (spare, true),
            spare => {
                // A spare too small for this frame stays cached for later
                self.spare = spare;
                let size = needed.max(self.min_segment);
                if self.total_size.saturating_add(size) > self.max_total {
                    return Err(RuntimeError::StackOverflow {
                        requested: size,
                        limit: self.max_total,
                    });
                }
                (map_stack(size)?, false)
            }
        };

        let bounds = SegmentBounds::of(&stack);
        if self.total_size + bounds.size() > self.max_total {
            // Page rounding can push a fresh mapping past the cap; it is
            // unmapped here and the cached spare stays put
            if reused {
                self.spare = Some(stack);
            }
            return Err(RuntimeError::StackOverflow {
                requested: bounds.size(),
                limit: self.max_total,
            });
        }

        let frame_base = align_down(bounds.base - args_size, ARGS_ALIGN);
        if args_size > 0 && !args_addr.is_null() {
            unsafe { ptr::copy_nonoverlapping(args_addr, frame_base as *mut u8, args_size) };
        }

        self.total_size += bounds.size();
        self.segments.push(GuestSegment { stack, frame_base });
        Ok(frame_base)
    }

    /// Retire the current segment and make the previous one current.
    pub fn shrink(&mut self) -> Result<(), RuntimeError> {
        if self.segments.len() <= 1 {
            return Err(RuntimeError::StackUnderflow);
        }
        if let Some(retired) = self.segments.pop() {
            self.total_size -= retired.bounds().size();
            self.spare = Some(retired.stack);
        }
        Ok(())
    }

    /// Retire every segment above the one containing `sp`. Returns how many
    /// were retired; an `sp` outside the chain leaves it untouched.
    pub fn unwind_to(&mut self, sp: usize) -> usize {
        let Some(index) = self.segments.iter().rposition(|s| s.bounds().contains(sp)) else {
            return 0;
        };
        let mut retired = 0;
        while self.segments.len() > index + 1 {
            if self.shrink().is_err() {
                break;
            }
            retired += 1;
        }
        retired
    }

    /// Retire everything but the root segment.
    pub fn unwind_to_root(&mut self) -> usize {
        let mut retired = 0;
        while self.shrink().is_ok() {
            retired += 1;
        }
        retired
    }

    fn current(&self) -> &GuestSegment {
        // The root segment is never popped
        &self.segments[self.segments.len() - 1]
    }

    /// Frame base of the current segment
    pub fn frame_base(&self) -> usize {
        self.current().frame_base
    }

    /// Bounds of the current segment
    pub fn bounds(&self) -> SegmentBounds {
        self.current().bounds()
    }

    /// Overflow boundary for the current segment
    pub fn limit(&self) -> usize {
        self.bounds().limit + RED_ZONE
    }

    /// Number of segments, root included
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Bytes mapped by the live segments (the spare excluded)
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn has_spare(&self) -> bool {
        self.spare.is_some()
    }

    /// Whether `addr` lies on any segment of the chain
    pub fn contains(&self, addr: usize) -> bool {
        self.segments.iter().any(|s| s.bounds().contains(addr))
    }
}

impl std::fmt::Debug for SegmentChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentChain")
            .field("depth", &self.depth())
            .field("total_size", &self.total_size)
            .field("frame_base", &format_args!("{:#x}", self.frame_base()))
            .field("spare", &self.spare.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> RuntimeConfig {
        RuntimeConfig {
            min_stack_size: 0x20000,
            native_stack_size: 0x100000,
            max_stack_size: 0x100000,
        }
    }

    #[test]
    fn test_root_segment() {
        let chain = SegmentChain::new(&small_config()).unwrap();
        assert_eq!(chain.depth(), 1);
        assert_eq!(chain.frame_base() % ARGS_ALIGN, 0);
        assert!(chain.bounds().size() >= 0x20000);
        assert_eq!(chain.limit(), chain.bounds().limit + RED_ZONE);
        assert!(!chain.has_spare());
    }

    #[test]
    fn test_grow_copies_arguments_and_shrink_restores() {
        let mut chain = SegmentChain::new(&small_config()).unwrap();
        let before = chain.frame_base();
        let args: [u64; 3] = [0xdead, 0xbeef, 42];

        let base = unsafe { chain.grow(4096, args.as_ptr().cast(), 24) }.unwrap();
        assert_eq!(chain.depth(), 2);
        assert_eq!(base, chain.frame_base());
        assert_eq!(base % ARGS_ALIGN, 0);
        assert!(chain.bounds().contains(base));
        let copied = unsafe { std::slice::from_raw_parts(base as *const u64, 3) };
        assert_eq!(copied, &args);

        chain.shrink().unwrap();
        assert_eq!(chain.depth(), 1);
        assert_eq!(chain.frame_base(), before);
        assert!(chain.has_spare());
    }

    #[test]
    fn test_spare_segment_is_reused() {
        let mut chain = SegmentChain::new(&small_config()).unwrap();
        let first = unsafe { chain.grow(1024, ptr::null(), 0) }.unwrap();
        chain.shrink().unwrap();
        let second = unsafe { chain.grow(1024, ptr::null(), 0) }.unwrap();
        assert_eq!(first, second);
        assert!(!chain.has_spare());
    }

    #[test]
    fn test_large_frame_gets_large_segment() {
        let mut chain = SegmentChain::new(&small_config()).unwrap();
        unsafe { chain.grow(0x40000, ptr::null(), 0) }.unwrap();
        assert!(chain.bounds().size() >= 0x40000 + RED_ZONE);
    }

    #[test]
    fn test_grow_past_maximum_overflows() {
        let mut chain = SegmentChain::new(&small_config()).unwrap();
        let err = unsafe { chain.grow(0x200000, ptr::null(), 0) }.unwrap_err();
        assert!(matches!(err, RuntimeError::StackOverflow { .. }));
        assert_eq!(chain.depth(), 1);
    }

    #[test]
    fn test_rounded_overflow_keeps_cached_spare() {
        // Room for exactly one unaligned segment above a 0x20000 root
        let config = RuntimeConfig {
            min_stack_size: 0x20000,
            native_stack_size: 0x100000,
            max_stack_size: 0x20000 + 0x30000 - 8,
        };
        let mut chain = SegmentChain::new(&config).unwrap();
        assert_eq!(chain.total_size(), 0x20000);

        let first = unsafe { chain.grow(1024, ptr::null(), 0) }.unwrap();
        chain.shrink().unwrap();
        assert!(chain.has_spare());

        // Needs 0x30000 - 8 bytes: too big for the spare, rounds up past the cap
        let requested = 0x30000 - 8 - RED_ZONE - ARGS_ALIGN;
        let err = unsafe { chain.grow(requested, ptr::null(), 0) }.unwrap_err();
        assert!(matches!(err, RuntimeError::StackOverflow { .. }));
        assert_eq!(chain.depth(), 1);
        assert_eq!(chain.total_size(), 0x20000);
        assert!(chain.has_spare());

        let again = unsafe { chain.grow(1024, ptr::null(), 0) }.unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_shrink_root_underflows() {
        let mut chain = SegmentChain::new(&small_config()).unwrap();
        assert!(matches!(chain.shrink(), Err(RuntimeError::StackUnderflow)));
    }

    #[test]
    fn test_unwind_to_retires_abandoned_segments() {
        let mut chain = SegmentChain::new(&small_config()).unwrap();
        let root_base = chain.frame_base();
        unsafe {
            chain.grow(1024, ptr::null(), 0).unwrap();
            chain.grow(1024, ptr::null(), 0).unwrap();
        }
        assert_eq!(chain.depth(), 3);

        // An address outside the chain changes nothing
        assert_eq!(chain.unwind_to(current_sp()), 0);
        assert_eq!(chain.depth(), 3);

        assert_eq!(chain.unwind_to(root_base - 64), 2);
        assert_eq!(chain.depth(), 1);
        assert_eq!(chain.frame_base(), root_base);
    }

    #[test]
    fn test_stack_limit_is_thread_local() {
        record_stack_limit(0x1000);
        let other = std::thread::spawn(stack_limit).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(stack_limit(), 0x1000);
        record_stack_limit(0);
    }

    #[test]
    fn test_stack_ref_rejects_bad_regions() {
        assert!(StackRef::new(0x1000, 0x2000).is_none());
        assert!(StackRef::new(0x1008, 0x100).is_none());
        assert!(StackRef::new(0x1000, 0x100).is_some());
    }
}
