//! Process-wide allocator
//!
//! The one allocator shared by every task. Exchange boxes and task-local
//! boxes are both carved out of it; only the bookkeeping on top differs.
//! libc's malloc family already serializes concurrent callers, so this module
//! adds nothing but zeroing, alignment, and statistics.
//!
//! # Statistics
//!
//! Lock-free counters, updated on every allocate/release:
//!
//! - `allocated`: monotonically increasing count of successful allocations
//! - `released`: monotonically increasing count of releases
//! - `live`: allocations not yet released
//! - `peak_live`: high-water mark of `live`

use crate::error::RuntimeError;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Alignment malloc already guarantees
#[cfg(target_pointer_width = "64")]
pub const MIN_ALIGN: usize = 16;
#[cfg(not(target_pointer_width = "64"))]
pub const MIN_ALIGN: usize = 8;

static TOTAL_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static TOTAL_RELEASED: AtomicU64 = AtomicU64::new(0);
static LIVE_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
static PEAK_LIVE: AtomicUsize = AtomicUsize::new(0);

/// Snapshot of the allocator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    pub allocated: u64,
    pub released: u64,
    pub live: usize,
    pub peak_live: usize,
}

/// Allocate `size` zeroed bytes aligned to `align` (a power of two).
///
/// Zero-size requests still return a unique, releasable pointer.
pub fn allocate_zeroed(size: usize, align: usize) -> Result<NonNull<u8>, RuntimeError> {
    debug_assert!(align.is_power_of_two(), "alignment {} is not a power of two", align);
    let size = size.max(1);

    let raw = if align <= MIN_ALIGN {
        unsafe { libc::calloc(1, size) }
    } else {
        let mut out: *mut libc::c_void = ptr::null_mut();
        let align = align.max(std::mem::size_of::<usize>());
        let rc = unsafe { libc::posix_memalign(&mut out, align, size) };
        if rc == 0 && !out.is_null() {
            unsafe { ptr::write_bytes(out.cast::<u8>(), 0, size) };
            out
        } else {
            ptr::null_mut()
        }
    };

    let ptr = NonNull::new(raw.cast::<u8>())
        .ok_or(RuntimeError::AllocatorExhausted { size, align })?;
    record_allocation();
    Ok(ptr)
}

/// Return memory to the process-wide allocator. Null is ignored.
///
/// # Safety
/// `ptr` must have come from [`allocate_zeroed`] and not been released yet.
pub unsafe fn release(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    unsafe { libc::free(ptr.cast()) };
    TOTAL_RELEASED.fetch_add(1, Ordering::Relaxed);
    LIVE_ALLOCATIONS.fetch_sub(1, Ordering::AcqRel);
}

fn record_allocation() {
    TOTAL_ALLOCATED.fetch_add(1, Ordering::Relaxed);
    let live = LIVE_ALLOCATIONS.fetch_add(1, Ordering::AcqRel) + 1;

    // Update peak via CAS loop
    let mut peak = PEAK_LIVE.load(Ordering::Relaxed);
    while live > peak {
        match PEAK_LIVE.compare_exchange_weak(peak, live, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(current) => peak = current,
        }
    }
}

/// Current allocator counters
pub fn kernel_stats() -> KernelStats {
    KernelStats {
        allocated: TOTAL_ALLOCATED.load(Ordering::Relaxed),
        released: TOTAL_RELEASED.load(Ordering::Relaxed),
        live: LIVE_ALLOCATIONS.load(Ordering::Acquire),
        peak_live: PEAK_LIVE.load(Ordering::Relaxed),
    }
}
