//! taskrt Core: boxes and the allocators behind them
//!
//! This crate holds the parts of the upcall layer that do not depend on a
//! task or a stack: the binary layout generated code shares with the runtime,
//! and the process-wide allocator every heap is carved from.
//!
//! Key design principles:
//! - BoxHeader: four-word header in front of every allocation
//! - RefCount: `Tracked(n)` for task-local boxes, `Untracked` for exchange boxes
//! - The process-wide allocator is the only state shared between tasks
//!
//! # Modules
//!
//! - `error`: Runtime error taxonomy and the fatal abort path
//! - `tydesc`: Type descriptors and box footprint computation
//! - `boxed`: Box header layout and ref-count decoding
//! - `kernel`: Process-wide zeroing allocator with lock-free statistics
//! - `exchange`: Untracked boxes shared between tasks

pub mod boxed;
pub mod error;
pub mod exchange;
pub mod kernel;
pub mod tydesc;

// Re-export key types and functions
pub use boxed::{BoxHeader, RefCount, UNTRACKED_REF_COUNT};
pub use error::{RuntimeError, fatal, format_panic_payload};
pub use exchange::{exchange_alloc, exchange_free, exchange_live};
pub use kernel::{KernelStats, allocate_zeroed, kernel_stats, release};
pub use tydesc::{HEADER_SIZE, TypeDesc, align_to, box_footprint, box_size};
