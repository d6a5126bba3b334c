//! taskrt: the upcall layer of a segmented-stack task runtime
//!
//! Generated code runs on a task's guest stack, a chain of small segments.
//! Whenever it needs the runtime it calls an upcall; the upcall switches to
//! the task's native stack, runs the service there and switches back.
//!
//! Key design principles:
//! - Task: owns its heap, its guest stack chain and its native stack
//! - Upcall record: `#[repr(C)]` arguments plus return slot, one per upcall
//! - One dispatch path for every upcall; one switch primitive under it
//! - Two heaps: tracked task-local boxes, untracked exchange boxes
//!
//! # Modules
//!
//! - `config`: Stack sizing from the environment
//! - `stack`: Guest segment chain and the published stack limit
//! - `switch`: Moving execution between guest and native stacks
//! - `task`: Tasks, the current-task guard, failure
//! - `local_heap`: Task-local boxed heap
//! - `dispatch`: Record-based upcall trampoline
//! - `upcalls`: The C entry points generated code links against
//! - `personality`: Unwind personality wrapper
//! - `log`: Diagnostic sink on `tracing`
//! - `debug`: Box origin tracking (`track-origins`)
//! - `diagnostics`: SIGQUIT statistics dump (`diagnostics`)

pub mod config;
pub mod debug;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod dispatch;
pub mod local_heap;
pub mod log;
pub mod personality;
pub mod stack;
pub mod switch;
pub mod task;
pub mod upcalls;

// Re-export key types and functions
pub use config::{RuntimeConfig, runtime_config};
pub use debug::{origin_of, track_origin, untrack_origin};
pub use dispatch::{UpcallRecord, dispatch};
pub use local_heap::LocalHeap;
pub use log::{LogCategory, emit};
pub use stack::{RED_ZONE, SegmentBounds, current_sp, stack_limit};
pub use switch::{UpcallHandler, on_guest_stack, on_native_stack, switch_and_call};
pub use task::{
    Task, TaskFailure, TaskGuard, TaskState, TaskStats, current_task, task_stats,
    with_current_task,
};
pub use taskrt_core::{
    BoxHeader, KernelStats, RefCount, RuntimeError, TypeDesc, UNTRACKED_REF_COUNT, kernel_stats,
};

// Personality wrapper (exported for the unwinder)
pub use personality::{
    PersonalityFn, UnwindReasonCode, native_personality, set_native_personality,
    upcall_personality as personality,
};

// Upcalls (exported for linking into generated code)
pub use upcalls::{
    upcall_call_shim_on_guest_stack as call_shim_on_guest_stack,
    upcall_call_shim_on_native_stack as call_shim_on_native_stack,
    upcall_del_stack as del_stack, upcall_exchange_free as exchange_free,
    upcall_exchange_malloc as exchange_malloc, upcall_fail as fail, upcall_free as free,
    upcall_malloc as malloc, upcall_new_stack as new_stack,
    upcall_reset_stack_limit as reset_stack_limit, upcall_stack_limit as get_stack_limit,
    upcall_trace as trace,
};

/// Load configuration and install the diagnostics handler.
///
/// Optional: tasks read the configuration lazily, and without this call
/// SIGQUIT keeps its default action.
pub fn init() -> &'static RuntimeConfig {
    let config = runtime_config();
    tracing::debug!(
        min_stack = config.min_stack_size,
        native_stack = config.native_stack_size,
        max_stack = config.max_stack_size,
        "taskrt initialized"
    );
    #[cfg(feature = "diagnostics")]
    diagnostics::install_signal_handler();
    config
}
