//! Upcall entry points
//!
//! The C ABI generated code links against. Each entry point finds the
//! current task, packs its arguments into a record and dispatches the
//! handler to the task's native stack, except for the stack-growth upcalls,
//! which sit on every function prologue and run in place.
//!
//! Upcalls that can fail the task are `extern "C-unwind"`: the failure
//! unwinds out through generated code. The two boundary shims are plain
//! `extern "C"` and turn anything that tries to unwind through them into a
//! process abort.
//!
//! The allocation, free and fail upcalls are also exported under an
//! `rt_upcall_*` name for callers that cannot use the primary one.

use crate::debug::{track_origin, untrack_origin};
use crate::dispatch::{UpcallRecord, dispatch};
use crate::log::rtlog;
use crate::stack::stack_limit;
use crate::switch::{UpcallHandler, on_guest_stack, switch_and_call};
use crate::task::{Task, TaskState, current_task};
use std::borrow::Cow;
use std::ffi::{CStr, c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use taskrt_core::{BoxHeader, TypeDesc, exchange_alloc, exchange_free, fatal};

/// The task upcalls run for. No current task is a fatal error: there is
/// nowhere to record a failure. Neither is a dead one, whose failure has
/// already been delivered. A failing task still gets its cleanup upcalls.
fn upcall_task<'a>() -> &'a Task {
    // The task outlives every upcall it makes
    match unsafe { current_task() } {
        Some(task) if task.state() == TaskState::Dead => fatal("upcall made by a dead task"),
        Some(task) => task,
        None => fatal("upcall made with no current task"),
    }
}

/// Text of a C string from generated code, lossily decoded
unsafe fn c_text<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("<unknown>")
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
    }
}

// ============================================================================
// fail
// ============================================================================

#[repr(C)]
struct FailArgs<'a> {
    task: &'a Task,
    expr: *const c_char,
    file: *const c_char,
    line: usize,
}

impl UpcallRecord for FailArgs<'_> {
    const NAME: &'static str = "fail";

    fn task(&self) -> &Task {
        self.task
    }

    fn handle(&mut self) {
        let expr = unsafe { c_text(self.expr) };
        let file = unsafe { c_text(self.file) };
        self.task.fail(&expr, &file, self.line)
    }
}

/// Fail the current task. Never returns.
///
/// # Safety
/// `expr` and `file` must be null or NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn upcall_fail(
    expr: *const c_char,
    file: *const c_char,
    line: usize,
) -> ! {
    let task = upcall_task();
    let mut args = FailArgs {
        task,
        expr,
        file,
        line,
    };
    dispatch(task, &mut args);
    fatal("fail upcall returned")
}

/// Alias of [`upcall_fail`]
///
/// # Safety
/// As for [`upcall_fail`].
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn rt_upcall_fail(
    expr: *const c_char,
    file: *const c_char,
    line: usize,
) -> ! {
    unsafe { upcall_fail(expr, file, line) }
}

// ============================================================================
// trace
// ============================================================================

#[repr(C)]
struct TraceArgs<'a> {
    task: &'a Task,
    msg: *const c_char,
    file: *const c_char,
    line: usize,
}

impl UpcallRecord for TraceArgs<'_> {
    const NAME: &'static str = "trace";

    fn task(&self) -> &Task {
        self.task
    }

    fn handle(&mut self) {
        let msg = unsafe { c_text(self.msg) };
        let file = unsafe { c_text(self.file) };
        rtlog!(self.task, Trace, "{}:{}: {}", file, self.line, msg);
    }
}

/// Emit a diagnostic record for the current task.
///
/// # Safety
/// `msg` and `file` must be null or NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upcall_trace(msg: *const c_char, file: *const c_char, line: usize) {
    let task = upcall_task();
    let mut args = TraceArgs {
        task,
        msg,
        file,
        line,
    };
    dispatch(task, &mut args);
}

// ============================================================================
// exchange heap
// ============================================================================

#[repr(C)]
struct ExchangeMallocArgs<'a> {
    task: &'a Task,
    td: *const TypeDesc,
    size: usize,
    retval: *mut BoxHeader,
}

impl UpcallRecord for ExchangeMallocArgs<'_> {
    const NAME: &'static str = "exchange_malloc";

    fn task(&self) -> &Task {
        self.task
    }

    fn handle(&mut self) {
        let Some(td) = (unsafe { self.td.as_ref() }) else {
            self.task
                .fail("exchange allocation without a type descriptor", file!(), line!() as usize)
        };
        match exchange_alloc(td, self.size) {
            Ok(header) => {
                self.retval = header.as_ptr();
                rtlog!(
                    self.task,
                    Mem,
                    "exchange malloc {:p} = {:p} ({} byte body)",
                    self.td,
                    self.retval,
                    self.size
                );
            }
            Err(e) => self.task.fail(&e.to_string(), file!(), line!() as usize),
        }
    }
}

/// Allocate an untracked box from the process-wide allocator. Exhaustion
/// fails the task.
///
/// # Safety
/// `td` must point to a valid type descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn upcall_exchange_malloc(
    td: *const TypeDesc,
    size: usize,
) -> *mut BoxHeader {
    let task = upcall_task();
    let mut args = ExchangeMallocArgs {
        task,
        td,
        size,
        retval: ptr::null_mut(),
    };
    dispatch(task, &mut args);
    args.retval
}

/// Alias of [`upcall_exchange_malloc`]
///
/// # Safety
/// As for [`upcall_exchange_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn rt_upcall_exchange_malloc(
    td: *const TypeDesc,
    size: usize,
) -> *mut BoxHeader {
    unsafe { upcall_exchange_malloc(td, size) }
}

#[repr(C)]
struct ExchangeFreeArgs<'a> {
    task: &'a Task,
    ptr: *mut BoxHeader,
}

impl UpcallRecord for ExchangeFreeArgs<'_> {
    const NAME: &'static str = "exchange_free";

    fn task(&self) -> &Task {
        self.task
    }

    fn handle(&mut self) {
        rtlog!(self.task, Mem, "exchange freed {:p}", self.ptr);
        unsafe { exchange_free(self.ptr) };
    }
}

/// Return an exchange box to the process-wide allocator.
///
/// # Safety
/// `ptr` must be null or come from [`upcall_exchange_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upcall_exchange_free(ptr: *mut BoxHeader) {
    let task = upcall_task();
    let mut args = ExchangeFreeArgs { task, ptr };
    dispatch(task, &mut args);
}

/// Alias of [`upcall_exchange_free`]
///
/// # Safety
/// As for [`upcall_exchange_free`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_upcall_exchange_free(ptr: *mut BoxHeader) {
    unsafe { upcall_exchange_free(ptr) }
}

// ============================================================================
// task-local heap
// ============================================================================

#[repr(C)]
struct MallocArgs<'a> {
    task: &'a Task,
    td: *const TypeDesc,
    size: usize,
    retval: *mut BoxHeader,
}

impl UpcallRecord for MallocArgs<'_> {
    const NAME: &'static str = "malloc";

    fn task(&self) -> &Task {
        self.task
    }

    fn handle(&mut self) {
        rtlog!(self.task, Mem, "upcall malloc({:p})", self.td);
        let Some(td) = (unsafe { self.td.as_ref() }) else {
            self.task
                .fail("allocation without a type descriptor", file!(), line!() as usize)
        };

        let allocated = self.task.local_heap().alloc(td, self.size);
        match allocated {
            Ok(header) => {
                track_origin(self.task, header.as_ptr());
                self.retval = header.as_ptr();
                rtlog!(
                    self.task,
                    Mem,
                    "malloc {:p} = {:p} ({} byte body)",
                    self.td,
                    self.retval,
                    self.size
                );
            }
            Err(e) => self.task.fail(&e.to_string(), file!(), line!() as usize),
        }
    }
}

/// Allocate a zeroed box on the current task's heap, ref-count 1.
/// Exhaustion fails the task.
///
/// # Safety
/// `td` must point to a valid type descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn upcall_malloc(td: *const TypeDesc, size: usize) -> *mut BoxHeader {
    let task = upcall_task();
    let mut args = MallocArgs {
        task,
        td,
        size,
        retval: ptr::null_mut(),
    };
    dispatch(task, &mut args);
    args.retval
}

/// Alias of [`upcall_malloc`]
///
/// # Safety
/// As for [`upcall_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn rt_upcall_malloc(
    td: *const TypeDesc,
    size: usize,
) -> *mut BoxHeader {
    unsafe { upcall_malloc(td, size) }
}

#[repr(C)]
struct FreeArgs<'a> {
    task: &'a Task,
    ptr: *mut BoxHeader,
}

impl UpcallRecord for FreeArgs<'_> {
    const NAME: &'static str = "free";

    fn task(&self) -> &Task {
        self.task
    }

    fn handle(&mut self) {
        rtlog!(self.task, Mem, "upcall free({:p})", self.ptr);
        untrack_origin(self.task, self.ptr);
        unsafe { self.task.local_heap().free(self.ptr) };
    }
}

/// Release a box back to the current task's heap.
///
/// # Safety
/// `ptr` must be null or come from [`upcall_malloc`] on the same task.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upcall_free(ptr: *mut BoxHeader) {
    let task = upcall_task();
    let mut args = FreeArgs { task, ptr };
    dispatch(task, &mut args);
}

/// Alias of [`upcall_free`]
///
/// # Safety
/// As for [`upcall_free`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_upcall_free(ptr: *mut BoxHeader) {
    unsafe { upcall_free(ptr) }
}

// ============================================================================
// guest stack
// ============================================================================
//
// These run on every prologue that overflows and every matching epilogue, so
// they stay on the guest stack instead of switching.

/// Move to a segment with room for a `size` byte frame, copying the
/// `args_size` byte argument block at `args_addr`. Returns the new frame
/// base. Exceeding the maximum stack size fails the task.
///
/// # Safety
/// `args_addr` must be readable for `args_size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn upcall_new_stack(
    size: usize,
    args_addr: *const c_void,
    args_size: usize,
) -> *mut c_void {
    let task = upcall_task();
    match unsafe { task.grow_stack(size, args_addr.cast(), args_size) } {
        Ok(frame_base) => frame_base as *mut c_void,
        Err(e) => task.fail(&e.to_string(), file!(), line!() as usize),
    }
}

/// Return to the previous segment.
///
/// # Safety
/// Must pair with an earlier [`upcall_new_stack`].
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn upcall_del_stack() {
    let task = upcall_task();
    if let Err(e) = task.shrink_stack() {
        task.fail(&e.to_string(), file!(), line!() as usize)
    }
}

/// Republish the overflow boundary after a landing pad. Must run on the
/// guest stack, since it reads the stack pointer.
///
/// # Safety
/// Requires a current task.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upcall_reset_stack_limit() {
    upcall_task().refresh_stack_limit();
}

/// The overflow boundary prologues compare the stack pointer against
#[unsafe(no_mangle)]
pub extern "C" fn upcall_stack_limit() -> usize {
    stack_limit()
}

// ============================================================================
// boundary shims
// ============================================================================

/// Run `f(args)` on the native stack, typically a foreign function.
/// Nothing may unwind out: an escaping failure aborts the process.
///
/// # Safety
/// `args` must be what `f` expects.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upcall_call_shim_on_native_stack(args: *mut c_void, f: UpcallHandler) {
    let task = upcall_task();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        switch_and_call(task, args, f)
    }));
    if outcome.is_err() {
        fatal("foreign code threw an exception");
    }
}

/// Run `f(args)` on the guest stack from native code calling back into the
/// task. A task failure cannot unwind through the native frames in between,
/// so it aborts the process.
///
/// # Safety
/// `args` must be what `f` expects.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upcall_call_shim_on_guest_stack(args: *mut c_void, f: UpcallHandler) {
    let task = upcall_task();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        on_guest_stack(task, || unsafe { f(args) })
    }));
    if outcome.is_err() {
        fatal("task failed after reentering the guest stack");
    }
}
