//! Unwind personality wrapper
//!
//! The unwinder calls the personality routine on whatever stack the frame it
//! is examining lives on, which for a task is often a small guest segment.
//! The platform routine needs more room than a guest segment can promise, so
//! [`upcall_personality`] moves the call to the native stack when it arrives
//! on the guest one and calls straight through otherwise. Either way the
//! caller gets the platform routine's answer unchanged.
//!
//! The wrapper runs in the middle of an unwind: it does not allocate, does
//! not log, and never unwinds itself.

use crate::dispatch::{UpcallRecord, dispatch};
use crate::task::{Task, current_task};
use std::ffi::c_int;
use std::sync::atomic::{AtomicPtr, Ordering};

/// `_Unwind_Reason_Code`
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindReasonCode(pub c_int);

impl UnwindReasonCode {
    pub const NO_REASON: Self = Self(0);
    pub const FOREIGN_EXCEPTION_CAUGHT: Self = Self(1);
    pub const FATAL_PHASE2_ERROR: Self = Self(2);
    pub const FATAL_PHASE1_ERROR: Self = Self(3);
    pub const NORMAL_STOP: Self = Self(4);
    pub const END_OF_STACK: Self = Self(5);
    pub const HANDLER_FOUND: Self = Self(6);
    pub const INSTALL_CONTEXT: Self = Self(7);
    pub const CONTINUE_UNWIND: Self = Self(8);
    pub const FAILURE: Self = Self(9);
}

/// `_Unwind_Action` bit set
pub type UnwindAction = c_int;

pub const UA_SEARCH_PHASE: UnwindAction = 1;
pub const UA_CLEANUP_PHASE: UnwindAction = 2;
pub const UA_HANDLER_FRAME: UnwindAction = 4;
pub const UA_FORCE_UNWIND: UnwindAction = 8;
pub const UA_END_OF_STACK: UnwindAction = 16;

/// `struct _Unwind_Exception`, never looked into
#[repr(C)]
pub struct UnwindException {
    _private: [u8; 0],
}

/// `struct _Unwind_Context`, never looked into
#[repr(C)]
pub struct UnwindContext {
    _private: [u8; 0],
}

/// Signature shared by the platform routine and the wrapper
pub type PersonalityFn = unsafe extern "C" fn(
    version: c_int,
    actions: UnwindAction,
    exception_class: u64,
    ue_header: *mut UnwindException,
    context: *mut UnwindContext,
) -> UnwindReasonCode;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
unsafe extern "C" {
    fn __gcc_personality_v0(
        version: c_int,
        actions: UnwindAction,
        exception_class: u64,
        ue_header: *mut UnwindException,
        context: *mut UnwindContext,
    ) -> UnwindReasonCode;
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn platform_personality() -> PersonalityFn {
    __gcc_personality_v0
}

/// No platform routine to defer to: no frame handles anything
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn platform_personality() -> PersonalityFn {
    unsafe extern "C" fn continue_unwind(
        _version: c_int,
        _actions: UnwindAction,
        _exception_class: u64,
        _ue_header: *mut UnwindException,
        _context: *mut UnwindContext,
    ) -> UnwindReasonCode {
        UnwindReasonCode::CONTINUE_UNWIND
    }
    continue_unwind
}

/// Installed override; null means the platform routine
static NATIVE_PERSONALITY: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

/// The routine the wrapper forwards to
pub fn native_personality() -> PersonalityFn {
    let raw = NATIVE_PERSONALITY.load(Ordering::Acquire);
    if raw.is_null() {
        platform_personality()
    } else {
        // Only ever stored from a PersonalityFn
        unsafe { std::mem::transmute::<*mut (), PersonalityFn>(raw) }
    }
}

/// Forward to `routine` instead of the platform routine. Returns the
/// routine previously in effect.
pub fn set_native_personality(routine: PersonalityFn) -> PersonalityFn {
    let previous = native_personality();
    NATIVE_PERSONALITY.store(routine as *mut (), Ordering::Release);
    previous
}

#[repr(C)]
struct PersonalityArgs<'a> {
    task: &'a Task,
    version: c_int,
    actions: UnwindAction,
    exception_class: u64,
    ue_header: *mut UnwindException,
    context: *mut UnwindContext,
    retval: UnwindReasonCode,
}

impl UpcallRecord for PersonalityArgs<'_> {
    const NAME: &'static str = "personality";
    const LOG_ENTRY: bool = false;

    fn task(&self) -> &Task {
        self.task
    }

    fn handle(&mut self) {
        self.retval = unsafe {
            native_personality()(
                self.version,
                self.actions,
                self.exception_class,
                self.ue_header,
                self.context,
            )
        };
    }
}

/// Personality routine for generated code: the platform routine, always run
/// on the native stack.
///
/// # Safety
/// Called by the unwinder with the arguments it hands every personality
/// routine.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn upcall_personality(
    version: c_int,
    actions: UnwindAction,
    exception_class: u64,
    ue_header: *mut UnwindException,
    context: *mut UnwindContext,
) -> UnwindReasonCode {
    let task = match unsafe { current_task() } {
        Some(task) if !task.is_on_native_stack() => task,
        _ => {
            return unsafe {
                native_personality()(version, actions, exception_class, ue_header, context)
            };
        }
    };

    let mut args = PersonalityArgs {
        task,
        version,
        actions,
        exception_class,
        ue_header,
        context,
        retval: UnwindReasonCode::NO_REASON,
    };
    dispatch(task, &mut args);
    args.retval
}
