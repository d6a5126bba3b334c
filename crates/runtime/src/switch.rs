//! Dual-stack switch engine
//!
//! Every task owns two stacks: the segmented guest stack generated code runs
//! on, and one fixed native stack the runtime's services run on. This module
//! is the only place that moves execution between them; everything else goes
//! through [`switch_and_call`], [`on_native_stack`] or [`on_guest_stack`].
//!
//! A switch is a synchronous call on another stack (via `corosensei`): the
//! closure runs to completion, then execution continues on the stack it came
//! from. Panics, and with them task failures, propagate across the switch.
//!
//! Switches nest. Leaving a stack records where it was left, so that the
//! next switch back onto it starts below the frames still live there:
//!
//! ```text
//! guest ──upcall──▶ native ──shim──▶ guest ──upcall──▶ native
//!   guest_sp saved    native_sp saved   starts below      starts below
//!                                       guest_sp          native_sp
//! ```

use crate::stack::{ARGS_ALIGN, StackRef, align_down, current_sp};
use crate::task::Task;
use std::cell::Cell;
use std::ffi::c_void;
use taskrt_core::fatal;

/// Gap left below a recorded stack pointer for the frames that were still
/// being pushed when the switch happened
pub const SWITCH_MARGIN: usize = 16 * 1024;

/// A service handler invoked on the native stack with its argument record
pub type UpcallHandler = unsafe extern "C-unwind" fn(*mut c_void);

/// Puts a saved stack pointer back when a switch returns or unwinds
struct RestoreSlot<'a> {
    slot: &'a Cell<Option<usize>>,
    previous: Option<usize>,
}

impl<'a> RestoreSlot<'a> {
    fn replace(slot: &'a Cell<Option<usize>>, sp: usize) -> Self {
        let previous = slot.replace(Some(sp));
        Self { slot, previous }
    }
}

impl Drop for RestoreSlot<'_> {
    fn drop(&mut self) {
        self.slot.set(self.previous);
    }
}

/// Run `f` on `task`'s native stack. A direct call if already there.
pub fn on_native_stack<R>(task: &Task, f: impl FnOnce() -> R) -> R {
    let sp = current_sp();
    let native = task.native_bounds();
    if native.contains(sp) {
        return f();
    }

    let top = match task.native_sp.get() {
        Some(saved) if native.contains(saved) => saved.saturating_sub(SWITCH_MARGIN),
        _ => native.base,
    };
    let Some(region) = StackRef::new(align_down(top, ARGS_ALIGN), native.limit) else {
        fatal("native stack exhausted by nested stack switches")
    };

    let _restore = RestoreSlot::replace(&task.guest_sp, sp);
    corosensei::on_stack(region, f)
}

/// Run `f` on `task`'s current guest segment. A direct call if already on
/// the guest stack.
pub fn on_guest_stack<R>(task: &Task, f: impl FnOnce() -> R) -> R {
    let sp = current_sp();
    if task.is_guest_address(sp) {
        return f();
    }

    let segment = task.guest_bounds();
    let top = match task.guest_sp.get() {
        Some(saved) if segment.contains(saved) => saved.saturating_sub(SWITCH_MARGIN),
        _ => task.frame_base(),
    };
    let Some(region) = StackRef::new(align_down(top, ARGS_ALIGN), segment.limit) else {
        fatal("guest segment exhausted by nested stack switches")
    };

    let _restore = RestoreSlot::replace(&task.native_sp, sp);
    corosensei::on_stack(region, f)
}

/// Switch to `task`'s native stack, call `handler(args)`, switch back.
///
/// # Safety
/// `args` must be the argument record `handler` expects, valid for the
/// duration of the call.
#[inline]
pub unsafe fn switch_and_call(task: &Task, args: *mut c_void, handler: UpcallHandler) {
    on_native_stack(task, || unsafe { handler(args) })
}
