//! Upcall dispatch
//!
//! Every upcall has the same shape: the guest-callable entry point packs its
//! arguments into a `#[repr(C)]` record on the guest stack, switches to the
//! native stack, runs the handler against the record, switches back and
//! reads the result out of the record's last field. [`UpcallRecord`] is that
//! record; [`dispatch`] is the whole round trip, written once.

use crate::log::rtlog;
use crate::switch::switch_and_call;
use crate::task::Task;
use std::ffi::c_void;

/// Argument record of one upcall kind
pub trait UpcallRecord {
    /// Name shown in the upcall log
    const NAME: &'static str;

    /// Whether entry is logged. Off for upcalls that run during unwinding.
    const LOG_ENTRY: bool = true;

    fn task(&self) -> &Task;

    /// The service itself. Runs on the native stack.
    fn handle(&mut self);
}

/// Native-stack entry for records of type `R`
unsafe extern "C-unwind" fn trampoline<R: UpcallRecord>(args: *mut c_void) {
    let record = unsafe { &mut *args.cast::<R>() };
    if R::LOG_ENTRY {
        rtlog!(record.task(), Upcall, "> UPCALL {}", R::NAME);
    }
    record.handle();
}

/// Run `record`'s handler on `task`'s native stack.
#[inline]
pub fn dispatch<R: UpcallRecord>(task: &Task, record: &mut R) {
    let args = (record as *mut R).cast::<c_void>();
    unsafe { switch_and_call(task, args, trampoline::<R>) }
}
