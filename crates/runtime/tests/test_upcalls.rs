//! End-to-end tests of the upcall entry points
//!
//! Each test drives the C entry points the way generated code would: with a
//! task installed as current, from the guest stack or from the test thread.

use std::ffi::c_void;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex};
use taskrt::upcalls::{
    rt_upcall_exchange_free, rt_upcall_exchange_malloc, rt_upcall_fail, rt_upcall_free,
    rt_upcall_malloc, upcall_del_stack, upcall_exchange_free, upcall_exchange_malloc, upcall_fail,
    upcall_free, upcall_malloc, upcall_new_stack, upcall_reset_stack_limit, upcall_stack_limit,
    upcall_trace,
};
use taskrt::{BoxHeader, RefCount, Task, TaskFailure, TaskState, TypeDesc, UpcallRecord, dispatch};

static WORD: TypeDesc = TypeDesc::new(16, 8);

fn live_list(task: &Task) -> Vec<*mut BoxHeader> {
    task.local_heap().iter().map(|h| h.as_ptr()).collect()
}

#[test]
fn test_local_box_scenario() {
    let task = Task::new("scenario-a").unwrap();
    let _g = task.enter();
    let before = live_list(&task);

    let header = unsafe { upcall_malloc(&WORD, 16) };
    assert!(!header.is_null());
    unsafe {
        assert_eq!((*header).ref_count(), RefCount::Tracked(1));
        assert_eq!((*header).td, &WORD as *const TypeDesc);
        let body = BoxHeader::body(header);
        assert_eq!(body as usize % 8, 0);
        assert!(std::slice::from_raw_parts(body, 16).iter().all(|&b| b == 0));
    }
    assert!(live_list(&task).contains(&header));

    unsafe { upcall_free(header) };
    assert!(!live_list(&task).contains(&header));
    assert_eq!(live_list(&task), before);
}

#[test]
fn test_local_boxes_from_guest_stack() {
    let task = Task::new("guest-allocs").unwrap();
    let count = task
        .run(|| {
            let boxes: Vec<_> = (0..10).map(|i| unsafe { upcall_malloc(&WORD, 8 * i) }).collect();
            let live = task.live_boxes();
            for b in boxes.into_iter().rev() {
                unsafe { upcall_free(b) };
            }
            live
        })
        .unwrap();
    assert_eq!(count, 10);
    assert_eq!(task.live_boxes(), 0);
}

#[test]
fn test_exchange_box_is_untracked() {
    let task = Task::new("exchange").unwrap();
    let _g = task.enter();

    let header = unsafe { upcall_exchange_malloc(&WORD, 16) };
    assert!(!header.is_null());
    unsafe {
        assert_eq!((*header).ref_count, -1);
        assert_eq!((*header).ref_count(), RefCount::Untracked);
        assert!((*header).prev.is_null());
        assert!((*header).next.is_null());
    }
    assert!(live_list(&task).is_empty());
    unsafe { upcall_exchange_free(header) };
}

#[test]
fn test_aliases_resolve_to_same_behavior() {
    let task = Task::new("aliases").unwrap();
    let _g = task.enter();

    let local = unsafe { rt_upcall_malloc(&WORD, 16) };
    assert_eq!(unsafe { (*local).ref_count() }, RefCount::Tracked(1));
    assert!(live_list(&task).contains(&local));
    unsafe { rt_upcall_free(local) };
    assert!(live_list(&task).is_empty());

    let shared = unsafe { rt_upcall_exchange_malloc(&WORD, 16) };
    assert_eq!(unsafe { (*shared).ref_count }, -1);
    unsafe { rt_upcall_exchange_free(shared) };

    let failed: Result<(), TaskFailure> =
        task.run(|| unsafe { rt_upcall_fail(c"alias".as_ptr(), c"alias.ext".as_ptr(), 3) });
    assert_eq!(failed, Err(TaskFailure::new("alias", "alias.ext", 3)));
}

#[test]
#[allow(unreachable_code)]
fn test_fail_marks_task_and_never_returns() {
    let task = Task::new("scenario-b").unwrap();
    let _g = task.enter();
    let mut after_call = false;

    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
        unsafe { upcall_fail(c"x > 0".as_ptr(), c"file.ext".as_ptr(), 42) };
        after_call = true;
    }));

    assert!(caught.is_err());
    assert!(!after_call);
    assert_eq!(task.state(), TaskState::Failing);
    assert_eq!(
        task.failure(),
        Some(TaskFailure::new("x > 0", "file.ext", 42))
    );
}

#[test]
fn test_fail_from_guest_stack_ends_task() {
    let task = Task::new("guest-fail").unwrap();
    let result: Result<(), TaskFailure> =
        task.run(|| unsafe { upcall_fail(c"x > 0".as_ptr(), c"file.ext".as_ptr(), 42) });
    let failure = result.unwrap_err();
    assert_eq!(failure.to_string(), "task failed at 'x > 0', file.ext:42");
    assert_eq!(task.state(), TaskState::Dead);
}

#[test]
fn test_fail_with_null_strings() {
    let task = Task::new("null-strings").unwrap();
    let result: Result<(), TaskFailure> =
        task.run(|| unsafe { upcall_fail(ptr::null(), ptr::null(), 0) });
    assert_eq!(result.unwrap_err().expr, "<unknown>");
}

#[test]
fn test_allocator_exhaustion_fails_task() {
    let task = Task::new("exhausted").unwrap();
    let local: Result<*mut BoxHeader, TaskFailure> =
        task.run(|| unsafe { upcall_malloc(&WORD, 1 << 60) });
    let failure = local.unwrap_err();
    assert!(failure.expr.contains("out of memory"), "{}", failure);
    assert_eq!(task.state(), TaskState::Dead);
    assert_eq!(task.live_boxes(), 0);

    let task = Task::new("exhausted-exchange").unwrap();
    let shared: Result<*mut BoxHeader, TaskFailure> =
        task.run(|| unsafe { upcall_exchange_malloc(&WORD, 1 << 60) });
    let failure = shared.unwrap_err();
    assert!(failure.expr.contains("out of memory"), "{}", failure);
    assert_eq!(task.state(), TaskState::Dead);
}

#[test]
fn test_grow_then_shrink_restores_frame_base() {
    let task = Task::new("segments").unwrap();
    let _g = task.enter();
    let before = task.frame_base();
    let limit_before = upcall_stack_limit();
    let args: [u32; 4] = [1, 2, 3, 4];

    let base = unsafe { upcall_new_stack(64 * 1024, args.as_ptr().cast(), 16) };
    assert_ne!(base as usize, before);
    assert_eq!(task.stack_depth(), 2);
    let copied = unsafe { std::slice::from_raw_parts(base as *const u32, 4) };
    assert_eq!(copied, &args);

    unsafe { upcall_del_stack() };
    assert_eq!(task.frame_base(), before);
    assert_eq!(upcall_stack_limit(), limit_before);
}

#[test]
fn test_reset_stack_limit_retires_abandoned_segments() {
    let task = Task::new("landing-pad").unwrap();
    let depth = task
        .run(|| unsafe {
            upcall_new_stack(4096, ptr::null(), 0);
            upcall_new_stack(4096, ptr::null(), 0);
            assert_eq!(task.stack_depth(), 3);
            // Still executing on the root segment, as after an unwind
            upcall_reset_stack_limit();
            assert_eq!(upcall_stack_limit(), task.stack_limit());
            task.stack_depth()
        })
        .unwrap();
    assert_eq!(depth, 1);
}

#[repr(C)]
struct WhereAmI<'a> {
    task: &'a Task,
    retval: bool,
}

impl UpcallRecord for WhereAmI<'_> {
    const NAME: &'static str = "where_am_i";

    fn task(&self) -> &Task {
        self.task
    }

    fn handle(&mut self) {
        self.retval = self.task.is_on_native_stack();
    }
}

#[test]
fn test_handler_sees_native_stack_from_either_origin() {
    let task = Task::new("origins").unwrap();

    let from_guest = task
        .run(|| {
            let mut record = WhereAmI {
                task: &task,
                retval: false,
            };
            dispatch(&task, &mut record);
            record.retval
        })
        .unwrap();
    assert!(from_guest);

    let from_native = taskrt::on_native_stack(&task, || {
        let mut record = WhereAmI {
            task: &task,
            retval: false,
        };
        dispatch(&task, &mut record);
        record.retval
    });
    assert!(from_native);
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Capture {
    type Writer = Capture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn test_trace_emits_record_without_state_change() {
    let capture = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();

    let task = Task::new("tracer").unwrap();
    tracing::subscriber::with_default(subscriber, || {
        task.run(|| unsafe {
            upcall_trace(c"hello from guest".as_ptr(), c"file.ext".as_ptr(), 7)
        })
        .unwrap();
    });

    let log = capture.contents();
    assert!(log.contains("taskrt::trace"), "log was: {}", log);
    assert!(log.contains("file.ext:7: hello from guest"), "log was: {}", log);
    assert!(log.contains("> UPCALL trace"), "log was: {}", log);
    assert!(log.contains("tracer"), "log was: {}", log);
    assert_eq!(task.state(), TaskState::Runnable);
    assert!(task.failure().is_none());
}

#[test]
fn test_shim_runs_foreign_function_on_native_stack() {
    unsafe extern "C-unwind" fn foreign(args: *mut c_void) {
        let out = unsafe { &mut *args.cast::<(usize, bool)>() };
        out.0 *= 3;
        out.1 = taskrt::with_current_task(|t| t.is_on_native_stack()).unwrap_or(false);
    }

    let task = Task::new("shim").unwrap();
    let result = task
        .run(|| {
            let mut args = (14usize, false);
            unsafe {
                taskrt::upcalls::upcall_call_shim_on_native_stack(
                    (&mut args as *mut (usize, bool)).cast(),
                    foreign,
                )
            };
            args
        })
        .unwrap();
    assert_eq!(result, (42, true));
}
