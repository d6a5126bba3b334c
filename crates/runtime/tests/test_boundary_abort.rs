//! Boundary shim abort tests
//!
//! A failure that reaches a boundary shim aborts the process, so each test
//! re-runs this test binary filtered down to itself, with an environment
//! variable telling the child to take the aborting path, and checks how the
//! child died.

use std::ffi::c_void;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};
use std::ptr;
use taskrt::upcalls::{
    upcall_call_shim_on_guest_stack, upcall_call_shim_on_native_stack, upcall_fail, upcall_free,
    upcall_malloc,
};
use taskrt::{Task, TaskFailure, TaskState, TypeDesc};

const CHILD_ENV: &str = "TASKRT_ABORT_CHILD";

fn is_child(test: &str) -> bool {
    std::env::var(CHILD_ENV).as_deref() == Ok(test)
}

fn run_child(test: &str) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args(["--exact", test, "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, test)
        .output()
        .unwrap()
}

fn assert_aborted(output: &Output, message: &str) {
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "child exited cleanly: {}", stderr);
    assert_eq!(output.status.signal(), Some(libc::SIGABRT), "stderr: {}", stderr);
    assert!(stderr.contains(message), "stderr: {}", stderr);
}

unsafe extern "C-unwind" fn failing(_args: *mut c_void) {
    unsafe { upcall_fail(c"boom".as_ptr(), c"shim.ext".as_ptr(), 1) }
}

unsafe extern "C-unwind" fn throwing(_args: *mut c_void) {
    std::panic::resume_unwind(Box::new("foreign exception"))
}

#[test]
fn guest_shim_failure_aborts() {
    if is_child("guest_shim_failure_aborts") {
        let task = Task::new("reentered").unwrap();
        let _g = task.enter();
        taskrt::on_native_stack(&task, || unsafe {
            upcall_call_shim_on_guest_stack(ptr::null_mut(), failing)
        });
        // Only reached if the shim let the failure through
        std::process::exit(0);
    }

    let output = run_child("guest_shim_failure_aborts");
    assert_aborted(&output, "task failed after reentering the guest stack");
}

#[test]
fn native_shim_exception_aborts() {
    if is_child("native_shim_exception_aborts") {
        let task = Task::new("foreign").unwrap();
        task.run(|| unsafe { upcall_call_shim_on_native_stack(ptr::null_mut(), throwing) })
            .ok();
        std::process::exit(0);
    }

    let output = run_child("native_shim_exception_aborts");
    assert_aborted(&output, "foreign code threw an exception");
}

#[test]
fn double_failure_aborts() {
    struct FailAgainOnDrop<'a>(&'a Task);

    impl Drop for FailAgainOnDrop<'_> {
        fn drop(&mut self) {
            self.0.fail("second", "drop.ext", 2);
        }
    }

    if is_child("double_failure_aborts") {
        let task = Task::new("twice").unwrap();
        let _: Result<(), taskrt::TaskFailure> = task.run(|| {
            let _guard = FailAgainOnDrop(&task);
            task.fail("first", "run.ext", 1);
        });
        std::process::exit(0);
    }

    let output = run_child("double_failure_aborts");
    assert_aborted(&output, "task failed while already failing");
}

#[test]
fn upcall_without_task_aborts() {
    if is_child("upcall_without_task_aborts") {
        unsafe { taskrt::upcalls::upcall_trace(c"orphan".as_ptr(), ptr::null(), 0) };
        std::process::exit(0);
    }

    let output = run_child("upcall_without_task_aborts");
    assert_aborted(&output, "upcall made with no current task");
}

#[test]
fn dead_task_upcall_aborts() {
    static WORD: TypeDesc = TypeDesc::new(16, 8);

    if is_child("dead_task_upcall_aborts") {
        let task = Task::new("dead").unwrap();
        let _: Result<(), TaskFailure> = task.run(|| task.fail("gone", "dead.ext", 5));
        assert_eq!(task.state(), TaskState::Dead);
        let _g = task.enter();
        let header = unsafe { upcall_malloc(&WORD, 16) };
        eprintln!("dead task malloc returned {:p}", header);
        std::process::exit(0);
    }

    let output = run_child("dead_task_upcall_aborts");
    assert_aborted(&output, "upcall made by a dead task");
}

#[test]
fn failing_task_cleanup_frees_complete() {
    static WORD: TypeDesc = TypeDesc::new(16, 8);

    struct FreeOnDrop(*mut taskrt::BoxHeader);

    impl Drop for FreeOnDrop {
        fn drop(&mut self) {
            unsafe { upcall_free(self.0) };
        }
    }

    let task = Task::new("cleanup").unwrap();
    let result: Result<(), TaskFailure> = task.run(|| {
        let _owned = FreeOnDrop(unsafe { upcall_malloc(&WORD, 16) });
        task.fail("unwinding", "cleanup.ext", 3);
    });
    assert_eq!(result.unwrap_err().line, 3);
    assert_eq!(task.live_boxes(), 0);
}
