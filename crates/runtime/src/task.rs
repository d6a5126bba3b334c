//! Tasks
//!
//! A [`Task`] owns everything the upcall layer touches on its behalf: the
//! task-local heap, the guest stack chain, and the native stack its upcalls
//! run on. Nothing here is shared between tasks, so nothing here locks.
//!
//! ## Current task
//!
//! Upcalls receive no task argument; they find the task through a
//! thread-local pointer. [`Task::enter`] installs it and hands back a guard
//! that puts the previous one back on drop, so a thread can only ever see a
//! task that is still alive.
//!
//! ## Failure
//!
//! [`Task::fail`] records the failure and unwinds with it as the panic
//! payload. The unwind crosses any number of stack switches and is caught by
//! [`Task::run`], which turns it back into an `Err`.

use crate::config::{RuntimeConfig, runtime_config};
use crate::debug::OriginTracker;
use crate::local_heap::LocalHeap;
use crate::log::rtlog;
use crate::stack::{
    SegmentBounds, SegmentChain, current_sp, map_stack, record_stack_limit,
};
use crate::switch;
use corosensei::stack::{DefaultStack, Stack};
use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use taskrt_core::{RuntimeError, fatal, format_panic_payload};

/// Total tasks ever created
pub static TASKS_CREATED: AtomicU64 = AtomicU64::new(0);
/// Tasks not yet dropped
pub static TASKS_LIVE: AtomicUsize = AtomicUsize::new(0);
/// Total tasks that failed
pub static TASKS_FAILED: AtomicU64 = AtomicU64::new(0);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TASK: Cell<*const Task> = const { Cell::new(ptr::null()) };
}

/// Snapshot of the task counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    pub created: u64,
    pub live: usize,
    pub failed: u64,
}

pub fn task_stats() -> TaskStats {
    TaskStats {
        created: TASKS_CREATED.load(Ordering::Relaxed),
        live: TASKS_LIVE.load(Ordering::Relaxed),
        failed: TASKS_FAILED.load(Ordering::Relaxed),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, or between runs
    Runnable,
    /// Inside [`Task::run`]
    Running,
    /// Unwinding after a failure
    Failing,
    /// Failed; never runs again
    Dead,
}

/// Where and why a task failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub expr: String,
    pub file: String,
    pub line: usize,
}

impl TaskFailure {
    pub fn new(expr: impl Into<String>, file: impl Into<String>, line: usize) -> Self {
        Self {
            expr: expr.into(),
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task failed at '{}', {}:{}", self.expr, self.file, self.line)
    }
}

impl std::error::Error for TaskFailure {}

pub struct Task {
    id: u64,
    name: String,
    state: Cell<TaskState>,
    failure: RefCell<Option<TaskFailure>>,
    heap: RefCell<LocalHeap>,
    chain: RefCell<SegmentChain>,
    native: DefaultStack,
    /// Where the guest stack was left for the native one
    pub(crate) guest_sp: Cell<Option<usize>>,
    /// Where the native stack was left for the guest one
    pub(crate) native_sp: Cell<Option<usize>>,
    origins: OriginTracker,
}

impl Task {
    /// Create a task sized by the process-wide configuration.
    pub fn new(name: impl Into<String>) -> Result<Self, RuntimeError> {
        Self::with_config(name, runtime_config())
    }

    pub fn with_config(
        name: impl Into<String>,
        config: &RuntimeConfig,
    ) -> Result<Self, RuntimeError> {
        let chain = SegmentChain::new(config)?;
        let native = map_stack(config.native_stack_size)?;

        let task = Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Cell::new(TaskState::Runnable),
            failure: RefCell::new(None),
            heap: RefCell::new(LocalHeap::new()),
            chain: RefCell::new(chain),
            native,
            guest_sp: Cell::new(None),
            native_sp: Cell::new(None),
            origins: OriginTracker::default(),
        };

        TASKS_CREATED.fetch_add(1, Ordering::Relaxed);
        TASKS_LIVE.fetch_add(1, Ordering::Relaxed);
        rtlog!(&task, Task, "task created");
        Ok(task)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// The recorded failure, if the task has failed
    pub fn failure(&self) -> Option<TaskFailure> {
        self.failure.borrow().clone()
    }

    /// Install this task as the thread's current task until the guard drops.
    pub fn enter(&self) -> TaskGuard<'_> {
        let previous = CURRENT_TASK.with(|c| c.replace(self as *const Task));
        self.publish_limit();
        TaskGuard {
            previous,
            _task: PhantomData,
        }
    }

    /// Whether this task is the thread's current task
    pub fn is_current(&self) -> bool {
        CURRENT_TASK.with(|c| ptr::eq(c.get(), self))
    }

    /// Run `f` on the guest stack as this task.
    ///
    /// A failure raised inside `f` (through [`Task::fail`], or any panic)
    /// is caught here: segments the unwind abandoned are retired, the task
    /// becomes [`TaskState::Dead`] and the failure is returned. A dead task
    /// returns its failure again without running `f`.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Result<R, TaskFailure> {
        if self.state.get() == TaskState::Dead {
            return Err(self
                .failure()
                .unwrap_or_else(|| TaskFailure::new("task is dead", "<runtime>", 0)));
        }

        let _guard = self.enter();
        self.state.set(TaskState::Running);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| switch::on_guest_stack(self, f)));

        let retired = self.chain.borrow_mut().unwind_to_root();
        if retired > 0 {
            rtlog!(self, Stack, "retired {} abandoned segment(s)", retired);
        }
        self.publish_limit();

        match outcome {
            Ok(value) => {
                self.state.set(TaskState::Runnable);
                Ok(value)
            }
            Err(payload) => {
                let failure = match payload.downcast::<TaskFailure>() {
                    Ok(failure) => *failure,
                    Err(other) => {
                        let failure =
                            TaskFailure::new(format_panic_payload(&other), "<unknown>", 0);
                        self.record_failure(&failure);
                        failure
                    }
                };
                self.state.set(TaskState::Dead);
                Err(failure)
            }
        }
    }

    /// Fail the task: record the failure and unwind out of it.
    ///
    /// Failing again while the first failure is still unwinding cannot be
    /// recovered from and aborts the process.
    pub fn fail(&self, expr: &str, file: &str, line: usize) -> ! {
        if self.state.get() == TaskState::Failing {
            fatal("task failed while already failing");
        }
        let failure = TaskFailure::new(expr, file, line);
        self.state.set(TaskState::Failing);
        self.record_failure(&failure);
        panic::resume_unwind(Box::new(failure))
    }

    fn record_failure(&self, failure: &TaskFailure) {
        tracing::error!(
            target: "taskrt::task",
            task = %self.name,
            task_id = self.id,
            "{}",
            failure
        );
        *self.failure.borrow_mut() = Some(failure.clone());
        TASKS_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    /// The task-local heap
    pub fn local_heap(&self) -> RefMut<'_, LocalHeap> {
        self.heap.borrow_mut()
    }

    /// Boxes currently live on the task-local heap
    pub fn live_boxes(&self) -> usize {
        self.heap.borrow().live_count()
    }

    pub fn origins(&self) -> &OriginTracker {
        &self.origins
    }

    pub fn native_bounds(&self) -> SegmentBounds {
        SegmentBounds {
            limit: self.native.limit().get(),
            base: self.native.base().get(),
        }
    }

    /// Whether the caller is running on this task's native stack
    pub fn is_on_native_stack(&self) -> bool {
        self.native_bounds().contains(current_sp())
    }

    /// Whether `addr` lies on any of this task's guest segments
    pub fn is_guest_address(&self, addr: usize) -> bool {
        self.chain.borrow().contains(addr)
    }

    /// Bounds of the current guest segment
    pub fn guest_bounds(&self) -> SegmentBounds {
        self.chain.borrow().bounds()
    }

    /// Frame base of the current guest segment
    pub fn frame_base(&self) -> usize {
        self.chain.borrow().frame_base()
    }

    /// Number of guest segments, root included
    pub fn stack_depth(&self) -> usize {
        self.chain.borrow().depth()
    }

    /// Overflow boundary of the current guest segment
    pub fn stack_limit(&self) -> usize {
        self.chain.borrow().limit()
    }

    /// Switch the guest stack to a segment with room for a `requested` byte
    /// frame, carrying the caller's argument block over. Returns the new
    /// frame base.
    ///
    /// # Safety
    /// `args_addr` must be readable for `args_size` bytes.
    pub unsafe fn grow_stack(
        &self,
        requested: usize,
        args_addr: *const u8,
        args_size: usize,
    ) -> Result<usize, RuntimeError> {
        let frame_base = unsafe { self.chain.borrow_mut().grow(requested, args_addr, args_size)? };
        rtlog!(
            self,
            Stack,
            "grew stack for {} bytes, frame base {:#x}, depth {}",
            requested,
            frame_base,
            self.stack_depth()
        );
        self.publish_limit();
        Ok(frame_base)
    }

    /// Retire the current guest segment.
    pub fn shrink_stack(&self) -> Result<(), RuntimeError> {
        self.chain.borrow_mut().shrink()?;
        rtlog!(self, Stack, "shrank stack, depth {}", self.stack_depth());
        self.publish_limit();
        Ok(())
    }

    /// Retire segments the stack pointer has been unwound out of, then
    /// republish the overflow boundary.
    pub fn refresh_stack_limit(&self) {
        let retired = self.chain.borrow_mut().unwind_to(current_sp());
        if retired > 0 {
            rtlog!(self, Stack, "reset stack limit, retired {} segment(s)", retired);
        }
        self.publish_limit();
    }

    fn publish_limit(&self) {
        if self.is_current() {
            record_stack_limit(self.stack_limit());
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("live_boxes", &self.live_boxes())
            .field("chain", &*self.chain.borrow())
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        TASKS_LIVE.fetch_sub(1, Ordering::Relaxed);
        rtlog!(self, Task, "task dropped in state {:?}", self.state.get());
    }
}

/// Keeps a task installed as the thread's current task
#[must_use = "the task is only current while the guard is alive"]
pub struct TaskGuard<'a> {
    previous: *const Task,
    _task: PhantomData<&'a Task>,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        CURRENT_TASK.with(|c| c.set(self.previous));
        let limit = unsafe { self.previous.as_ref() }.map_or(0, |task| task.stack_limit());
        record_stack_limit(limit);
    }
}

/// The thread's current task.
///
/// # Safety
/// The reference is only valid while the [`TaskGuard`] that installed the
/// task is alive; callers must not hold it past that.
pub unsafe fn current_task<'a>() -> Option<&'a Task> {
    CURRENT_TASK.with(|c| unsafe { c.get().as_ref() })
}

/// Run `f` with the thread's current task, if there is one
pub fn with_current_task<R>(f: impl FnOnce(&Task) -> R) -> Option<R> {
    unsafe { current_task() }.map(f)
}
