//! Diagnostic sink
//!
//! Every runtime event is tagged with a category, and each category is a
//! fixed `tracing` target, so `RUST_LOG=taskrt::mem=debug` selects exactly
//! the allocation traffic. Events carry the task's name and id as fields.
//!
//! | Category | Target | Level |
//! |----------|--------|-------|
//! | `Upcall` | `taskrt::upcall` | trace |
//! | `Mem` | `taskrt::mem` | debug |
//! | `Stack` | `taskrt::stack` | trace |
//! | `Trace` | `taskrt::trace` | info |
//! | `Task` | `taskrt::task` | info |

use crate::task::Task;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    /// Entry into an upcall
    Upcall,
    /// Box allocation and release
    Mem,
    /// Segment growth and retirement
    Stack,
    /// Messages from the trace upcall
    Trace,
    /// Task lifecycle
    Task,
}

impl LogCategory {
    pub fn target(self) -> &'static str {
        match self {
            LogCategory::Upcall => "taskrt::upcall",
            LogCategory::Mem => "taskrt::mem",
            LogCategory::Stack => "taskrt::stack",
            LogCategory::Trace => "taskrt::trace",
            LogCategory::Task => "taskrt::task",
        }
    }
}

/// Emit one event for `task`. Fire and forget.
pub fn emit(task: &Task, category: LogCategory, args: fmt::Arguments<'_>) {
    let name = task.name();
    let id = task.id();
    // tracing needs the target as a literal, hence one arm per category
    match category {
        LogCategory::Upcall => {
            tracing::trace!(target: "taskrt::upcall", task = name, task_id = id, "{}", args)
        }
        LogCategory::Mem => {
            tracing::debug!(target: "taskrt::mem", task = name, task_id = id, "{}", args)
        }
        LogCategory::Stack => {
            tracing::trace!(target: "taskrt::stack", task = name, task_id = id, "{}", args)
        }
        LogCategory::Trace => {
            tracing::info!(target: "taskrt::trace", task = name, task_id = id, "{}", args)
        }
        LogCategory::Task => {
            tracing::info!(target: "taskrt::task", task = name, task_id = id, "{}", args)
        }
    }
}

/// `rtlog!(task, Category, "format", args...)`
macro_rules! rtlog {
    ($task:expr, $category:ident, $($arg:tt)+) => {
        $crate::log::emit($task, $crate::log::LogCategory::$category, format_args!($($arg)+))
    };
}

pub(crate) use rtlog;
