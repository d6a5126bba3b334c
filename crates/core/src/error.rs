//! Runtime Error Handling
//!
//! Errors produced below the upcall ABI. None of these ever reach generated
//! code: upcall handlers escalate them into task failure, and the few
//! conditions that cannot be escalated go through [`fatal`], which aborts the
//! process.
//!
//! # Usage
//!
//! ```ignore
//! match heap.alloc(td, size) {
//!     Ok(header) => header,
//!     Err(e) => task.fail(&e.to_string(), file!(), line!() as usize),
//! }
//! ```

use std::fmt;

/// Error raised by the allocators and the guest stack chain
#[derive(Debug)]
pub enum RuntimeError {
    /// The backing allocator could not satisfy a request
    AllocatorExhausted { size: usize, align: usize },
    /// A type descriptor described an impossible layout
    InvalidLayout { size: usize, align: usize },
    /// The OS refused to map a stack
    StackAllocation { size: usize, source: std::io::Error },
    /// Growing the guest stack would exceed the configured maximum
    StackOverflow { requested: usize, limit: usize },
    /// A segment was retired while only the root segment remained
    StackUnderflow,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::AllocatorExhausted { size, align } => {
                write!(f, "out of memory allocating {} bytes (align {})", size, align)
            }
            RuntimeError::InvalidLayout { size, align } => {
                write!(f, "invalid allocation layout: size {} align {}", size, align)
            }
            RuntimeError::StackAllocation { size, source } => {
                write!(f, "failed to map a {} byte stack: {}", size, source)
            }
            RuntimeError::StackOverflow { requested, limit } => write!(
                f,
                "stack overflow: {} more bytes would exceed the {} byte limit",
                requested, limit
            ),
            RuntimeError::StackUnderflow => {
                write!(f, "stack underflow: no segment left to retire")
            }
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::StackAllocation { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Format a panic payload into an error message
pub fn format_panic_payload(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Report a fatal runtime error and abort the process.
///
/// Writes straight to fd 2 with no allocation and no locks: this runs at
/// boundaries where unwinding has already gone wrong and the logging stack
/// cannot be trusted.
pub fn fatal(msg: &str) -> ! {
    for part in ["taskrt: fatal runtime error: ", msg, "\n"] {
        // Best effort; there is nothing left to do if stderr is gone.
        unsafe {
            libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len());
        }
    }
    std::process::abort()
}
