//! Runtime configuration
//!
//! ## Configuration (Environment Variables)
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TASKRT_MIN_STACK` | `0x20000` (128 KiB) | Minimum size of a guest stack segment |
//! | `TASKRT_NATIVE_STACK` | `0x100000` (1 MiB) | Size of each task's native stack |
//! | `TASKRT_MAX_STACK` | `0x40000000` (1 GiB) | Total guest stack a task may hold before failing |
//!
//! Sizes are in bytes, decimal or `0x`-prefixed hex. Invalid or zero values
//! are warned about and replaced by the default; values below the floor are
//! raised to it.
//!
//! ## Example
//!
//! ```bash
//! # Larger guest segments and native stack for deep runtime services
//! TASKRT_MIN_STACK=0x40000 TASKRT_NATIVE_STACK=4194304 ./my-program
//! ```

use crate::stack::RED_ZONE;
use std::sync::OnceLock;

/// Default guest segment size: 128KB (0x20000 bytes)
pub const DEFAULT_MIN_STACK: usize = 0x20000;

/// Default native stack size: 1MB
pub const DEFAULT_NATIVE_STACK: usize = 0x100000;

/// Default cap on a task's total guest stack
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_MAX_STACK: usize = 1024 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_MAX_STACK: usize = 256 * 1024 * 1024;

/// Smallest guest segment: room for the red zone plus a usable frame area
const MIN_STACK_FLOOR: usize = 4 * RED_ZONE;

/// Smallest native stack the runtime services are known to fit in
const NATIVE_STACK_FLOOR: usize = 0x10000;

/// Stack sizing for tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Minimum size of a guest stack segment
    pub min_stack_size: usize,
    /// Size of the native stack each task runs its upcalls on
    pub native_stack_size: usize,
    /// Total guest stack a task may hold before it fails
    pub max_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            min_stack_size: DEFAULT_MIN_STACK,
            native_stack_size: DEFAULT_NATIVE_STACK,
            max_stack_size: DEFAULT_MAX_STACK,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let min_stack_size = parse_size(
            "TASKRT_MIN_STACK",
            lookup("TASKRT_MIN_STACK"),
            DEFAULT_MIN_STACK,
        )
        .max(MIN_STACK_FLOOR);

        let native_stack_size = parse_size(
            "TASKRT_NATIVE_STACK",
            lookup("TASKRT_NATIVE_STACK"),
            DEFAULT_NATIVE_STACK,
        )
        .max(NATIVE_STACK_FLOOR);

        let max_stack_size = parse_size(
            "TASKRT_MAX_STACK",
            lookup("TASKRT_MAX_STACK"),
            DEFAULT_MAX_STACK,
        )
        .max(min_stack_size);

        Self {
            min_stack_size,
            native_stack_size,
            max_stack_size,
        }
    }
}

/// Parse a byte size from an optional string value.
///
/// Returns `default` if the value is missing, zero, or invalid. Warns for
/// invalid values.
fn parse_size(name: &str, value: Option<String>, default: usize) -> usize {
    let Some(raw) = value else {
        return default;
    };
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => trimmed.parse::<usize>(),
    };

    match parsed {
        Ok(0) => {
            tracing::warn!("{}=0 is invalid, using default {}", name, default);
            default
        }
        Ok(size) => size,
        Err(_) => {
            tracing::warn!(
                "{}='{}' is not a valid size, using default {}",
                name,
                raw,
                default
            );
            default
        }
    }
}

static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration, read from the environment on first use
pub fn runtime_config() -> &'static RuntimeConfig {
    RUNTIME_CONFIG.get_or_init(RuntimeConfig::from_env)
}
