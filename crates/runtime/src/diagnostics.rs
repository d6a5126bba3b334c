//! Runtime diagnostics for production debugging
//!
//! Provides a SIGQUIT (kill -3) handler that dumps task and allocator
//! statistics to stderr without stopping the process.
//!
//! ## Usage
//!
//! ```bash
//! kill -3 <pid>
//! ```
//!
//! ## Signal Safety
//!
//! dump_diagnostics() does I/O and takes the stderr lock, neither of which is
//! async-signal-safe. The handler therefore only wakes a dedicated thread
//! (signal-hook's iterator API), and the dump runs there.

use crate::task::task_stats;
use std::io::Write;
use std::sync::Once;
use taskrt_core::{exchange_live, kernel_stats};

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Install the SIGQUIT handler. Idempotent.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            use signal_hook::consts::SIGQUIT;
            use signal_hook::iterator::Signals;

            let mut signals = match Signals::new([SIGQUIT]) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("diagnostics: cannot register SIGQUIT handler: {}", e);
                    return;
                }
            };

            let spawned = std::thread::Builder::new()
                .name("taskrt-diagnostics".to_string())
                .spawn(move || {
                    for sig in signals.forever() {
                        if sig == SIGQUIT {
                            dump_diagnostics();
                        }
                    }
                });
            if let Err(e) = spawned {
                tracing::warn!("diagnostics: cannot spawn handler thread: {}", e);
            }
        }
    });
}

/// Dump runtime diagnostics to stderr
pub fn dump_diagnostics() {
    let mut out = std::io::stderr().lock();
    // stderr failures have nowhere better to go
    let _ = write_diagnostics(&mut out);
}

/// Write the diagnostics report to `out`
pub fn write_diagnostics(out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "\n=== taskrt Diagnostics ===")?;
    writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now())?;

    let tasks = task_stats();
    writeln!(out, "\n[Tasks]")?;
    writeln!(out, "  Live:    {}", tasks.live)?;
    writeln!(out, "  Created: {} (total)", tasks.created)?;
    writeln!(out, "  Failed:  {} (total)", tasks.failed)?;

    let kernel = kernel_stats();
    writeln!(out, "\n[Allocator]")?;
    writeln!(out, "  Live allocations: {}", kernel.live)?;
    writeln!(out, "  Peak live:        {} (high-water mark)", kernel.peak_live)?;
    writeln!(out, "  Allocated:        {} (total)", kernel.allocated)?;
    writeln!(out, "  Released:         {} (total)", kernel.released)?;

    let exchange = exchange_live();
    writeln!(out, "\n[Exchange Heap]")?;
    writeln!(out, "  Live boxes: {}", exchange)?;
    if exchange > 0 && tasks.live == 0 {
        writeln!(
            out,
            "  WARNING: {} exchange box(es) outlived every task (leaked?)",
            exchange
        )?;
    }

    writeln!(out, "\n=== End Diagnostics ===\n")
}
