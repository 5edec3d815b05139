//! Diagnostic snapshots of heap and scheduler state, grounded on the
//! teacher's `diagnostics.rs` SIGQUIT dump — minus the signal-hook
//! wiring itself, since installing a process-wide signal handler is a
//! CLI-layer concern this workspace doesn't own. Callers wire
//! [`dump_diagnostics`] to whatever signal or host hook they have.
//!
//! Emits through `tracing` rather than bare `eprintln!`, matching the
//! teacher's own logging crate (`seq-lsp`, the `diagnostics` feature of
//! `seq-runtime`) so a host that installs a `tracing_subscriber`
//! already captures this output alongside everything else.

use serde::{Deserialize, Serialize};

use crate::gc::HeapStats;
use crate::scheduler::SchedulerStats;

/// A single point-in-time view of both counters, suitable for logging
/// or returning from a host-exposed `diagnostics()` native.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub heap: HeapStats,
    pub scheduler: SchedulerStats,
}

/// Emits a structured dump of `diag` at `info` level, in the style of
/// the teacher's SIGQUIT handler.
pub fn dump_diagnostics(diag: &Diagnostics) {
    tracing::info!(
        bytes_allocated = diag.heap.bytes_allocated,
        objects_live = diag.heap.objects_live,
        collections_run = diag.heap.collections_run,
        bytes_freed_last_gc = diag.heap.bytes_freed_last_gc,
        worker_running = diag.scheduler.worker_running,
        pinned = diag.scheduler.pinned_count,
        spawned = diag.scheduler.routines_spawned,
        completed = diag.scheduler.routines_completed,
        "wisp diagnostics"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_does_not_panic_on_default_counters() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        dump_diagnostics(&Diagnostics::default());
    }
}
