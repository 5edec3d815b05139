//! The routine scheduler (spec.md §4.5/§5): one background worker
//! routine plus up to ten pinned interrupt-service routines. Pinned
//! routines are exempt from ordinary round-robin scheduling — they run
//! to completion as soon as their bound interrupt fires, ahead of the
//! worker's queue.
//!
//! Diagnostics counters follow the teacher's `StrandRegistry` pattern:
//! lock-free atomics on the hot path (spawn/complete), a snapshot
//! struct for the cold diagnostic-dump path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::object::ObjRef;

/// Point-in-time scheduler counters, read by [`crate::diagnostics`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub pinned_count: usize,
    pub worker_running: bool,
    pub routines_spawned: u64,
    pub routines_completed: u64,
}

struct PinnedSlot {
    routine: ObjRef,
    irq: u32,
}

/// Owns the worker/pinned-routine bookkeeping for one VM instance.
/// Does not itself run bytecode — [`crate::interpreter::Interpreter`]
/// does that; the scheduler decides which [`crate::routine::Routine`]
/// gets the worker's attention next and tracks pinned-slot occupancy.
pub struct Scheduler {
    max_pinned: usize,
    pinned: Mutex<Vec<PinnedSlot>>,
    worker_running: AtomicUsize,
    routines_spawned: AtomicUsize,
    routines_completed: AtomicUsize,
}

impl Scheduler {
    pub fn new(max_pinned: usize) -> Self {
        Scheduler {
            max_pinned,
            pinned: Mutex::new(Vec::new()),
            worker_running: AtomicUsize::new(0),
            routines_spawned: AtomicUsize::new(0),
            routines_completed: AtomicUsize::new(0),
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.lock().expect("scheduler mutex poisoned").len()
    }

    /// Snapshot of the heap references of every currently pinned
    /// routine, for the GC's root set — a pinned ISR routine can be
    /// live with no script-visible variable pointing at it.
    pub fn pinned_refs(&self) -> Vec<ObjRef> {
        self.pinned
            .lock()
            .expect("scheduler mutex poisoned")
            .iter()
            .map(|s| s.routine)
            .collect()
    }

    pub fn worker_is_running(&self) -> bool {
        self.worker_running.load(Ordering::Acquire) != 0
    }

    /// Claims the single background-worker slot. Fails if a worker is
    /// already live (spec.md §5: "Attempting to start a second worker
    /// while one is live fails.").
    pub fn try_begin_worker(&self) -> Result<(), crate::error::RuntimeError> {
        match self
            .worker_running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.routines_spawned.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => Err(crate::error::RuntimeError::new(
                0,
                "a worker routine is already running",
            )),
        }
    }

    /// Releases the worker slot claimed by `try_begin_worker`.
    pub fn end_worker(&self) {
        self.routines_completed.fetch_add(1, Ordering::Relaxed);
        self.worker_running.store(0, Ordering::Release);
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pinned_count: self.pinned_count(),
            worker_running: self.worker_is_running(),
            routines_spawned: self.routines_spawned.load(Ordering::Relaxed) as u64,
            routines_completed: self.routines_completed.load(Ordering::Relaxed) as u64,
        }
    }

    /// Binds `routine` to `irq` as a pinned interrupt-service routine.
    /// Fails once `max_pinned` slots (spec.md §4.5: 10) are occupied.
    pub fn pin_routine(&self, routine: ObjRef, irq: u32) -> Result<(), crate::error::RuntimeError> {
        let mut guard = self.pinned.lock().expect("scheduler mutex poisoned");
        if guard.len() >= self.max_pinned {
            return Err(crate::error::RuntimeError::new(
                0,
                format!("no free pinned-routine slots (limit {})", self.max_pinned),
            ));
        }
        guard.push(PinnedSlot { routine, irq });
        Ok(())
    }

    pub fn unpin_routine(&self, routine: ObjRef) {
        self.pinned
            .lock()
            .expect("scheduler mutex poisoned")
            .retain(|s| s.routine != routine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinning_beyond_capacity_is_rejected() {
        let sched = Scheduler::new(2);
        sched.pin_routine(ObjRef(0), 1).unwrap();
        sched.pin_routine(ObjRef(1), 2).unwrap();
        assert!(sched.pin_routine(ObjRef(2), 3).is_err());
        assert_eq!(sched.pinned_count(), 2);
    }

    #[test]
    fn unpinning_frees_a_slot() {
        let sched = Scheduler::new(1);
        sched.pin_routine(ObjRef(0), 1).unwrap();
        sched.unpin_routine(ObjRef(0));
        assert_eq!(sched.pinned_count(), 0);
        assert!(sched.pin_routine(ObjRef(1), 2).is_ok());
    }

    #[test]
    fn only_one_worker_may_run_at_a_time() {
        let sched = Scheduler::new(1);
        sched.try_begin_worker().unwrap();
        assert!(sched.worker_is_running());
        assert!(sched.try_begin_worker().is_err());
        sched.end_worker();
        assert!(!sched.worker_is_running());
        assert!(sched.try_begin_worker().is_ok());
    }

    #[test]
    fn pinned_refs_reflects_current_slots() {
        let sched = Scheduler::new(2);
        sched.pin_routine(ObjRef(5), 1).unwrap();
        sched.pin_routine(ObjRef(7), 2).unwrap();
        let refs = sched.pinned_refs();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&ObjRef(5)));
        assert!(refs.contains(&ObjRef(7)));
    }
}
