//! Routines: the unit of cooperative execution (spec.md §4.5). A
//! routine owns its own value stack and call-frame array; routines
//! never share a stack the way OS threads share nothing but do share
//! the heap.

use crate::object::ObjRef;
use crate::types::TypeDesc;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle state of a routine, spec.md §3's five-state machine:
/// a routine starts `Unbound`, becomes `Running` once resumed, can
/// toggle `Running`/`Suspended` any number of times (via `yield` /
/// `resume`), and ends in `Closed` (returned) or `Error` (raised and
/// uncaught) from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineState {
    Unbound,
    Running,
    Suspended,
    Closed,
    Error,
}

/// One active call frame: the closure being executed, the bytecode
/// offset within it, and the base stack slot its locals start at.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub closure: ObjRef,
    pub ip: usize,
    pub stack_base: usize,
}

/// The mutable state behind a `Routine` heap object. Wrapped in
/// `Arc<Mutex<_>>` in [`crate::object::ObjKind::Routine`] so the
/// scheduler can hand a routine to its worker thread while other
/// routines (and the GC) observe it concurrently.
pub struct RoutineInner {
    pub state: RoutineState,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub open_upvalues: Vec<ObjRef>,
    pub max_frames: usize,
    /// Set when a pinned interrupt-service routine is bound to a
    /// peripheral interrupt; such routines are exempt from the normal
    /// one-worker scheduling rule (spec.md §4.5/§5).
    pub pinned: bool,
    /// The value passed to the next `resume`, consumed by the next
    /// `yield`/`receive` the routine's frame observes.
    pub resume_value: Option<Value>,
    /// Set on `Closed`/`Error`: the routine's final value, or the
    /// uncaught error's message.
    pub result: Option<Result<Value, String>>,
    /// Declared type of the local variable cell at a given absolute
    /// stack index, set by `SET_CELL_TYPE`/`INITIALISE` (spec.md §4.2's
    /// "a cell's declared type"). Pruned on return so a reused slot in
    /// an unrelated frame doesn't inherit a stale entry.
    pub cell_types: HashMap<usize, Arc<TypeDesc>>,
}

impl RoutineInner {
    pub fn new(entry: ObjRef, max_frames: usize) -> Self {
        RoutineInner {
            state: RoutineState::Unbound,
            stack: Vec::new(),
            frames: vec![CallFrame {
                closure: entry,
                ip: 0,
                stack_base: 0,
            }],
            open_upvalues: Vec::new(),
            max_frames,
            pinned: false,
            resume_value: None,
            result: None,
            cell_types: HashMap::new(),
        }
    }

    /// Drops the declared-type records for every stack slot at or
    /// above `base`, called when a frame returns and its locals stop
    /// existing.
    pub fn forget_cell_types_from(&mut self, base: usize) {
        self.cell_types.retain(|&idx, _| idx < base);
    }

    /// Transitions `Unbound`/`Suspended` -> `Running`, per spec.md
    /// §3's state machine (resume is only valid from those two
    /// states).
    pub fn begin_running(&mut self, arg: Option<Value>) -> Result<(), crate::error::RuntimeError> {
        match self.state {
            RoutineState::Unbound | RoutineState::Suspended => {
                self.state = RoutineState::Running;
                self.resume_value = arg;
                Ok(())
            }
            RoutineState::Running => Err(crate::error::RuntimeError::new(
                0,
                "cannot resume a routine that is already running",
            )),
            RoutineState::Closed | RoutineState::Error => Err(crate::error::RuntimeError::new(
                0,
                "cannot resume a closed or errored routine",
            )),
        }
    }

    /// `YIELD` latches the yielded value into `result` as well as
    /// setting the state, so `receive` can observe a `Suspended`
    /// routine's most recent yield the same way it observes a
    /// `Closed` routine's return value (spec.md §4.4/§4.5).
    pub fn suspend(&mut self, value: Value) {
        self.state = RoutineState::Suspended;
        self.result = Some(Ok(value));
    }

    pub fn close(&mut self, result: Value) {
        self.state = RoutineState::Closed;
        self.result = Some(Ok(result));
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = RoutineState::Error;
        self.result = Some(Err(message.into()));
    }

    pub fn push_frame(&mut self, frame: CallFrame) -> Result<(), crate::error::RuntimeError> {
        if self.frames.len() >= self.max_frames {
            return Err(crate::error::RuntimeError::new(
                0,
                format!("call stack overflow (limit {})", self.max_frames),
            ));
        }
        self.frames.push(frame);
        Ok(())
    }
}

/// The external handle a caller holds to a routine. Cheap to clone;
/// all mutation goes through the shared `Arc<Mutex<RoutineInner>>`
/// stored in the `ObjKind::Routine` heap slot this wraps.
#[derive(Clone)]
pub struct Routine {
    pub inner: Arc<std::sync::Mutex<RoutineInner>>,
}

impl Routine {
    pub fn new(entry: ObjRef, max_frames: usize) -> Self {
        Routine {
            inner: Arc::new(std::sync::Mutex::new(RoutineInner::new(entry, max_frames))),
        }
    }

    pub fn state(&self) -> RoutineState {
        self.inner.lock().expect("routine mutex poisoned").state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_transitions_unbound_to_running() {
        let mut r = RoutineInner::new(ObjRef(0), 48);
        assert_eq!(r.state, RoutineState::Unbound);
        r.begin_running(None).unwrap();
        assert_eq!(r.state, RoutineState::Running);
    }

    #[test]
    fn resuming_a_running_routine_errors() {
        let mut r = RoutineInner::new(ObjRef(0), 48);
        r.begin_running(None).unwrap();
        assert!(r.begin_running(None).is_err());
    }

    #[test]
    fn resuming_a_closed_routine_errors() {
        let mut r = RoutineInner::new(ObjRef(0), 48);
        r.begin_running(None).unwrap();
        r.close(Value::Nil);
        assert!(r.begin_running(None).is_err());
    }

    #[test]
    fn frame_overflow_is_reported() {
        let mut r = RoutineInner::new(ObjRef(0), 2);
        r.frames.pop();
        for _ in 0..2 {
            r.push_frame(CallFrame {
                closure: ObjRef(0),
                ip: 0,
                stack_base: 0,
            })
            .unwrap();
        }
        assert!(r
            .push_frame(CallFrame {
                closure: ObjRef(0),
                ip: 0,
                stack_base: 0,
            })
            .is_err());
    }
}
