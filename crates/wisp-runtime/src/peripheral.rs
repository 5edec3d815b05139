//! The peripheral boundary (spec.md §6): `peek`/`poke` and shared
//! interrupt handler registration. Embedded targets wire this trait to
//! real MMIO; on hosted targets, as spec.md directs, a write "is a
//! logged or mocked write" — [`MockPeripheral`] below is that mock,
//! recording every access for assertions in tests.
//!
//! Routine pinning (binding a routine to an interrupt so it runs as an
//! ISR) is a [`crate::scheduler::Scheduler`] concern, not a peripheral
//! one — spec.md's `pin(routine)` builtin takes a routine, not a GPIO
//! pin number, so it has no business on this trait.

use std::collections::HashMap;
use std::sync::Mutex;

/// An address-space read/write surface plus shared interrupt
/// registration. Implemented once per hosted/embedded target and
/// handed to the interpreter at construction time; the `peek`/`poke`
/// builtins and the `irq_add_shared_handler`/`irq_remove_handler`
/// builtins call through it.
pub trait Peripheral: Send + Sync {
    fn peek(&self, address: usize) -> u8;
    fn poke(&self, address: usize, value: u8);
    /// Registers `handler_id` against `irq`, allowing several routines
    /// to share one interrupt line (spec.md §4.5/§6).
    fn irq_add_shared_handler(&self, irq: u32, handler_id: u32);
    fn irq_remove_handler(&self, irq: u32, handler_id: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedAccess {
    Peek { address: usize },
    Poke { address: usize, value: u8 },
    IrqAdd { irq: u32, handler_id: u32 },
    IrqRemove { irq: u32, handler_id: u32 },
}

/// A hosted peripheral implementation: reads return zero (or whatever
/// was last poked to that address), and every access is recorded for
/// test assertions, in place of real MMIO.
#[derive(Default)]
pub struct MockPeripheral {
    memory: Mutex<HashMap<usize, u8>>,
    log: Mutex<Vec<RecordedAccess>>,
}

impl MockPeripheral {
    pub fn new() -> Self {
        MockPeripheral::default()
    }

    pub fn log(&self) -> Vec<RecordedAccess> {
        self.log.lock().expect("mock peripheral mutex poisoned").clone()
    }
}

impl Peripheral for MockPeripheral {
    fn peek(&self, address: usize) -> u8 {
        let value = *self
            .memory
            .lock()
            .expect("mock peripheral mutex poisoned")
            .get(&address)
            .unwrap_or(&0);
        self.log
            .lock()
            .expect("mock peripheral mutex poisoned")
            .push(RecordedAccess::Peek { address });
        value
    }

    fn poke(&self, address: usize, value: u8) {
        self.memory
            .lock()
            .expect("mock peripheral mutex poisoned")
            .insert(address, value);
        self.log
            .lock()
            .expect("mock peripheral mutex poisoned")
            .push(RecordedAccess::Poke { address, value });
    }

    fn irq_add_shared_handler(&self, irq: u32, handler_id: u32) {
        self.log
            .lock()
            .expect("mock peripheral mutex poisoned")
            .push(RecordedAccess::IrqAdd { irq, handler_id });
    }

    fn irq_remove_handler(&self, irq: u32, handler_id: u32) {
        self.log
            .lock()
            .expect("mock peripheral mutex poisoned")
            .push(RecordedAccess::IrqRemove { irq, handler_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poke_then_peek_round_trips() {
        let p = MockPeripheral::new();
        p.poke(0x1000, 42);
        assert_eq!(p.peek(0x1000), 42);
    }

    #[test]
    fn unwritten_address_reads_zero() {
        let p = MockPeripheral::new();
        assert_eq!(p.peek(0x2000), 0);
    }

    #[test]
    fn accesses_are_recorded_in_order() {
        let p = MockPeripheral::new();
        p.poke(1, 9);
        p.peek(1);
        p.irq_add_shared_handler(3, 1);
        let log = p.log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], RecordedAccess::Poke { address: 1, value: 9 });
        assert_eq!(log[2], RecordedAccess::IrqAdd { irq: 3, handler_id: 1 });
    }
}
