//! Bounded inter-routine channels (spec.md §4.5). Deliberately not the
//! teacher's unbounded MPMC channel registry: that design grows
//! without bound and has no `share`/overwrite-oldest mode, neither of
//! which fits spec.md's fixed-capacity, possibly-lossy contract. This
//! is a fresh design in the teacher's idiom instead — a mutex-guarded
//! ring buffer plus condvars for the blocking `send`/`receive` paths
//! (see DESIGN.md).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::value::Value;

/// The state behind a `Channel` heap object, wrapped in
/// `Arc<Mutex<_>>` in [`crate::object::ObjKind::Channel`].
pub struct ChannelInner {
    pub buffer: VecDeque<Value>,
    pub capacity: usize,
    pub closed: bool,
}

impl ChannelInner {
    pub fn new(capacity: usize) -> Self {
        ChannelInner {
            buffer: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            closed: false,
        }
    }
}

/// A bounded FIFO channel. `send` blocks while full; `receive` blocks
/// while empty; `share` never blocks, overwriting the oldest buffered
/// value once full; `peek` reads the oldest value without removing it.
pub struct Channel {
    inner: Mutex<ChannelInner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        Channel {
            inner: Mutex::new(ChannelInner::new(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Blocks the calling routine until there is room, then enqueues
    /// `value`. Returns an error if the channel has been closed.
    pub fn send(&self, value: Value) -> Result<(), crate::error::RuntimeError> {
        let mut guard = self.inner.lock().expect("channel mutex poisoned");
        loop {
            if guard.closed {
                return Err(crate::error::RuntimeError::new(0, "send on closed channel"));
            }
            if guard.buffer.len() < guard.capacity {
                guard.buffer.push_back(value);
                self.not_empty.notify_one();
                return Ok(());
            }
            guard = self.not_full.wait(guard).expect("channel mutex poisoned");
        }
    }

    /// Non-blocking: if full, silently drops the oldest buffered value
    /// to make room (spec.md §4.5's "share" semantics — a producer
    /// that must never block, e.g. an interrupt-service routine).
    /// Returns `true` exactly when the channel was already at capacity
    /// and an existing value was overwritten.
    pub fn share(&self, value: Value) -> bool {
        let mut guard = self.inner.lock().expect("channel mutex poisoned");
        let overwrote = guard.buffer.len() >= guard.capacity;
        if overwrote {
            guard.buffer.pop_front();
        }
        guard.buffer.push_back(value);
        self.not_empty.notify_one();
        overwrote
    }

    /// A single non-blocking attempt to dequeue: `Some(value)` if one
    /// was immediately available, `None` otherwise. Used by
    /// [`crate::syncgroup::SyncGroup`]'s atomic multi-channel sampling,
    /// which must never let one empty member hold up the others.
    pub fn try_pop(&self) -> Option<Value> {
        let mut guard = self.inner.lock().expect("channel mutex poisoned");
        let v = guard.buffer.pop_front();
        if v.is_some() {
            self.not_full.notify_one();
        }
        v
    }

    /// Blocks the calling routine until a value is available, then
    /// dequeues and returns it.
    pub fn receive(&self) -> Result<Value, crate::error::RuntimeError> {
        let mut guard = self.inner.lock().expect("channel mutex poisoned");
        loop {
            if let Some(v) = guard.buffer.pop_front() {
                self.not_full.notify_one();
                return Ok(v);
            }
            if guard.closed {
                return Err(crate::error::RuntimeError::new(0, "receive on closed, empty channel"));
            }
            guard = self.not_empty.wait(guard).expect("channel mutex poisoned");
        }
    }

    /// Reads the oldest buffered value without removing it.
    pub fn peek(&self) -> Option<Value> {
        self.inner
            .lock()
            .expect("channel mutex poisoned")
            .buffer
            .front()
            .copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("channel mutex poisoned").buffer.len()
    }

    /// Snapshot of every buffered value, for the GC's mark phase
    /// (spec.md §4.3: "channel contents" are among the roots a
    /// `Channel` object blackens to).
    pub fn buffered_values(&self) -> Vec<Value> {
        self.inner.lock().expect("channel mutex poisoned").buffer.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("channel mutex poisoned");
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_receive_round_trips() {
        let ch = Channel::new(1);
        ch.send(Value::Int32(7)).unwrap();
        assert_eq!(ch.receive().unwrap(), Value::Int32(7));
    }

    #[test]
    fn share_overwrites_oldest_when_full() {
        let ch = Channel::new(1);
        assert!(!ch.share(Value::Int32(1)));
        assert!(ch.share(Value::Int32(2)));
        assert_eq!(ch.receive().unwrap(), Value::Int32(2));
    }

    #[test]
    fn try_pop_is_non_blocking() {
        let ch = Channel::new(2);
        assert_eq!(ch.try_pop(), None);
        ch.send(Value::Int32(4)).unwrap();
        assert_eq!(ch.try_pop(), Some(Value::Int32(4)));
        assert_eq!(ch.try_pop(), None);
    }

    #[test]
    fn peek_does_not_consume() {
        let ch = Channel::new(2);
        ch.send(Value::Int32(9)).unwrap();
        assert_eq!(ch.peek(), Some(Value::Int32(9)));
        assert_eq!(ch.len(), 1);
    }

    #[test]
    fn receive_on_closed_empty_channel_errors() {
        let ch = Channel::new(1);
        ch.close();
        assert!(ch.receive().is_err());
    }

    #[test]
    fn blocking_send_unblocks_once_a_slot_frees() {
        use std::sync::Arc;
        use std::thread;

        let ch = Arc::new(Channel::new(1));
        ch.send(Value::Int32(1)).unwrap();

        let ch2 = Arc::clone(&ch);
        let handle = thread::spawn(move || {
            ch2.send(Value::Int32(2)).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(ch.receive().unwrap(), Value::Int32(1));
        handle.join().unwrap();
        assert_eq!(ch.receive().unwrap(), Value::Int32(2));
    }
}
