//! The heap and its tracing mark-and-sweep collector (spec.md §4.3).
//!
//! No reference counting anywhere — collection only ever runs as a
//! full stop-the-world mark/sweep pass triggered from an allocation
//! site. The original walks one intrusive linked list; here `objects`
//! is a `Vec<Option<HeapObject>>` slot-map addressed by [`ObjRef`], and
//! a parallel `free_slots` list reuses vacated indices the way the
//! original's allocator reuses freed `Obj*` nodes (see `object.rs`'s
//! module doc for the full rationale).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::object::{HeapObject, ObjKind, ObjRef};
use crate::value::Value;

/// Point-in-time counters for [`crate::diagnostics`], read without
/// blocking the collector (spec.md §4.8 supplement: `HeapStats`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HeapStats {
    pub bytes_allocated: usize,
    pub objects_live: usize,
    pub collections_run: usize,
    pub bytes_freed_last_gc: usize,
}

/// The heap: every live object, the GC's accounting, the interned
/// string table, and the bounded temp-roots stack.
pub struct Heap {
    objects: Vec<Option<HeapObject>>,
    free_slots: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    always_gc_above: usize,
    gc_stress: bool,
    gc_log: bool,
    collections_run: usize,
    bytes_freed_last_gc: usize,
    strings: HashMap<String, ObjRef>,
    /// Bounded stack of freshly allocated objects not yet reachable
    /// from any rooted slot (spec.md §4.3: depth 8 is sufficient since
    /// no single opcode allocates more than a handful of objects
    /// before storing them).
    temp_roots: Vec<ObjRef>,
    temp_roots_capacity: usize,
}

impl Heap {
    pub fn new(initial_gc_threshold: usize, always_gc_above: usize, gc_stress: bool, gc_log: bool, temp_roots_capacity: usize) -> Self {
        Heap {
            objects: Vec::new(),
            free_slots: Vec::new(),
            bytes_allocated: 0,
            next_gc: initial_gc_threshold,
            always_gc_above,
            gc_stress,
            gc_log,
            collections_run: 0,
            bytes_freed_last_gc: 0,
            strings: HashMap::new(),
            temp_roots: Vec::new(),
            temp_roots_capacity,
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            bytes_allocated: self.bytes_allocated,
            objects_live: self.objects.iter().filter(|o| o.is_some()).count(),
            collections_run: self.collections_run,
            bytes_freed_last_gc: self.bytes_freed_last_gc,
        }
    }

    /// Allocates a new heap object and pins it on the temp-roots stack
    /// until the caller stores it somewhere reachable (spec.md §4.3's
    /// pinning rule — an allocation made while building up a compound
    /// value, e.g. a `Closure`'s upvalue list, must survive any GC that
    /// runs before the compound value itself becomes reachable).
    ///
    /// Callers that immediately store the returned `ObjRef` into a
    /// rooted slot should call [`Heap::unpin`] right after.
    pub fn allocate(&mut self, kind: ObjKind, roots: &mut dyn FnMut(&mut Vec<Value>)) -> Result<ObjRef, crate::error::FatalVmError> {
        let size = kind.size_bytes();
        if self.gc_stress || self.bytes_allocated + size > self.next_gc {
            self.collect_garbage(roots);
        }
        let obj = HeapObject::new(kind);
        let ref_ = if let Some(idx) = self.free_slots.pop() {
            self.objects[idx as usize] = Some(obj);
            ObjRef(idx)
        } else {
            let idx = self.objects.len() as u32;
            self.objects.push(Some(obj));
            ObjRef(idx)
        };
        self.bytes_allocated += size;
        self.pin(ref_)?;
        Ok(ref_)
    }

    pub fn pin(&mut self, r: ObjRef) -> Result<(), crate::error::FatalVmError> {
        if self.temp_roots.len() >= self.temp_roots_capacity {
            return Err(crate::error::FatalVmError(
                "temp-roots stack overflow".to_string(),
            ));
        }
        self.temp_roots.push(r);
        Ok(())
    }

    pub fn unpin(&mut self, r: ObjRef) {
        if let Some(pos) = self.temp_roots.iter().rposition(|x| *x == r) {
            self.temp_roots.remove(pos);
        }
    }

    pub fn get(&self, r: ObjRef) -> Option<&HeapObject> {
        self.objects.get(r.0 as usize).and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(r.0 as usize).and_then(|o| o.as_mut())
    }

    /// Interns a string: repeated allocation of the same text returns
    /// the same `ObjRef`, matching the original's `internedStrings`
    /// table used to make `==` on strings a pointer comparison.
    pub fn intern_string(
        &mut self,
        s: &str,
        roots: &mut dyn FnMut(&mut Vec<Value>),
    ) -> Result<ObjRef, crate::error::FatalVmError> {
        if let Some(r) = self.strings.get(s) {
            return Ok(*r);
        }
        let r = self.allocate(ObjKind::String(s.to_string()), roots)?;
        self.strings.insert(s.to_string(), r);
        self.unpin(r);
        Ok(r)
    }

    /// Runs one full mark-and-sweep collection. `roots` is called once
    /// to collect every directly-rooted `Value` (routine stacks,
    /// globals, open upvalues, the temp-roots stack's own objects are
    /// added automatically).
    pub fn collect_garbage(&mut self, roots: &mut dyn FnMut(&mut Vec<Value>)) {
        let before = self.bytes_allocated;

        let mut root_values = Vec::new();
        roots(&mut root_values);

        let mut gray_stack: Vec<ObjRef> = Vec::new();
        for v in &root_values {
            if let Value::Obj(r) = v {
                self.mark_object(*r, &mut gray_stack);
            }
        }
        for r in self.temp_roots.clone() {
            self.mark_object(r, &mut gray_stack);
        }

        while let Some(r) = gray_stack.pop() {
            self.blacken_object(r, &mut gray_stack);
        }

        let mut freed = 0usize;
        for slot in self.objects.iter_mut() {
            let should_free = match slot {
                Some(obj) if !obj.marked => true,
                Some(obj) => {
                    obj.marked = false;
                    false
                }
                None => false,
            };
            if should_free {
                if let Some(obj) = slot.take() {
                    freed += obj.kind.size_bytes();
                    if let ObjKind::String(s) = &obj.kind {
                        self.strings.remove(s);
                    }
                }
            }
        }
        for (idx, slot) in self.objects.iter().enumerate() {
            if slot.is_none() {
                self.free_slots.push(idx as u32);
            }
        }
        self.free_slots.sort_unstable();
        self.free_slots.dedup();

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.bytes_freed_last_gc = freed;
        self.collections_run += 1;
        self.next_gc = (self.bytes_allocated * 2).min(self.always_gc_above).max(self.next_gc.min(self.always_gc_above));

        if self.gc_log {
            tracing::debug!(
                freed,
                before,
                after = self.bytes_allocated,
                next_gc = self.next_gc,
                "gc collection complete"
            );
        }
    }

    fn mark_object(&mut self, r: ObjRef, gray_stack: &mut Vec<ObjRef>) {
        if let Some(obj) = self.objects.get_mut(r.0 as usize).and_then(|o| o.as_mut()) {
            if !obj.marked {
                obj.marked = true;
                gray_stack.push(r);
            }
        }
    }

    fn mark_value(&mut self, v: &Value, gray_stack: &mut Vec<ObjRef>) {
        if let Value::Obj(r) = v {
            self.mark_object(*r, gray_stack);
        }
    }

    /// Traces the children of one already-marked object, pushing any
    /// newly marked children onto the gray stack (the "blacken" step
    /// of a tricolor mark).
    fn blacken_object(&mut self, r: ObjRef, gray_stack: &mut Vec<ObjRef>) {
        let kind = match self.objects.get(r.0 as usize).and_then(|o| o.as_ref()) {
            Some(obj) => obj.kind.clone(),
            None => return,
        };
        match kind {
            ObjKind::Closure(c) => {
                for up in &c.upvalues {
                    self.mark_object(*up, gray_stack);
                }
                for constant in &c.function.chunk.constants {
                    self.mark_value(constant, gray_stack);
                }
            }
            ObjKind::Upvalue(state) => {
                if let crate::object::UpvalueState::Closed(v) = state {
                    self.mark_value(&v, gray_stack);
                }
            }
            ObjKind::Class(c) => {
                if let Some(sup) = c.superclass {
                    self.mark_object(sup, gray_stack);
                }
                for m in c.methods.values() {
                    self.mark_object(*m, gray_stack);
                }
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class, gray_stack);
                for v in i.fields.values() {
                    self.mark_value(v, gray_stack);
                }
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(&b.receiver, gray_stack);
                self.mark_object(b.method, gray_stack);
            }
            ObjKind::Routine(r) => {
                if let Ok(inner) = r.lock() {
                    for v in &inner.stack {
                        self.mark_value(v, gray_stack);
                    }
                    for up in &inner.open_upvalues {
                        self.mark_object(*up, gray_stack);
                    }
                }
            }
            ObjKind::Channel(c) => {
                for v in c.buffered_values() {
                    self.mark_value(&v, gray_stack);
                }
            }
            ObjKind::SyncGroup(sg) => {
                if let Ok(inner) = sg.lock() {
                    for ch in &inner.channels {
                        self.mark_object(*ch, gray_stack);
                    }
                }
            }
            ObjKind::PackedUnowned(p) => {
                // An unowned container marks its descriptor type and,
                // if it aliases another heap object, that object too —
                // but never recurses into the aliased object's own
                // element slots here; that object's own blacken pass
                // (if reachable independently) is what walks those
                // (spec.md §4.3: "Unowned packed objects mark their
                // descriptor but never recurse into their (foreign)
                // storage"). A `place`d raw address has no heap parent
                // to mark.
                if let crate::object::UnownedSource::Heap(parent) = p.source {
                    self.mark_object(parent, gray_stack);
                }
            }
            ObjKind::PackedOwned(p) => {
                mark_packed_bytes(&p.bytes, &p.ty, self, gray_stack);
            }
            ObjKind::String(_)
            | ObjKind::Function(_)
            | ObjKind::Native(_)
            | ObjKind::Blob(_)
            | ObjKind::BigInt(_)
            | ObjKind::Type(_) => {}
        }
    }
}

/// Walks a packed container's raw bytes following its type descriptor,
/// marking every object-typed slot it finds (spec.md §4.3: "packed-
/// container elements (following the type descriptor to know which
/// slots are object-typed), pointer destinations of owned pointers
/// (following the target type)").
fn mark_packed_bytes(bytes: &[u8], ty: &crate::types::TypeDesc, heap: &mut Heap, gray_stack: &mut Vec<ObjRef>) {
    use crate::types::TypeDesc;
    match ty {
        TypeDesc::Array { element, cardinality } => {
            let stride = element.packed_size();
            for i in 0..*cardinality {
                let off = i * stride;
                if off + stride > bytes.len() {
                    break;
                }
                mark_packed_bytes(&bytes[off..off + stride], element, heap, gray_stack);
            }
        }
        TypeDesc::Struct { fields, .. } => {
            for field in fields {
                let size = field.ty.packed_size();
                if field.offset + size > bytes.len() {
                    continue;
                }
                mark_packed_bytes(&bytes[field.offset..field.offset + size], &field.ty, heap, gray_stack);
            }
        }
        TypeDesc::Any => {
            // An `Any` slot holds a boxed `Value`, not a bare object
            // handle; only mark it if that boxed value happens to be
            // one (spec.md §4.3's object-kind tracing extends to
            // whatever `Any` is currently holding).
            if let Value::Obj(r) = crate::packed::load_any(bytes, 0) {
                heap.mark_object(r, gray_stack);
            }
        }
        t if t.is_object_kind() => {
            let v = crate::packed::load_primitive(bytes, 0, t);
            if let Value::Obj(r) = v {
                heap.mark_object(r, gray_stack);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_roots(_: &mut Vec<Value>) {}

    #[test]
    fn unrooted_objects_are_collected() {
        let mut heap = Heap::new(0, 1024 * 1024, false, false, 8);
        let r = heap.allocate(ObjKind::String("temp".to_string()), &mut no_roots).unwrap();
        heap.unpin(r);
        assert_eq!(heap.stats().objects_live, 1);
        heap.collect_garbage(&mut no_roots);
        assert_eq!(heap.stats().objects_live, 0);
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let mut heap = Heap::new(0, 1024 * 1024, false, false, 8);
        let r = heap.allocate(ObjKind::String("kept".to_string()), &mut no_roots).unwrap();
        heap.unpin(r);
        let mut roots = move |out: &mut Vec<Value>| out.push(Value::Obj(r));
        heap.collect_garbage(&mut roots);
        assert_eq!(heap.stats().objects_live, 1);
        assert!(heap.get(r).is_some());
    }

    #[test]
    fn string_interning_returns_same_ref() {
        let mut heap = Heap::new(0, 1024 * 1024, false, false, 8);
        let a = heap.intern_string("hello", &mut no_roots).unwrap();
        let b = heap.intern_string("hello", &mut no_roots).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn temp_roots_overflow_is_fatal() {
        let mut heap = Heap::new(0, 1024 * 1024, false, false, 2);
        let _a = heap.allocate(ObjKind::String("a".to_string()), &mut no_roots).unwrap();
        let _b = heap.allocate(ObjKind::String("b".to_string()), &mut no_roots).unwrap();
        // Both allocations pinned themselves; the stack is already at
        // its capacity of 2, so a third pin must be rejected.
        assert!(heap.pin(ObjRef(0)).is_err());
    }

    #[test]
    fn gc_log_emits_a_tracing_event_without_panicking() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut heap = Heap::new(0, 1024 * 1024, false, true, 8);
        let r = heap.allocate(ObjKind::String("temp".to_string()), &mut no_roots).unwrap();
        heap.unpin(r);
        heap.collect_garbage(&mut no_roots);
    }
}
