//! Heap object kinds (spec.md §3's "heap object kinds" table) and the
//! `ObjRef` handle that stands in for the original's intrusive
//! `next`-linked `Obj*` pointer.
//!
//! The C original (`cyarg/object.h`) threads every heap allocation onto
//! one global intrusive linked list via a raw `next` pointer in the
//! common `Obj` header, walked by the sweep phase and by `isMarked`
//! bit-flips during mark. That shape is unsafe-pointer-only in Rust; an
//! index into a `Vec` slot-map (`Heap::objects`) gives the identical
//! semantics — same O(1) allocation, same full-sweep walk, same
//! per-object `marked` bit — without `unsafe`. This is a deliberate
//! substitution, not a shortcut: see DESIGN.md.

use std::sync::{Arc, Mutex};

use wisp_core::BigInt;

use crate::channel::Channel;
use crate::chunk::Function;
use crate::routine::RoutineInner;
use crate::syncgroup::SyncGroupInner;
use crate::types::TypeDesc;
use crate::value::Value;

/// A handle to a heap-allocated object. Stable for the object's
/// lifetime; never reused while the object is live, reclaimed (its
/// slot set to `None`) only by a completed sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

/// An upvalue is open (pointing at a live stack slot) or closed (the
/// value has been copied out because the owning frame returned).
#[derive(Debug, Clone)]
pub enum UpvalueState {
    Open { routine: ObjRef, stack_index: usize },
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: Arc<Function>,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: String,
    pub superclass: Option<ObjRef>,
    pub methods: std::collections::HashMap<String, ObjRef>,
}

#[derive(Debug, Clone)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: std::collections::HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A native function's body. Unlike the teacher's natives (which only
/// ever touch their own arguments), Wisp's natives allocate heap
/// objects (a fresh channel, a fresh bigint) and reach into the
/// routine/scheduler machinery (`start`, `resume`, `pin`) — so each
/// gets the interpreter and the calling routine, not just its `Value`
/// arguments.
pub type NativeFn = Arc<
    dyn Fn(
            &mut crate::interpreter::Interpreter,
            &crate::routine::Routine,
            &[Value],
        ) -> Result<Value, crate::error::RuntimeError>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct NativeObj {
    pub name: String,
    pub arity: u8,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObj")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// A fixed-element-size, fixed-length byte buffer used for raw I/O and
/// as the backing store `import`'s file-reader hands back (spec.md
/// §4.7's file-read primitive sits on top of this).
#[derive(Debug, Clone)]
pub struct BlobObj {
    pub bytes: Vec<u8>,
}

/// A first-class type value (spec.md §3: "a type carries a const
/// flag"). Pushed by `TYPE_LITERAL`/`TYPE_MODIFIER`/`TYPE_STRUCT`/
/// `TYPE_ARRAY` and consumed by `SET_CELL_TYPE`/`INITIALISE`/packed
/// container construction.
#[derive(Debug, Clone)]
pub struct TypeValue {
    pub ty: Arc<TypeDesc>,
    pub is_const: bool,
}

/// Owned packed storage: a `TypeDesc::Array`/`Struct`/`Pointer` value
/// that allocated and owns its backing bytes.
#[derive(Debug, Clone)]
pub struct PackedOwned {
    pub ty: Arc<TypeDesc>,
    pub bytes: Vec<u8>,
}

/// What an unowned packed container aliases: either another heap
/// object's backing bytes (a struct field, an array slice, the target
/// of a heap-object pointer), or a raw machine address bound by a
/// `place` declaration (spec.md §4.5/glossary's "Place" — a typed view
/// over externally-owned memory such as a peripheral register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnownedSource {
    Heap(ObjRef),
    Address(usize),
}

/// Unowned (aliasing) packed storage: a view over another object's
/// bytes (e.g. a struct field's sub-array, a pointer target) or over a
/// `place`d machine address. Never outlives (and never frees) what it
/// aliases; the GC keeps a `Heap` source alive by treating it as a
/// root reference (spec.md §3 invariant 4), and never recurses into an
/// `Address` source since it is foreign, unmanaged memory.
#[derive(Debug, Clone)]
pub struct PackedUnowned {
    pub ty: Arc<TypeDesc>,
    pub source: UnownedSource,
    pub byte_offset: usize,
    pub byte_len: usize,
}

/// The kind-specific payload of a heap object. The common header
/// (mark bit, allocation size) lives alongside this in [`HeapObject`],
/// not inside each variant, mirroring the original's split between
/// the shared `Obj` header and the kind-specific trailing struct.
#[derive(Debug, Clone)]
pub enum ObjKind {
    String(String),
    Function(Arc<Function>),
    Closure(ClosureObj),
    Upvalue(UpvalueState),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Native(NativeObj),
    Blob(BlobObj),
    BigInt(BigInt),
    Routine(Arc<Mutex<RoutineInner>>),
    Channel(Arc<Channel>),
    SyncGroup(Arc<Mutex<SyncGroupInner>>),
    Type(TypeValue),
    PackedOwned(PackedOwned),
    PackedUnowned(PackedUnowned),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::String(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Closure(_) => "closure",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound_method",
            ObjKind::Native(_) => "native",
            ObjKind::Blob(_) => "blob",
            ObjKind::BigInt(_) => "bigint",
            ObjKind::Routine(_) => "routine",
            ObjKind::Channel(_) => "channel",
            ObjKind::SyncGroup(_) => "sync_group",
            ObjKind::Type(_) => "type",
            ObjKind::PackedOwned(_) => "packed",
            ObjKind::PackedUnowned(_) => "packed_unowned",
        }
    }

    /// Rough byte accounting for `Heap::bytes_allocated`, mirroring the
    /// original's per-kind size passed to `reallocate` at allocation
    /// time (spec.md §3 supplement on `size_bytes`).
    pub fn size_bytes(&self) -> usize {
        match self {
            ObjKind::String(s) => std::mem::size_of::<String>() + s.capacity(),
            ObjKind::Function(_) => std::mem::size_of::<Function>(),
            ObjKind::Closure(c) => {
                std::mem::size_of::<ClosureObj>() + c.upvalues.capacity() * std::mem::size_of::<ObjRef>()
            }
            ObjKind::Upvalue(_) => std::mem::size_of::<UpvalueState>(),
            ObjKind::Class(c) => std::mem::size_of::<ClassObj>() + c.methods.len() * 64,
            ObjKind::Instance(i) => std::mem::size_of::<InstanceObj>() + i.fields.len() * 64,
            ObjKind::BoundMethod(_) => std::mem::size_of::<BoundMethodObj>(),
            ObjKind::Native(_) => std::mem::size_of::<NativeObj>(),
            ObjKind::Blob(b) => std::mem::size_of::<BlobObj>() + b.bytes.capacity(),
            ObjKind::BigInt(_) => std::mem::size_of::<BigInt>(),
            ObjKind::Routine(_) => std::mem::size_of::<Arc<Mutex<RoutineInner>>>(),
            ObjKind::Channel(c) => std::mem::size_of::<Arc<Channel>>() + c.len() * std::mem::size_of::<Value>(),
            ObjKind::SyncGroup(_) => std::mem::size_of::<Arc<Mutex<SyncGroupInner>>>(),
            ObjKind::Type(_) => std::mem::size_of::<TypeDesc>(),
            ObjKind::PackedOwned(p) => std::mem::size_of::<PackedOwned>() + p.bytes.capacity(),
            ObjKind::PackedUnowned(_) => std::mem::size_of::<PackedUnowned>(),
        }
    }
}

/// One slot in `Heap::objects`: the kind-specific payload plus the
/// tricolor mark bit the sweep phase reads.
#[derive(Debug, Clone)]
pub struct HeapObject {
    pub kind: ObjKind,
    pub marked: bool,
}

impl HeapObject {
    pub fn new(kind: ObjKind) -> Self {
        HeapObject { kind, marked: false }
    }
}
