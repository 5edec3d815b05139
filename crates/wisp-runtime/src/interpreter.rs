//! The bytecode interpreter: opcode dispatch, the call/invoke
//! machinery, and the arithmetic/comparison rules binary operators
//! follow (spec.md §4.4, §4.6). Mirrors the teacher's fetch-decode-
//! execute loop shape (`interpreter/dispatch.rs`) — one `Interpreter`
//! owns the heap and globals, `run` drives a single [`Routine`] until
//! it returns, yields, or errors.

use std::collections::HashMap;
use std::sync::Arc;

use wisp_core::BigInt;

use crate::chunk::OpCode;
use crate::config::VmConfig;
use crate::error::{FatalVmError, RuntimeError, VmError};
use crate::gc::Heap;
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, HeapObject, InstanceObj, ObjKind, ObjRef, PackedOwned,
    PackedUnowned, TypeValue, UnownedSource,
};
use crate::packed;
use crate::peripheral::Peripheral;
use crate::routine::{CallFrame, Routine};
use crate::scheduler::Scheduler;
use crate::types::TypeDesc;
use crate::value::Value;

/// Tag order `GET_BUILTIN`'s one-byte operand indexes into. A fresh
/// `Interpreter` installs one `ObjKind::Native` per entry, in this
/// order, via [`crate::builtins::install`].
pub const BUILTIN_NAMES: &[&str] = &[
    "make_channel",
    "send",
    "receive",
    "share",
    "peek",
    "cpeek",
    "make_routine",
    "start",
    "resume",
    "pin",
    "make_sync_group",
    "int8",
    "uint8",
    "int16",
    "uint16",
    "int32",
    "uint32",
    "int64",
    "uint64",
    "int",
    "mfloat64",
    "string",
    "irq_add_shared_handler",
    "irq_remove_handler",
];

/// What running a routine to its next stopping point produced.
#[derive(Debug)]
pub enum StepOutcome {
    Returned(Value),
    Yielded(Value),
    Errored(RuntimeError),
}

enum ExecOutcome {
    Continue,
    Return(Value),
    Yield(Value),
}

/// Owns the heap, globals, peripheral boundary, scheduler and builtin
/// table for one VM instance. Not itself handed across threads — the
/// heap is plain owned state rather than behind a lock, so only one
/// routine ever executes at a time through a given `Interpreter` (see
/// DESIGN.md for how this simplifies spec.md §5's "at most one worker
/// routine may run at a time" into the scheduler-gated, synchronous
/// `start` this crate implements).
pub struct Interpreter {
    pub heap: Heap,
    pub globals: HashMap<String, Value>,
    pub global_types: HashMap<String, Arc<TypeDesc>>,
    pub peripheral: Arc<dyn Peripheral>,
    pub scheduler: Scheduler,
    pub builtins: Vec<ObjRef>,
    pub config: VmConfig,
}

impl Interpreter {
    pub fn new(peripheral: Arc<dyn Peripheral>, config: VmConfig) -> Result<Self, FatalVmError> {
        let mut heap = Heap::new(
            config.initial_gc_threshold,
            config.always_gc_above,
            config.gc_stress,
            config.gc_log,
            config.temp_roots_capacity,
        );
        let builtins = crate::builtins::install(&mut heap)?;
        Ok(Interpreter {
            heap,
            globals: HashMap::new(),
            global_types: HashMap::new(),
            peripheral,
            scheduler: Scheduler::new(config.max_pinned_routines),
            builtins,
            config,
        })
    }

    /// Builds the GC root-scanning closure: globals, the builtin
    /// table, every pinned ISR routine, and the currently executing
    /// routine's own stack/open-upvalues (spec.md §4.3). A reachable
    /// routine's *own* stack is already walked by `blacken_object`'s
    /// `ObjKind::Routine` arm, so this only needs to supply routines
    /// that might otherwise have nothing pointing at them.
    fn roots<'a>(
        globals: &'a HashMap<String, Value>,
        builtins: &'a [ObjRef],
        pinned: &'a [ObjRef],
        current: &'a Routine,
    ) -> impl FnMut(&mut Vec<Value>) + 'a {
        move |out: &mut Vec<Value>| {
            out.extend(globals.values().copied());
            out.extend(builtins.iter().map(|r| Value::Obj(*r)));
            out.extend(pinned.iter().map(|r| Value::Obj(*r)));
            if let Ok(inner) = current.inner.lock() {
                out.extend(inner.stack.iter().copied());
                out.extend(inner.open_upvalues.iter().map(|r| Value::Obj(*r)));
            }
        }
    }

    /// Allocates and immediately unpins, the same convention
    /// `Heap::intern_string` already follows: the caller stores the
    /// returned `ObjRef` into a stack slot or field right away, before
    /// any further allocation could trigger a collection that would
    /// otherwise need it on the temp-roots stack.
    pub fn allocate(&mut self, kind: ObjKind, current: &Routine) -> Result<ObjRef, FatalVmError> {
        let pinned = self.scheduler.pinned_refs();
        let mut roots = Self::roots(&self.globals, &self.builtins, &pinned, current);
        let r = self.heap.allocate(kind, &mut roots)?;
        self.heap.unpin(r);
        Ok(r)
    }

    pub fn intern_string(&mut self, s: &str, current: &Routine) -> Result<ObjRef, FatalVmError> {
        let pinned = self.scheduler.pinned_refs();
        let mut roots = Self::roots(&self.globals, &self.builtins, &pinned, current);
        self.heap.intern_string(s, &mut roots)
    }

    /// Runs `routine` from its current suspension point (or from the
    /// top if `Unbound`) until it returns, yields, or raises an
    /// uncaught error. `arg` is the value `resume` is passing in.
    pub fn run(&mut self, routine: &Routine, arg: Option<Value>) -> Result<StepOutcome, FatalVmError> {
        {
            let mut inner = routine.inner.lock().expect("routine mutex poisoned");
            let was_suspended = matches!(inner.state, crate::routine::RoutineState::Suspended);
            inner
                .begin_running(arg)
                .map_err(|e| FatalVmError(format!("cannot resume routine: {e}")))?;
            // A `yield` expression evaluates to whatever `resume` is
            // passed next time (spec.md §5 ordering guarantee (b)): the
            // dispatch loop left the routine paused right after YIELD
            // popped the yielded value, so the resumed frame's next
            // instruction expects exactly one value back on top.
            if was_suspended {
                inner.stack.push(inner.resume_value.take().unwrap_or(Value::Nil));
            }
        }
        loop {
            match self.execute_one(routine) {
                Ok(ExecOutcome::Continue) => continue,
                Ok(ExecOutcome::Return(v)) => {
                    let mut inner = routine.inner.lock().expect("routine mutex poisoned");
                    inner.close(v);
                    return Ok(StepOutcome::Returned(v));
                }
                Ok(ExecOutcome::Yield(v)) => {
                    let mut inner = routine.inner.lock().expect("routine mutex poisoned");
                    inner.suspend(v);
                    return Ok(StepOutcome::Yielded(v));
                }
                Err(VmError::Runtime(e)) => {
                    let mut inner = routine.inner.lock().expect("routine mutex poisoned");
                    inner.fail(e.message.clone());
                    return Ok(StepOutcome::Errored(e));
                }
                Err(VmError::Fatal(e)) => return Err(e),
                Err(VmError::CompileError(m)) | Err(VmError::Io(m)) => {
                    return Err(FatalVmError(m));
                }
            }
        }
    }

    fn closure_of(&self, r: ObjRef) -> Result<ClosureObj, RuntimeError> {
        match self.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::Closure(c)) => Ok(c.clone()),
            _ => Err(RuntimeError::new(0, "expected a closure")),
        }
    }

    fn string_of(&self, r: ObjRef) -> Option<String> {
        match self.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn bigint_of(&self, r: ObjRef) -> Option<BigInt> {
        match self.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::BigInt(b)) => Some(*b),
            _ => None,
        }
    }

    /// One opcode's worth of execution for `routine`'s current frame.
    fn execute_one(&mut self, routine: &Routine) -> Result<ExecOutcome, VmError> {
        let mut inner = routine.inner.lock().expect("routine mutex poisoned");
        let frame_idx = inner.frames.len() - 1;
        let closure_ref = inner.frames[frame_idx].closure;
        let closure = self.closure_of(closure_ref)?;
        let line = {
            let ip = inner.frames[frame_idx].ip;
            closure.function.chunk.lines.get(ip).copied().unwrap_or(0)
        };

        macro_rules! chunk {
            () => {
                &closure.function.chunk
            };
        }
        macro_rules! read_u8 {
            () => {{
                let ip = inner.frames[frame_idx].ip;
                let b = chunk!().code[ip];
                inner.frames[frame_idx].ip += 1;
                b
            }};
        }
        macro_rules! read_u16 {
            () => {{
                let lo = read_u8!();
                let hi = read_u8!();
                u16::from_le_bytes([lo, hi])
            }};
        }
        macro_rules! read_u32 {
            () => {{
                let b0 = read_u8!();
                let b1 = read_u8!();
                let b2 = read_u8!();
                let b3 = read_u8!();
                u32::from_le_bytes([b0, b1, b2, b3])
            }};
        }
        macro_rules! read_u64 {
            () => {{
                let lo = read_u32!();
                let hi = read_u32!();
                ((hi as u64) << 32) | (lo as u64)
            }};
        }
        macro_rules! base {
            () => {
                inner.frames[frame_idx].stack_base
            };
        }
        macro_rules! pop {
            () => {
                inner.stack.pop().ok_or_else(|| RuntimeError::new(line, "stack underflow"))?
            };
        }
        macro_rules! push {
            ($v:expr) => {
                inner.stack.push($v)
            };
        }
        macro_rules! peek_top {
            () => {
                *inner.stack.last().ok_or_else(|| RuntimeError::new(line, "stack underflow"))?
            };
        }

        let opcode = decode_opcode(read_u8!(), line)?;

        match opcode {
            OpCode::Constant => {
                let idx = read_u16!();
                push!(chunk!().constants[idx as usize]);
            }
            OpCode::Nil => push!(Value::Nil),
            OpCode::True => push!(Value::Bool(true)),
            OpCode::False => push!(Value::Bool(false)),
            OpCode::ImmediateI8 => {
                let b = read_u8!();
                push!(Value::Int8(b as i8));
            }
            OpCode::ImmediateU8 => {
                let b = read_u8!();
                push!(Value::Uint8(b));
            }
            OpCode::ImmediateI16 => {
                let b = read_u16!();
                push!(Value::Int16(b as i16));
            }
            OpCode::ImmediateU16 => {
                let b = read_u16!();
                push!(Value::Uint16(b));
            }
            OpCode::ImmediateI32 => {
                let b = read_u32!();
                push!(Value::Int32(b as i32));
            }
            OpCode::ImmediateU32 => {
                let b = read_u32!();
                push!(Value::Uint32(b));
            }
            OpCode::ImmediateI64 => {
                let b = read_u64!();
                push!(Value::Int64(b as i64));
            }
            OpCode::ImmediateU64 => {
                let b = read_u64!();
                push!(Value::Uint64(b));
            }
            OpCode::Pop => {
                pop!();
            }
            OpCode::GetLocal => {
                let slot = read_u8!() as usize;
                let idx = base!() + slot;
                push!(inner.stack[idx]);
            }
            OpCode::SetLocal => {
                let slot = read_u8!() as usize;
                let idx = base!() + slot;
                inner.stack[idx] = peek_top!();
            }
            OpCode::Initialise => {
                // Pops the value then its declared type; writes the
                // value into the local slot the declaration reserved
                // and records the cell's declared type.
                let value = pop!();
                let type_ref = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "INITIALISE expects a type value"))?;
                let ty = match self.heap.get(type_ref).map(|o| &o.kind) {
                    Some(ObjKind::Type(t)) => t.ty.clone(),
                    _ => return Err(RuntimeError::new(line, "INITIALISE expects a type value").into()),
                };
                let slot = read_u8!() as usize;
                let idx = base!() + slot;
                while inner.stack.len() <= idx {
                    inner.stack.push(Value::Nil);
                }
                inner.stack[idx] = value;
                inner.cell_types.insert(idx, ty);
            }
            OpCode::SetCellType => {
                let type_ref = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "SET_CELL_TYPE expects a type value"))?;
                let ty = match self.heap.get(type_ref).map(|o| &o.kind) {
                    Some(ObjKind::Type(t)) => t.ty.clone(),
                    _ => return Err(RuntimeError::new(line, "SET_CELL_TYPE expects a type value").into()),
                };
                let slot = read_u8!() as usize;
                let idx = base!() + slot;
                inner.cell_types.insert(idx, ty);
            }
            OpCode::GetGlobal => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                match self.globals.get(&name) {
                    Some(v) => push!(*v),
                    None => return Err(RuntimeError::new(line, format!("undefined global '{name}'")).into()),
                }
            }
            OpCode::DefineGlobal => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                let value = pop!();
                self.globals.insert(name, value);
            }
            OpCode::SetGlobal => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                if !self.globals.contains_key(&name) {
                    return Err(RuntimeError::new(line, format!("undefined global '{name}'")).into());
                }
                self.globals.insert(name, peek_top!());
            }
            OpCode::GetUpvalue => {
                let slot = read_u8!() as usize;
                let up_ref = closure.upvalues[slot];
                let v = self.read_upvalue(up_ref, &inner, line)?;
                push!(v);
            }
            OpCode::SetUpvalue => {
                let slot = read_u8!() as usize;
                let up_ref = closure.upvalues[slot];
                let value = peek_top!();
                self.write_upvalue(up_ref, value, &mut inner, line)?;
            }
            OpCode::CloseUpvalue => {
                let idx = inner.stack.len() - 1;
                let value = pop!();
                close_upvalue_at(&mut inner, idx, value, &mut self.heap);
            }
            OpCode::GetProperty => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                let receiver = pop!();
                let inst_ref = receiver
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "only instances have properties"))?;
                let (field, class_ref) = match self.heap.get(inst_ref).map(|o| &o.kind) {
                    Some(ObjKind::Instance(i)) => (i.fields.get(&name).copied(), i.class),
                    _ => return Err(RuntimeError::new(line, "only instances have properties").into()),
                };
                if let Some(v) = field {
                    push!(v);
                } else {
                    let method = self.find_method(class_ref, &name);
                    match method {
                        Some(m) => {
                            drop(inner);
                            let bound = self.allocate(
                                ObjKind::BoundMethod(BoundMethodObj { receiver, method: m }),
                                routine,
                            )?;
                            inner = routine.inner.lock().expect("routine mutex poisoned");
                            push!(Value::Obj(bound));
                        }
                        None => return Err(RuntimeError::new(line, format!("undefined property '{name}'")).into()),
                    }
                }
            }
            OpCode::SetProperty => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                let value = pop!();
                let receiver = pop!();
                let inst_ref = receiver
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "only instances have properties"))?;
                match self.heap.get_mut(inst_ref).map(|o| &mut o.kind) {
                    Some(ObjKind::Instance(i)) => {
                        i.fields.insert(name, value);
                    }
                    _ => return Err(RuntimeError::new(line, "only instances have properties").into()),
                }
                push!(value);
            }
            OpCode::GetSuper => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                let superclass = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "GET_SUPER expects a class"))?;
                let receiver = pop!();
                let method = self
                    .find_method(superclass, &name)
                    .ok_or_else(|| RuntimeError::new(line, format!("undefined property '{name}'")))?;
                drop(inner);
                let bound = self.allocate(ObjKind::BoundMethod(BoundMethodObj { receiver, method }), routine)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(Value::Obj(bound));
            }
            OpCode::Class => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                drop(inner);
                let class_ref = self.allocate(
                    ObjKind::Class(ClassObj { name, superclass: None, methods: HashMap::new() }),
                    routine,
                )?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(Value::Obj(class_ref));
            }
            OpCode::Inherit => {
                let subclass_ref = pop!().as_obj().ok_or_else(|| RuntimeError::new(line, "INHERIT expects a class"))?;
                let superclass_ref = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "superclass must be a class"))?;
                let super_methods = match self.heap.get(superclass_ref).map(|o| &o.kind) {
                    Some(ObjKind::Class(c)) => c.methods.clone(),
                    _ => return Err(RuntimeError::new(line, "superclass must be a class").into()),
                };
                match self.heap.get_mut(subclass_ref).map(|o| &mut o.kind) {
                    Some(ObjKind::Class(c)) => {
                        c.superclass = Some(superclass_ref);
                        for (name, method) in super_methods {
                            c.methods.entry(name).or_insert(method);
                        }
                    }
                    _ => return Err(RuntimeError::new(line, "INHERIT expects a class").into()),
                }
                push!(Value::Obj(subclass_ref));
            }
            OpCode::Method => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                let method_ref = pop!().as_obj().ok_or_else(|| RuntimeError::new(line, "METHOD expects a closure"))?;
                let class_ref = peek_top!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "METHOD expects a class below the method"))?;
                match self.heap.get_mut(class_ref).map(|o| &mut o.kind) {
                    Some(ObjKind::Class(c)) => {
                        c.methods.insert(name, method_ref);
                    }
                    _ => return Err(RuntimeError::new(line, "METHOD expects a class below the method").into()),
                }
            }
            OpCode::Closure => {
                let idx = read_u16!();
                let function = match &chunk!().constants[idx as usize] {
                    Value::Obj(r) => match self.heap.get(*r).map(|o| &o.kind) {
                        Some(ObjKind::Function(f)) => f.clone(),
                        _ => return Err(RuntimeError::new(line, "CLOSURE expects a function constant").into()),
                    },
                    _ => return Err(RuntimeError::new(line, "CLOSURE expects a function constant").into()),
                };
                let mut upvalues = Vec::with_capacity(function.upvalue_count as usize);
                for i in 0..function.upvalue_count as usize {
                    let is_local = read_u8!() != 0;
                    let index = read_u8!() as usize;
                    let _ = i;
                    if is_local {
                        let stack_index = base!() + index;
                        let existing = inner.open_upvalues.iter().find_map(|r| match self.heap.get(*r).map(|o| &o.kind) {
                            Some(ObjKind::Upvalue(crate::object::UpvalueState::Open { stack_index: si, .. })) if *si == stack_index => Some(*r),
                            _ => None,
                        });
                        if let Some(r) = existing {
                            upvalues.push(r);
                        } else {
                            drop(inner);
                            let up_ref = self.allocate(
                                ObjKind::Upvalue(crate::object::UpvalueState::Open { routine: ObjRef(0), stack_index }),
                                routine,
                            )?;
                            inner = routine.inner.lock().expect("routine mutex poisoned");
                            inner.open_upvalues.push(up_ref);
                            upvalues.push(up_ref);
                        }
                    } else {
                        upvalues.push(closure.upvalues[index]);
                    }
                }
                drop(inner);
                let closure_ref = self.allocate(ObjKind::Closure(ClosureObj { function, upvalues }), routine)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(Value::Obj(closure_ref));
            }
            OpCode::Equal => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(self.values_equal(a, b)));
            }
            OpCode::Greater => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(self.compare_values(a, b, line)? == std::cmp::Ordering::Greater));
            }
            OpCode::Less => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(self.compare_values(a, b, line)? == std::cmp::Ordering::Less));
            }
            OpCode::Add => {
                let b = pop!();
                let a = pop!();
                if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
                    if matches!(self.heap.get(ra).map(|o| &o.kind), Some(ObjKind::String(_)))
                        && matches!(self.heap.get(rb).map(|o| &o.kind), Some(ObjKind::String(_)))
                    {
                        let sa = self.string_of(ra).unwrap_or_default();
                        let sb = self.string_of(rb).unwrap_or_default();
                        drop(inner);
                        let r = self.intern_string(&format!("{sa}{sb}"), routine)?;
                        inner = routine.inner.lock().expect("routine mutex poisoned");
                        push!(Value::Obj(r));
                    } else {
                        let result = self.bigint_binary_op(ra, rb, line, BigInt::add)?;
                        drop(inner);
                        let r = self.allocate(ObjKind::BigInt(result), routine)?;
                        inner = routine.inner.lock().expect("routine mutex poisoned");
                        push!(Value::Obj(r));
                    }
                } else if let (Value::Obj(ra), Value::Uint32(offset)) = (a, b) {
                    drop(inner);
                    let r = self.pointer_add_offset(ra, offset, line, routine)?;
                    inner = routine.inner.lock().expect("routine mutex poisoned");
                    push!(Value::Obj(r));
                } else {
                    push!(self.binary_arith(a, b, line, |x, y| x + y, i64::wrapping_add)?);
                }
            }
            OpCode::Subtract => {
                let b = pop!();
                let a = pop!();
                if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
                    let result = self.bigint_binary_op(ra, rb, line, BigInt::sub)?;
                    drop(inner);
                    let r = self.allocate(ObjKind::BigInt(result), routine)?;
                    inner = routine.inner.lock().expect("routine mutex poisoned");
                    push!(Value::Obj(r));
                } else {
                    push!(self.binary_arith(a, b, line, |x, y| x - y, i64::wrapping_sub)?);
                }
            }
            OpCode::Multiply => {
                let b = pop!();
                let a = pop!();
                if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
                    let result = self.bigint_binary_op(ra, rb, line, BigInt::mul)?;
                    drop(inner);
                    let r = self.allocate(ObjKind::BigInt(result), routine)?;
                    inner = routine.inner.lock().expect("routine mutex poisoned");
                    push!(Value::Obj(r));
                } else {
                    push!(self.binary_arith(a, b, line, |x, y| x * y, i64::wrapping_mul)?);
                }
            }
            OpCode::Divide => {
                let b = pop!();
                let a = pop!();
                if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
                    let ba = self.bigint_of(ra).ok_or_else(|| RuntimeError::new(line, "expected a bigint"))?;
                    let bb = self.bigint_of(rb).ok_or_else(|| RuntimeError::new(line, "expected a bigint"))?;
                    let (q, _r) = ba.div_mod(&bb).ok_or_else(|| RuntimeError::new(line, "division by zero"))?;
                    drop(inner);
                    let r = self.allocate(ObjKind::BigInt(q), routine)?;
                    inner = routine.inner.lock().expect("routine mutex poisoned");
                    push!(Value::Obj(r));
                } else {
                    push!(self.divide_values(a, b, line)?);
                }
            }
            OpCode::Modulo => {
                let b = pop!();
                let a = pop!();
                if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
                    let ba = self.bigint_of(ra).ok_or_else(|| RuntimeError::new(line, "expected a bigint"))?;
                    let bb = self.bigint_of(rb).ok_or_else(|| RuntimeError::new(line, "expected a bigint"))?;
                    let (_q, rem) = ba.div_mod(&bb).ok_or_else(|| RuntimeError::new(line, "division by zero"))?;
                    drop(inner);
                    let r = self.allocate(ObjKind::BigInt(rem), routine)?;
                    inner = routine.inner.lock().expect("routine mutex poisoned");
                    push!(Value::Obj(r));
                } else {
                    push!(self.euclidean_mod(a, b, line)?);
                }
            }
            OpCode::LeftShift => {
                let b = pop!();
                let a = pop!();
                push!(self.bitwise_op(a, b, line, |x, y| x.wrapping_shl(y as u32), |x, y| x.wrapping_shl(y as u32))?);
            }
            OpCode::RightShift => {
                let b = pop!();
                let a = pop!();
                push!(self.bitwise_op(a, b, line, |x, y| x.wrapping_shr(y as u32), |x, y| x.wrapping_shr(y as u32))?);
            }
            OpCode::BitOr => {
                let b = pop!();
                let a = pop!();
                push!(self.bitwise_op(a, b, line, |x, y| x | y, |x, y| x | y)?);
            }
            OpCode::BitAnd => {
                let b = pop!();
                let a = pop!();
                push!(self.bitwise_op(a, b, line, |x, y| x & y, |x, y| x & y)?);
            }
            OpCode::BitXor => {
                let b = pop!();
                let a = pop!();
                push!(self.bitwise_op(a, b, line, |x, y| x ^ y, |x, y| x ^ y)?);
            }
            OpCode::Not => {
                let a = pop!();
                push!(Value::Bool(!a.is_truthy()));
            }
            OpCode::Negate => {
                let a = pop!();
                push!(negate_value(a, line)?);
            }
            OpCode::Jump => {
                let offset = read_u16!();
                inner.frames[frame_idx].ip += offset as usize;
            }
            OpCode::JumpIfFalse => {
                let offset = read_u16!();
                if !peek_top!().is_truthy() {
                    inner.frames[frame_idx].ip += offset as usize;
                }
            }
            OpCode::Loop => {
                let offset = read_u16!();
                inner.frames[frame_idx].ip -= offset as usize;
            }
            OpCode::Print => {
                let v = pop!();
                let text = self.display_value(&v);
                println!("{text}");
            }
            OpCode::Poke => {
                let value = pop!();
                let addr = pop!();
                let (address, byte) = poke_operands(addr, value, line)?;
                self.peripheral.poke(address, byte);
            }
            OpCode::TypeLiteral => {
                let tag = read_u8!();
                let ty = TypeDesc::from_tag(tag).ok_or_else(|| RuntimeError::new(line, format!("unknown type tag {tag}")))?;
                drop(inner);
                let r = self.allocate(ObjKind::Type(TypeValue { ty: Arc::new(ty), is_const: false }), routine)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(Value::Obj(r));
            }
            OpCode::TypeModifier => {
                // 0 = pointer-to, 1 = toggle const.
                let tag = read_u8!();
                let base_ref = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "TYPE_MODIFIER expects a type value"))?;
                let base = match self.heap.get(base_ref).map(|o| &o.kind) {
                    Some(ObjKind::Type(t)) => t.clone(),
                    _ => return Err(RuntimeError::new(line, "TYPE_MODIFIER expects a type value").into()),
                };
                let new_type = match tag {
                    0 => TypeValue { ty: Arc::new(TypeDesc::Pointer { target: base.ty }), is_const: false },
                    1 => TypeValue { ty: base.ty, is_const: !base.is_const },
                    _ => return Err(RuntimeError::new(line, format!("unknown type modifier {tag}")).into()),
                };
                drop(inner);
                let r = self.allocate(ObjKind::Type(new_type), routine)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(Value::Obj(r));
            }
            OpCode::TypeArray => {
                let cardinality = read_u32!() as usize;
                let elem_ref = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "TYPE_ARRAY expects an element type"))?;
                let elem = match self.heap.get(elem_ref).map(|o| &o.kind) {
                    Some(ObjKind::Type(t)) => t.ty.clone(),
                    _ => return Err(RuntimeError::new(line, "TYPE_ARRAY expects an element type").into()),
                };
                drop(inner);
                let r = self.allocate(
                    ObjKind::Type(TypeValue { ty: Arc::new(TypeDesc::Array { element: elem, cardinality }), is_const: false }),
                    routine,
                )?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(Value::Obj(r));
            }
            OpCode::TypeStruct => {
                let field_count = read_u8!() as usize;
                let mut fields = Vec::with_capacity(field_count);
                for _ in 0..field_count {
                    let ty_ref = pop!()
                        .as_obj()
                        .ok_or_else(|| RuntimeError::new(line, "TYPE_STRUCT expects field type values"))?;
                    let name_ref = pop!()
                        .as_obj()
                        .ok_or_else(|| RuntimeError::new(line, "TYPE_STRUCT expects field name strings"))?;
                    let name = self
                        .string_of(name_ref)
                        .ok_or_else(|| RuntimeError::new(line, "TYPE_STRUCT expects field name strings"))?;
                    let ty = match self.heap.get(ty_ref).map(|o| &o.kind) {
                        Some(ObjKind::Type(t)) => t.ty.clone(),
                        _ => return Err(RuntimeError::new(line, "TYPE_STRUCT expects field type values").into()),
                    };
                    fields.push((name, ty));
                }
                fields.reverse();
                let ty = TypeDesc::new_struct(fields);
                drop(inner);
                let r = self.allocate(ObjKind::Type(TypeValue { ty: Arc::new(ty), is_const: false }), routine)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(Value::Obj(r));
            }
            OpCode::Element => {
                let index = value_as_i64(pop!(), line)?;
                let container = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "ELEMENT expects a packed container"))?;
                drop(inner);
                let v = self.element_get(container, index, line, routine)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(v);
            }
            OpCode::SetElement => {
                let value = pop!();
                let index = value_as_i64(pop!(), line)?;
                let container = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "SET_ELEMENT expects a packed container"))?;
                drop(inner);
                self.element_set(container, index, value, line)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(value);
            }
            OpCode::DerefPtr => {
                let ptr_container = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "DEREF_PTR expects a pointer"))?;
                drop(inner);
                let v = self.deref_ptr(ptr_container, line, routine)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(v);
            }
            OpCode::SetPtrTarget => {
                let value = pop!();
                let ptr_container = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "SET_PTR_TARGET expects a pointer"))?;
                drop(inner);
                self.set_ptr_target(ptr_container, value, line)?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(value);
            }
            OpCode::Place => {
                let addr = value_as_i64(pop!(), line)? as usize;
                let type_ref = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "PLACE expects a type value"))?;
                let ty = match self.heap.get(type_ref).map(|o| &o.kind) {
                    Some(ObjKind::Type(t)) => t.ty.clone(),
                    _ => return Err(RuntimeError::new(line, "PLACE expects a type value").into()),
                };
                let byte_len = ty.packed_size();
                drop(inner);
                let r = self.allocate(
                    ObjKind::PackedUnowned(PackedUnowned { ty, source: UnownedSource::Address(addr), byte_offset: 0, byte_len }),
                    routine,
                )?;
                inner = routine.inner.lock().expect("routine mutex poisoned");
                push!(Value::Obj(r));
            }
            OpCode::GetBuiltin => {
                let tag = read_u8!() as usize;
                let r = *self
                    .builtins
                    .get(tag)
                    .ok_or_else(|| RuntimeError::new(line, format!("unknown builtin tag {tag}")))?;
                push!(Value::Obj(r));
            }
            OpCode::Call => {
                let argc = read_u8!() as usize;
                let callee_idx = inner.stack.len() - argc - 1;
                let callee = inner.stack[callee_idx];
                drop(inner);
                let outcome = self.call_value(routine, callee, callee_idx, argc, line)?;
                if let Some(out) = outcome {
                    return Ok(out);
                }
                inner = routine.inner.lock().expect("routine mutex poisoned");
            }
            OpCode::Invoke => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                let argc = read_u8!() as usize;
                let callee_idx = inner.stack.len() - argc - 1;
                let receiver = inner.stack[callee_idx];
                drop(inner);
                let outcome = self.invoke(routine, receiver, &name, callee_idx, argc, line)?;
                if let Some(out) = outcome {
                    return Ok(out);
                }
                inner = routine.inner.lock().expect("routine mutex poisoned");
            }
            OpCode::SuperInvoke => {
                let idx = read_u16!();
                let name = constant_name(chunk!(), idx, self, line)?;
                let argc = read_u8!() as usize;
                let superclass = pop!()
                    .as_obj()
                    .ok_or_else(|| RuntimeError::new(line, "SUPER_INVOKE expects a class on top"))?;
                let callee_idx = inner.stack.len() - argc - 1;
                drop(inner);
                let method = self
                    .find_method(superclass, &name)
                    .ok_or_else(|| RuntimeError::new(line, format!("undefined method '{name}'")))?;
                let outcome = self.call_closure(routine, method, callee_idx, argc, line)?;
                if let Some(out) = outcome {
                    return Ok(out);
                }
                inner = routine.inner.lock().expect("routine mutex poisoned");
            }
            OpCode::Return => {
                let result = pop!();
                let base = base!();
                inner.forget_cell_types_from(base);
                inner.stack.truncate(base);
                inner.frames.pop();
                if inner.frames.is_empty() {
                    return Ok(ExecOutcome::Return(result));
                }
                inner.stack.push(result);
            }
            OpCode::Yield => {
                let v = pop!();
                return Ok(ExecOutcome::Yield(v));
            }
        }
        Ok(ExecOutcome::Continue)
    }

    fn find_method(&self, class_ref: ObjRef, name: &str) -> Option<ObjRef> {
        match self.heap.get(class_ref).map(|o| &o.kind) {
            Some(ObjKind::Class(c)) => c.methods.get(name).copied(),
            _ => None,
        }
    }

    fn read_upvalue(&self, up_ref: ObjRef, inner: &crate::routine::RoutineInner, line: u32) -> Result<Value, RuntimeError> {
        match self.heap.get(up_ref).map(|o| &o.kind) {
            Some(ObjKind::Upvalue(crate::object::UpvalueState::Closed(v))) => Ok(*v),
            Some(ObjKind::Upvalue(crate::object::UpvalueState::Open { stack_index, .. })) => inner
                .stack
                .get(*stack_index)
                .copied()
                .ok_or_else(|| RuntimeError::new(line, "dangling open upvalue")),
            _ => Err(RuntimeError::new(line, "expected an upvalue")),
        }
    }

    fn write_upvalue(&self, up_ref: ObjRef, value: Value, inner: &mut crate::routine::RoutineInner, line: u32) -> Result<(), RuntimeError> {
        match self.heap.get(up_ref).map(|o| &o.kind) {
            Some(ObjKind::Upvalue(crate::object::UpvalueState::Open { stack_index, .. })) => {
                let idx = *stack_index;
                if idx >= inner.stack.len() {
                    return Err(RuntimeError::new(line, "dangling open upvalue"));
                }
                inner.stack[idx] = value;
                Ok(())
            }
            Some(ObjKind::Upvalue(crate::object::UpvalueState::Closed(_))) => {
                Err(RuntimeError::new(line, "cannot assign through a closed upvalue from a foreign frame"))
            }
            _ => Err(RuntimeError::new(line, "expected an upvalue")),
        }
    }

    /// Dispatches a property-call (`obj.method(args)`, `INVOKE`'s
    /// fused lookup+call) to an instance field holding a callable, or
    /// a method resolved on the instance's class.
    fn invoke(
        &mut self,
        routine: &Routine,
        receiver: Value,
        name: &str,
        callee_idx: usize,
        argc: usize,
        line: u32,
    ) -> Result<Option<ExecOutcome>, VmError> {
        let inst_ref = receiver.as_obj().ok_or_else(|| RuntimeError::new(line, "only instances have methods"))?;
        let (field, class_ref) = match self.heap.get(inst_ref).map(|o| &o.kind) {
            Some(ObjKind::Instance(i)) => (i.fields.get(name).copied(), i.class),
            _ => return Err(RuntimeError::new(line, "only instances have methods").into()),
        };
        if let Some(field_value) = field {
            {
                let mut g = routine.inner.lock().expect("routine mutex poisoned");
                g.stack[callee_idx] = field_value;
            }
            self.call_value(routine, field_value, callee_idx, argc, line)
        } else {
            let method = self
                .find_method(class_ref, name)
                .ok_or_else(|| RuntimeError::new(line, format!("undefined method '{name}'")))?;
            self.call_closure(routine, method, callee_idx, argc, line)
        }
    }

    /// Dispatches a `CALL`/property-call to a closure, native, bound
    /// method, or class constructor sitting at `inner.stack[callee_idx]`.
    /// Returns `Some(outcome)` if the call completed without pushing a
    /// new frame (natives, and a no-init-method constructor), `None`
    /// once a new frame for a closure call has been pushed (the
    /// caller's `execute_one` loop continues from there).
    fn call_value(&mut self, routine: &Routine, callee: Value, callee_idx: usize, argc: usize, line: u32) -> Result<Option<ExecOutcome>, VmError> {
        let callee_ref = match callee.as_obj() {
            Some(r) => r,
            None => return Err(RuntimeError::new(line, "can only call functions and classes").into()),
        };
        let kind = match self.heap.get(callee_ref) {
            Some(o) => o.kind.clone(),
            None => return Err(RuntimeError::new(line, "can only call functions and classes").into()),
        };
        match kind {
            ObjKind::Closure(_) => self.call_closure(routine, callee_ref, callee_idx, argc, line),
            ObjKind::Native(n) => {
                let args: Vec<Value> = {
                    let mut g = routine.inner.lock().expect("routine mutex poisoned");
                    let args = g.stack[callee_idx + 1..].to_vec();
                    g.stack.truncate(callee_idx);
                    args
                };
                let result = (n.func)(self, routine, &args)?;
                let mut g = routine.inner.lock().expect("routine mutex poisoned");
                g.stack.push(result);
                Ok(None)
            }
            ObjKind::BoundMethod(b) => {
                {
                    let mut g = routine.inner.lock().expect("routine mutex poisoned");
                    g.stack[callee_idx] = b.receiver;
                }
                self.call_closure(routine, b.method, callee_idx, argc, line)
            }
            ObjKind::Class(_) => {
                let instance_ref = self.allocate(
                    ObjKind::Instance(InstanceObj { class: callee_ref, fields: HashMap::new() }),
                    routine,
                )?;
                let init = self.find_method(callee_ref, "init");
                {
                    let mut g = routine.inner.lock().expect("routine mutex poisoned");
                    g.stack[callee_idx] = Value::Obj(instance_ref);
                }
                match init {
                    Some(init_ref) => self.call_closure(routine, init_ref, callee_idx, argc, line),
                    None => {
                        if argc != 0 {
                            return Err(RuntimeError::new(line, "expected 0 arguments to a class with no init method").into());
                        }
                        Ok(None)
                    }
                }
            }
            _ => Err(RuntimeError::new(line, "can only call functions and classes").into()),
        }
    }

    fn call_closure(&mut self, routine: &Routine, closure_ref: ObjRef, callee_idx: usize, argc: usize, line: u32) -> Result<Option<ExecOutcome>, VmError> {
        let closure = self.closure_of(closure_ref)?;
        if argc != closure.function.arity as usize {
            return Err(RuntimeError::new(
                line,
                format!("expected {} arguments but got {argc}", closure.function.arity),
            )
            .into());
        }
        let mut inner = routine.inner.lock().expect("routine mutex poisoned");
        inner.push_frame(CallFrame { closure: closure_ref, ip: 0, stack_base: callee_idx })?;
        Ok(None)
    }

    fn bigint_binary_op(&self, ra: ObjRef, rb: ObjRef, line: u32, f: impl Fn(&BigInt, &BigInt) -> BigInt) -> Result<BigInt, RuntimeError> {
        let a = self.bigint_of(ra).ok_or_else(|| RuntimeError::new(line, "expected a bigint"))?;
        let b = self.bigint_of(rb).ok_or_else(|| RuntimeError::new(line, "expected a bigint"))?;
        Ok(f(&a, &b))
    }

    fn binary_arith(&self, a: Value, b: Value, line: u32, ff: impl Fn(f64, f64) -> f64, fi: impl Fn(i64, i64) -> i64) -> Result<Value, RuntimeError> {
        use Value::*;
        match (a, b) {
            (Double(x), Double(y)) => Ok(Double(ff(x, y))),
            (Int8(x), Int8(y)) => Ok(Int8(fi(x as i64, y as i64) as i8)),
            (Uint8(x), Uint8(y)) => Ok(Uint8(fi(x as i64, y as i64) as u8)),
            (Int16(x), Int16(y)) => Ok(Int16(fi(x as i64, y as i64) as i16)),
            (Uint16(x), Uint16(y)) => Ok(Uint16(fi(x as i64, y as i64) as u16)),
            (Int32(x), Int32(y)) => Ok(Int32(fi(x as i64, y as i64) as i32)),
            (Uint32(x), Uint32(y)) => Ok(Uint32(fi(x as i64, y as i64) as u32)),
            (Int64(x), Int64(y)) => Ok(Int64(fi(x, y))),
            (Uint64(x), Uint64(y)) => Ok(Uint64(fi(x as i64, y as i64) as u64)),
            (Address(x), Uint32(y)) => Ok(Address(fi(x as i64, y as i64) as usize)),
            _ => Err(RuntimeError::new(line, format!("operator requires matching numeric operands, got {} and {}", a.type_name(), b.type_name()))),
        }
    }

    fn divide_values(&self, a: Value, b: Value, line: u32) -> Result<Value, RuntimeError> {
        use Value::*;
        if matches!(b, Int8(0) | Uint8(0) | Int16(0) | Uint16(0) | Int32(0) | Uint32(0) | Int64(0) | Uint64(0)) {
            return Err(RuntimeError::new(line, "division by zero"));
        }
        match (a, b) {
            (Double(x), Double(y)) => Ok(Double(x / y)),
            (Int8(x), Int8(y)) => Ok(Int8(x.wrapping_div(y))),
            (Uint8(x), Uint8(y)) => Ok(Uint8(x / y)),
            (Int16(x), Int16(y)) => Ok(Int16(x.wrapping_div(y))),
            (Uint16(x), Uint16(y)) => Ok(Uint16(x / y)),
            (Int32(x), Int32(y)) => Ok(Int32(x.wrapping_div(y))),
            (Uint32(x), Uint32(y)) => Ok(Uint32(x / y)),
            (Int64(x), Int64(y)) => Ok(Int64(x.wrapping_div(y))),
            (Uint64(x), Uint64(y)) => Ok(Uint64(x / y)),
            _ => Err(RuntimeError::new(line, format!("operator requires matching numeric operands, got {} and {}", a.type_name(), b.type_name()))),
        }
    }

    fn euclidean_mod(&self, a: Value, b: Value, line: u32) -> Result<Value, RuntimeError> {
        use Value::*;
        match (a, b) {
            (Double(x), Double(y)) => Ok(Double(x.rem_euclid(y))),
            (Int8(x), Int8(y)) => checked_int_mod(x, y, line).map(Int8),
            (Uint8(x), Uint8(y)) => checked_uint_mod(x, y, line).map(Uint8),
            (Int16(x), Int16(y)) => checked_int_mod(x, y, line).map(Int16),
            (Uint16(x), Uint16(y)) => checked_uint_mod(x, y, line).map(Uint16),
            (Int32(x), Int32(y)) => checked_int_mod(x, y, line).map(Int32),
            (Uint32(x), Uint32(y)) => checked_uint_mod(x, y, line).map(Uint32),
            (Int64(x), Int64(y)) => checked_int_mod(x, y, line).map(Int64),
            (Uint64(x), Uint64(y)) => checked_uint_mod(x, y, line).map(Uint64),
            _ => Err(RuntimeError::new(line, format!("operator requires matching numeric operands, got {} and {}", a.type_name(), b.type_name()))),
        }
    }

    fn bitwise_op(&self, a: Value, b: Value, line: u32, fi: impl Fn(i64, i64) -> i64, fu: impl Fn(u64, u64) -> u64) -> Result<Value, RuntimeError> {
        use Value::*;
        match (a, b) {
            (Int8(x), Int8(y)) => Ok(Int8(fi(x as i64, y as i64) as i8)),
            (Uint8(x), Uint8(y)) => Ok(Uint8(fu(x as u64, y as u64) as u8)),
            (Int16(x), Int16(y)) => Ok(Int16(fi(x as i64, y as i64) as i16)),
            (Uint16(x), Uint16(y)) => Ok(Uint16(fu(x as u64, y as u64) as u16)),
            (Int32(x), Int32(y)) => Ok(Int32(fi(x as i64, y as i64) as i32)),
            (Uint32(x), Uint32(y)) => Ok(Uint32(fu(x as u64, y as u64) as u32)),
            (Int64(x), Int64(y)) => Ok(Int64(fi(x, y))),
            (Uint64(x), Uint64(y)) => Ok(Uint64(fu(x, y))),
            _ => Err(RuntimeError::new(line, format!("bitwise operator requires matching integer operands, got {} and {}", a.type_name(), b.type_name()))),
        }
    }

    fn compare_values(&self, a: Value, b: Value, line: u32) -> Result<std::cmp::Ordering, RuntimeError> {
        use Value::*;
        match (a, b) {
            (Double(x), Double(y)) => x.partial_cmp(&y).ok_or_else(|| RuntimeError::new(line, "comparison with NaN")),
            (Int8(x), Int8(y)) => Ok(x.cmp(&y)),
            (Uint8(x), Uint8(y)) => Ok(x.cmp(&y)),
            (Int16(x), Int16(y)) => Ok(x.cmp(&y)),
            (Uint16(x), Uint16(y)) => Ok(x.cmp(&y)),
            (Int32(x), Int32(y)) => Ok(x.cmp(&y)),
            (Uint32(x), Uint32(y)) => Ok(x.cmp(&y)),
            (Int64(x), Int64(y)) => Ok(x.cmp(&y)),
            (Uint64(x), Uint64(y)) => Ok(x.cmp(&y)),
            (Obj(ra), Obj(rb)) => match (self.bigint_of(ra), self.bigint_of(rb)) {
                (Some(x), Some(y)) => Ok(x.compare(&y)),
                _ => Err(RuntimeError::new(line, "cannot order these operands")),
            },
            _ => Err(RuntimeError::new(line, format!("cannot order a {} and a {}", a.type_name(), b.type_name()))),
        }
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(ra), Value::Obj(rb)) => {
                if ra == rb {
                    return true;
                }
                match (self.bigint_of(ra), self.bigint_of(rb)) {
                    (Some(x), Some(y)) => x.compare(&y) == std::cmp::Ordering::Equal,
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    /// Produces `PRINT`'s textual form of a value, resolving heap-
    /// backed kinds (strings print bare, bigints in decimal,
    /// instances/classes/closures get a bracketed tag, same spirit as
    /// spec.md §4.7's "print does not quote strings").
    pub fn display_value(&self, v: &Value) -> String {
        match v {
            Value::Obj(r) => match self.heap.get(*r).map(|o| &o.kind) {
                Some(ObjKind::String(s)) => s.clone(),
                Some(ObjKind::BigInt(b)) => b.to_decimal_string(),
                Some(ObjKind::Instance(i)) => {
                    let class_name = match self.heap.get(i.class).map(|o| &o.kind) {
                        Some(ObjKind::Class(c)) => c.name.clone(),
                        _ => "?".to_string(),
                    };
                    format!("<{class_name} instance>")
                }
                Some(ObjKind::Class(c)) => format!("<class {}>", c.name),
                Some(ObjKind::Closure(c)) => format!("<fn {}>", c.function.name),
                Some(kind) => format!("<{}>", kind.type_name()),
                None => "<dangling>".to_string(),
            },
            other => other.to_string(),
        }
    }

    /// Resolves `container` for `ELEMENT`/`SET_ELEMENT`: either a
    /// uniform array directly, or a pointer-to-array, dereferenced
    /// first (spec.md §4.4: "accept a uniform array or a pointer-to-
    /// array"). The `bool` reports whether indexing arrived through a
    /// pointer, which changes `ELEMENT`'s result shape below.
    fn resolve_indexable(&self, container: ObjRef, line: u32) -> Result<(TypeDesc, UnownedSource, usize, bool), RuntimeError> {
        let (ty, source, base_offset) = self.resolve_packed(container, line)?;
        match ty {
            TypeDesc::Array { .. } => Ok((ty, source, base_offset, false)),
            TypeDesc::Pointer { target } => match &*target {
                TypeDesc::Array { .. } => {
                    let dest_ref = self.load_pointer_target(source, base_offset, line)?;
                    let (array_ty, array_source, array_base_offset) = self.resolve_packed(dest_ref, line)?;
                    Ok((array_ty, array_source, array_base_offset, true))
                }
                other => Err(RuntimeError::new(line, format!("cannot index a pointer to {other}"))),
            },
            other => Err(RuntimeError::new(line, format!("cannot index a {other} value"))),
        }
    }

    /// Resolves `container[index]`, handling both a direct array and a
    /// pointer-to-array. For a pointer-to-array the result is always a
    /// fresh unowned pointer to the slot, enabling `*p = …` afterwards;
    /// for a direct array an object-typed element yields a fresh
    /// unowned view rather than copying, and a primitive element is
    /// unpacked (spec.md §4.4).
    fn element_get(&mut self, container: ObjRef, index: i64, line: u32, routine: &Routine) -> Result<Value, VmError> {
        let (array_ty, source, base_offset, via_pointer) = self.resolve_indexable(container, line)?;
        let (offset, elem_ty) = packed::element_offset(&array_ty, index)?;
        let abs_offset = base_offset + offset;
        if via_pointer {
            let byte_len = elem_ty.packed_size();
            let target = Arc::new(elem_ty);
            let view = PackedUnowned { ty: target.clone(), source, byte_offset: abs_offset, byte_len };
            let view_ref = self.allocate(ObjKind::PackedUnowned(view), routine)?;
            let ptr_ty = Arc::new(TypeDesc::Pointer { target });
            let mut bytes = vec![0u8; ptr_ty.packed_size()];
            packed::store_primitive(&mut bytes, 0, &ptr_ty, &Value::Obj(view_ref), true)?;
            let ptr_ref = self.allocate(ObjKind::PackedOwned(PackedOwned { ty: ptr_ty, bytes }), routine)?;
            return Ok(Value::Obj(ptr_ref));
        }
        if elem_ty.is_object_kind() && !matches!(elem_ty, TypeDesc::String | TypeDesc::BigInt) {
            let byte_len = elem_ty.packed_size();
            let view = PackedUnowned { ty: Arc::new(elem_ty), source, byte_offset: abs_offset, byte_len };
            let r = self.allocate(ObjKind::PackedUnowned(view), routine)?;
            return Ok(Value::Obj(r));
        }
        let bytes = self.packed_bytes(source, line)?;
        Ok(packed::load_primitive(&bytes, abs_offset, &elem_ty))
    }

    fn element_set(&mut self, container: ObjRef, index: i64, value: Value, line: u32) -> Result<(), RuntimeError> {
        let (array_ty, source, base_offset, _via_pointer) = self.resolve_indexable(container, line)?;
        let (offset, elem_ty) = packed::element_offset(&array_ty, index)?;
        let abs_offset = base_offset + offset;
        self.store_into(source, abs_offset, &elem_ty, &value, false, line)
    }

    fn deref_ptr(&mut self, ptr_container: ObjRef, line: u32, routine: &Routine) -> Result<Value, VmError> {
        let (ty, source, base_offset) = self.resolve_packed(ptr_container, line)?;
        let target_ty = match &ty {
            TypeDesc::Pointer { target } => (**target).clone(),
            _ => return Err(RuntimeError::new(line, "DEREF_PTR expects a pointer").into()),
        };
        let target_ref = self.load_pointer_target(source, base_offset, line)?;
        if target_ty.is_object_kind() {
            let byte_len = target_ty.packed_size();
            let view = PackedUnowned { ty: Arc::new(target_ty), source: UnownedSource::Heap(target_ref), byte_offset: 0, byte_len };
            let r = self.allocate(ObjKind::PackedUnowned(view), routine)?;
            Ok(Value::Obj(r))
        } else {
            let target_bytes = self.packed_bytes(UnownedSource::Heap(target_ref), line)?;
            Ok(packed::load_primitive(&target_bytes, 0, &target_ty))
        }
    }

    fn set_ptr_target(&mut self, ptr_container: ObjRef, value: Value, line: u32) -> Result<(), RuntimeError> {
        let (ty, source, base_offset) = self.resolve_packed(ptr_container, line)?;
        let target_ty = match &ty {
            TypeDesc::Pointer { target } => (**target).clone(),
            _ => return Err(RuntimeError::new(line, "SET_PTR_TARGET expects a pointer")),
        };
        let target_ref = self.load_pointer_target(source, base_offset, line)?;
        self.store_into(UnownedSource::Heap(target_ref), 0, &target_ty, &value, false, line)
    }

    fn load_pointer_target(&self, source: UnownedSource, offset: usize, line: u32) -> Result<ObjRef, RuntimeError> {
        let bytes = self.packed_bytes(source, line)?;
        match packed::load_primitive(&bytes, offset, &TypeDesc::Uint64) {
            Value::Uint64(n) => Ok(ObjRef(n as u32)),
            _ => Err(RuntimeError::new(line, "malformed pointer value")),
        }
    }

    /// `Pointer + Uint32` (spec.md §4.6): yields a fresh `Pointer` whose
    /// destination is `offset` bytes further into the same backing
    /// storage as `ptr_ref`'s destination. Builds a new pointer rather
    /// than mutating `ptr_ref` in place, the same immutable-result style
    /// BigInt arithmetic already follows here.
    fn pointer_add_offset(&mut self, ptr_ref: ObjRef, offset: u32, line: u32, routine: &Routine) -> Result<ObjRef, VmError> {
        let (ty, source, base_offset) = self.resolve_packed(ptr_ref, line)?;
        let target = match ty {
            TypeDesc::Pointer { target } => target,
            other => return Err(RuntimeError::new(line, format!("cannot add an integer offset to a {other}")).into()),
        };
        let dest_ref = self.load_pointer_target(source, base_offset, line)?;
        let byte_len = target.packed_size();
        let view = PackedUnowned {
            ty: target.clone(),
            source: UnownedSource::Heap(dest_ref),
            byte_offset: offset as usize,
            byte_len,
        };
        let view_ref = self.allocate(ObjKind::PackedUnowned(view), routine)?;
        let ptr_ty = Arc::new(TypeDesc::Pointer { target });
        let mut bytes = vec![0u8; ptr_ty.packed_size()];
        packed::store_primitive(&mut bytes, 0, &ptr_ty, &Value::Obj(view_ref), true)?;
        Ok(self.allocate(ObjKind::PackedOwned(PackedOwned { ty: ptr_ty, bytes }), routine)?)
    }

    /// Resolves a packed-container `ObjRef` (owned or unowned) to its
    /// declared type, the source its bytes live in, and the byte
    /// offset within that source this container's own slots start at.
    fn resolve_packed(&self, container: ObjRef, line: u32) -> Result<(TypeDesc, UnownedSource, usize), RuntimeError> {
        match self.heap.get(container).map(|o| &o.kind) {
            Some(ObjKind::PackedOwned(p)) => Ok(((*p.ty).clone(), UnownedSource::Heap(container), 0)),
            Some(ObjKind::PackedUnowned(p)) => Ok(((*p.ty).clone(), p.source, p.byte_offset)),
            _ => Err(RuntimeError::new(line, "expected a packed container")),
        }
    }

    /// Reads a source's backing bytes, recursing one level when the
    /// source is itself an unowned view (a pointer target produced by
    /// `pointer_add_offset`, or an element view chained through a
    /// pointer-to-array) so any depth of aliasing resolves to the same
    /// underlying owned storage.
    fn packed_bytes(&self, source: UnownedSource, line: u32) -> Result<Vec<u8>, RuntimeError> {
        match source {
            UnownedSource::Heap(r) => match self.heap.get(r).map(|o| &o.kind) {
                Some(ObjKind::PackedOwned(p)) => Ok(p.bytes.clone()),
                Some(ObjKind::PackedUnowned(p)) => {
                    let (inner_source, byte_offset, byte_len) = (p.source, p.byte_offset, p.byte_len);
                    let inner = self.packed_bytes(inner_source, line)?;
                    inner
                        .get(byte_offset..byte_offset + byte_len)
                        .map(|s| s.to_vec())
                        .ok_or_else(|| RuntimeError::new(line, "unowned view reaches past its source's storage"))
                }
                _ => Err(RuntimeError::new(line, "aliased object is not packed storage")),
            },
            UnownedSource::Address(addr) => Ok((0..8u8).map(|i| self.peripheral.peek(addr + i as usize)).collect()),
        }
    }

    fn store_into(&mut self, source: UnownedSource, offset: usize, ty: &TypeDesc, value: &Value, allow_nil_init: bool, line: u32) -> Result<(), RuntimeError> {
        match source {
            UnownedSource::Heap(r) => {
                let redirect = match self.heap.get(r).map(|o| &o.kind) {
                    Some(ObjKind::PackedUnowned(p)) => Some((p.source, p.byte_offset)),
                    _ => None,
                };
                if let Some((inner_source, base_offset)) = redirect {
                    return self.store_into(inner_source, base_offset + offset, ty, value, allow_nil_init, line);
                }
                match self.heap.get_mut(r).map(|o| &mut o.kind) {
                    Some(ObjKind::PackedOwned(p)) => packed::store_primitive(&mut p.bytes, offset, ty, value, allow_nil_init),
                    _ => Err(RuntimeError::new(line, "aliased object is not packed storage")),
                }
            }
            UnownedSource::Address(addr) => {
                let mut buf = vec![0u8; ty.packed_size()];
                packed::store_primitive(&mut buf, 0, ty, value, allow_nil_init)?;
                for (i, b) in buf.iter().enumerate() {
                    self.peripheral.poke(addr + offset + i, *b);
                }
                Ok(())
            }
        }
    }

    /// Allocates a fresh owned packed container of `ty`, zero-filled.
    pub fn allocate_packed(&mut self, ty: Arc<TypeDesc>, routine: &Routine) -> Result<ObjRef, FatalVmError> {
        let size = ty.packed_size();
        self.allocate(ObjKind::PackedOwned(PackedOwned { ty, bytes: vec![0u8; size] }), routine)
    }
}

fn constant_name(chunk: &crate::chunk::Chunk, idx: u16, interp: &Interpreter, line: u32) -> Result<String, RuntimeError> {
    match chunk.constants[idx as usize] {
        Value::Obj(r) => interp
            .string_of(r)
            .ok_or_else(|| RuntimeError::new(line, "expected a string constant")),
        _ => Err(RuntimeError::new(line, "expected a string constant")),
    }
}

fn close_upvalue_at(inner: &mut crate::routine::RoutineInner, stack_index: usize, value: Value, heap: &mut Heap) {
    inner.open_upvalues.retain(|r| {
        let should_close = matches!(
            heap.get(*r).map(|o| &o.kind),
            Some(ObjKind::Upvalue(crate::object::UpvalueState::Open { stack_index: si, .. })) if *si == stack_index
        );
        if should_close {
            if let Some(HeapObject { kind: ObjKind::Upvalue(state), .. }) = heap.get_mut(*r) {
                *state = crate::object::UpvalueState::Closed(value);
            }
        }
        !should_close
    });
}

fn checked_int_mod<T>(x: T, y: T, line: u32) -> Result<T, RuntimeError>
where
    T: Copy + PartialEq + PartialOrd + Default + std::ops::Rem<Output = T> + std::ops::Add<Output = T>,
{
    if y == T::default() {
        return Err(RuntimeError::new(line, "modulo by zero"));
    }
    let r = x % y;
    Ok(if (r < T::default()) != (y < T::default()) && r != T::default() { r + y } else { r })
}

fn checked_uint_mod<T>(x: T, y: T, line: u32) -> Result<T, RuntimeError>
where
    T: Copy + PartialEq + Default + std::ops::Rem<Output = T>,
{
    if y == T::default() {
        return Err(RuntimeError::new(line, "modulo by zero"));
    }
    Ok(x % y)
}

fn negate_value(v: Value, line: u32) -> Result<Value, RuntimeError> {
    use Value::*;
    match v {
        Double(x) => Ok(Double(-x)),
        Int8(x) => Ok(Int8(x.wrapping_neg())),
        Int16(x) => Ok(Int16(x.wrapping_neg())),
        Int32(x) => Ok(Int32(x.wrapping_neg())),
        Int64(x) => Ok(Int64(x.wrapping_neg())),
        _ => Err(RuntimeError::new(line, format!("cannot negate a {}", v.type_name()))),
    }
}

fn poke_operands(addr: Value, value: Value, line: u32) -> Result<(usize, u8), RuntimeError> {
    let address = match addr {
        Value::Address(a) => a,
        Value::Uint32(a) => a as usize,
        Value::Uint64(a) => a as usize,
        _ => return Err(RuntimeError::new(line, "POKE expects an address")),
    };
    let byte = match value {
        Value::Uint8(b) => b,
        Value::Int8(b) => b as u8,
        _ => return Err(RuntimeError::new(line, "POKE expects a byte value")),
    };
    Ok((address, byte))
}

fn value_as_i64(v: Value, line: u32) -> Result<i64, RuntimeError> {
    use Value::*;
    match v {
        Int8(x) => Ok(x as i64),
        Uint8(x) => Ok(x as i64),
        Int16(x) => Ok(x as i64),
        Uint16(x) => Ok(x as i64),
        Int32(x) => Ok(x as i64),
        Uint32(x) => Ok(x as i64),
        Int64(x) => Ok(x),
        Uint64(x) => Ok(x as i64),
        _ => Err(RuntimeError::new(line, "expected an integer index")),
    }
}

fn decode_opcode(byte: u8, line: u32) -> Result<OpCode, RuntimeError> {
    if byte > OpCode::GetBuiltin as u8 {
        return Err(RuntimeError::new(line, format!("invalid opcode byte {byte}")));
    }
    // SAFETY: `OpCode` is `#[repr(u8)]` and every discriminant from 0
    // through `GetBuiltin` is declared, so any byte in that range
    // names a valid variant.
    Ok(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkBuilder, Function};
    use crate::object::ClosureObj;
    use crate::peripheral::MockPeripheral;

    fn interp() -> Interpreter {
        Interpreter::new(Arc::new(MockPeripheral::new()), VmConfig::default()).unwrap()
    }

    fn emit_i32(b: &mut ChunkBuilder, v: i32, line: u32) {
        b.emit(OpCode::ImmediateI32, line);
        for byte in v.to_le_bytes() {
            b.emit_byte(byte, line);
        }
    }

    fn run_function(interp: &mut Interpreter, function: Function) -> StepOutcome {
        let func_ref = interp.heap.allocate(ObjKind::Function(Arc::new(function)), &mut |_| {}).unwrap();
        interp.heap.unpin(func_ref);
        let closure_ref = interp
            .heap
            .allocate(ObjKind::Closure(ClosureObj { function: closure_function(interp, func_ref), upvalues: vec![] }), &mut |_| {})
            .unwrap();
        interp.heap.unpin(closure_ref);
        let routine = Routine::new(closure_ref, interp.config.max_call_frames);
        interp.run(&routine, None).unwrap()
    }

    fn closure_function(interp: &Interpreter, r: ObjRef) -> Arc<Function> {
        match interp.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::Function(f)) => f.clone(),
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn arithmetic_adds_two_immediates() {
        let mut interp = interp();
        let mut b = ChunkBuilder::new("script", 0);
        emit_i32(&mut b, 2, 1);
        emit_i32(&mut b, 3, 1);
        b.emit(OpCode::Add, 1);
        b.emit(OpCode::Pop, 1);
        b.emit(OpCode::Nil, 1);
        b.emit(OpCode::Return, 1);
        let outcome = run_function(&mut interp, b.finish());
        assert!(matches!(outcome, StepOutcome::Returned(Value::Nil)));
    }

    #[test]
    fn jump_if_false_skips_the_then_branch() {
        let mut interp = interp();
        let mut b = ChunkBuilder::new("script", 0);
        b.emit(OpCode::False, 1);
        let patch = b.emit_jump(OpCode::JumpIfFalse, 1);
        b.emit(OpCode::Pop, 1);
        b.emit(OpCode::True, 1);
        b.patch_jump(patch);
        b.emit(OpCode::Pop, 1);
        b.emit(OpCode::Nil, 1);
        b.emit(OpCode::Return, 1);
        let outcome = run_function(&mut interp, b.finish());
        assert!(matches!(outcome, StepOutcome::Returned(Value::Nil)));
    }

    #[test]
    fn division_by_zero_errors_the_routine_not_the_vm() {
        let mut interp = interp();
        let mut b = ChunkBuilder::new("script", 0);
        emit_i32(&mut b, 1, 1);
        emit_i32(&mut b, 0, 1);
        b.emit(OpCode::Divide, 1);
        b.emit(OpCode::Pop, 1);
        b.emit(OpCode::Nil, 1);
        b.emit(OpCode::Return, 1);
        let outcome = run_function(&mut interp, b.finish());
        assert!(matches!(outcome, StepOutcome::Errored(_)));
    }

    #[test]
    fn a_global_can_be_defined_and_read_back() {
        let mut interp = interp();
        let routine_dummy = Routine::new(ObjRef(0), 8);
        let name_ref = interp.intern_string("counter", &routine_dummy).unwrap();

        let mut b = ChunkBuilder::new("script", 0);
        emit_i32(&mut b, 42, 1);
        let idx = b.constant(Value::Obj(name_ref));
        b.emit(OpCode::DefineGlobal, 1);
        b.emit_u16(idx, 1);
        b.emit(OpCode::GetGlobal, 1);
        b.emit_u16(idx, 1);
        b.emit(OpCode::Pop, 1);
        b.emit(OpCode::Nil, 1);
        b.emit(OpCode::Return, 1);
        let outcome = run_function(&mut interp, b.finish());
        assert!(matches!(outcome, StepOutcome::Returned(Value::Nil)));
        assert_eq!(interp.globals.get("counter"), Some(&Value::Int32(42)));
    }
}
