//! Installs the table [`crate::interpreter::BUILTIN_NAMES`] names
//! (spec.md §4.5/§4.6/§6): channels, sync-groups, routine start/resume/
//! pin, the numeric/string type-coercion words, and the peripheral IRQ
//! registration pair. `GET_BUILTIN` indexes this same-order table by a
//! one-byte tag; nothing here is reachable by name lookup.
//!
//! The teacher's own natives (`runtime/src/arithmetic.rs` and siblings)
//! are raw `extern "C" fn(stack: Stack) -> Stack` functions operating on
//! an opaque stack pointer — a calling convention tied to its LLVM
//! codegen target. That shape has no counterpart here: this crate's
//! natives are ordinary Rust closures over [`crate::value::Value`] and
//! the owning [`crate::interpreter::Interpreter`] (see `object.rs`'s
//! `NativeFn`). The registration style below is consequently a fresh
//! design in the teacher's idiom rather than a port — see DESIGN.md.

use std::sync::{Arc, Mutex};

use wisp_core::BigInt;

use crate::channel::Channel;
use crate::error::{FatalVmError, RuntimeError};
use crate::gc::Heap;
use crate::interpreter::{Interpreter, StepOutcome, BUILTIN_NAMES};
use crate::object::{NativeFn, NativeObj, ObjKind, ObjRef};
use crate::packed;
use crate::routine::Routine;
use crate::syncgroup::{self, SyncGroupInner};
use crate::types::TypeDesc;
use crate::value::Value;

/// Base address (and per-slot stride) of the synthetic interrupt
/// trampoline pool `pin` hands out addresses from. Not a real function
/// pointer — on a hosted target there is nothing for it to point at —
/// just a stable, distinct value per pinned slot that `irq_add_shared_
/// handler` can be given back (spec.md §6: "a distinct function-pointer
/// ... the returned value is that trampoline address").
const TRAMPOLINE_BASE: usize = 0x2000_0000;
const TRAMPOLINE_STRIDE: usize = 0x10;

fn native(name: &'static str, f: impl Fn(&mut Interpreter, &Routine, &[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static) -> NativeObj {
    NativeObj {
        name: name.to_string(),
        arity: 0,
        func: Arc::new(f) as NativeFn,
    }
}

/// Allocates one `ObjKind::Native` per [`BUILTIN_NAMES`] entry, in
/// order, and returns their `ObjRef`s for [`Interpreter::new`] to store
/// as `Interpreter::builtins`.
pub fn install(heap: &mut Heap) -> Result<Vec<ObjRef>, FatalVmError> {
    let entries: Vec<NativeObj> = vec![
        native("make_channel", make_channel),
        native("send", send),
        native("receive", receive),
        native("share", share),
        native("peek", peek),
        native("cpeek", cpeek),
        native("make_routine", make_routine),
        native("start", start),
        native("resume", resume),
        native("pin", pin),
        native("make_sync_group", make_sync_group),
        native("int8", |i, _r, a| coerce_int(i, a, "int8", IntWidth::I8)),
        native("uint8", |i, _r, a| coerce_int(i, a, "uint8", IntWidth::U8)),
        native("int16", |i, _r, a| coerce_int(i, a, "int16", IntWidth::I16)),
        native("uint16", |i, _r, a| coerce_int(i, a, "uint16", IntWidth::U16)),
        native("int32", |i, _r, a| coerce_int(i, a, "int32", IntWidth::I32)),
        native("uint32", |i, _r, a| coerce_int(i, a, "uint32", IntWidth::U32)),
        native("int64", |i, _r, a| coerce_int(i, a, "int64", IntWidth::I64)),
        native("uint64", |i, _r, a| coerce_int(i, a, "uint64", IntWidth::U64)),
        native("int", int_builtin),
        native("mfloat64", mfloat64_builtin),
        native("string", string_builtin),
        native("irq_add_shared_handler", irq_add_shared_handler),
        native("irq_remove_handler", irq_remove_handler),
    ];
    debug_assert_eq!(entries.len(), BUILTIN_NAMES.len());

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let r = heap.allocate(ObjKind::Native(entry), &mut |_| {})?;
        heap.unpin(r);
        out.push(r);
    }
    Ok(out)
}

fn fatal_to_runtime(e: FatalVmError) -> RuntimeError {
    RuntimeError::new(0, e.0)
}

fn expect_obj(v: &Value, who: &str) -> Result<ObjRef, RuntimeError> {
    v.as_obj()
        .ok_or_else(|| RuntimeError::new(0, format!("{who} expects a heap object argument")))
}

fn as_channel(interp: &Interpreter, r: ObjRef) -> Result<Arc<Channel>, RuntimeError> {
    match interp.heap.get(r).map(|o| &o.kind) {
        Some(ObjKind::Channel(c)) => Ok(c.clone()),
        _ => Err(RuntimeError::new(0, "expected a channel")),
    }
}

fn as_routine(interp: &Interpreter, r: ObjRef) -> Result<Routine, RuntimeError> {
    match interp.heap.get(r).map(|o| &o.kind) {
        Some(ObjKind::Routine(inner)) => Ok(Routine { inner: inner.clone() }),
        _ => Err(RuntimeError::new(0, "expected a routine")),
    }
}

fn value_to_usize(v: Value, who: &str) -> Result<usize, RuntimeError> {
    match v {
        Value::Int8(x) if x >= 0 => Ok(x as usize),
        Value::Uint8(x) => Ok(x as usize),
        Value::Int16(x) if x >= 0 => Ok(x as usize),
        Value::Uint16(x) => Ok(x as usize),
        Value::Int32(x) if x >= 0 => Ok(x as usize),
        Value::Uint32(x) => Ok(x as usize),
        Value::Int64(x) if x >= 0 => Ok(x as usize),
        Value::Uint64(x) => Ok(x as usize),
        Value::Address(a) => Ok(a),
        _ => Err(RuntimeError::new(0, format!("{who} expects a non-negative integer"))),
    }
}

// --- Channels and sync-groups (spec.md §4.5) --------------------------

fn make_channel(interp: &mut Interpreter, routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() > 1 {
        return Err(RuntimeError::new(0, "make_channel expects at most one argument"));
    }
    let capacity = match args.first() {
        Some(v) => value_to_usize(*v, "make_channel")?,
        None => interp.config.default_channel_capacity,
    };
    let channel = Arc::new(Channel::new(capacity));
    let r = interp.allocate(ObjKind::Channel(channel), routine).map_err(fatal_to_runtime)?;
    Ok(Value::Obj(r))
}

fn send(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 2 {
        return Err(RuntimeError::new(0, "send expects a channel and a value"));
    }
    let r = expect_obj(&args[0], "send")?;
    as_channel(interp, r)?.send(args[1])?;
    Ok(Value::Nil)
}

fn share(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 2 {
        return Err(RuntimeError::new(0, "share expects a channel and a value"));
    }
    let r = expect_obj(&args[0], "share")?;
    Ok(Value::Bool(as_channel(interp, r)?.share(args[1])))
}

/// `receive` is polymorphic over its single argument (spec.md §9's
/// duck-typed dispatch by object kind, used throughout this interpreter
/// for call/invoke): a `Channel` blocks for one value, a `SyncGroup`
/// blocks for the first member with data and returns one slot per
/// member (`nil` for the ones that didn't produce on that sample), and
/// a `Routine` blocks until it is `Closed` or `Suspended` and returns
/// its latched result — erroring if it is still `Running` (spec.md
/// §4.5).
fn receive(interp: &mut Interpreter, routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::new(0, "receive expects exactly one argument"));
    }
    let r = expect_obj(&args[0], "receive")?;
    let kind = interp
        .heap
        .get(r)
        .map(|o| o.kind.clone())
        .ok_or_else(|| RuntimeError::new(0, "dangling reference"))?;
    match kind {
        ObjKind::Channel(ch) => ch.receive(),
        ObjKind::SyncGroup(sg) => {
            let members: Vec<Arc<Channel>> = {
                let inner = sg.lock().expect("sync group mutex poisoned");
                inner
                    .channels
                    .iter()
                    .map(|cr| as_channel(interp, *cr))
                    .collect::<Result<_, _>>()?
            };
            let sample = syncgroup::receive_group(&members, None)
                .ok_or_else(|| RuntimeError::new(0, "sync group receive timed out"))?;
            pack_sync_result(interp, routine, sample)
        }
        ObjKind::Routine(inner) => {
            let inner = inner.lock().expect("routine mutex poisoned");
            match inner.state {
                crate::routine::RoutineState::Running => {
                    Err(RuntimeError::new(0, "receive expects a routine that is not running"))
                }
                _ => match &inner.result {
                    Some(Ok(v)) => Ok(*v),
                    Some(Err(msg)) => Err(RuntimeError::new(0, msg.clone())),
                    None => Err(RuntimeError::new(0, "routine has not produced a result yet")),
                },
            }
        }
        _ => Err(RuntimeError::new(0, "receive expects a channel, a sync group, or a routine")),
    }
}

/// `peek` is also polymorphic: a channel argument reads its oldest
/// buffered value without removing it (spec.md §4.5), an address
/// argument reads one byte through the peripheral boundary (spec.md
/// §6). `cpeek` below is the channel-only spelling.
fn peek(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::new(0, "peek expects exactly one argument"));
    }
    match args[0] {
        Value::Obj(r) => match interp.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::Channel(ch)) => Ok(ch.peek().unwrap_or(Value::Nil)),
            _ => Err(RuntimeError::new(0, "peek expects a channel or an address")),
        },
        Value::Address(a) => Ok(Value::Uint8(interp.peripheral.peek(a))),
        Value::Uint32(a) => Ok(Value::Uint8(interp.peripheral.peek(a as usize))),
        Value::Uint64(a) => Ok(Value::Uint8(interp.peripheral.peek(a as usize))),
        _ => Err(RuntimeError::new(0, "peek expects a channel or an address")),
    }
}

fn cpeek(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::new(0, "cpeek expects exactly one argument"));
    }
    let r = expect_obj(&args[0], "cpeek")?;
    Ok(as_channel(interp, r)?.peek().unwrap_or(Value::Nil))
}

fn make_sync_group(interp: &mut Interpreter, routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(RuntimeError::new(0, "make_sync_group expects at least one channel"));
    }
    let mut channels = Vec::with_capacity(args.len());
    for v in args {
        let r = expect_obj(v, "make_sync_group")?;
        match interp.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::Channel(_)) => channels.push(r),
            _ => return Err(RuntimeError::new(0, "make_sync_group expects channel arguments")),
        }
    }
    let group = Arc::new(Mutex::new(SyncGroupInner::new(channels)));
    let r = interp.allocate(ObjKind::SyncGroup(group), routine).map_err(fatal_to_runtime)?;
    Ok(Value::Obj(r))
}

/// Packs a sync-group sample into a fresh `[n]any` packed array, one
/// slot per member channel (spec.md §4.5: "returns the companion array
/// of results, nil for the empty channels").
fn pack_sync_result(interp: &mut Interpreter, routine: &Routine, results: Vec<Option<Value>>) -> Result<Value, RuntimeError> {
    let ty = Arc::new(TypeDesc::Array {
        element: Arc::new(TypeDesc::Any),
        cardinality: results.len(),
    });
    let owned_ref = interp.allocate_packed(ty, routine).map_err(fatal_to_runtime)?;
    let stride = TypeDesc::Any.packed_size();
    if let Some(obj) = interp.heap.get_mut(owned_ref) {
        if let ObjKind::PackedOwned(p) = &mut obj.kind {
            for (i, slot) in results.into_iter().enumerate() {
                let v = slot.unwrap_or(Value::Nil);
                packed::store_primitive(&mut p.bytes, i * stride, &TypeDesc::Any, &v, true)?;
            }
        }
    }
    Ok(Value::Obj(owned_ref))
}

// --- Routines (spec.md §4.5/§5) ----------------------------------------

fn make_routine(interp: &mut Interpreter, routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 2 {
        return Err(RuntimeError::new(0, "make_routine expects a closure and an is-ISR flag"));
    }
    let closure_ref = expect_obj(&args[0], "make_routine")?;
    match interp.heap.get(closure_ref).map(|o| &o.kind) {
        Some(ObjKind::Closure(_)) => {}
        _ => return Err(RuntimeError::new(0, "make_routine expects a closure")),
    }
    let is_isr = match args[1] {
        Value::Bool(b) => b,
        _ => return Err(RuntimeError::new(0, "make_routine expects a boolean ISR flag")),
    };
    let new_routine = Routine::new(closure_ref, interp.config.max_call_frames);
    new_routine.inner.lock().expect("routine mutex poisoned").pinned = is_isr;
    let r = interp
        .allocate(ObjKind::Routine(new_routine.inner.clone()), routine)
        .map_err(fatal_to_runtime)?;
    Ok(Value::Obj(r))
}

/// Launches `routine` on the single background worker slot (spec.md
/// §5). The scheduler is not itself multi-threaded here — `Interpreter`
/// owns its heap outright rather than behind a lock (see its module
/// doc) — so `start` claims the worker slot, runs the routine to its
/// next stopping point inline, then releases the slot. This preserves
/// spec.md's "at most one worker routine may run at a time" invariant
/// exactly; see DESIGN.md for why the scheduling is synchronous rather
/// than handed to a real OS thread.
fn start(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::new(0, "start expects a routine and an optional argument"));
    }
    let r = expect_obj(&args[0], "start")?;
    let target = as_routine(interp, r)?;
    let arg = args.get(1).copied();
    interp.scheduler.try_begin_worker()?;
    let outcome = interp.run(&target, arg);
    interp.scheduler.end_worker();
    outcome.map_err(fatal_to_runtime)?;
    Ok(Value::Nil)
}

/// Resumes a suspended (or unbound) routine and blocks until it yields,
/// returns, or errors, handing back that value (spec.md §4.5). An error
/// raised inside the resumed routine surfaces here rather than at the
/// resumed routine's own caller being silently left with no result —
/// the routine-isolation rule (spec.md §5) means the failure doesn't
/// crash the *resuming* routine's own state, only this call reports it.
fn resume(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::new(0, "resume expects a routine and an optional argument"));
    }
    let r = expect_obj(&args[0], "resume")?;
    let target = as_routine(interp, r)?;
    let arg = args.get(1).copied();
    match interp.run(&target, arg).map_err(fatal_to_runtime)? {
        StepOutcome::Returned(v) | StepOutcome::Yielded(v) => Ok(v),
        StepOutcome::Errored(e) => Err(e),
    }
}

/// Binds a zero-arity routine to one of the fixed pool of interrupt
/// trampolines (spec.md §4.5/§6: "up to 10 ... each a distinct
/// function-pointer"), returning that trampoline's address. The irq
/// itself is wired up separately by `irq_add_shared_handler`.
fn pin(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::new(0, "pin expects exactly one argument"));
    }
    let r = expect_obj(&args[0], "pin")?;
    let inner = match interp.heap.get(r).map(|o| &o.kind) {
        Some(ObjKind::Routine(inner)) => inner.clone(),
        _ => return Err(RuntimeError::new(0, "pin expects a routine")),
    };
    let entry_closure = inner.lock().expect("routine mutex poisoned").frames[0].closure;
    let arity = match interp.heap.get(entry_closure).map(|o| &o.kind) {
        Some(ObjKind::Closure(c)) => c.function.arity,
        _ => return Err(RuntimeError::new(0, "pin target has no entry closure")),
    };
    if arity != 0 {
        return Err(RuntimeError::new(0, "pin requires a zero-arity routine"));
    }
    let index = interp.scheduler.pinned_count();
    interp.scheduler.pin_routine(r, 0)?;
    Ok(Value::Address(TRAMPOLINE_BASE + index * TRAMPOLINE_STRIDE))
}

// --- Peripheral IRQ registration (spec.md §6) ---------------------------

fn irq_add_shared_handler(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 3 {
        return Err(RuntimeError::new(
            0,
            "irq_add_shared_handler expects (irq, handler_address, priority)",
        ));
    }
    let irq = value_to_usize(args[0], "irq_add_shared_handler")? as u32;
    let handler = value_to_usize(args[1], "irq_add_shared_handler")? as u32;
    // Priority is accepted for call-site compatibility; the peripheral
    // boundary (spec.md §6) has no notion of interrupt priority for it
    // to forward to.
    let _priority = args[2];
    interp.peripheral.irq_add_shared_handler(irq, handler);
    Ok(Value::Nil)
}

fn irq_remove_handler(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 2 {
        return Err(RuntimeError::new(0, "irq_remove_handler expects (irq, handler_address)"));
    }
    let irq = value_to_usize(args[0], "irq_remove_handler")? as u32;
    let handler = value_to_usize(args[1], "irq_remove_handler")? as u32;
    interp.peripheral.irq_remove_handler(irq, handler);
    Ok(Value::Nil)
}

// --- Type-coercion builtins (spec.md §4.6) ------------------------------
//
// "accept any numeric, integer, big-int, decimal string, or parseable
// float string; out-of-range inputs fail rather than truncate; floats
// truncate toward zero." `wisp_core::BigInt` is the common intermediate:
// every integer-coercion builtin converts its argument to a `BigInt`,
// range-checks against the target width, and only then narrows.

#[derive(Clone, Copy)]
enum IntWidth {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

fn value_to_bigint(interp: &Interpreter, v: Value) -> Result<BigInt, RuntimeError> {
    match v {
        Value::Int8(x) => Ok(BigInt::set_i64(x as i64)),
        Value::Uint8(x) => Ok(BigInt::set_u64(x as u64)),
        Value::Int16(x) => Ok(BigInt::set_i64(x as i64)),
        Value::Uint16(x) => Ok(BigInt::set_u64(x as u64)),
        Value::Int32(x) => Ok(BigInt::set_i64(x as i64)),
        Value::Uint32(x) => Ok(BigInt::set_u64(x as u64)),
        Value::Int64(x) => Ok(BigInt::set_i64(x)),
        Value::Uint64(x) => Ok(BigInt::set_u64(x)),
        Value::Address(a) => Ok(BigInt::set_u64(a as u64)),
        Value::Double(f) => Ok(BigInt::set_i64(f.trunc() as i64)),
        Value::Obj(r) => match interp.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::BigInt(b)) => Ok(*b),
            Some(ObjKind::String(s)) => parse_string_to_bigint(s),
            _ => Err(RuntimeError::new(0, "cannot convert this value to an integer")),
        },
        Value::Bool(_) | Value::Nil => Err(RuntimeError::new(0, "cannot convert this value to an integer")),
    }
}

fn parse_string_to_bigint(s: &str) -> Result<BigInt, RuntimeError> {
    if let Ok(b) = BigInt::set_from_decimal_string(s) {
        return Ok(b);
    }
    match s.parse::<f64>() {
        Ok(f) => Ok(BigInt::set_i64(f.trunc() as i64)),
        Err(_) => Err(RuntimeError::new(0, format!("cannot parse '{s}' as an integer"))),
    }
}

fn value_to_f64(interp: &Interpreter, v: Value) -> Result<f64, RuntimeError> {
    match v {
        Value::Double(f) => Ok(f),
        Value::Int8(x) => Ok(x as f64),
        Value::Uint8(x) => Ok(x as f64),
        Value::Int16(x) => Ok(x as f64),
        Value::Uint16(x) => Ok(x as f64),
        Value::Int32(x) => Ok(x as f64),
        Value::Uint32(x) => Ok(x as f64),
        Value::Int64(x) => Ok(x as f64),
        Value::Uint64(x) => Ok(x as f64),
        Value::Address(a) => Ok(a as f64),
        Value::Obj(r) => match interp.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::BigInt(b)) => Ok(b.to_i64() as f64),
            Some(ObjKind::String(s)) => s
                .parse::<f64>()
                .map_err(|_| RuntimeError::new(0, format!("cannot parse '{s}' as a float"))),
            _ => Err(RuntimeError::new(0, "cannot convert this value to a float")),
        },
        Value::Bool(_) | Value::Nil => Err(RuntimeError::new(0, "cannot convert this value to a float")),
    }
}

fn coerce_int(interp: &mut Interpreter, args: &[Value], name: &str, width: IntWidth) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::new(0, format!("{name} expects exactly one argument")));
    }
    let big = value_to_bigint(interp, args[0])?;
    let (lo, hi) = match width {
        IntWidth::I8 => (BigInt::set_i64(i8::MIN as i64), BigInt::set_i64(i8::MAX as i64)),
        IntWidth::U8 => (BigInt::zero(), BigInt::set_u64(u8::MAX as u64)),
        IntWidth::I16 => (BigInt::set_i64(i16::MIN as i64), BigInt::set_i64(i16::MAX as i64)),
        IntWidth::U16 => (BigInt::zero(), BigInt::set_u64(u16::MAX as u64)),
        IntWidth::I32 => (BigInt::set_i64(i32::MIN as i64), BigInt::set_i64(i32::MAX as i64)),
        IntWidth::U32 => (BigInt::zero(), BigInt::set_u64(u32::MAX as u64)),
        IntWidth::I64 => (BigInt::set_i64(i64::MIN), BigInt::set_i64(i64::MAX)),
        IntWidth::U64 => (BigInt::zero(), BigInt::set_u64(u64::MAX)),
    };
    if !big.in_range(&lo, &hi) {
        return Err(RuntimeError::new(
            0,
            format!("{name}: value {} out of range", big.to_decimal_string()),
        ));
    }
    Ok(match width {
        IntWidth::I8 => Value::Int8(big.to_i64() as i8),
        IntWidth::U8 => Value::Uint8(big.to_u64() as u8),
        IntWidth::I16 => Value::Int16(big.to_i64() as i16),
        IntWidth::U16 => Value::Uint16(big.to_u64() as u16),
        IntWidth::I32 => Value::Int32(big.to_i64() as i32),
        IntWidth::U32 => Value::Uint32(big.to_u64() as u32),
        IntWidth::I64 => Value::Int64(big.to_i64()),
        IntWidth::U64 => Value::Uint64(big.to_u64()),
    })
}

fn int_builtin(interp: &mut Interpreter, routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::new(0, "int expects exactly one argument"));
    }
    let big = value_to_bigint(interp, args[0])?;
    let r = interp.allocate(ObjKind::BigInt(big), routine).map_err(fatal_to_runtime)?;
    Ok(Value::Obj(r))
}

fn mfloat64_builtin(interp: &mut Interpreter, _routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::new(0, "mfloat64 expects exactly one argument"));
    }
    Ok(Value::Double(value_to_f64(interp, args[0])?))
}

fn string_builtin(interp: &mut Interpreter, routine: &Routine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(RuntimeError::new(0, "string expects exactly one argument"));
    }
    let text = match args[0] {
        Value::Obj(r) => match interp.heap.get(r).map(|o| &o.kind) {
            Some(ObjKind::String(s)) => s.clone(),
            Some(ObjKind::BigInt(b)) => b.to_decimal_string(),
            _ => return Err(RuntimeError::new(0, "cannot convert this value to a string")),
        },
        other => other.to_string(),
    };
    let r = interp.intern_string(&text, routine).map_err(fatal_to_runtime)?;
    Ok(Value::Obj(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::peripheral::MockPeripheral;

    fn fresh_interpreter() -> Interpreter {
        Interpreter::new(Arc::new(MockPeripheral::new()), VmConfig::default()).unwrap()
    }

    fn builtin(interp: &Interpreter, name: &str) -> NativeObj {
        let idx = BUILTIN_NAMES.iter().position(|n| *n == name).unwrap();
        match &interp.heap.get(interp.builtins[idx]).unwrap().kind {
            ObjKind::Native(n) => n.clone(),
            _ => panic!("expected native"),
        }
    }

    #[test]
    fn installs_one_native_per_builtin_name() {
        let interp = fresh_interpreter();
        assert_eq!(interp.builtins.len(), BUILTIN_NAMES.len());
        for (idx, name) in BUILTIN_NAMES.iter().enumerate() {
            match &interp.heap.get(interp.builtins[idx]).unwrap().kind {
                ObjKind::Native(n) => assert_eq!(&n.name, name),
                _ => panic!("expected native at builtin slot {idx}"),
            }
        }
    }

    #[test]
    fn channel_send_and_receive_round_trip_through_natives() {
        let mut interp = fresh_interpreter();
        let routine = Routine::new(ObjRef(0), 8);
        let make = builtin(&interp, "make_channel");
        let chan = (make.func)(&mut interp, &routine, &[Value::Uint8(2)]).unwrap();

        let send_fn = builtin(&interp, "send");
        (send_fn.func)(&mut interp, &routine, &[chan, Value::Int32(41)]).unwrap();

        let recv_fn = builtin(&interp, "receive");
        let got = (recv_fn.func)(&mut interp, &routine, &[chan]).unwrap();
        assert_eq!(got, Value::Int32(41));
    }

    #[test]
    fn share_never_blocks_and_reports_overwrite() {
        let mut interp = fresh_interpreter();
        let routine = Routine::new(ObjRef(0), 8);
        let make = builtin(&interp, "make_channel");
        let chan = (make.func)(&mut interp, &routine, &[Value::Uint8(1)]).unwrap();

        let share_fn = builtin(&interp, "share");
        let first = (share_fn.func)(&mut interp, &routine, &[chan, Value::Int32(1)]).unwrap();
        assert_eq!(first, Value::Bool(false));
        let second = (share_fn.func)(&mut interp, &routine, &[chan, Value::Int32(2)]).unwrap();
        assert_eq!(second, Value::Bool(true));
    }

    #[test]
    fn int32_coercion_rejects_out_of_range_values() {
        let mut interp = fresh_interpreter();
        let routine = Routine::new(ObjRef(0), 8);
        let f = builtin(&interp, "int32");
        let ok = (f.func)(&mut interp, &routine, &[Value::Int64(42)]).unwrap();
        assert_eq!(ok, Value::Int32(42));
        let err = (f.func)(&mut interp, &routine, &[Value::Int64(i64::MAX)]);
        assert!(err.is_err());
    }

    #[test]
    fn mfloat64_truncates_are_not_applied_but_ints_widen_cleanly() {
        let mut interp = fresh_interpreter();
        let routine = Routine::new(ObjRef(0), 8);
        let f = builtin(&interp, "mfloat64");
        let v = (f.func)(&mut interp, &routine, &[Value::Int32(7)]).unwrap();
        assert_eq!(v, Value::Double(7.0));
    }

    #[test]
    fn pin_is_rejected_beyond_scheduler_capacity() {
        let mut interp = fresh_interpreter();
        let routine = Routine::new(ObjRef(0), 8);
        let make_routine_fn = builtin(&interp, "make_routine");
        let closure = interp.heap.get(interp.builtins[0]).is_some(); // sanity: heap usable
        assert!(closure);

        // make_routine needs a real Closure object; build a trivial one.
        let function = Arc::new(crate::chunk::Function::new("f", 0));
        let closure_ref = interp
            .allocate(
                ObjKind::Closure(crate::object::ClosureObj {
                    function,
                    upvalues: vec![],
                }),
                &routine,
            )
            .unwrap();

        for _ in 0..interp.config.max_pinned_routines {
            let r = (make_routine_fn.func)(&mut interp, &routine, &[Value::Obj(closure_ref), Value::Bool(true)]).unwrap();
            let pin_fn = builtin(&interp, "pin");
            (pin_fn.func)(&mut interp, &routine, &[r]).unwrap();
        }
        let r = (make_routine_fn.func)(&mut interp, &routine, &[Value::Obj(closure_ref), Value::Bool(true)]).unwrap();
        let pin_fn = builtin(&interp, "pin");
        assert!((pin_fn.func)(&mut interp, &routine, &[r]).is_err());
    }
}
