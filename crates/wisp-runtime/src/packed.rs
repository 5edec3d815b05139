//! Packed storage load/store rules (spec.md §4.2): typed containers
//! distinct from boxed `Value`s, whose slots hold raw primitive bytes
//! rather than a tagged union, and the assignment-compatibility check
//! that gates every store into one.

use crate::error::RuntimeError;
use crate::object::ObjRef;
use crate::types::{TypeDesc, ANY_SLOT_SIZE};
use crate::value::Value;

/// One-byte discriminants for the boxed-`Value` encoding used by
/// [`store_any`]/[`load_any`].
mod any_tag {
    pub const NIL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const DOUBLE: u8 = 2;
    pub const INT8: u8 = 3;
    pub const UINT8: u8 = 4;
    pub const INT16: u8 = 5;
    pub const UINT16: u8 = 6;
    pub const INT32: u8 = 7;
    pub const UINT32: u8 = 8;
    pub const INT64: u8 = 9;
    pub const UINT64: u8 = 10;
    pub const ADDRESS: u8 = 11;
    pub const OBJ: u8 = 12;
}

/// Encodes an arbitrary `Value` into an `Any`-typed packed slot
/// (spec.md §3/§4.2: "`Any`-typed slots hold a full boxed `Value`").
/// Unlike [`store_primitive`], every variant — including `Nil` — is
/// accepted unconditionally; `Any` has no "nil only at init" rule.
pub fn store_any(bytes: &mut [u8], offset: usize, value: &Value) {
    let slot = &mut bytes[offset..offset + ANY_SLOT_SIZE];
    slot.fill(0);
    match value {
        Value::Nil => slot[0] = any_tag::NIL,
        Value::Bool(b) => {
            slot[0] = any_tag::BOOL;
            slot[1] = *b as u8;
        }
        Value::Double(v) => {
            slot[0] = any_tag::DOUBLE;
            slot[1..9].copy_from_slice(&v.to_le_bytes());
        }
        Value::Int8(v) => {
            slot[0] = any_tag::INT8;
            slot[1] = *v as u8;
        }
        Value::Uint8(v) => {
            slot[0] = any_tag::UINT8;
            slot[1] = *v;
        }
        Value::Int16(v) => {
            slot[0] = any_tag::INT16;
            slot[1..3].copy_from_slice(&v.to_le_bytes());
        }
        Value::Uint16(v) => {
            slot[0] = any_tag::UINT16;
            slot[1..3].copy_from_slice(&v.to_le_bytes());
        }
        Value::Int32(v) => {
            slot[0] = any_tag::INT32;
            slot[1..5].copy_from_slice(&v.to_le_bytes());
        }
        Value::Uint32(v) => {
            slot[0] = any_tag::UINT32;
            slot[1..5].copy_from_slice(&v.to_le_bytes());
        }
        Value::Int64(v) => {
            slot[0] = any_tag::INT64;
            slot[1..9].copy_from_slice(&v.to_le_bytes());
        }
        Value::Uint64(v) => {
            slot[0] = any_tag::UINT64;
            slot[1..9].copy_from_slice(&v.to_le_bytes());
        }
        Value::Address(v) => {
            slot[0] = any_tag::ADDRESS;
            slot[1..9].copy_from_slice(&(*v as u64).to_le_bytes());
        }
        Value::Obj(r) => {
            slot[0] = any_tag::OBJ;
            slot[1..5].copy_from_slice(&r.0.to_le_bytes());
        }
    }
}

/// Decodes a `Value` previously written by [`store_any`].
pub fn load_any(bytes: &[u8], offset: usize) -> Value {
    let slot = &bytes[offset..offset + ANY_SLOT_SIZE];
    match slot[0] {
        any_tag::BOOL => Value::Bool(slot[1] != 0),
        any_tag::DOUBLE => Value::Double(f64::from_le_bytes(slot[1..9].try_into().unwrap())),
        any_tag::INT8 => Value::Int8(slot[1] as i8),
        any_tag::UINT8 => Value::Uint8(slot[1]),
        any_tag::INT16 => Value::Int16(i16::from_le_bytes(slot[1..3].try_into().unwrap())),
        any_tag::UINT16 => Value::Uint16(u16::from_le_bytes(slot[1..3].try_into().unwrap())),
        any_tag::INT32 => Value::Int32(i32::from_le_bytes(slot[1..5].try_into().unwrap())),
        any_tag::UINT32 => Value::Uint32(u32::from_le_bytes(slot[1..5].try_into().unwrap())),
        any_tag::INT64 => Value::Int64(i64::from_le_bytes(slot[1..9].try_into().unwrap())),
        any_tag::UINT64 => Value::Uint64(u64::from_le_bytes(slot[1..9].try_into().unwrap())),
        any_tag::ADDRESS => Value::Address(u64::from_le_bytes(slot[1..9].try_into().unwrap()) as usize),
        any_tag::OBJ => Value::Obj(ObjRef(u32::from_le_bytes(slot[1..5].try_into().unwrap()))),
        _ => Value::Nil,
    }
}

/// Whether a value of type `from` may be stored into a slot declared
/// `into`, per spec.md §4.2's assignment rule: exact type match, or
/// `Any`, admit anything; `nil` is admitted only at initialization
/// (construction of a fresh packed container), never on a later
/// assignment into an already-initialized slot.
pub fn is_compatible_type(into: &TypeDesc, from: &TypeDesc) -> bool {
    if matches!(into, TypeDesc::Any) {
        return true;
    }
    match (into, from) {
        (TypeDesc::Array { element: e1, cardinality: c1 }, TypeDesc::Array { element: e2, cardinality: c2 }) => {
            c1 == c2 && is_compatible_type(e1, e2)
        }
        (TypeDesc::Pointer { target: t1 }, TypeDesc::Pointer { target: t2 }) => is_compatible_type(t1, t2),
        (TypeDesc::Struct { fields: f1, .. }, TypeDesc::Struct { fields: f2, .. }) => {
            f1.len() == f2.len()
                && f1
                    .iter()
                    .zip(f2.iter())
                    .all(|(a, b)| a.name == b.name && is_compatible_type(&a.ty, &b.ty))
        }
        _ => into == from,
    }
}

/// Encodes one primitive `Value` into its packed-storage byte
/// representation at `offset` within `bytes`, enforcing the slot's
/// declared type. `allow_nil_init` is set only when filling a freshly
/// allocated container (spec.md §4.2: "nil admits at initialization,
/// never at assignment").
pub fn store_primitive(
    bytes: &mut [u8],
    offset: usize,
    ty: &TypeDesc,
    value: &Value,
    allow_nil_init: bool,
) -> Result<(), RuntimeError> {
    if matches!(ty, TypeDesc::Any) {
        store_any(bytes, offset, value);
        return Ok(());
    }
    if matches!(value, Value::Nil) {
        if allow_nil_init {
            bytes[offset..offset + ty.packed_size()].fill(0);
            return Ok(());
        }
        return Err(RuntimeError::new(0, "cannot assign nil to an initialized packed slot"));
    }
    macro_rules! put {
        ($t:ty, $v:expr) => {{
            let le = ($v as $t).to_le_bytes();
            bytes[offset..offset + le.len()].copy_from_slice(&le);
        }};
    }
    match (ty, value) {
        (TypeDesc::Bool, Value::Bool(b)) => bytes[offset] = *b as u8,
        (TypeDesc::Int8, Value::Int8(v)) => put!(i8, *v),
        (TypeDesc::Uint8, Value::Uint8(v)) => put!(u8, *v),
        (TypeDesc::Int16, Value::Int16(v)) => put!(i16, *v),
        (TypeDesc::Uint16, Value::Uint16(v)) => put!(u16, *v),
        (TypeDesc::Int32, Value::Int32(v)) => put!(i32, *v),
        (TypeDesc::Uint32, Value::Uint32(v)) => put!(u32, *v),
        (TypeDesc::Int64, Value::Int64(v)) => put!(i64, *v),
        (TypeDesc::Uint64, Value::Uint64(v)) => put!(u64, *v),
        (TypeDesc::Double, Value::Double(v)) => put!(f64, *v),
        (t, Value::Obj(r)) if t.is_object_kind() => put!(u64, r.0),
        _ => {
            return Err(RuntimeError::new(
                0,
                format!("cannot store a {} into a {} slot", value.type_name(), ty),
            ))
        }
    }
    Ok(())
}

/// Computes the byte offset and element type of `index` within an
/// array-typed packed container, bounds-checking against its
/// cardinality (spec.md §4.4's `ELEMENT`/`SET_ELEMENT`: "index bounds
/// are checked; out-of-range fails with a runtime error citing the
/// bound").
pub fn element_offset(ty: &TypeDesc, index: i64) -> Result<(usize, TypeDesc), RuntimeError> {
    match ty {
        TypeDesc::Array { element, cardinality } => {
            if index < 0 || index as usize >= *cardinality {
                return Err(RuntimeError::new(
                    0,
                    format!("array index {index} out of bounds (cardinality {cardinality})"),
                ));
            }
            let stride = element.packed_size();
            Ok((index as usize * stride, (**element).clone()))
        }
        _ => Err(RuntimeError::new(0, format!("cannot index a {ty} value"))),
    }
}

/// Decodes a primitive `Value` out of a packed-storage slot.
pub fn load_primitive(bytes: &[u8], offset: usize, ty: &TypeDesc) -> Value {
    macro_rules! get {
        ($t:ty, $n:expr) => {{
            let mut buf = [0u8; $n];
            buf.copy_from_slice(&bytes[offset..offset + $n]);
            <$t>::from_le_bytes(buf)
        }};
    }
    match ty {
        TypeDesc::Any => load_any(bytes, offset),
        TypeDesc::Bool => Value::Bool(bytes[offset] != 0),
        TypeDesc::Int8 => Value::Int8(get!(i8, 1)),
        TypeDesc::Uint8 => Value::Uint8(get!(u8, 1)),
        TypeDesc::Int16 => Value::Int16(get!(i16, 2)),
        TypeDesc::Uint16 => Value::Uint16(get!(u16, 2)),
        TypeDesc::Int32 => Value::Int32(get!(i32, 4)),
        TypeDesc::Uint32 => Value::Uint32(get!(u32, 4)),
        TypeDesc::Int64 => Value::Int64(get!(i64, 8)),
        TypeDesc::Uint64 => Value::Uint64(get!(u64, 8)),
        TypeDesc::Double => Value::Double(get!(f64, 8)),
        t if t.is_object_kind() => Value::Obj(ObjRef(get!(u64, 8) as u32)),
        _ => Value::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn primitive_round_trips() {
        let mut bytes = [0u8; 4];
        store_primitive(&mut bytes, 0, &TypeDesc::Int32, &Value::Int32(-7), false).unwrap();
        assert_eq!(load_primitive(&bytes, 0, &TypeDesc::Int32), Value::Int32(-7));
    }

    #[test]
    fn nil_rejected_on_assignment_but_allowed_on_init() {
        let mut bytes = [0u8; 4];
        assert!(store_primitive(&mut bytes, 0, &TypeDesc::Int32, &Value::Nil, false).is_err());
        assert!(store_primitive(&mut bytes, 0, &TypeDesc::Int32, &Value::Nil, true).is_ok());
    }

    #[test]
    fn any_slot_accepts_everything() {
        assert!(is_compatible_type(&TypeDesc::Any, &TypeDesc::Int8));
        assert!(is_compatible_type(&TypeDesc::Any, &TypeDesc::Struct { fields: vec![], size: 0 }));
    }

    #[test]
    fn any_slot_round_trips_both_primitives_and_object_handles() {
        let mut bytes = [0u8; ANY_SLOT_SIZE];
        store_primitive(&mut bytes, 0, &TypeDesc::Any, &Value::Int32(-9), true).unwrap();
        assert_eq!(load_primitive(&bytes, 0, &TypeDesc::Any), Value::Int32(-9));

        store_primitive(&mut bytes, 0, &TypeDesc::Any, &Value::Obj(ObjRef(7)), true).unwrap();
        assert_eq!(load_primitive(&bytes, 0, &TypeDesc::Any), Value::Obj(ObjRef(7)));

        store_primitive(&mut bytes, 0, &TypeDesc::Any, &Value::Nil, false).unwrap();
        assert_eq!(load_primitive(&bytes, 0, &TypeDesc::Any), Value::Nil);
    }

    #[test]
    fn array_compatibility_requires_matching_cardinality_and_element() {
        let a = TypeDesc::Array { element: Arc::new(TypeDesc::Int32), cardinality: 4 };
        let b = TypeDesc::Array { element: Arc::new(TypeDesc::Int32), cardinality: 3 };
        assert!(!is_compatible_type(&a, &b));
        let c = TypeDesc::Array { element: Arc::new(TypeDesc::Int32), cardinality: 4 };
        assert!(is_compatible_type(&a, &c));
    }
}
