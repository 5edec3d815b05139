//! Concrete type descriptors (`YargType` in spec.md §3) and the packed
//! storage layout rules they drive.

use std::fmt;
use std::sync::Arc;

/// Byte width of a boxed `Value` inside an `Any`-typed packed slot: one
/// tag byte plus the widest primitive payload (`Double`/`Int64`/
/// `Uint64`/`Address`, all 8 bytes). See [`crate::packed::store_any`]/
/// [`crate::packed::load_any`] for the encoding (spec.md §3: "`Any`-
/// typed slots hold a full boxed `Value`").
pub const ANY_SLOT_SIZE: usize = 9;

/// A field within a [`TypeDesc::Struct`], packed left-to-right with no
/// padding beyond the natural alignment of its own primitive width.
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub ty: Arc<TypeDesc>,
    /// Byte offset from the struct's base, computed at construction.
    pub offset: usize,
}

/// A concrete type descriptor. Every packed slot, every `Instance`
/// field, and every typed cell is interpreted through one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDesc {
    Any,
    Bool,
    Double,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    BigInt,
    String,
    Class,
    Instance,
    Function,
    Blob,
    Routine,
    Channel,
    Array {
        element: Arc<TypeDesc>,
        cardinality: usize,
    },
    Struct {
        fields: Vec<StructField>,
        size: usize,
    },
    Pointer {
        target: Arc<TypeDesc>,
    },
    /// The type of a type value itself (`TYPE_LITERAL`/`TYPE_MODIFIER`
    /// push these as ordinary first-class values).
    YargType,
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Any => write!(f, "any"),
            TypeDesc::Bool => write!(f, "bool"),
            TypeDesc::Double => write!(f, "double"),
            TypeDesc::Int8 => write!(f, "int8"),
            TypeDesc::Uint8 => write!(f, "uint8"),
            TypeDesc::Int16 => write!(f, "int16"),
            TypeDesc::Uint16 => write!(f, "uint16"),
            TypeDesc::Int32 => write!(f, "int32"),
            TypeDesc::Uint32 => write!(f, "uint32"),
            TypeDesc::Int64 => write!(f, "int64"),
            TypeDesc::Uint64 => write!(f, "uint64"),
            TypeDesc::BigInt => write!(f, "bigint"),
            TypeDesc::String => write!(f, "string"),
            TypeDesc::Class => write!(f, "class"),
            TypeDesc::Instance => write!(f, "instance"),
            TypeDesc::Function => write!(f, "function"),
            TypeDesc::Blob => write!(f, "blob"),
            TypeDesc::Routine => write!(f, "routine"),
            TypeDesc::Channel => write!(f, "channel"),
            TypeDesc::Array { element, cardinality } => write!(f, "[{cardinality}]{element}"),
            TypeDesc::Struct { .. } => write!(f, "struct"),
            TypeDesc::Pointer { target } => write!(f, "*{target}"),
            TypeDesc::YargType => write!(f, "type"),
        }
    }
}

impl TypeDesc {
    /// Natural storage width in bytes for primitive (non-aggregate,
    /// non-`Any`) types; used to compute struct field offsets and array
    /// element strides.
    pub fn packed_size(&self) -> usize {
        match self {
            TypeDesc::Any => ANY_SLOT_SIZE,
            TypeDesc::Bool | TypeDesc::Int8 | TypeDesc::Uint8 => 1,
            TypeDesc::Int16 | TypeDesc::Uint16 => 2,
            TypeDesc::Int32 | TypeDesc::Uint32 => 4,
            TypeDesc::Double | TypeDesc::Int64 | TypeDesc::Uint64 => 8,
            TypeDesc::Pointer { .. } => std::mem::size_of::<usize>(),
            TypeDesc::Array { element, cardinality } => element.packed_size() * cardinality,
            TypeDesc::Struct { size, .. } => *size,
            // Object-kind slots (String/Class/Instance/Function/Blob/
            // Routine/Channel) hold a raw object handle.
            _ => std::mem::size_of::<usize>(),
        }
    }

    /// Whether a slot of this type holds a heap object handle rather
    /// than an inline primitive (spec.md §3's packed-storage rules).
    pub fn is_object_kind(&self) -> bool {
        matches!(
            self,
            TypeDesc::String
                | TypeDesc::Class
                | TypeDesc::Instance
                | TypeDesc::Function
                | TypeDesc::Blob
                | TypeDesc::Routine
                | TypeDesc::Channel
                | TypeDesc::BigInt
                | TypeDesc::Array { .. }
                | TypeDesc::Struct { .. }
                | TypeDesc::Pointer { .. }
                | TypeDesc::YargType
        )
    }

    /// Decodes `TYPE_LITERAL`'s one-byte primitive tag into the
    /// `TypeDesc` it names. Aggregate shapes (`Array`/`Struct`/
    /// `Pointer`) are never literal tags — those are built up by
    /// `TYPE_ARRAY`/`TYPE_STRUCT`/`TYPE_MODIFIER` from values already on
    /// the stack.
    pub fn from_tag(tag: u8) -> Option<TypeDesc> {
        Some(match tag {
            0 => TypeDesc::Any,
            1 => TypeDesc::Bool,
            2 => TypeDesc::Double,
            3 => TypeDesc::Int8,
            4 => TypeDesc::Uint8,
            5 => TypeDesc::Int16,
            6 => TypeDesc::Uint16,
            7 => TypeDesc::Int32,
            8 => TypeDesc::Uint32,
            9 => TypeDesc::Int64,
            10 => TypeDesc::Uint64,
            11 => TypeDesc::BigInt,
            12 => TypeDesc::String,
            13 => TypeDesc::Class,
            14 => TypeDesc::Instance,
            15 => TypeDesc::Function,
            16 => TypeDesc::Blob,
            17 => TypeDesc::Routine,
            18 => TypeDesc::Channel,
            19 => TypeDesc::YargType,
            _ => return None,
        })
    }

    /// Builds a `Struct` type, computing each field's offset
    /// left-to-right (spec.md §3: "packed left-to-right, no padding
    /// contract beyond natural alignment of the widest field").
    pub fn new_struct(mut fields: Vec<(String, Arc<TypeDesc>)>) -> TypeDesc {
        let mut offset = 0usize;
        let mut built = Vec::with_capacity(fields.len());
        for (name, ty) in fields.drain(..) {
            let size = ty.packed_size();
            built.push(StructField { name, ty, offset });
            offset += size;
        }
        TypeDesc::Struct {
            fields: built,
            size: offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_offsets_are_packed_left_to_right() {
        let ty = TypeDesc::new_struct(vec![
            ("a".to_string(), Arc::new(TypeDesc::Int8)),
            ("b".to_string(), Arc::new(TypeDesc::Int32)),
            ("c".to_string(), Arc::new(TypeDesc::Double)),
        ]);
        match ty {
            TypeDesc::Struct { fields, size } => {
                assert_eq!(fields[0].offset, 0);
                assert_eq!(fields[1].offset, 1);
                assert_eq!(fields[2].offset, 5);
                assert_eq!(size, 13);
            }
            _ => panic!("expected struct"),
        }
    }

    #[test]
    fn from_tag_decodes_known_primitive_tags() {
        assert_eq!(TypeDesc::from_tag(7), Some(TypeDesc::Int32));
        assert_eq!(TypeDesc::from_tag(255), None);
    }

    #[test]
    fn array_size_multiplies_element_by_cardinality() {
        let arr = TypeDesc::Array {
            element: Arc::new(TypeDesc::Int32),
            cardinality: 4,
        };
        assert_eq!(arr.packed_size(), 16);
    }
}
