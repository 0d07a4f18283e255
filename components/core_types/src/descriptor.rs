//! Field and method descriptor parsing.
//!
//! Descriptors use the standard class-file grammar: primitive type
//! identifiers (`I`, `J`, ...), `L<binary name>;` for classes and a
//! `[` prefix per array dimension. A method descriptor is
//! `(<params>)<return>`.

use crate::{Name, Names, ValueKind, VmError, VmResult};
use std::fmt;

/// The primitive types, including `void` for method returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// `Z`
    Boolean,
    /// `B`
    Byte,
    /// `C`
    Char,
    /// `S`
    Short,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `F`
    Float,
    /// `D`
    Double,
    /// `V` - only valid as a method return
    Void,
}

impl PrimitiveKind {
    /// The descriptor identifier character.
    pub fn id(self) -> char {
        match self {
            PrimitiveKind::Boolean => 'Z',
            PrimitiveKind::Byte => 'B',
            PrimitiveKind::Char => 'C',
            PrimitiveKind::Short => 'S',
            PrimitiveKind::Int => 'I',
            PrimitiveKind::Long => 'J',
            PrimitiveKind::Float => 'F',
            PrimitiveKind::Double => 'D',
            PrimitiveKind::Void => 'V',
        }
    }

    /// Parses a descriptor identifier character.
    pub fn from_id(id: char) -> Option<Self> {
        Some(match id {
            'Z' => PrimitiveKind::Boolean,
            'B' => PrimitiveKind::Byte,
            'C' => PrimitiveKind::Char,
            'S' => PrimitiveKind::Short,
            'I' => PrimitiveKind::Int,
            'J' => PrimitiveKind::Long,
            'F' => PrimitiveKind::Float,
            'D' => PrimitiveKind::Double,
            'V' => PrimitiveKind::Void,
            _ => return None,
        })
    }

    /// log2 of the storage size in bytes. `void` has no storage.
    pub fn log_size(self) -> u32 {
        match self {
            PrimitiveKind::Boolean | PrimitiveKind::Byte => 0,
            PrimitiveKind::Char | PrimitiveKind::Short => 1,
            PrimitiveKind::Int | PrimitiveKind::Float => 2,
            PrimitiveKind::Long | PrimitiveKind::Double => 3,
            PrimitiveKind::Void => 0,
        }
    }

    /// Storage kind on the operand stack, or `None` for `void`.
    pub fn value_kind(self) -> Option<ValueKind> {
        Some(match self {
            PrimitiveKind::Boolean
            | PrimitiveKind::Byte
            | PrimitiveKind::Char
            | PrimitiveKind::Short
            | PrimitiveKind::Int => ValueKind::Int,
            PrimitiveKind::Long => ValueKind::Long,
            PrimitiveKind::Float => ValueKind::Float,
            PrimitiveKind::Double => ValueKind::Double,
            PrimitiveKind::Void => return None,
        })
    }
}

/// A parsed field or parameter type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    /// A primitive type.
    Primitive(PrimitiveKind),
    /// A class or interface type, by binary name.
    Object(Name),
    /// An array type with the given component.
    Array(Box<TypeDesc>),
}

impl TypeDesc {
    /// Parses a full descriptor; the whole string must be consumed.
    pub fn parse(names: &Names, descriptor: &str) -> VmResult<TypeDesc> {
        let bytes = descriptor.as_bytes();
        let (desc, end) = Self::parse_prefix(names, bytes, 0, descriptor)?;
        if end != bytes.len() {
            return Err(bad_descriptor(descriptor));
        }
        Ok(desc)
    }

    /// Parses one descriptor starting at `pos`, returning it and the
    /// first unconsumed position.
    fn parse_prefix(
        names: &Names,
        bytes: &[u8],
        start: usize,
        whole: &str,
    ) -> VmResult<(TypeDesc, usize)> {
        let mut pos = start;
        let mut dims = 0usize;
        while pos < bytes.len() && bytes[pos] == b'[' {
            dims += 1;
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(bad_descriptor(whole));
        }
        let mut desc = match bytes[pos] {
            b'L' => {
                let name_start = pos + 1;
                let mut end = name_start;
                while end < bytes.len() && bytes[end] != b';' {
                    end += 1;
                }
                if end >= bytes.len() || end == name_start {
                    return Err(bad_descriptor(whole));
                }
                pos = end + 1;
                TypeDesc::Object(names.get(&whole[name_start..end]))
            }
            c => {
                let kind = PrimitiveKind::from_id(c as char).ok_or_else(|| bad_descriptor(whole))?;
                if kind == PrimitiveKind::Void && dims > 0 {
                    return Err(bad_descriptor(whole));
                }
                pos += 1;
                TypeDesc::Primitive(kind)
            }
        };
        for _ in 0..dims {
            desc = TypeDesc::Array(Box::new(desc));
        }
        Ok((desc, pos))
    }

    /// Storage kind on the operand stack; `None` only for `void`.
    pub fn value_kind_opt(&self) -> Option<ValueKind> {
        match self {
            TypeDesc::Primitive(p) => p.value_kind(),
            TypeDesc::Object(_) | TypeDesc::Array(_) => Some(ValueKind::Reference),
        }
    }

    /// Storage kind on the operand stack. Panics on `void`, which never
    /// names a value.
    pub fn value_kind(&self) -> ValueKind {
        self.value_kind_opt().expect("void has no value kind")
    }

    /// log2 of the field storage size in bytes (references are 8).
    pub fn log_size(&self) -> u32 {
        match self {
            TypeDesc::Primitive(p) => p.log_size(),
            TypeDesc::Object(_) | TypeDesc::Array(_) => 3,
        }
    }

    /// Array dimension count (zero for non-arrays).
    pub fn dimensions(&self) -> usize {
        match self {
            TypeDesc::Array(inner) => 1 + inner.dimensions(),
            _ => 0,
        }
    }

    /// Whether this descriptor names `void`.
    pub fn is_void(&self) -> bool {
        matches!(self, TypeDesc::Primitive(PrimitiveKind::Void))
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Primitive(p) => write!(f, "{}", p.id()),
            TypeDesc::Object(name) => write!(f, "L{};", name),
            TypeDesc::Array(inner) => write!(f, "[{}", inner),
        }
    }
}

/// A parsed method descriptor: parameter types and return type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDesc {
    /// Parameter types, in declaration order. Does not include the
    /// implicit receiver of instance methods.
    pub params: Vec<TypeDesc>,
    /// Return type; may be `void`.
    pub ret: TypeDesc,
}

impl MethodDesc {
    /// Parses a `(<params>)<return>` descriptor.
    pub fn parse(names: &Names, descriptor: &str) -> VmResult<MethodDesc> {
        let bytes = descriptor.as_bytes();
        if bytes.first() != Some(&b'(') {
            return Err(bad_descriptor(descriptor));
        }
        let mut pos = 1;
        let mut params = Vec::new();
        while pos < bytes.len() && bytes[pos] != b')' {
            let (desc, next) = TypeDesc::parse_prefix(names, bytes, pos, descriptor)?;
            if desc.is_void() {
                return Err(bad_descriptor(descriptor));
            }
            params.push(desc);
            pos = next;
        }
        if pos >= bytes.len() {
            return Err(bad_descriptor(descriptor));
        }
        pos += 1; // ')'
        let (ret, end) = TypeDesc::parse_prefix(names, bytes, pos, descriptor)?;
        if end != bytes.len() {
            return Err(bad_descriptor(descriptor));
        }
        Ok(MethodDesc { params, ret })
    }

    /// Number of local-variable slots consumed by the parameters,
    /// counting wide kinds twice, excluding any receiver.
    pub fn param_slots(&self) -> usize {
        self.params
            .iter()
            .map(|p| if p.value_kind().is_wide() { 2 } else { 1 })
            .sum()
    }
}

impl fmt::Display for MethodDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for p in &self.params {
            write!(f, "{}", p)?;
        }
        write!(f, "){}", self.ret)
    }
}

fn bad_descriptor(descriptor: &str) -> VmError {
    VmError::ClassFormat {
        class: String::new(),
        reason: format!("malformed descriptor: {}", descriptor),
    }
}
