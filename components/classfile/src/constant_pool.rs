//! The typed constant pool.
//!
//! Entries are decoded into a tagged enum in one pass. Index 0 is
//! unusable by definition, and the second slot of `long`/`double`
//! entries is filled with [`Constant::Unusable`] so indices stay
//! aligned with the class-file numbering.

use crate::Reader;
use core_types::{Name, Names, VmError, VmResult};

/// Constant pool entry tags, as they appear in class bytes.
pub(crate) mod tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELD_REF: u8 = 9;
    pub const METHOD_REF: u8 = 10;
    pub const INTERFACE_METHOD_REF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const INVOKE_DYNAMIC: u8 = 18;
}

/// One decoded constant pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Slot 0 and the trailing slot of 8-byte constants.
    Unusable,
    /// Modified-UTF8 text, interned.
    Utf8(Name),
    /// 32-bit integer constant.
    Integer(i32),
    /// 32-bit float constant.
    Float(f32),
    /// 64-bit integer constant (occupies two slots).
    Long(i64),
    /// 64-bit float constant (occupies two slots).
    Double(f64),
    /// Class reference; the index names a `Utf8` entry.
    Class(u16),
    /// String literal; the index names a `Utf8` entry.
    String(u16),
    /// Field reference: class index and name-and-type index.
    FieldRef {
        /// Index of the owning `Class` entry.
        class: u16,
        /// Index of the `NameAndType` entry.
        name_and_type: u16,
    },
    /// Method reference: class index and name-and-type index.
    MethodRef {
        /// Index of the owning `Class` entry.
        class: u16,
        /// Index of the `NameAndType` entry.
        name_and_type: u16,
    },
    /// Interface method reference.
    InterfaceMethodRef {
        /// Index of the owning `Class` entry.
        class: u16,
        /// Index of the `NameAndType` entry.
        name_and_type: u16,
    },
    /// Name and descriptor pair.
    NameAndType {
        /// Index of the name `Utf8` entry.
        name: u16,
        /// Index of the descriptor `Utf8` entry.
        descriptor: u16,
    },
    /// Method handle (parsed, rejected at use sites).
    MethodHandle {
        /// Reference kind.
        kind: u8,
        /// Reference index.
        index: u16,
    },
    /// Method type (parsed, rejected at use sites).
    MethodType(u16),
    /// Invoke-dynamic call site (parsed, rejected at use sites).
    InvokeDynamic {
        /// Bootstrap method attribute index.
        bootstrap: u16,
        /// Index of the `NameAndType` entry.
        name_and_type: u16,
    },
}

/// A decoded constant pool with typed accessors.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    class: Name,
    entries: Vec<Constant>,
}

impl ConstantPool {
    /// Decodes the pool from `reader`; `count` is the declared entry
    /// count (one more than the highest valid index).
    pub fn parse(names: &Names, class: &Name, reader: &mut Reader<'_>) -> VmResult<ConstantPool> {
        let count = reader.u2()? as usize;
        if count < 1 {
            return Err(VmError::format(class.as_str(), "zero-sized constant pool"));
        }
        let mut entries = Vec::with_capacity(count);
        entries.push(Constant::Unusable);
        while entries.len() < count {
            let tag = reader.u1()?;
            let entry = match tag {
                tag::UTF8 => {
                    let len = reader.u2()? as usize;
                    let bytes = reader.bytes(len)?;
                    let text = std::str::from_utf8(bytes).map_err(|_| {
                        VmError::format(class.as_str(), "malformed UTF8 constant")
                    })?;
                    Constant::Utf8(names.get(text))
                }
                tag::INTEGER => Constant::Integer(reader.s4()?),
                tag::FLOAT => Constant::Float(f32::from_bits(reader.u4()?)),
                tag::LONG => {
                    let hi = reader.u4()? as u64;
                    let lo = reader.u4()? as u64;
                    Constant::Long(((hi << 32) | lo) as i64)
                }
                tag::DOUBLE => {
                    let hi = reader.u4()? as u64;
                    let lo = reader.u4()? as u64;
                    Constant::Double(f64::from_bits((hi << 32) | lo))
                }
                tag::CLASS => Constant::Class(reader.u2()?),
                tag::STRING => Constant::String(reader.u2()?),
                tag::FIELD_REF => Constant::FieldRef {
                    class: reader.u2()?,
                    name_and_type: reader.u2()?,
                },
                tag::METHOD_REF => Constant::MethodRef {
                    class: reader.u2()?,
                    name_and_type: reader.u2()?,
                },
                tag::INTERFACE_METHOD_REF => Constant::InterfaceMethodRef {
                    class: reader.u2()?,
                    name_and_type: reader.u2()?,
                },
                tag::NAME_AND_TYPE => Constant::NameAndType {
                    name: reader.u2()?,
                    descriptor: reader.u2()?,
                },
                tag::METHOD_HANDLE => Constant::MethodHandle {
                    kind: reader.u1()?,
                    index: reader.u2()?,
                },
                tag::METHOD_TYPE => Constant::MethodType(reader.u2()?),
                tag::INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap: reader.u2()?,
                    name_and_type: reader.u2()?,
                },
                other => {
                    return Err(VmError::format(
                        class.as_str(),
                        format!("wrong constant pool entry type: {}", other),
                    ))
                }
            };
            let wide = matches!(entry, Constant::Long(_) | Constant::Double(_));
            entries.push(entry);
            if wide {
                entries.push(Constant::Unusable);
            }
        }
        if entries.len() != count {
            return Err(VmError::format(
                class.as_str(),
                "8-byte constant overruns the constant pool",
            ));
        }
        Ok(ConstantPool {
            class: class.clone(),
            entries,
        })
    }

    /// Number of slots, including slot 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool holds only the unusable slot 0.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// The entry at `idx`, bounds-checked.
    pub fn entry(&self, idx: u16) -> VmResult<&Constant> {
        self.entries
            .get(idx as usize)
            .ok_or_else(|| self.bad_index(idx, "out of range"))
    }

    fn bad_index(&self, idx: u16, what: &str) -> VmError {
        VmError::format(
            self.class.as_str(),
            format!("wrong constant pool index {}: {}", idx, what),
        )
    }

    /// The `Utf8` entry at `idx`.
    pub fn utf8_at(&self, idx: u16) -> VmResult<&Name> {
        match self.entry(idx)? {
            Constant::Utf8(name) => Ok(name),
            _ => Err(self.bad_index(idx, "expected Utf8")),
        }
    }

    /// The name of the `Class` entry at `idx`.
    pub fn class_name_at(&self, idx: u16) -> VmResult<&Name> {
        match self.entry(idx)? {
            Constant::Class(utf8) => self.utf8_at(*utf8),
            _ => Err(self.bad_index(idx, "expected Class")),
        }
    }

    /// The `Integer` entry at `idx`.
    pub fn integer_at(&self, idx: u16) -> VmResult<i32> {
        match self.entry(idx)? {
            Constant::Integer(v) => Ok(*v),
            _ => Err(self.bad_index(idx, "expected Integer")),
        }
    }

    /// The `Float` entry at `idx`.
    pub fn float_at(&self, idx: u16) -> VmResult<f32> {
        match self.entry(idx)? {
            Constant::Float(v) => Ok(*v),
            _ => Err(self.bad_index(idx, "expected Float")),
        }
    }

    /// The `Long` entry at `idx`.
    pub fn long_at(&self, idx: u16) -> VmResult<i64> {
        match self.entry(idx)? {
            Constant::Long(v) => Ok(*v),
            _ => Err(self.bad_index(idx, "expected Long")),
        }
    }

    /// The `Double` entry at `idx`.
    pub fn double_at(&self, idx: u16) -> VmResult<f64> {
        match self.entry(idx)? {
            Constant::Double(v) => Ok(*v),
            _ => Err(self.bad_index(idx, "expected Double")),
        }
    }

    /// The text of the `String` entry at `idx`.
    pub fn string_at(&self, idx: u16) -> VmResult<&Name> {
        match self.entry(idx)? {
            Constant::String(utf8) => self.utf8_at(*utf8),
            _ => Err(self.bad_index(idx, "expected String")),
        }
    }

    /// The (name, descriptor) pair of the `NameAndType` entry at `idx`.
    pub fn name_and_type_at(&self, idx: u16) -> VmResult<(&Name, &Name)> {
        match self.entry(idx)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8_at(*name)?, self.utf8_at(*descriptor)?))
            }
            _ => Err(self.bad_index(idx, "expected NameAndType")),
        }
    }

    /// The (class, member, descriptor) triple behind a field reference.
    pub fn field_ref_at(&self, idx: u16) -> VmResult<(&Name, &Name, &Name)> {
        match self.entry(idx)? {
            Constant::FieldRef {
                class,
                name_and_type,
            } => {
                let class_name = self.class_name_at(*class)?;
                let (name, desc) = self.name_and_type_at(*name_and_type)?;
                Ok((class_name, name, desc))
            }
            _ => Err(self.bad_index(idx, "expected Fieldref")),
        }
    }

    /// The (class, member, descriptor) triple behind a method or
    /// interface-method reference.
    pub fn method_ref_at(&self, idx: u16) -> VmResult<(&Name, &Name, &Name)> {
        match self.entry(idx)? {
            Constant::MethodRef {
                class,
                name_and_type,
            }
            | Constant::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                let class_name = self.class_name_at(*class)?;
                let (name, desc) = self.name_and_type_at(*name_and_type)?;
                Ok((class_name, name, desc))
            }
            _ => Err(self.bad_index(idx, "expected Methodref")),
        }
    }
}
