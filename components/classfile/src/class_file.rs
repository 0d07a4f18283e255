//! The decoded class-file structure.

use crate::{AccessFlags, Attributes, ConstantPool, Reader};
use core_types::{Name, Names, VmError, VmResult};
use tracing::debug;

/// Class-file magic number.
pub const MAGIC: u32 = 0xCAFE_BABE;

/// One declared field or method, still unresolved.
#[derive(Debug, Clone)]
pub struct RawMember {
    /// Access flags.
    pub access: AccessFlags,
    /// Member name.
    pub name: Name,
    /// Field or method descriptor.
    pub descriptor: Name,
    /// The member's attribute table.
    pub attributes: Attributes,
}

/// A structurally-decoded class file.
///
/// Names are interned and the constant pool is typed, but nothing is
/// resolved against other classes; that is the type system's job.
#[derive(Debug, Clone)]
pub struct RawClassFile {
    /// Minor format version.
    pub minor_version: u16,
    /// Major format version.
    pub major_version: u16,
    /// The constant pool.
    pub pool: ConstantPool,
    /// Class access flags.
    pub access: AccessFlags,
    /// Binary name of this class, from `this_class`.
    pub this_class: Name,
    /// Binary name of the super class; `None` only for the root class.
    pub super_class: Option<Name>,
    /// Binary names of directly implemented interfaces.
    pub interfaces: Vec<Name>,
    /// Declared fields.
    pub fields: Vec<RawMember>,
    /// Declared methods.
    pub methods: Vec<RawMember>,
    /// Class-level attributes.
    pub attributes: Attributes,
}

impl RawClassFile {
    /// Decodes `bytes` as a class file.
    ///
    /// `expected_name` is the name under which the bytes were requested;
    /// it contextualizes errors and is checked against `this_class`.
    pub fn parse(names: &Names, expected_name: &Name, bytes: &[u8]) -> VmResult<RawClassFile> {
        Self::parse_inner(names, expected_name, bytes).map_err(|e| match e {
            VmError::ClassFormat { class, reason } if class.is_empty() => VmError::ClassFormat {
                class: expected_name.as_str().to_string(),
                reason,
            },
            other => other,
        })
    }

    fn parse_inner(names: &Names, expected_name: &Name, bytes: &[u8]) -> VmResult<RawClassFile> {
        let mut reader = Reader::new(bytes);

        let magic = reader.u4()?;
        if magic != MAGIC {
            return Err(VmError::format(expected_name.as_str(), "bad magic"));
        }
        let minor_version = reader.u2()?;
        let major_version = reader.u2()?;

        let pool = ConstantPool::parse(names, expected_name, &mut reader)?;

        let access = AccessFlags::from_raw(reader.u2()?);

        let this_class = pool.class_name_at(reader.u2()?)?.clone();
        if this_class != *expected_name {
            return Err(VmError::format(
                expected_name.as_str(),
                format!("wrong class file (describes class {})", this_class),
            ));
        }

        let super_idx = reader.u2()?;
        let super_class = if super_idx == 0 {
            None
        } else {
            Some(pool.class_name_at(super_idx)?.clone())
        };

        let interface_count = reader.u2()? as usize;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interfaces.push(pool.class_name_at(reader.u2()?)?.clone());
        }

        let fields = Self::parse_members(&pool, &mut reader)?;
        let methods = Self::parse_members(&pool, &mut reader)?;
        let attributes = Attributes::parse(&pool, &mut reader)?;

        debug!(
            class = %this_class,
            fields = fields.len(),
            methods = methods.len(),
            "decoded class file"
        );

        Ok(RawClassFile {
            minor_version,
            major_version,
            pool,
            access,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    fn parse_members(pool: &ConstantPool, reader: &mut Reader<'_>) -> VmResult<Vec<RawMember>> {
        let count = reader.u2()? as usize;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let access = AccessFlags::from_raw(reader.u2()?);
            let name = pool.utf8_at(reader.u2()?)?.clone();
            let descriptor = pool.utf8_at(reader.u2()?)?.clone();
            let attributes = Attributes::parse(pool, reader)?;
            members.push(RawMember {
                access,
                name,
                descriptor,
                attributes,
            });
        }
        Ok(members)
    }
}
