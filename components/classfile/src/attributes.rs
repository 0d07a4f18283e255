//! Attribute tables and the Code attribute.

use crate::{ConstantPool, Reader};
use core_types::{Name, VmError, VmResult};

/// One attribute: its name and owned payload bytes.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Interned attribute name (`Code`, `ConstantValue`, ...).
    pub name: Name,
    /// Raw payload, excluding the 6-byte attribute header.
    pub data: Vec<u8>,
}

/// An attribute table, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    entries: Vec<Attribute>,
}

impl Attributes {
    /// Decodes an attribute table.
    pub fn parse(pool: &ConstantPool, reader: &mut Reader<'_>) -> VmResult<Attributes> {
        let count = reader.u2()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let name = pool.utf8_at(reader.u2()?)?.clone();
            let len = reader.u4()? as usize;
            let data = reader.bytes(len)?.to_vec();
            entries.push(Attribute { name, data });
        }
        Ok(Attributes { entries })
    }

    /// Finds the first attribute with the given name.
    pub fn lookup(&self, name: &str) -> Option<&Attribute> {
        self.entries.iter().find(|a| a.name.as_str() == name)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One row of a method's exception table, still in PC terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExceptionEntry {
    /// First covered bytecode offset.
    pub start_pc: u16,
    /// First offset past the covered range.
    pub end_pc: u16,
    /// Handler entry offset.
    pub handler_pc: u16,
    /// Constant-pool index of the caught class, or 0 for catch-all.
    pub catch_type: u16,
}

/// A decoded `Code` attribute.
#[derive(Debug, Clone)]
pub struct CodeAttribute {
    /// Declared operand-stack depth bound.
    pub max_stack: u16,
    /// Declared local-variable slot count.
    pub max_locals: u16,
    /// The raw bytecode stream.
    pub code: Vec<u8>,
    /// Exception table rows, in declaration (priority) order.
    pub exception_table: Vec<RawExceptionEntry>,
    /// Nested attributes (line tables and the like; kept, unused).
    pub attributes: Attributes,
}

impl CodeAttribute {
    /// Decodes a `Code` attribute payload.
    pub fn parse(pool: &ConstantPool, class: &Name, data: &[u8]) -> VmResult<CodeAttribute> {
        let mut reader = Reader::new(data);
        let max_stack = reader.u2()?;
        let max_locals = reader.u2()?;
        let code_length = reader.u4()? as usize;
        if code_length == 0 {
            return Err(VmError::format(class.as_str(), "empty Code attribute"));
        }
        let code = reader.bytes(code_length)?.to_vec();
        let entry_count = reader.u2()? as usize;
        let mut exception_table = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let entry = RawExceptionEntry {
                start_pc: reader.u2()?,
                end_pc: reader.u2()?,
                handler_pc: reader.u2()?,
                catch_type: reader.u2()?,
            };
            if entry.start_pc >= entry.end_pc || entry.end_pc as usize > code_length {
                return Err(VmError::format(
                    class.as_str(),
                    "exception table range out of order",
                ));
            }
            exception_table.push(entry);
        }
        let attributes = Attributes::parse(pool, &mut reader)?;
        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }
}
