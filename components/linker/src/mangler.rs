//! Symbol name mangling.
//!
//! Produces collision-free, flat identifiers for (class, member,
//! signature) triples. Escapes follow the native-interface convention:
//! `_1` for `_`, `_2` for `;`, `_3` for `[`, `_0xxxx` for characters
//! outside ASCII, `/` becomes `_`, and the structural characters
//! `< > ( )` vanish. Because every literal underscore is escaped, the
//! unescaped `_` and `__` separators can never be forged by a name,
//! which is what makes the encoding injective.

use core_types::{MethodDesc, TypeDesc};
use std::fmt::Write;

/// Prefix of engine-internal patch-target symbols.
pub const ENGINE_PREFIX: &str = "vm_";
/// Prefix of native-bridge lookup symbols.
pub const NATIVE_PREFIX: &str = "Java_";

/// Incremental symbol builder.
pub struct Mangler {
    buf: String,
}

impl Mangler {
    /// Creates an empty mangler.
    pub fn new() -> Mangler {
        Mangler { buf: String::new() }
    }

    /// Appends a raw, pre-mangled fragment.
    pub fn raw(&mut self, text: &str) -> &mut Self {
        self.buf.push_str(text);
        self
    }

    /// Appends a class or member name with full escaping.
    pub fn name(&mut self, name: &str) -> &mut Self {
        for c in name.chars() {
            match c {
                '<' | '>' | '(' | ')' => {}
                '_' => self.buf.push_str("_1"),
                ';' => self.buf.push_str("_2"),
                '[' => self.buf.push_str("_3"),
                '/' => self.buf.push('_'),
                c if (c as u32) < 0x80 => self.buf.push(c),
                c => {
                    let _ = write!(self.buf, "_0{:04x}", c as u32 & 0xffff);
                }
            }
        }
        self
    }

    /// Appends one type in its native spelling: the primitive id
    /// letter, `L<escaped>_2` for classes, `_3<component>` for arrays.
    pub fn type_name(&mut self, desc: &TypeDesc) -> &mut Self {
        match desc {
            TypeDesc::Primitive(kind) => {
                self.buf.push(kind.id());
            }
            TypeDesc::Object(name) => {
                self.buf.push('L');
                self.name(name.as_str());
                self.buf.push_str("_2");
            }
            TypeDesc::Array(component) => {
                self.buf.push_str("_3");
                self.type_name(component);
            }
        }
        self
    }

    /// Appends the `__<params>` overload suffix.
    pub fn type_suffix(&mut self, desc: &MethodDesc) -> &mut Self {
        if !desc.params.is_empty() {
            self.buf.push_str("__");
            for param in &desc.params {
                self.type_name(param);
            }
        }
        self
    }

    /// The finished symbol.
    pub fn finish(self) -> String {
        self.buf
    }
}

impl Default for Mangler {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine-internal symbol of a method, used as the stable name of
/// its patch target.
pub fn method_symbol(class_name: &str, member: &str, desc: &MethodDesc) -> String {
    let mut m = Mangler::new();
    m.raw(ENGINE_PREFIX)
        .name(class_name)
        .raw("_")
        .name(member)
        .type_suffix(desc);
    m.finish()
}

/// The short native-bridge symbol (no overload suffix).
pub fn native_symbol_short(class_name: &str, member: &str) -> String {
    let mut m = Mangler::new();
    m.raw(NATIVE_PREFIX).name(class_name).raw("_").name(member);
    m.finish()
}

/// The long native-bridge symbol, with the argument-type suffix that
/// disambiguates overloads.
pub fn native_symbol_long(class_name: &str, member: &str, desc: &MethodDesc) -> String {
    let mut m = Mangler::new();
    m.raw(NATIVE_PREFIX)
        .name(class_name)
        .raw("_")
        .name(member)
        .type_suffix(desc);
    m.finish()
}
