//! Class and member access flags.

use bitflags::bitflags;

bitflags! {
    /// Access and property flags of classes, fields and methods.
    ///
    /// Some bits are context-dependent in the class-file format
    /// (`SYNCHRONIZED` on methods is `SUPER` on classes, `VOLATILE` on
    /// fields is `BRIDGE` on methods); callers use the accessor that
    /// matches their context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u16 {
        /// Declared public.
        const PUBLIC = 0x0001;
        /// Declared private.
        const PRIVATE = 0x0002;
        /// Declared protected.
        const PROTECTED = 0x0004;
        /// Declared static.
        const STATIC = 0x0008;
        /// Declared final.
        const FINAL = 0x0010;
        /// Method: declared synchronized. Class: `super` semantics.
        const SYNCHRONIZED = 0x0020;
        /// Field: declared volatile. Method: bridge.
        const VOLATILE = 0x0040;
        /// Field: declared transient. Method: varargs.
        const TRANSIENT = 0x0080;
        /// Method implemented in native code.
        const NATIVE = 0x0100;
        /// The class is an interface.
        const INTERFACE = 0x0200;
        /// Declared abstract.
        const ABSTRACT = 0x0400;
        /// Method: strict floating point.
        const STRICT = 0x0800;
        /// Compiler-generated.
        const SYNTHETIC = 0x1000;
        /// The class is an annotation type.
        const ANNOTATION = 0x2000;
        /// The class or field is an enum.
        const ENUM = 0x4000;
    }
}

impl AccessFlags {
    /// Parses a raw flag word, keeping unknown bits dropped.
    pub fn from_raw(raw: u16) -> Self {
        AccessFlags::from_bits_truncate(raw)
    }

    /// Whether the member is static.
    pub fn is_static(self) -> bool {
        self.contains(AccessFlags::STATIC)
    }

    /// Whether the class is an interface.
    pub fn is_interface(self) -> bool {
        self.contains(AccessFlags::INTERFACE)
    }

    /// Whether the class or method is abstract.
    pub fn is_abstract(self) -> bool {
        self.contains(AccessFlags::ABSTRACT)
    }

    /// Whether the method is native.
    pub fn is_native(self) -> bool {
        self.contains(AccessFlags::NATIVE)
    }

    /// Whether the method is synchronized.
    pub fn is_synchronized(self) -> bool {
        self.contains(AccessFlags::SYNCHRONIZED)
    }
}
