//! Typed storage kinds and compiled-code entry handles.

use std::num::NonZeroU64;

/// The five storage kinds a typed operand slot can hold.
///
/// Every value flowing through translated code is one of these; the
/// sub-int types (boolean, byte, char, short) are widened to `Int` on
/// the operand stack, exactly as the class-file model prescribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// 32-bit integer (also booleans, bytes, chars, shorts).
    Int,
    /// 64-bit integer.
    Long,
    /// 32-bit IEEE float.
    Float,
    /// 64-bit IEEE double.
    Double,
    /// Object or array reference.
    Reference,
}

impl ValueKind {
    /// Whether the kind occupies two local-variable slots.
    pub fn is_wide(self) -> bool {
        matches!(self, ValueKind::Long | ValueKind::Double)
    }
}

/// Opaque handle to a callable entry produced by the code backend.
///
/// The zero bit pattern is reserved to mean "not yet compiled", which
/// lets dispatch slots store raw `u64`s and patch them with a single
/// compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint(NonZeroU64);

impl EntryPoint {
    /// Wraps a backend-issued token; `0` is not a valid entry.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(EntryPoint)
    }

    /// The raw token, suitable for storing in an atomic dispatch slot.
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}
