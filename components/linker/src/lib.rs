//! Lazy binding: trampolines, call-site patching and name mangling.
//!
//! The [`Linker`] is the resolver behind every unresolved dispatch
//! cell. Calls reach an unresolved target through a [`Trampoline`];
//! the resolver looks the target up (static, virtual or interface),
//! drives it through the translator and the code backend, patches the
//! cell in place, and returns the compiled entry. The [`mangler`]
//! produces the stable symbol names used for patch targets and for
//! native-method lookup through the [`NativeBridge`].

#![warn(clippy::all)]

pub mod mangler;

mod linker;
mod trampoline;

pub use linker::{Linker, NativeBridge};
pub use trampoline::{Trampoline, TrampolineKind};
