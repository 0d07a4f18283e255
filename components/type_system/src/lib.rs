//! Type registry, resolution lifecycle and dispatch engine.
//!
//! This crate owns the runtime type model of the execution engine:
//!
//! - [`Type`] with its variants [`Class`], [`ArrayClass`] and
//!   [`Primitive`], each driven through `LOADED -> RESOLVED -> INITED`
//! - [`ClassLoader`] - the per-loader registry of defined types
//! - [`VirtualTable`] - dispatch slots, the display-based subtype
//!   checker and the interface method table
//! - [`Object`] / [`ObjRef`] / [`Storage`] - heap objects over the
//!   locking subsystem
//! - [`Vm`] - the process-wide context object everything hangs off
//!
//! The code backend and the lazy-binding resolver are collaborators
//! behind the [`MethodCompiler`] trait; class bytes come from a
//! [`ClassBytesSource`].

#![warn(clippy::all)]

mod class;
mod loader;
mod method;
mod object;
mod options;
mod ty;
mod vm;
mod vtable;

pub use class::{Class, FieldRef};
pub use loader::ClassLoader;
pub use method::{Field, Layout, Method};
pub use object::{JavaValue, ObjRef, Object, Storage};
pub use options::VmOptions;
pub use ty::{ArrayClass, Primitive, ResolutionStatus, Type};
pub use vm::{ClassBytesSource, MethodCompiler, Vm};
pub use vtable::{InterfaceSlot, TypeChecker, VirtualTable, CACHE_OFFSET, DISPLAY_LENGTH};
