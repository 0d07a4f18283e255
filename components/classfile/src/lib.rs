//! Class-file decoding for the JVM execution engine.
//!
//! This crate turns raw class bytes (obtained by an external byte
//! source) into a structured, validated form:
//!
//! - [`Reader`] - bounds-checked cursor over class bytes
//! - [`ConstantPool`] / [`Constant`] - the typed constant pool
//! - [`RawClassFile`] - header, fields, methods, attributes
//! - [`CodeAttribute`] - per-method bytecode and exception table
//! - [`AccessFlags`] - class and member access flags
//!
//! Decoding stops at structure: resolving names to live types, laying
//! out fields and building dispatch tables belong to `type_system`.
//! Any structural violation is a [`core_types::VmError::ClassFormat`].

#![warn(clippy::all)]

mod attributes;
mod class_file;
mod constant_pool;
mod flags;
mod reader;

pub use attributes::{Attribute, Attributes, CodeAttribute, RawExceptionEntry};
pub use class_file::{RawClassFile, RawMember, MAGIC};
pub use constant_pool::{Constant, ConstantPool};
pub use flags::AccessFlags;
pub use reader::Reader;
