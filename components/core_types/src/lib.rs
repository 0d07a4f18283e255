//! Core types shared by every component of the JVM execution engine.
//!
//! This crate provides the foundational, dependency-free types:
//!
//! - [`Name`] / [`Names`] - interned class, member and descriptor names
//! - [`TypeDesc`] / [`MethodDesc`] - parsed field and method descriptors
//! - [`ValueKind`] - the five storage kinds of typed operand slots
//! - [`EntryPoint`] - opaque handle to a compiled method entry
//! - [`VmError`] / [`VmResult`] - the engine error taxonomy
//!
//! # Examples
//!
//! ```
//! use core_types::{Names, TypeDesc, ValueKind};
//!
//! let names = Names::new();
//! let desc = TypeDesc::parse(&names, "[Ljava/lang/String;").unwrap();
//! assert_eq!(desc.value_kind(), ValueKind::Reference);
//! assert_eq!(desc.dimensions(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod descriptor;
mod error;
mod name;
mod value;

pub use descriptor::{MethodDesc, PrimitiveKind, TypeDesc};
pub use error::{VmError, VmResult};
pub use name::{Name, Names};
pub use value::{EntryPoint, ValueKind};
