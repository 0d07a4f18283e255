//! The engine error taxonomy.
//!
//! Four families of failure exist (format, linkage, monitor-state and
//! internal faults); all are carried by one enum so every fallible
//! operation can propagate with `?`. Format and linkage errors are
//! fatal to the triggering class-load or resolve and are never retried.

use thiserror::Error;

/// Any error raised by the execution engine core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmError {
    /// Malformed class bytes, bad constant-pool index, inconsistent
    /// flag redeclaration and similar structural violations.
    #[error("class format error in {class}: {reason}")]
    ClassFormat {
        /// Binary name of the offending class.
        class: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A class requested by name could not be produced by the byte source.
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// A class referenced during resolution is missing.
    #[error("no class definition found: {0}")]
    NoClassDef(String),

    /// A referenced method does not exist in the target class hierarchy.
    #[error("no such method: {class}::{name}{descriptor}")]
    NoSuchMethod {
        /// Class searched.
        class: String,
        /// Method name.
        name: String,
        /// Method descriptor.
        descriptor: String,
    },

    /// A referenced field does not exist in the target class.
    #[error("no such field: {class}::{name}")]
    NoSuchField {
        /// Class searched.
        class: String,
        /// Field name.
        name: String,
    },

    /// A native method could not be bound to a symbol.
    #[error("linkage error: {0}")]
    Linkage(String),

    /// wait/notify/unlock attempted by a thread that does not own the lock.
    #[error("thread does not own the monitor")]
    IllegalMonitorState,

    /// An engine invariant was violated; distinct from user-level errors.
    #[error("internal engine fault: {0}")]
    Internal(String),
}

impl VmError {
    /// Convenience constructor for [`VmError::ClassFormat`].
    pub fn format(class: impl Into<String>, reason: impl Into<String>) -> Self {
        VmError::ClassFormat {
            class: class.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`VmError::Internal`].
    pub fn internal(reason: impl Into<String>) -> Self {
        VmError::Internal(reason.into())
    }
}

/// Result alias used across all engine components.
pub type VmResult<T> = Result<T, VmError>;
