//! Per-object locking for the JVM execution engine.
//!
//! Every object carries a 64-bit header word that multiplexes three
//! lock states:
//!
//! - **Unlocked** - identity hash bits and an age counter
//! - **StackLocked** - a thin lock: owner thread tag and recursion count
//! - **Inflated** - an index into the heavyweight [`Monitor`] pool
//!
//! Uncontended acquisition is a single compare-and-swap on the header.
//! Contention, recursion overflow, and any `wait`/`notify` use promote
//! the lock to a pooled monitor; the promoting thread installs the
//! monitor with the current owner's state so the owner's eventual
//! release goes down the monitor path transparently.
//!
//! The [`LockSystem`] owns the monitor pool and the identity-hash
//! source; one instance lives in the VM context.

#![warn(clippy::all)]
#![deny(unsafe_code)]

mod header;
mod monitor;
mod pool;
mod system;
mod thread_tag;

pub use header::{LockWord, MAX_THIN_COUNT};
pub use monitor::Monitor;
pub use pool::MonitorPool;
pub use system::LockSystem;
pub use thread_tag::{current_thread_tag, ThreadTag};
