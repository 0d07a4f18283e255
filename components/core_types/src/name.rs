//! Interned names for classes, members and descriptors.
//!
//! Every name that enters the engine is interned once, so name equality
//! is cheap and the same spelling is never stored twice.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

/// An interned, immutable name.
///
/// Names compare by content; cloning is a reference-count bump.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(Arc<str>);

impl Name {
    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the name in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the name is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", &self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The name intern table.
///
/// One instance lives in the VM context; loaders and the translator
/// share it. Interning is guarded by a single mutex, which is only hit
/// on first sight of a spelling.
pub struct Names {
    pool: Mutex<HashSet<Arc<str>>>,
}

impl Names {
    /// Creates an empty intern table.
    pub fn new() -> Self {
        Names {
            pool: Mutex::new(HashSet::new()),
        }
    }

    /// Interns `spelling`, returning the canonical [`Name`].
    pub fn get(&self, spelling: &str) -> Name {
        let mut pool = self.pool.lock().expect("name pool poisoned");
        if let Some(existing) = pool.get(spelling) {
            return Name(existing.clone());
        }
        let arc: Arc<str> = Arc::from(spelling);
        pool.insert(arc.clone());
        Name(arc)
    }

    /// Number of distinct names interned so far.
    pub fn len(&self) -> usize {
        self.pool.lock().expect("name pool poisoned").len()
    }

    /// Whether no name has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Names {
    fn default() -> Self {
        Self::new()
    }
}
