//! The object header lock word.
//!
//! The word is an explicit tagged encoding rather than a pointer with
//! stolen low bits, so every transition is a decode, a pure state
//! change, and a compare-and-swap of the re-encoded word.
//!
//! Layout (low to high):
//!
//! - bits 0..2   - state tag
//! - `Unlocked`:    bits 2..6 age, bits 34..64 identity hash
//! - `StackLocked`: bits 2..22 owner tag, bits 22..34 recursion count,
//!   bits 34..64 identity hash (displaced hash rides along)
//! - `Inflated`:    bits 2..34 monitor index

use crate::ThreadTag;

const TAG_MASK: u64 = 0b11;
const TAG_UNLOCKED: u64 = 0;
const TAG_STACK_LOCKED: u64 = 1;
const TAG_INFLATED: u64 = 2;

const OWNER_SHIFT: u32 = 2;
const OWNER_MASK: u64 = (1 << 20) - 1;
const COUNT_SHIFT: u32 = 22;
const COUNT_MASK: u64 = (1 << 12) - 1;
const AGE_SHIFT: u32 = 2;
const AGE_MASK: u64 = (1 << 4) - 1;
const HASH_SHIFT: u32 = 34;
const HASH_MASK: u64 = (1 << 30) - 1;
const MONITOR_SHIFT: u32 = 2;
const MONITOR_MASK: u64 = u32::MAX as u64;

/// Highest recursion count a stack lock can hold before the lock is
/// promoted to a monitor.
pub const MAX_THIN_COUNT: u32 = COUNT_MASK as u32;

/// Decoded view of an object header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWord {
    /// No lock held. `hash` is 0 until lazily assigned.
    Unlocked {
        /// Identity hash bits, 0 if not yet assigned.
        hash: u32,
        /// Object age (free for a collector; carried, never interpreted).
        age: u8,
    },
    /// Thin lock held by `owner` with `count` recursive acquisitions.
    StackLocked {
        /// Owning thread tag.
        owner: ThreadTag,
        /// Recursion count, at least 1.
        count: u32,
        /// Displaced identity hash bits.
        hash: u32,
    },
    /// Heavyweight lock; the payload indexes the monitor pool.
    Inflated {
        /// Monitor pool index.
        monitor: u32,
    },
}

impl LockWord {
    /// The word a freshly allocated object carries.
    pub fn new() -> LockWord {
        LockWord::Unlocked { hash: 0, age: 0 }
    }

    /// Decodes a raw header word.
    pub fn decode(raw: u64) -> LockWord {
        match raw & TAG_MASK {
            TAG_UNLOCKED => LockWord::Unlocked {
                hash: ((raw >> HASH_SHIFT) & HASH_MASK) as u32,
                age: ((raw >> AGE_SHIFT) & AGE_MASK) as u8,
            },
            TAG_STACK_LOCKED => LockWord::StackLocked {
                owner: ThreadTag(((raw >> OWNER_SHIFT) & OWNER_MASK) as u32),
                count: ((raw >> COUNT_SHIFT) & COUNT_MASK) as u32,
                hash: ((raw >> HASH_SHIFT) & HASH_MASK) as u32,
            },
            TAG_INFLATED => LockWord::Inflated {
                monitor: ((raw >> MONITOR_SHIFT) & MONITOR_MASK) as u32,
            },
            _ => LockWord::Unlocked { hash: 0, age: 0 },
        }
    }

    /// Encodes the word for storage in an object header.
    pub fn encode(self) -> u64 {
        match self {
            LockWord::Unlocked { hash, age } => {
                TAG_UNLOCKED
                    | ((age as u64 & AGE_MASK) << AGE_SHIFT)
                    | ((hash as u64 & HASH_MASK) << HASH_SHIFT)
            }
            LockWord::StackLocked { owner, count, hash } => {
                debug_assert!(count >= 1 && count <= MAX_THIN_COUNT);
                TAG_STACK_LOCKED
                    | ((owner.0 as u64 & OWNER_MASK) << OWNER_SHIFT)
                    | ((count as u64 & COUNT_MASK) << COUNT_SHIFT)
                    | ((hash as u64 & HASH_MASK) << HASH_SHIFT)
            }
            LockWord::Inflated { monitor } => {
                TAG_INFLATED | ((monitor as u64 & MONITOR_MASK) << MONITOR_SHIFT)
            }
        }
    }

    /// The identity hash carried by this word, if any is visible here.
    /// Inflated words keep the hash in the monitor's displaced header.
    pub fn hash(self) -> Option<u32> {
        match self {
            LockWord::Unlocked { hash, .. } | LockWord::StackLocked { hash, .. } => {
                (hash != 0).then_some(hash)
            }
            LockWord::Inflated { .. } => None,
        }
    }
}

impl Default for LockWord {
    fn default() -> Self {
        Self::new()
    }
}
