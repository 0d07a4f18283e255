//! The lock-word state machine.
//!
//! All transitions are compare-and-swaps on the object's header word:
//!
//! ```text
//! Unlocked --CAS--> StackLocked --CAS--> Inflated
//!     ^                 |  (contention, recursion overflow,
//!     |                 |   or wait/notify)
//!     +---- deflate ----+
//! ```
//!
//! Inflation can be performed by a contender while another thread owns
//! the thin lock; the monitor is seeded with the owner's state first,
//! so the owner's release transparently becomes a monitor release.

use crate::header::{LockWord, MAX_THIN_COUNT};
use crate::monitor::Hit;
use crate::thread_tag::{current_thread_tag, ThreadTag};
use crate::MonitorPool;
use core_types::{VmError, VmResult};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Owns the monitor pool and the identity-hash source.
///
/// One instance lives in the VM context; every object header is driven
/// through it.
pub struct LockSystem {
    pool: MonitorPool,
    next_hash: AtomicU32,
}

/// Identity of an object, taken from its header cell address. Headers
/// never move (objects are heap-pinned for their lifetime), so the
/// address is a stable identity.
fn object_id(header: &AtomicU64) -> u64 {
    header as *const AtomicU64 as usize as u64
}

impl LockSystem {
    /// Creates a lock system with an empty monitor pool.
    pub fn new() -> LockSystem {
        LockSystem {
            pool: MonitorPool::new(),
            next_hash: AtomicU32::new(1),
        }
    }

    /// The monitor pool (test support).
    pub fn pool(&self) -> &MonitorPool {
        &self.pool
    }

    fn fresh_hash(&self) -> u32 {
        // Golden-ratio scramble of a counter, clipped to the hash field.
        let raw = self
            .next_hash
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_mul(0x9E37_79B1);
        let clipped = raw & ((1 << 30) - 1);
        if clipped == 0 {
            1
        } else {
            clipped
        }
    }

    fn cas(header: &AtomicU64, old: u64, new: LockWord) -> bool {
        header
            .compare_exchange(old, new.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Installs a monitor seeded with `owner`'s current thin state.
    /// Returns the pool index on success.
    fn inflate(
        &self,
        header: &AtomicU64,
        old_raw: u64,
        owner: Option<ThreadTag>,
        recursion: u32,
        hash: u32,
    ) -> Option<u32> {
        let oid = object_id(header);
        let (id, monitor) = self.pool.allocate();
        let displaced = LockWord::Unlocked { hash, age: 0 }.encode();
        monitor.prepare(oid, owner, recursion, displaced);
        if Self::cas(header, old_raw, LockWord::Inflated { monitor: id }) {
            trace!(monitor = id, "inflated object lock");
            Some(id)
        } else {
            monitor.abandon();
            self.pool.release(id);
            None
        }
    }

    /// Acquires the object's lock, promoting as needed.
    pub fn lock(&self, header: &AtomicU64) {
        let me = current_thread_tag();
        let oid = object_id(header);
        loop {
            let raw = header.load(Ordering::Acquire);
            match LockWord::decode(raw) {
                LockWord::Unlocked { hash, .. } => {
                    let thin = LockWord::StackLocked {
                        owner: me,
                        count: 1,
                        hash,
                    };
                    if Self::cas(header, raw, thin) {
                        return;
                    }
                }
                LockWord::StackLocked { owner, count, hash } if owner == me => {
                    if count < MAX_THIN_COUNT {
                        let thin = LockWord::StackLocked {
                            owner,
                            count: count + 1,
                            hash,
                        };
                        if Self::cas(header, raw, thin) {
                            return;
                        }
                    } else if self
                        .inflate(header, raw, Some(me), count + 1, hash)
                        .is_some()
                    {
                        // Recursion overflow; the monitor now carries it.
                        return;
                    }
                }
                LockWord::StackLocked { owner, count, hash } => {
                    // Contended: attach a monitor on behalf of the owner,
                    // then queue on it.
                    if let Some(id) = self.inflate(header, raw, Some(owner), count, hash) {
                        let monitor = self.pool.get(id);
                        if monitor.enter(me, oid) == Hit::Done {
                            return;
                        }
                    }
                }
                LockWord::Inflated { monitor } => {
                    if self.pool.get(monitor).enter(me, oid) == Hit::Done {
                        return;
                    }
                }
            }
        }
    }

    /// Releases one level of the object's lock.
    pub fn unlock(&self, header: &AtomicU64) -> VmResult<()> {
        let me = current_thread_tag();
        let oid = object_id(header);
        loop {
            let raw = header.load(Ordering::Acquire);
            match LockWord::decode(raw) {
                LockWord::StackLocked { owner, count, hash } if owner == me => {
                    let next = if count > 1 {
                        LockWord::StackLocked {
                            owner,
                            count: count - 1,
                            hash,
                        }
                    } else {
                        LockWord::Unlocked { hash, age: 0 }
                    };
                    if Self::cas(header, raw, next) {
                        return Ok(());
                    }
                }
                LockWord::Inflated { monitor } => {
                    let m = self.pool.get(monitor);
                    let deflatable = m.exit(me, oid)?;
                    if deflatable {
                        let detached = m.try_detach(oid, |saved| {
                            header
                                .compare_exchange(
                                    raw,
                                    saved,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                        });
                        if detached {
                            self.pool.release(monitor);
                            trace!(monitor, "deflated object lock");
                        }
                    }
                    return Ok(());
                }
                _ => return Err(VmError::IllegalMonitorState),
            }
        }
    }

    /// Ensures the lock is inflated while owned by the caller; needed
    /// before any wait-set operation.
    fn inflate_owned(&self, header: &AtomicU64, me: ThreadTag) -> VmResult<u32> {
        loop {
            let raw = header.load(Ordering::Acquire);
            match LockWord::decode(raw) {
                LockWord::StackLocked { owner, count, hash } if owner == me => {
                    if let Some(id) = self.inflate(header, raw, Some(me), count, hash) {
                        return Ok(id);
                    }
                }
                LockWord::Inflated { monitor } => return Ok(monitor),
                _ => return Err(VmError::IllegalMonitorState),
            }
        }
    }

    /// Releases the lock and parks on the object's wait set;
    /// re-acquires before returning. `None` waits until notified.
    pub fn wait(&self, header: &AtomicU64, timeout: Option<Duration>) -> VmResult<()> {
        let me = current_thread_tag();
        let oid = object_id(header);
        loop {
            let id = self.inflate_owned(header, me)?;
            if self.pool.get(id).wait(me, oid, timeout)? == Hit::Done {
                return Ok(());
            }
        }
    }

    /// Wakes one thread waiting on the object.
    pub fn notify(&self, header: &AtomicU64) -> VmResult<()> {
        self.notify_inner(header, false)
    }

    /// Wakes every thread waiting on the object.
    pub fn notify_all(&self, header: &AtomicU64) -> VmResult<()> {
        self.notify_inner(header, true)
    }

    fn notify_inner(&self, header: &AtomicU64, all: bool) -> VmResult<()> {
        let me = current_thread_tag();
        let oid = object_id(header);
        loop {
            let raw = header.load(Ordering::Acquire);
            match LockWord::decode(raw) {
                // Thin-locked by us: nobody can be waiting (wait inflates).
                LockWord::StackLocked { owner, .. } if owner == me => return Ok(()),
                LockWord::Inflated { monitor } => {
                    let m = self.pool.get(monitor);
                    let hit = if all {
                        m.notify_all(me, oid)?
                    } else {
                        m.notify(me, oid)?
                    };
                    if hit == Hit::Done {
                        return Ok(());
                    }
                }
                _ => return Err(VmError::IllegalMonitorState),
            }
        }
    }

    /// The object's identity hash, assigned lazily on first request and
    /// stable across lock-state transitions.
    pub fn hash_code(&self, header: &AtomicU64) -> u32 {
        let oid = object_id(header);
        loop {
            let raw = header.load(Ordering::Acquire);
            match LockWord::decode(raw) {
                LockWord::Unlocked { hash, age } => {
                    if hash != 0 {
                        return hash;
                    }
                    let word = LockWord::Unlocked {
                        hash: self.fresh_hash(),
                        age,
                    };
                    let _ = Self::cas(header, raw, word);
                }
                LockWord::StackLocked { owner, count, hash } => {
                    if hash != 0 {
                        return hash;
                    }
                    let word = LockWord::StackLocked {
                        owner,
                        count,
                        hash: self.fresh_hash(),
                    };
                    let _ = Self::cas(header, raw, word);
                }
                LockWord::Inflated { monitor } => {
                    if let Some(hash) = self.pool.get(monitor).hash_code(oid, || self.fresh_hash())
                    {
                        return hash;
                    }
                }
            }
        }
    }

    /// Whether the calling thread holds the object's lock (test support).
    pub fn owns(&self, header: &AtomicU64) -> bool {
        let me = current_thread_tag();
        match LockWord::decode(header.load(Ordering::Acquire)) {
            LockWord::StackLocked { owner, .. } => owner == me,
            LockWord::Inflated { monitor } => self.pool.get(monitor).owned_by(me),
            LockWord::Unlocked { .. } => false,
        }
    }
}

impl Default for LockSystem {
    fn default() -> Self {
        Self::new()
    }
}
