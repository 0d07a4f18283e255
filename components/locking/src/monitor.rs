//! The heavyweight monitor.
//!
//! A monitor is a pooled lock record supporting recursive ownership
//! and wait/notify. It can be installed while another thread owns the
//! thin lock: the installer seeds the monitor with the current owner's
//! tag and recursion count, and the owner's eventual release goes down
//! the monitor path without ever noticing the promotion.

use crate::ThreadTag;
use core_types::{VmError, VmResult};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Outcome of a monitor operation that may race with deflation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hit {
    /// The operation completed against the right object.
    Done,
    /// The monitor was recycled; re-read the header and retry.
    Stale,
}

#[derive(Debug)]
struct MonitorState {
    /// Identity of the object this monitor is bound to; 0 when pooled.
    object: u64,
    owner: Option<ThreadTag>,
    recursion: u32,
    /// Displaced header word (unlocked form, carries the hash).
    saved_header: u64,
    /// Threads blocked acquiring the monitor.
    entering: u32,
    /// Threads parked in `wait`.
    waiting: u32,
    /// Unconsumed notifications.
    permits: u32,
}

/// A heavyweight lock with an entry queue and a wait set.
#[derive(Debug)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    entry: Condvar,
    waitset: Condvar,
}

impl Monitor {
    pub(crate) fn new() -> Monitor {
        Monitor {
            state: Mutex::new(MonitorState {
                object: 0,
                owner: None,
                recursion: 0,
                saved_header: 0,
                entering: 0,
                waiting: 0,
                permits: 0,
            }),
            entry: Condvar::new(),
            waitset: Condvar::new(),
        }
    }

    /// Binds the monitor to an object, seeding the present lock state.
    /// Called before the header is patched to point here.
    pub(crate) fn prepare(
        &self,
        object: u64,
        owner: Option<ThreadTag>,
        recursion: u32,
        saved_header: u64,
    ) {
        let mut s = self.state.lock();
        s.object = object;
        s.owner = owner;
        s.recursion = recursion;
        s.saved_header = saved_header;
        s.permits = 0;
    }

    /// Unbinds a monitor whose header patch lost the race.
    pub(crate) fn abandon(&self) {
        let mut s = self.state.lock();
        s.object = 0;
        s.owner = None;
        s.recursion = 0;
    }

    /// Acquires the monitor, blocking behind the current owner.
    pub(crate) fn enter(&self, me: ThreadTag, object: u64) -> Hit {
        let mut s = self.state.lock();
        if s.object != object {
            return Hit::Stale;
        }
        if s.owner == Some(me) {
            s.recursion += 1;
            return Hit::Done;
        }
        s.entering += 1;
        while s.owner.is_some() {
            self.entry.wait(&mut s);
        }
        s.entering -= 1;
        s.owner = Some(me);
        s.recursion = 1;
        Hit::Done
    }

    /// Releases one recursion level. Returns `Ok(true)` when the
    /// monitor became free with nobody queued, i.e. it may deflate.
    pub(crate) fn exit(&self, me: ThreadTag, object: u64) -> VmResult<bool> {
        let mut s = self.state.lock();
        if s.object != object || s.owner != Some(me) {
            return Err(VmError::IllegalMonitorState);
        }
        s.recursion -= 1;
        if s.recursion > 0 {
            return Ok(false);
        }
        s.owner = None;
        let deflatable = s.entering == 0 && s.waiting == 0 && s.permits == 0;
        self.entry.notify_one();
        Ok(deflatable)
    }

    /// Detaches the monitor from its object if it is still idle,
    /// restoring the displaced header word via `restore`. Returns true
    /// when the caller may return the monitor to the pool.
    pub(crate) fn try_detach(
        &self,
        object: u64,
        restore: impl FnOnce(u64) -> bool,
    ) -> bool {
        let mut s = self.state.lock();
        if s.object != object
            || s.owner.is_some()
            || s.entering != 0
            || s.waiting != 0
            || s.permits != 0
        {
            return false;
        }
        if !restore(s.saved_header) {
            return false;
        }
        s.object = 0;
        true
    }

    /// Releases ownership and parks on the wait set, then re-acquires
    /// with the saved recursion count. `timeout` of `None` waits until
    /// notified.
    pub(crate) fn wait(
        &self,
        me: ThreadTag,
        object: u64,
        timeout: Option<Duration>,
    ) -> VmResult<Hit> {
        let mut s = self.state.lock();
        if s.object != object {
            return Ok(Hit::Stale);
        }
        if s.owner != Some(me) {
            return Err(VmError::IllegalMonitorState);
        }

        let saved_recursion = s.recursion;
        s.owner = None;
        s.recursion = 0;
        s.waiting += 1;
        self.entry.notify_one();

        match timeout {
            None => {
                while s.permits == 0 {
                    self.waitset.wait(&mut s);
                }
            }
            Some(duration) => {
                while s.permits == 0 {
                    if self.waitset.wait_for(&mut s, duration).timed_out() {
                        break;
                    }
                }
            }
        }
        if s.permits > 0 {
            s.permits -= 1;
        }
        s.waiting -= 1;

        s.entering += 1;
        while s.owner.is_some() {
            self.entry.wait(&mut s);
        }
        s.entering -= 1;
        s.owner = Some(me);
        s.recursion = saved_recursion;
        Ok(Hit::Done)
    }

    /// Wakes one thread from the wait set.
    pub(crate) fn notify(&self, me: ThreadTag, object: u64) -> VmResult<Hit> {
        let mut s = self.state.lock();
        if s.object != object {
            return Ok(Hit::Stale);
        }
        if s.owner != Some(me) {
            return Err(VmError::IllegalMonitorState);
        }
        if s.waiting > s.permits {
            s.permits += 1;
            self.waitset.notify_one();
        }
        Ok(Hit::Done)
    }

    /// Wakes every thread in the wait set.
    pub(crate) fn notify_all(&self, me: ThreadTag, object: u64) -> VmResult<Hit> {
        let mut s = self.state.lock();
        if s.object != object {
            return Ok(Hit::Stale);
        }
        if s.owner != Some(me) {
            return Err(VmError::IllegalMonitorState);
        }
        s.permits = s.waiting;
        self.waitset.notify_all();
        Ok(Hit::Done)
    }

    /// Reads the identity hash from the displaced header, assigning it
    /// with `fresh` on first use. `None` when the monitor is stale.
    pub(crate) fn hash_code(&self, object: u64, fresh: impl FnOnce() -> u32) -> Option<u32> {
        let mut s = self.state.lock();
        if s.object != object {
            return None;
        }
        let word = crate::LockWord::decode(s.saved_header);
        if let crate::LockWord::Unlocked { hash, age } = word {
            if hash != 0 {
                return Some(hash);
            }
            let assigned = fresh();
            s.saved_header = crate::LockWord::Unlocked {
                hash: assigned,
                age,
            }
            .encode();
            return Some(assigned);
        }
        None
    }

    /// Whether `me` currently owns the monitor (test support).
    pub fn owned_by(&self, me: ThreadTag) -> bool {
        self.state.lock().owner == Some(me)
    }
}
