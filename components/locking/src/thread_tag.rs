//! Compact per-thread identity tags for lock words.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Numeric identity of a thread, small enough to pack into a header
/// word. Tags start at 1; 0 never names a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadTag(pub u32);

/// Tags must fit the owner field of [`crate::LockWord`].
pub(crate) const MAX_THREAD_TAG: u32 = (1 << 20) - 1;

static NEXT_TAG: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static TAG: Cell<u32> = const { Cell::new(0) };
}

/// The calling thread's tag, assigned on first use.
pub fn current_thread_tag() -> ThreadTag {
    TAG.with(|cell| {
        let mut tag = cell.get();
        if tag == 0 {
            tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
            assert!(tag <= MAX_THREAD_TAG, "thread tag space exhausted");
            cell.set(tag);
        }
        ThreadTag(tag)
    })
}
