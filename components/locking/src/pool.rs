//! The monitor pool.
//!
//! Monitors are allocated on first contention and recycled through a
//! lock-free free list. Pool indices are what header words store, so a
//! monitor's slot is stable for the life of the process.

use crate::Monitor;
use crossbeam_queue::SegQueue;
use parking_lot::RwLock;
use std::sync::Arc;

/// Process-wide store of heavyweight monitors.
pub struct MonitorPool {
    monitors: RwLock<Vec<Arc<Monitor>>>,
    free: SegQueue<u32>,
}

impl MonitorPool {
    /// Creates an empty pool.
    pub fn new() -> MonitorPool {
        MonitorPool {
            monitors: RwLock::new(Vec::new()),
            free: SegQueue::new(),
        }
    }

    /// Takes a monitor from the free list, growing the pool if empty.
    pub fn allocate(&self) -> (u32, Arc<Monitor>) {
        if let Some(id) = self.free.pop() {
            let monitor = self.monitors.read()[id as usize].clone();
            return (id, monitor);
        }
        let mut monitors = self.monitors.write();
        let id = monitors.len() as u32;
        let monitor = Arc::new(Monitor::new());
        monitors.push(monitor.clone());
        (id, monitor)
    }

    /// The monitor at a pool index previously stored in a header.
    pub fn get(&self, id: u32) -> Arc<Monitor> {
        self.monitors.read()[id as usize].clone()
    }

    /// Returns a detached monitor to the free list.
    pub fn release(&self, id: u32) {
        self.free.push(id);
    }

    /// Total monitors ever created (test support).
    pub fn len(&self) -> usize {
        self.monitors.read().len()
    }

    /// Whether no monitor was ever allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MonitorPool {
    fn default() -> Self {
        Self::new()
    }
}
