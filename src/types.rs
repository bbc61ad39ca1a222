//! Common types used across the VM subsystem
//!
//! This module defines shared identifier types to avoid circular
//! dependencies between the frame table, the swap manager, and the
//! per-process supplemental page tables.

use core::sync::atomic::{AtomicU64, Ordering};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub u64);

impl ProcessId {
    /// Create a new process ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ProcessId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Physical frame identifier (index into the frame arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Swap slot identifier (index into the swap area, one page per slot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

impl SwapSlot {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// One mapping of a frame: a (process, virtual page) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub pid: ProcessId,
    pub vaddr: u64,
}

impl Owner {
    pub fn new(pid: ProcessId, vaddr: u64) -> Self {
        Self { pid, vaddr }
    }
}
