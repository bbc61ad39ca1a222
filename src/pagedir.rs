//! Page Directory Adapter - Hardware Page Table Contract
//!
//! The VM subsystem never walks hardware page tables itself. Everything it
//! needs from the MMU goes through the [`PageDir`] trait: install or clear
//! a translation, and query-and-clear the accessed/dirty bits. The bits are
//! an external, side-effecting resource: the eviction scan and the
//! write-back paths are the only readers, and they always consume them
//! through the query-and-clear operations so the policy code stays
//! independent of the page-table representation.
//!
//! [`SoftPageDir`] is the software reference implementation: a mapping
//! cache keyed by (process, virtual page) with explicit accessed/dirty
//! bits. It stands in for the architecture layer in hosted tests and on
//! targets without an MMU driver yet.

use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::types::{FrameId, ProcessId};

// ============================================================================
// Contract
// ============================================================================

/// One installed translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Frame the virtual page translates to
    pub frame: FrameId,
    /// Hardware write permission (may be narrower than the logical one
    /// while the page is copy-on-write shared)
    pub writable: bool,
}

/// Hardware page-table operations consumed by the VM subsystem
pub trait PageDir: Send + Sync {
    /// Install (or replace) the translation for a virtual page
    fn install_mapping(&self, pid: ProcessId, vaddr: u64, frame: FrameId, writable: bool);

    /// Remove the translation for a virtual page, if any
    fn clear_mapping(&self, pid: ProcessId, vaddr: u64);

    /// Current translation for a virtual page
    ///
    /// Used by the fault resolver to tell a spurious (stale-TLB) fault
    /// from a genuine protection violation.
    fn lookup_mapping(&self, pid: ProcessId, vaddr: u64) -> Option<Mapping>;

    /// Read and clear the accessed bit
    fn query_and_clear_accessed(&self, pid: ProcessId, vaddr: u64) -> bool;

    /// Read and clear the dirty bit
    fn query_and_clear_dirty(&self, pid: ProcessId, vaddr: u64) -> bool;

    /// Record an access made through a kernel copy path
    ///
    /// The MMU sets accessed/dirty implicitly for user-mode accesses; when
    /// the kernel copies through a pinned frame on the user's behalf it
    /// must report the access here so eviction sees the same history.
    fn mark_access(&self, pid: ProcessId, vaddr: u64, write: bool);
}

// ============================================================================
// Software Reference Implementation
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SoftEntry {
    frame: FrameId,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Software page directory: a mapping cache with explicit bits
pub struct SoftPageDir {
    entries: Mutex<BTreeMap<(ProcessId, u64), SoftEntry>>,
}

impl SoftPageDir {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of installed translations (all processes)
    pub fn mapping_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for SoftPageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir for SoftPageDir {
    fn install_mapping(&self, pid: ProcessId, vaddr: u64, frame: FrameId, writable: bool) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&(pid, vaddr)) {
            // Permission change on the same frame keeps the bit history;
            // losing the dirty bit on a copy-on-write downgrade would lose
            // the page's contents at eviction time.
            Some(e) if e.frame == frame => {
                e.writable = writable;
            }
            _ => {
                entries.insert(
                    (pid, vaddr),
                    SoftEntry {
                        frame,
                        writable,
                        accessed: false,
                        dirty: false,
                    },
                );
            }
        }
    }

    fn clear_mapping(&self, pid: ProcessId, vaddr: u64) {
        self.entries.lock().remove(&(pid, vaddr));
    }

    fn lookup_mapping(&self, pid: ProcessId, vaddr: u64) -> Option<Mapping> {
        self.entries.lock().get(&(pid, vaddr)).map(|e| Mapping {
            frame: e.frame,
            writable: e.writable,
        })
    }

    fn query_and_clear_accessed(&self, pid: ProcessId, vaddr: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&(pid, vaddr)) {
            Some(e) => {
                let was = e.accessed;
                e.accessed = false;
                was
            }
            None => false,
        }
    }

    fn query_and_clear_dirty(&self, pid: ProcessId, vaddr: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&(pid, vaddr)) {
            Some(e) => {
                let was = e.dirty;
                e.dirty = false;
                was
            }
            None => false,
        }
    }

    fn mark_access(&self, pid: ProcessId, vaddr: u64, write: bool) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get_mut(&(pid, vaddr)) {
            e.accessed = true;
            if write {
                e.dirty = true;
            }
        }
    }
}
