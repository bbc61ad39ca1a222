//! Address Space - Supplemental Page Table
//!
//! One per process: maps each page-aligned virtual address to a
//! description of where that page's data currently lives (zero-fill
//! pending, file region pending, swap slot, or resident frame) and the
//! permissions the hardware mapping must carry when resident.
//!
//! Entries keep their file backing even while resident so a clean,
//! never-written page can be evicted by reverting to its file (or zero)
//! origin instead of consuming a swap slot.
//!
//! The entry map's mutex serializes mutations only; it is never held while
//! acquiring the frame table lock. The evictor, which holds the frame
//! table lock, may take this mutex to demote a victim owner's entry.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::SptError;
use crate::page::{is_page_aligned, VmProt, PAGE_SIZE};
use crate::storage::BackingFile;
use crate::types::{FrameId, ProcessId, SwapSlot};

// ============================================================================
// Backing Description
// ============================================================================

/// Where a page's pristine bytes come from
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    /// Bytes to read from the file at `offset`
    pub read_bytes: usize,
    /// Bytes to zero after the read; `read_bytes + zero_bytes == PAGE_SIZE`
    pub zero_bytes: usize,
}

impl core::fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish()
    }
}

// ============================================================================
// Page Entry
// ============================================================================

/// Current home of a page's data; exactly one holds at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Not yet materialized; first touch yields a zeroed frame
    Zero,
    /// Not resident; bytes come from the entry's file backing
    File,
    /// Not resident; page image lives in a swap slot
    Swap(SwapSlot),
    /// Resident in a physical frame
    Frame(FrameId),
}

/// Supplemental page table entry
#[derive(Clone)]
pub struct PageEntry {
    pub status: PageStatus,
    /// Logical protection; tracked separately from the transient hardware
    /// permission (copy-on-write downgrades only the latter)
    pub prot: VmProt,
    /// Eviction and unmap write dirty data back to the file, not to swap
    pub is_mmap: bool,
    /// Pristine-content source; `None` means all zeroes
    pub backing: Option<FileBacking>,
    /// A fault is mid-flight on this page (I/O in progress); concurrent
    /// faulters back off and let the instruction retry
    pub(crate) loading: bool,
}

impl PageEntry {
    fn zero(prot: VmProt) -> Self {
        Self {
            status: PageStatus::Zero,
            prot,
            is_mmap: false,
            backing: None,
            loading: false,
        }
    }
}

/// Destination chosen by the evictor for a victim page
#[derive(Clone, Copy, Debug)]
pub(crate) enum EvictDest {
    /// Reload from the file backing on next fault
    File,
    /// Zero-fill again on next fault
    Zero,
    /// Page image written to this swap slot
    Swap(SwapSlot),
}

/// Outcome of attempting to claim a page for fault resolution
pub(crate) enum Claim {
    /// Caller owns the load; snapshot of the entry at claim time
    Claimed(PageEntry),
    /// Another thread is resolving this page; back off and retry
    Busy,
    /// No entry at this address
    Gone,
}

// ============================================================================
// Address Space
// ============================================================================

/// Per-process address space: supplemental page table plus the record of
/// memory-mapped regions for unmap validation and exit write-back
pub struct AddressSpace {
    pid: ProcessId,
    entries: Mutex<BTreeMap<u64, PageEntry>>,
    /// start -> length (bytes, page-rounded) of live mmap regions
    regions: Mutex<BTreeMap<u64, u64>>,
}

impl AddressSpace {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            entries: Mutex::new(BTreeMap::new()),
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    fn check_aligned(vaddr: u64) -> Result<(), SptError> {
        if is_page_aligned(vaddr) {
            Ok(())
        } else {
            Err(SptError::InvalidAddress)
        }
    }

    /// Snapshot of the entry at `vaddr`, if any
    pub fn lookup(&self, vaddr: u64) -> Option<PageEntry> {
        self.entries.lock().get(&vaddr).cloned()
    }

    /// Install a zero-fill entry
    pub fn insert_zero(&self, vaddr: u64, prot: VmProt) -> Result<(), SptError> {
        Self::check_aligned(vaddr)?;
        let mut entries = self.entries.lock();
        if entries.contains_key(&vaddr) {
            return Err(SptError::DuplicateMapping);
        }
        entries.insert(vaddr, PageEntry::zero(prot));
        Ok(())
    }

    /// Install a lazily-loaded file entry
    #[allow(clippy::too_many_arguments)]
    pub fn insert_file(
        &self,
        vaddr: u64,
        file: Arc<dyn BackingFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        prot: VmProt,
        is_mmap: bool,
    ) -> Result<(), SptError> {
        Self::check_aligned(vaddr)?;
        if read_bytes + zero_bytes != PAGE_SIZE {
            return Err(SptError::InvalidAddress);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&vaddr) {
            return Err(SptError::DuplicateMapping);
        }
        entries.insert(
            vaddr,
            PageEntry {
                status: PageStatus::File,
                prot,
                is_mmap,
                backing: Some(FileBacking {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                }),
                loading: false,
            },
        );
        Ok(())
    }

    /// Install a pre-built entry (fork duplication)
    pub(crate) fn install_entry(&self, vaddr: u64, entry: PageEntry) -> Result<(), SptError> {
        Self::check_aligned(vaddr)?;
        let mut entries = self.entries.lock();
        if entries.contains_key(&vaddr) {
            return Err(SptError::DuplicateMapping);
        }
        entries.insert(vaddr, entry);
        Ok(())
    }

    /// Publish a frame for this page; clears any in-flight claim
    pub fn mark_resident(&self, vaddr: u64, frame: FrameId) -> Result<(), SptError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&vaddr) {
            Some(e) => {
                e.status = PageStatus::Frame(frame);
                e.loading = false;
                Ok(())
            }
            None => Err(SptError::InvalidAddress),
        }
    }

    /// Record that this page's image now lives in a swap slot
    pub fn mark_swapped(&self, vaddr: u64, slot: SwapSlot) -> Result<(), SptError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&vaddr) {
            Some(e) => {
                e.status = PageStatus::Swap(slot);
                Ok(())
            }
            None => Err(SptError::InvalidAddress),
        }
    }

    /// Demote a victim owner's entry after eviction write-out
    pub(crate) fn mark_evicted(&self, vaddr: u64, dest: EvictDest) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get_mut(&vaddr) {
            debug_assert!(matches!(e.status, PageStatus::Frame(_)));
            e.status = match dest {
                EvictDest::File => PageStatus::File,
                EvictDest::Zero => PageStatus::Zero,
                EvictDest::Swap(slot) => PageStatus::Swap(slot),
            };
        }
    }

    /// Remove and return the entry at `vaddr`; the caller releases any
    /// frame or swap reference it still holds
    pub fn remove(&self, vaddr: u64) -> Option<PageEntry> {
        self.entries.lock().remove(&vaddr)
    }

    /// Atomically claim a non-resident page for fault resolution
    pub(crate) fn claim_for_load(&self, vaddr: u64) -> Claim {
        let mut entries = self.entries.lock();
        match entries.get_mut(&vaddr) {
            Some(e) if e.loading => Claim::Busy,
            Some(e) => {
                e.loading = true;
                Claim::Claimed(e.clone())
            }
            None => Claim::Gone,
        }
    }

    /// Abandon a claim after a failed load
    pub(crate) fn unclaim(&self, vaddr: u64) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get_mut(&vaddr) {
            e.loading = false;
        }
    }

    /// Frame this page is resident in, if any
    pub fn resident_frame(&self, vaddr: u64) -> Option<FrameId> {
        match self.entries.lock().get(&vaddr)?.status {
            PageStatus::Frame(id) => Some(id),
            _ => None,
        }
    }

    /// Logical writability of the page at `vaddr`
    pub fn is_writable(&self, vaddr: u64) -> bool {
        self.entries
            .lock()
            .get(&vaddr)
            .map(|e| e.prot.can_write())
            .unwrap_or(false)
    }

    /// Write-back metadata needed by the evictor: (is_mmap, backing)
    pub(crate) fn page_meta(&self, vaddr: u64) -> Option<(bool, Option<FileBacking>)> {
        self.entries
            .lock()
            .get(&vaddr)
            .map(|e| (e.is_mmap, e.backing.clone()))
    }

    /// Snapshot of every entry (fork, teardown)
    pub fn pages(&self) -> Vec<(u64, PageEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(va, e)| (*va, e.clone()))
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    // ========================================================================
    // Mmap region records
    // ========================================================================

    pub(crate) fn add_region(&self, start: u64, len: u64) {
        self.regions.lock().insert(start, len);
    }

    pub(crate) fn remove_region(&self, start: u64) -> Option<u64> {
        self.regions.lock().remove(&start)
    }

    pub(crate) fn region_list(&self) -> Vec<(u64, u64)> {
        self.regions.lock().iter().map(|(s, l)| (*s, *l)).collect()
    }
}

// ============================================================================
// Process Registry
// ============================================================================

/// Registry of live address spaces, shared with the evictor so it can
/// demote victim owners' entries
pub struct Spaces {
    map: Mutex<BTreeMap<ProcessId, Arc<AddressSpace>>>,
}

impl Spaces {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create and register an address space; `None` if one already exists
    pub fn create(&self, pid: ProcessId) -> Option<Arc<AddressSpace>> {
        let mut map = self.map.lock();
        if map.contains_key(&pid) {
            return None;
        }
        let space = Arc::new(AddressSpace::new(pid));
        map.insert(pid, Arc::clone(&space));
        Some(space)
    }

    pub fn get(&self, pid: ProcessId) -> Option<Arc<AddressSpace>> {
        self.map.lock().get(&pid).cloned()
    }

    pub fn remove(&self, pid: ProcessId) -> Option<Arc<AddressSpace>> {
        self.map.lock().remove(&pid)
    }
}

impl Default for Spaces {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFile;

    fn space() -> AddressSpace {
        AddressSpace::new(ProcessId(1))
    }

    #[test]
    fn test_insert_and_lookup() {
        let s = space();
        s.insert_zero(0x1000, VmProt::DEFAULT).unwrap();

        let e = s.lookup(0x1000).unwrap();
        assert_eq!(e.status, PageStatus::Zero);
        assert!(e.prot.can_write());
        assert!(s.lookup(0x2000).is_none());
    }

    #[test]
    fn test_duplicate_mapping_rejected() {
        let s = space();
        s.insert_zero(0x1000, VmProt::DEFAULT).unwrap();
        assert_eq!(
            s.insert_zero(0x1000, VmProt::READ),
            Err(SptError::DuplicateMapping)
        );

        let file = MemFile::zeroed(PAGE_SIZE);
        assert_eq!(
            s.insert_file(0x1000, file, 0, PAGE_SIZE, 0, VmProt::READ, false),
            Err(SptError::DuplicateMapping)
        );
    }

    #[test]
    fn test_misaligned_address_rejected() {
        let s = space();
        assert_eq!(
            s.insert_zero(0x1008, VmProt::DEFAULT),
            Err(SptError::InvalidAddress)
        );
    }

    #[test]
    fn test_file_entry_byte_budget() {
        let s = space();
        let file = MemFile::zeroed(PAGE_SIZE);
        // read + zero must cover exactly one page
        assert_eq!(
            s.insert_file(0x1000, file, 0, 100, 100, VmProt::READ, false),
            Err(SptError::InvalidAddress)
        );
    }

    #[test]
    fn test_status_transitions() {
        let s = space();
        s.insert_zero(0x3000, VmProt::DEFAULT).unwrap();

        s.mark_resident(0x3000, FrameId(5)).unwrap();
        assert_eq!(s.resident_frame(0x3000), Some(FrameId(5)));

        s.mark_swapped(0x3000, SwapSlot(9)).unwrap();
        assert_eq!(s.resident_frame(0x3000), None);
        assert_eq!(s.lookup(0x3000).unwrap().status, PageStatus::Swap(SwapSlot(9)));

        assert_eq!(
            s.mark_resident(0x9000, FrameId(1)),
            Err(SptError::InvalidAddress)
        );
    }

    #[test]
    fn test_claim_excludes_concurrent_loads() {
        let s = space();
        s.insert_zero(0x4000, VmProt::DEFAULT).unwrap();

        assert!(matches!(s.claim_for_load(0x4000), Claim::Claimed(_)));
        assert!(matches!(s.claim_for_load(0x4000), Claim::Busy));

        s.unclaim(0x4000);
        assert!(matches!(s.claim_for_load(0x4000), Claim::Claimed(_)));

        assert!(matches!(s.claim_for_load(0x5000), Claim::Gone));
    }

    #[test]
    fn test_registry() {
        let spaces = Spaces::new();
        let pid = ProcessId(3);
        assert!(spaces.create(pid).is_some());
        assert!(spaces.create(pid).is_none());
        assert!(spaces.get(pid).is_some());
        spaces.remove(pid);
        assert!(spaces.get(pid).is_none());
    }
}
