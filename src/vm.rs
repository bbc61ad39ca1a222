//! VM Facade
//!
//! Owns the frame table, the swap manager, the hardware page-directory
//! adapter, and the registry of per-process address spaces, and exposes
//! the surface the trap and syscall layers call: fault handling, mapping
//! setup, mmap/munmap, fork, teardown, and the pinned user-buffer copy
//! helpers.
//!
//! The copy helpers are the pinning protocol made concrete: any kernel
//! path that moves bytes through a user page must pin the frame around
//! the copy so the eviction scan cannot reclaim it mid-transfer, and must
//! report the access to the page directory so the clock sees the same
//! history the hardware would have recorded.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use log::warn;

use crate::config::VmConfig;
use crate::error::{ForkError, MmapError, SptError, VmError};
use crate::fault::{self, FaultCtx, FaultStats};
use crate::fork;
use crate::frame::{EvictCtx, FrameTable};
use crate::mmap;
use crate::page::{is_page_aligned, page_offset, trunc_page, VmProt, PAGE_SIZE};
use crate::pagedir::PageDir;
use crate::space::{PageStatus, Spaces};
use crate::storage::{BackingFile, BlockDevice};
use crate::swap::SwapManager;
use crate::types::{FrameId, Owner, ProcessId};

/// Attempts to fault-and-pin a page before a copy gives up
const PIN_RETRY_LIMIT: usize = 64;

// ============================================================================
// Statistics Snapshot
// ============================================================================

/// Point-in-time counters across the whole subsystem
#[derive(Debug, Clone, Copy, Default)]
pub struct VmStatsSnapshot {
    pub faults: u64,
    pub zero_fills: u64,
    pub file_loads: u64,
    pub swap_ins: u64,
    pub cow_copies: u64,
    pub stack_growths: u64,
    pub spurious_faults: u64,
    pub failed_faults: u64,
    pub evictions: u64,
    pub swap_outs: u64,
    pub file_writebacks: u64,
    pub clean_reverts: u64,
    pub free_frames: usize,
    pub free_swap_slots: usize,
}

// ============================================================================
// Facade
// ============================================================================

/// The virtual memory subsystem
pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapManager,
    pagedir: Arc<dyn PageDir>,
    spaces: Spaces,
    fault_stats: FaultStats,
}

impl Vm {
    pub fn new(
        config: VmConfig,
        pagedir: Arc<dyn PageDir>,
        swap_device: Arc<dyn BlockDevice>,
    ) -> Self {
        Self {
            frames: FrameTable::new(config.frame_count),
            swap: SwapManager::new(swap_device, config.swap_slots),
            pagedir,
            spaces: Spaces::new(),
            fault_stats: FaultStats::new(),
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    fn evict_ctx(&self) -> EvictCtx<'_> {
        EvictCtx {
            swap: &self.swap,
            pagedir: self.pagedir.as_ref(),
            spaces: &self.spaces,
        }
    }

    fn fault_ctx(&self) -> FaultCtx<'_> {
        FaultCtx {
            frames: &self.frames,
            swap: &self.swap,
            pagedir: self.pagedir.as_ref(),
            spaces: &self.spaces,
            config: &self.config,
            stats: &self.fault_stats,
        }
    }

    // ========================================================================
    // Address Space Lifecycle
    // ========================================================================

    /// Register an empty address space for a process
    pub fn create_address_space(&self, pid: ProcessId) -> Result<(), SptError> {
        match self.spaces.create(pid) {
            Some(_) => Ok(()),
            None => Err(SptError::DuplicateMapping),
        }
    }

    /// Tear down a process's address space: write back dirty mmap pages,
    /// release every frame and swap slot, clear every hardware mapping
    pub fn destroy_address_space(&self, pid: ProcessId) {
        let space = match self.spaces.get(pid) {
            Some(space) => space,
            None => return,
        };
        let ctx = self.evict_ctx();
        for (va, _) in space.pages() {
            if let Err(e) = mmap::drop_page(&self.frames, &ctx, &space, pid, va) {
                warn!("teardown: write-back failed for {:?} {:#x}: {}", pid, va, e);
            }
        }
        self.spaces.remove(pid);
    }

    /// Clone `parent`'s address space into a new one for `child`,
    /// converting writable resident pages to copy-on-write sharing
    pub fn fork_address_space(
        &self,
        parent: ProcessId,
        child: ProcessId,
    ) -> Result<(), ForkError> {
        if self.spaces.get(child).is_some() {
            return Err(ForkError::ChildNotEmpty);
        }
        let result = fork::fork_address_space(
            &self.frames,
            &self.swap,
            self.pagedir.as_ref(),
            &self.spaces,
            parent,
            child,
        );
        if result.is_err() && self.spaces.get(child).is_some() {
            // Partially-built child: tear it back down
            self.destroy_address_space(child);
        }
        result
    }

    // ========================================================================
    // Mapping Setup (executable load, heap, stack seeding)
    // ========================================================================

    /// Install a lazily-zeroed page
    pub fn install_zero_page(
        &self,
        pid: ProcessId,
        vaddr: u64,
        prot: VmProt,
    ) -> Result<(), SptError> {
        let space = self.spaces.get(pid).ok_or(SptError::InvalidAddress)?;
        space.insert_zero(vaddr, prot)
    }

    /// Install a lazily-loaded file page (executable segment style):
    /// `read_bytes` from the file, then `zero_bytes` of fill
    #[allow(clippy::too_many_arguments)]
    pub fn install_file_page(
        &self,
        pid: ProcessId,
        vaddr: u64,
        file: Arc<dyn BackingFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        prot: VmProt,
    ) -> Result<(), SptError> {
        let space = self.spaces.get(pid).ok_or(SptError::InvalidAddress)?;
        space.insert_file(vaddr, file, offset, read_bytes, zero_bytes, prot, false)
    }

    /// Remove one page mapping, releasing whatever backs it (dirty mmap
    /// pages are written back first)
    pub fn remove_page(&self, pid: ProcessId, vaddr: u64) -> Result<(), SptError> {
        if !is_page_aligned(vaddr) {
            return Err(SptError::InvalidAddress);
        }
        let space = self.spaces.get(pid).ok_or(SptError::InvalidAddress)?;
        if space.lookup(vaddr).is_none() {
            return Err(SptError::InvalidAddress);
        }
        let ctx = self.evict_ctx();
        if let Err(e) = mmap::drop_page(&self.frames, &ctx, &space, pid, vaddr) {
            warn!("remove_page: write-back failed for {:?} {:#x}: {}", pid, vaddr, e);
        }
        Ok(())
    }

    // ========================================================================
    // Fault Handling
    // ========================================================================

    /// Resolve a page fault. `Ok(())` means the faulting instruction is
    /// safe to retry; the error taxonomy is the trap layer's signal to
    /// terminate or fail the offending process.
    pub fn handle_page_fault(
        &self,
        pid: ProcessId,
        fault_addr: u64,
        is_write: bool,
        stack_hint: u64,
    ) -> Result<(), VmError> {
        fault::handle_fault(&self.fault_ctx(), pid, fault_addr, is_write, stack_hint)
    }

    // ========================================================================
    // Memory-Mapped Files
    // ========================================================================

    /// Map `length` bytes of `file` at `addr` (page-aligned, lazy)
    pub fn mmap(
        &self,
        pid: ProcessId,
        addr: u64,
        length: u64,
        file: Arc<dyn BackingFile>,
        offset: u64,
    ) -> Result<(), MmapError> {
        let space = self.spaces.get(pid).ok_or(MmapError::NotMapped)?;
        mmap::mmap(&space, addr, length, file, offset)
    }

    /// Unmap `[addr, addr + length)`, writing dirty pages back
    pub fn munmap(&self, pid: ProcessId, addr: u64, length: u64) -> Result<(), MmapError> {
        let space = self.spaces.get(pid).ok_or(MmapError::NotMapped)?;
        mmap::munmap(&self.frames, &self.evict_ctx(), &space, addr, length)
    }

    // ========================================================================
    // Pinned User-Buffer Copies
    // ========================================================================

    /// Copy `bytes` into a process's memory, faulting pages in as needed.
    /// Each touched frame is pinned around its copy and the access is
    /// reported to the page directory as a write.
    pub fn copy_out(
        &self,
        pid: ProcessId,
        vaddr: u64,
        bytes: &[u8],
        stack_hint: u64,
    ) -> Result<(), VmError> {
        let mut vaddr = vaddr;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let page = trunc_page(vaddr);
            let off = page_offset(vaddr);
            let n = (PAGE_SIZE - off).min(remaining.len());

            let frame = self.pin_for_copy(pid, vaddr, true, stack_hint)?;
            self.frames
                .with_bytes(frame, |b| b[off..off + n].copy_from_slice(&remaining[..n]));
            self.pagedir.mark_access(pid, page, true);
            self.frames.unpin(frame);

            vaddr += n as u64;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Copy from a process's memory into `buf`, faulting pages in as
    /// needed. Frames are pinned around the copy; the access is reported
    /// as a read.
    pub fn copy_in(
        &self,
        pid: ProcessId,
        vaddr: u64,
        buf: &mut [u8],
        stack_hint: u64,
    ) -> Result<(), VmError> {
        let mut vaddr = vaddr;
        let mut remaining: &mut [u8] = buf;
        while !remaining.is_empty() {
            let page = trunc_page(vaddr);
            let off = page_offset(vaddr);
            let n = (PAGE_SIZE - off).min(remaining.len());

            let frame = self.pin_for_copy(pid, vaddr, false, stack_hint)?;
            let (chunk, rest) = remaining.split_at_mut(n);
            self.frames
                .with_bytes(frame, |b| chunk.copy_from_slice(&b[off..off + n]));
            self.pagedir.mark_access(pid, page, false);
            self.frames.unpin(frame);

            vaddr += n as u64;
            remaining = rest;
        }
        Ok(())
    }

    /// Fault a page resident and pin it for a kernel copy. Writes demand
    /// exclusive ownership so the bytes cannot leak into a copy-on-write
    /// sibling; the fault path's materialization guarantees progress.
    fn pin_for_copy(
        &self,
        pid: ProcessId,
        vaddr: u64,
        write: bool,
        stack_hint: u64,
    ) -> Result<FrameId, VmError> {
        let page = trunc_page(vaddr);
        let owner = Owner::new(pid, page);
        let space = self
            .spaces
            .get(pid)
            .ok_or(VmError::SegmentationFault)?;

        for _ in 0..PIN_RETRY_LIMIT {
            self.handle_page_fault(pid, vaddr, write, stack_hint)?;
            if let Some(id) = space.resident_frame(page) {
                if self.frames.pin_owned(id, owner, write) {
                    return Ok(id);
                }
            }
            core::hint::spin_loop();
        }
        // Persistent contention between faulting and eviction
        Err(VmError::NoFreeFrame)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Where a page's data currently lives
    pub fn page_status(&self, pid: ProcessId, vaddr: u64) -> Option<PageStatus> {
        self.spaces.get(pid)?.lookup(trunc_page(vaddr)).map(|e| e.status)
    }

    /// Frame a page is resident in, if any
    pub fn resident_frame(&self, pid: ProcessId, vaddr: u64) -> Option<FrameId> {
        self.spaces.get(pid)?.resident_frame(trunc_page(vaddr))
    }

    /// Number of (process, page) pairs mapped to a frame
    pub fn frame_owner_count(&self, id: FrameId) -> usize {
        self.frames.owner_count(id)
    }

    /// Owner pairs currently mapped to a frame
    pub fn frame_owners(&self, id: FrameId) -> alloc::vec::Vec<Owner> {
        self.frames.owners(id)
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_count()
    }

    pub fn free_swap_slots(&self) -> usize {
        self.swap.free_slots()
    }

    /// Counter snapshot
    pub fn stats(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            faults: self.fault_stats.total.load(Ordering::Relaxed),
            zero_fills: self.fault_stats.zero_fills.load(Ordering::Relaxed),
            file_loads: self.fault_stats.file_loads.load(Ordering::Relaxed),
            swap_ins: self.fault_stats.swap_ins.load(Ordering::Relaxed),
            cow_copies: self.fault_stats.cow_copies.load(Ordering::Relaxed),
            stack_growths: self.fault_stats.stack_growths.load(Ordering::Relaxed),
            spurious_faults: self.fault_stats.spurious.load(Ordering::Relaxed),
            failed_faults: self.fault_stats.failures.load(Ordering::Relaxed),
            evictions: self.frames.stats.evictions.load(Ordering::Relaxed),
            swap_outs: self.frames.stats.swap_outs.load(Ordering::Relaxed),
            file_writebacks: self.frames.stats.file_writebacks.load(Ordering::Relaxed),
            clean_reverts: self.frames.stats.clean_reverts.load(Ordering::Relaxed),
            free_frames: self.frames.free_count(),
            free_swap_slots: self.swap.free_slots(),
        }
    }
}
