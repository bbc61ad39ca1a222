//! Page Fault Resolution
//!
//! The algorithm behind `handle_page_fault`: round the address down, look
//! it up in the faulting process's page table, and dispatch on where the
//! page's data lives. A success return means the trap layer may simply
//! retry the faulting instruction; every load path leaves the page
//! resident, mapped, and unpinned.
//!
//! ## Fault Types
//!
//! - **Zero-fill**: anonymous pages get a zeroed frame on first access
//! - **File load**: lazily read `read_bytes` from the backing file, zero
//!   the tail
//! - **Swap-in**: read the page image back and free the slot reference
//! - **Copy-on-write**: write fault on a shared frame materializes a
//!   private copy
//! - **Stack growth**: a miss just below the stack pointer synthesizes a
//!   fresh writable zero page
//!
//! Concurrent faults on the same page are handled by claiming the entry
//! before any I/O: the losing thread backs off with a success return and
//! lets the instruction retry against the winner's result.

use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, trace};

use crate::config::VmConfig;
use crate::error::{SptError, VmError};
use crate::frame::{CowOutcome, EvictCtx, FrameTable};
use crate::page::{trunc_page, VmProt};
use crate::pagedir::PageDir;
use crate::space::{AddressSpace, Claim, FileBacking, PageEntry, PageStatus, Spaces};
use crate::swap::SwapManager;
use crate::types::{FrameId, Owner, ProcessId};

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault counters
#[derive(Debug, Default)]
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Zero-fill faults
    pub zero_fills: AtomicU64,
    /// Lazy file loads
    pub file_loads: AtomicU64,
    /// Swap-ins
    pub swap_ins: AtomicU64,
    /// Copy-on-write materializations
    pub cow_copies: AtomicU64,
    /// Stack pages synthesized
    pub stack_growths: AtomicU64,
    /// Spurious faults resolved by retry
    pub spurious: AtomicU64,
    /// Unresolvable faults
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            file_loads: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
            cow_copies: AtomicU64::new(0),
            stack_growths: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Fault Context
// ============================================================================

/// Everything the resolver touches, borrowed from the facade
pub(crate) struct FaultCtx<'a> {
    pub frames: &'a FrameTable,
    pub swap: &'a SwapManager,
    pub pagedir: &'a dyn PageDir,
    pub spaces: &'a Spaces,
    pub config: &'a VmConfig,
    pub stats: &'a FaultStats,
}

impl<'a> FaultCtx<'a> {
    fn evict(&self) -> EvictCtx<'a> {
        EvictCtx {
            swap: self.swap,
            pagedir: self.pagedir,
            spaces: self.spaces,
        }
    }

    fn fail(&self) -> VmError {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        VmError::SegmentationFault
    }
}

// ============================================================================
// Entry Point
// ============================================================================

/// Resolve one page fault; `Ok(())` means the instruction may be retried
pub(crate) fn handle_fault(
    ctx: &FaultCtx<'_>,
    pid: ProcessId,
    fault_addr: u64,
    is_write: bool,
    stack_hint: u64,
) -> Result<(), VmError> {
    ctx.stats.total.fetch_add(1, Ordering::Relaxed);

    let page = trunc_page(fault_addr);
    let space = match ctx.spaces.get(pid) {
        Some(space) => space,
        None => return Err(ctx.fail()),
    };

    if space.lookup(page).is_none() {
        if !ctx.config.allows_stack_growth(fault_addr, stack_hint) {
            debug!(
                "fault: {:?} unresolvable at {:#x} (sp hint {:#x})",
                pid, fault_addr, stack_hint
            );
            return Err(ctx.fail());
        }
        match space.insert_zero(page, VmProt::DEFAULT) {
            Ok(()) => {
                ctx.stats.stack_growths.fetch_add(1, Ordering::Relaxed);
                trace!("fault: {:?} stack grows to {:#x}", pid, page);
            }
            // A sibling thread grew the stack first
            Err(SptError::DuplicateMapping) => {}
            Err(SptError::InvalidAddress) => return Err(ctx.fail()),
        }
    }

    loop {
        let entry = match space.lookup(page) {
            Some(entry) => entry,
            None => return Err(ctx.fail()),
        };

        if let PageStatus::Frame(id) = entry.status {
            return resolve_resident(ctx, &space, pid, page, id, &entry, is_write);
        }

        // Non-resident: claim the load so concurrent faulters back off
        match space.claim_for_load(page) {
            Claim::Busy => {
                // I/O in flight on another thread; retrying the
                // instruction lands on its result
                ctx.stats.spurious.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Claim::Gone => return Err(ctx.fail()),
            Claim::Claimed(entry) => match entry.status {
                PageStatus::Frame(_) => {
                    // Resolved between lookup and claim
                    space.unclaim(page);
                    continue;
                }
                PageStatus::Zero => return load_zero(ctx, &space, pid, page, &entry),
                PageStatus::File => return load_file(ctx, &space, pid, page, &entry),
                PageStatus::Swap(slot) => return swap_in(ctx, &space, pid, page, &entry, slot),
            },
        }
    }
}

// ============================================================================
// Load Paths
// ============================================================================

fn load_zero(
    ctx: &FaultCtx<'_>,
    space: &AddressSpace,
    pid: ProcessId,
    page: u64,
    entry: &PageEntry,
) -> Result<(), VmError> {
    let owner = Owner::new(pid, page);
    let frame = match ctx.frames.allocate(&ctx.evict(), owner, true) {
        Ok(frame) => frame,
        Err(e) => {
            space.unclaim(page);
            return Err(e);
        }
    };
    ctx.stats.zero_fills.fetch_add(1, Ordering::Relaxed);
    publish(ctx, space, owner, frame, entry.prot);
    Ok(())
}

fn load_file(
    ctx: &FaultCtx<'_>,
    space: &AddressSpace,
    pid: ProcessId,
    page: u64,
    entry: &PageEntry,
) -> Result<(), VmError> {
    let backing = match entry.backing.clone() {
        Some(backing) => backing,
        None => {
            space.unclaim(page);
            return Err(VmError::Io);
        }
    };
    let owner = Owner::new(pid, page);
    let frame = match ctx.frames.allocate(&ctx.evict(), owner, false) {
        Ok(frame) => frame,
        Err(e) => {
            space.unclaim(page);
            return Err(e);
        }
    };

    if let Err(e) = fill_from_file(ctx, frame, &backing) {
        space.unclaim(page);
        ctx.frames.discard_unpublished(frame, owner);
        return Err(e);
    }

    ctx.stats.file_loads.fetch_add(1, Ordering::Relaxed);
    publish(ctx, space, owner, frame, entry.prot);
    Ok(())
}

fn fill_from_file(
    ctx: &FaultCtx<'_>,
    frame: FrameId,
    backing: &FileBacking,
) -> Result<(), VmError> {
    ctx.frames.with_bytes(frame, |bytes| {
        match backing.file.read_at(&mut bytes[..backing.read_bytes], backing.offset) {
            Ok(n) if n == backing.read_bytes => {
                bytes[backing.read_bytes..].fill(0);
                Ok(())
            }
            _ => Err(VmError::Io),
        }
    })
}

fn swap_in(
    ctx: &FaultCtx<'_>,
    space: &AddressSpace,
    pid: ProcessId,
    page: u64,
    entry: &PageEntry,
    slot: crate::types::SwapSlot,
) -> Result<(), VmError> {
    let owner = Owner::new(pid, page);
    let frame = match ctx.frames.allocate(&ctx.evict(), owner, false) {
        Ok(frame) => frame,
        Err(e) => {
            space.unclaim(page);
            return Err(e);
        }
    };

    let read = ctx
        .frames
        .with_bytes(frame, |bytes| ctx.swap.read_page(slot, bytes));
    if read.is_err() {
        space.unclaim(page);
        ctx.frames.discard_unpublished(frame, owner);
        return Err(VmError::Io);
    }

    // The hardware dirty bit is fresh for the new mapping; without the
    // software flag this page could be evicted "clean" and lost.
    if ctx.config.forced_dirty_on_swap_in {
        ctx.frames.set_forced_dirty(frame);
    }

    ctx.stats.swap_ins.fetch_add(1, Ordering::Relaxed);
    if publish(ctx, space, owner, frame, entry.prot) {
        // Publish succeeded, so this entry's reference to the slot is
        // dead. Shared slots (copy-on-write siblings) stay allocated
        // until their last referent swaps in. A lost publish means the
        // teardown that removed the entry dropped the reference instead.
        ctx.swap.release(slot);
    }
    Ok(())
}

/// Publish a loaded frame: flip the entry to resident, install the
/// hardware mapping, drop the allocation pin. A vanished entry (torn down
/// mid-load) discards the frame; the retry then faults cleanly. Returns
/// whether the entry was actually published.
fn publish(
    ctx: &FaultCtx<'_>,
    space: &AddressSpace,
    owner: Owner,
    frame: FrameId,
    prot: VmProt,
) -> bool {
    match space.mark_resident(owner.vaddr, frame) {
        Ok(()) => {
            ctx.pagedir
                .install_mapping(owner.pid, owner.vaddr, frame, prot.can_write());
            ctx.frames.unpin(frame);
            true
        }
        Err(_) => {
            ctx.frames.discard_unpublished(frame, owner);
            false
        }
    }
}

// ============================================================================
// Resident Faults (copy-on-write, spurious, protection)
// ============================================================================

fn resolve_resident(
    ctx: &FaultCtx<'_>,
    space: &AddressSpace,
    pid: ProcessId,
    page: u64,
    id: FrameId,
    entry: &PageEntry,
    is_write: bool,
) -> Result<(), VmError> {
    let owner = Owner::new(pid, page);

    if is_write {
        if !entry.prot.can_write() {
            debug!("fault: {:?} write to read-only page {:#x}", pid, page);
            return Err(ctx.fail());
        }
        return match ctx.frames.cow_write_fault(&ctx.evict(), id, owner)? {
            CowOutcome::Copied(new) => {
                if space.mark_resident(page, new).is_ok() {
                    ctx.pagedir.install_mapping(pid, page, new, true);
                    ctx.frames.unpin(new);
                    ctx.stats.cow_copies.fetch_add(1, Ordering::Relaxed);
                } else {
                    // Torn down mid-fault; the retry resolves it
                    ctx.frames.discard_unpublished(new, owner);
                }
                Ok(())
            }
            CowOutcome::Restored => {
                ctx.stats.spurious.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            CowOutcome::Stale => {
                // The frame moved under us (eviction won the race);
                // retrying the instruction faults again on fresh state
                ctx.stats.spurious.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        };
    }

    // Read fault on a resident page: stale TLB or a lost mapping.
    match ctx.pagedir.lookup_mapping(pid, page) {
        Some(m) if m.frame == id => {
            ctx.stats.spurious.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        _ => {
            ctx.frames
                .refresh_mapping(id, owner, entry.prot.can_write(), ctx.pagedir);
            ctx.stats.spurious.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}
