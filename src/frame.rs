//! Frame Table - Physical Frame Arena and Clock Eviction
//!
//! Global registry of physical frames. Each frame is free, exclusively
//! owned by one (process, virtual page) pair, or shared read-only among
//! several pairs (copy-on-write). The arena index doubles as the physical
//! address in this model; each slot carries its own page of bytes.
//!
//! One mutex guards all structural state (owner sets, pin counts, the
//! clock hand, the free list). Eviction write-out performs its device I/O
//! while that lock is held, deliberately: no other thread may allocate a
//! frame the evictor is midway through reclaiming. The swap bitmap lock is
//! only ever taken under this lock, fixing the lock order
//! frame table -> swap manager.
//!
//! Page bytes live behind a per-frame mutex outside the structural lock so
//! the fault path can fill a pinned frame from file or swap without
//! stalling every other frame operation.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{error, trace};
use spin::Mutex;

use crate::error::VmError;
use crate::page::PAGE_SIZE;
use crate::pagedir::PageDir;
use crate::space::{EvictDest, FileBacking, Spaces};
use crate::swap::SwapManager;
use crate::types::{FrameId, Owner};

// ============================================================================
// Eviction Context
// ============================================================================

/// Collaborators the evictor needs: where dirty pages go, how mappings are
/// torn down, and how victim owners' page tables are demoted
pub struct EvictCtx<'a> {
    pub swap: &'a SwapManager,
    pub pagedir: &'a dyn PageDir,
    pub spaces: &'a Spaces,
}

// ============================================================================
// Eviction Statistics
// ============================================================================

/// Eviction counters
#[derive(Debug, Default)]
pub struct EvictStats {
    /// Frames reclaimed
    pub evictions: AtomicU64,
    /// Victim pages written to swap
    pub swap_outs: AtomicU64,
    /// Victim pages written back to their mmap file
    pub file_writebacks: AtomicU64,
    /// Clean victims reverted to file or zero backing
    pub clean_reverts: AtomicU64,
}

impl EvictStats {
    pub const fn new() -> Self {
        Self {
            evictions: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            file_writebacks: AtomicU64::new(0),
            clean_reverts: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Frame State
// ============================================================================

#[derive(Debug, Default)]
struct FrameState {
    /// Mappings of this frame; empty = free
    owners: Vec<Owner>,
    /// Pinned frames are never selected for eviction
    pin_count: u32,
    /// Software dirty flag: set on swap-in and copy-on-write
    /// materialization, where the hardware bit cannot be trusted to
    /// describe the frame's divergence from its backing store
    forced_dirty: bool,
}

struct TableInner {
    states: Vec<FrameState>,
    /// Indices of free frames
    free: Vec<u32>,
    /// Clock hand; persists across allocations so no frame is starved
    hand: usize,
}

/// Outcome of a copy-on-write write fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowOutcome {
    /// Frame was already down to this single owner; the hardware mapping
    /// has been restored to the logical permission
    Restored,
    /// A private copy was materialized; the new frame is pinned for the
    /// caller to publish and unpin
    Copied(FrameId),
    /// The faulting pair no longer owns the frame; retry the fault
    Stale,
}

// ============================================================================
// Frame Table
// ============================================================================

/// The global frame arena
pub struct FrameTable {
    data: Vec<Mutex<Vec<u8>>>,
    inner: Mutex<TableInner>,
    pub stats: EvictStats,
}

impl FrameTable {
    pub fn new(frame_count: usize) -> Self {
        let mut data = Vec::with_capacity(frame_count);
        let mut states = Vec::with_capacity(frame_count);
        let mut free = Vec::with_capacity(frame_count);
        for i in 0..frame_count {
            data.push(Mutex::new(alloc::vec![0u8; PAGE_SIZE]));
            states.push(FrameState::default());
            // Popped from the back; keep low indices first out
            free.push((frame_count - 1 - i) as u32);
        }
        Self {
            data,
            inner: Mutex::new(TableInner {
                states,
                free,
                hand: 0,
            }),
            stats: EvictStats::new(),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.data.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of owners currently mapped to a frame
    pub fn owner_count(&self, id: FrameId) -> usize {
        self.inner.lock().states[id.index()].owners.len()
    }

    /// Snapshot of a frame's owner set
    pub fn owners(&self, id: FrameId) -> Vec<Owner> {
        self.inner.lock().states[id.index()].owners.clone()
    }

    /// Run a closure over a frame's page bytes
    pub fn with_bytes<R>(&self, id: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.data[id.index()].lock();
        f(&mut bytes)
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a frame for `owner`, evicting if no frame is free.
    /// The returned frame is pinned; the caller unpins after installing
    /// the hardware mapping.
    pub fn allocate(
        &self,
        ctx: &EvictCtx<'_>,
        owner: Owner,
        zero_fill: bool,
    ) -> Result<FrameId, VmError> {
        let mut inner = self.inner.lock();
        self.allocate_locked(&mut inner, ctx, owner, zero_fill)
    }

    fn allocate_locked(
        &self,
        inner: &mut TableInner,
        ctx: &EvictCtx<'_>,
        owner: Owner,
        zero_fill: bool,
    ) -> Result<FrameId, VmError> {
        let idx = match inner.free.pop() {
            Some(idx) => idx,
            None => self.evict_locked(inner, ctx)?,
        };
        let state = &mut inner.states[idx as usize];
        debug_assert!(state.owners.is_empty());
        state.owners.push(owner);
        state.pin_count = 1;
        state.forced_dirty = false;
        if zero_fill {
            self.data[idx as usize].lock().fill(0);
        }
        Ok(FrameId(idx))
    }

    // ========================================================================
    // Pinning
    // ========================================================================

    pub fn pin(&self, id: FrameId) {
        self.inner.lock().states[id.index()].pin_count += 1;
    }

    pub fn unpin(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        let state = &mut inner.states[id.index()];
        debug_assert!(state.pin_count > 0);
        state.pin_count = state.pin_count.saturating_sub(1);
    }

    /// Pin a frame only if `owner` still maps it (and, for writes, owns it
    /// exclusively so the copy cannot leak into a copy-on-write sibling).
    /// Closes the race between fault resolution and a kernel copy.
    pub fn pin_owned(&self, id: FrameId, owner: Owner, require_exclusive: bool) -> bool {
        let mut inner = self.inner.lock();
        let state = &mut inner.states[id.index()];
        if !state.owners.contains(&owner) {
            return false;
        }
        if require_exclusive && state.owners.len() > 1 {
            return false;
        }
        state.pin_count += 1;
        true
    }

    // ========================================================================
    // Sharing and Release
    // ========================================================================

    /// Add an owner to a frame (copy-on-write fork). The new owner's
    /// hardware mapping is installed read-only regardless of the page's
    /// logical permission.
    pub fn share(&self, id: FrameId, new_owner: Owner, pagedir: &dyn PageDir) {
        let mut inner = self.inner.lock();
        let state = &mut inner.states[id.index()];
        debug_assert!(!state.owners.is_empty());
        debug_assert!(!state.owners.contains(&new_owner));
        state.owners.push(new_owner);
        pagedir.install_mapping(new_owner.pid, new_owner.vaddr, id, false);
    }

    /// Remove one owner. A single remaining owner gets its hardware
    /// mapping upgraded back to the logical permission; an empty owner set
    /// returns the frame to the free pool. Does not touch the departing
    /// owner's hardware mapping (callers clear or replace it themselves).
    pub fn release(&self, id: FrameId, owner: Owner, pagedir: &dyn PageDir, spaces: &Spaces) {
        let mut inner = self.inner.lock();
        Self::drop_owner_locked(&mut inner, id, owner, pagedir, spaces);
    }

    fn drop_owner_locked(
        inner: &mut TableInner,
        id: FrameId,
        owner: Owner,
        pagedir: &dyn PageDir,
        spaces: &Spaces,
    ) {
        let state = &mut inner.states[id.index()];
        let before = state.owners.len();
        state.owners.retain(|o| *o != owner);
        if state.owners.len() == before {
            return;
        }
        if state.owners.len() == 1 {
            // Un-share: the survivor gets its logical permission back
            let rem = state.owners[0];
            let writable = spaces
                .get(rem.pid)
                .map(|s| s.is_writable(rem.vaddr))
                .unwrap_or(false);
            pagedir.install_mapping(rem.pid, rem.vaddr, id, writable);
        } else if state.owners.is_empty() {
            state.forced_dirty = false;
            inner.free.push(id.0);
        }
    }

    /// Re-install an owner's hardware mapping from current frame state
    /// (spurious-fault recovery). Shared frames stay read-only. Returns
    /// false if the owner no longer maps this frame.
    pub fn refresh_mapping(
        &self,
        id: FrameId,
        owner: Owner,
        logical_writable: bool,
        pagedir: &dyn PageDir,
    ) -> bool {
        let inner = self.inner.lock();
        let state = &inner.states[id.index()];
        if !state.owners.contains(&owner) {
            return false;
        }
        let shared = state.owners.len() > 1;
        pagedir.install_mapping(owner.pid, owner.vaddr, id, logical_writable && !shared);
        true
    }

    /// Back out a freshly-allocated frame that lost its publish race
    /// (the page table entry vanished before `mark_resident`): drop the
    /// allocation pin and the tentative ownership in one step.
    pub fn discard_unpublished(&self, id: FrameId, owner: Owner) {
        let mut inner = self.inner.lock();
        let state = &mut inner.states[id.index()];
        state.pin_count = state.pin_count.saturating_sub(1);
        state.owners.retain(|o| *o != owner);
        if state.owners.is_empty() {
            state.forced_dirty = false;
            inner.free.push(id.0);
        }
    }

    /// Mark a frame's contents as diverged from every backing store
    pub fn set_forced_dirty(&self, id: FrameId) {
        self.inner.lock().states[id.index()].forced_dirty = true;
    }

    // ========================================================================
    // Copy-on-Write Materialization
    // ========================================================================

    /// Resolve a write fault on a resident, logically-writable page.
    ///
    /// Runs entirely under the frame table lock, which serializes all
    /// materializations of one shared frame: the second of two concurrent
    /// write-faulters observes the frame already down to a single owner
    /// and takes the restore path instead of copying again.
    pub fn cow_write_fault(
        &self,
        ctx: &EvictCtx<'_>,
        id: FrameId,
        owner: Owner,
    ) -> Result<CowOutcome, VmError> {
        let mut inner = self.inner.lock();
        {
            let state = &inner.states[id.index()];
            if !state.owners.contains(&owner) {
                return Ok(CowOutcome::Stale);
            }
            if state.owners.len() == 1 {
                ctx.pagedir.install_mapping(owner.pid, owner.vaddr, id, true);
                return Ok(CowOutcome::Restored);
            }
        }

        // Keep the shared source resident while eviction hunts for a frame
        inner.states[id.index()].pin_count += 1;
        let new = match self.allocate_locked(&mut inner, ctx, owner, false) {
            Ok(new) => new,
            Err(e) => {
                inner.states[id.index()].pin_count -= 1;
                return Err(e);
            }
        };
        inner.states[id.index()].pin_count -= 1;

        {
            let src = self.data[id.index()].lock();
            let mut dst = self.data[new.index()].lock();
            dst.copy_from_slice(&src);
        }
        // The copy matches no backing store until written out
        inner.states[new.index()].forced_dirty = true;

        Self::drop_owner_locked(&mut inner, id, owner, ctx.pagedir, ctx.spaces);
        trace!(
            "cow: {:?} {:#x} copied frame {} -> {}",
            owner.pid,
            owner.vaddr,
            id.0,
            new.0
        );
        Ok(CowOutcome::Copied(new))
    }

    // ========================================================================
    // Unmap / Teardown
    // ========================================================================

    /// Drop one owner from a resident frame on the unmap or teardown path:
    /// clear the hardware mapping, write the page back to its mmap file if
    /// it is dirty, then release the ownership.
    pub fn remove_owner(
        &self,
        ctx: &EvictCtx<'_>,
        id: FrameId,
        owner: Owner,
        writeback: Option<&FileBacking>,
    ) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        if !inner.states[id.index()].owners.contains(&owner) {
            return Ok(());
        }

        let mut dirty = ctx.pagedir.query_and_clear_dirty(owner.pid, owner.vaddr);
        if inner.states[id.index()].owners.len() == 1 {
            dirty |= inner.states[id.index()].forced_dirty;
        }
        ctx.pagedir.clear_mapping(owner.pid, owner.vaddr);

        let mut result = Ok(());
        if dirty {
            if let Some(backing) = writeback {
                let data = self.data[id.index()].lock();
                match backing.file.write_at(&data[..backing.read_bytes], backing.offset) {
                    Ok(n) if n == backing.read_bytes => {
                        self.stats.file_writebacks.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        error!(
                            "write-back failed for {:?} {:#x} (offset {:#x})",
                            owner.pid, owner.vaddr, backing.offset
                        );
                        result = Err(VmError::Io);
                    }
                }
            }
        }

        Self::drop_owner_locked(&mut inner, id, owner, ctx.pagedir, ctx.spaces);
        result
    }

    // ========================================================================
    // Clock Eviction
    // ========================================================================

    /// Clock (second-chance) scan. Returns the index of a freed frame, not
    /// yet on the free list. Fails only when no unpinned frame exists.
    fn evict_locked(&self, inner: &mut TableInner, ctx: &EvictCtx<'_>) -> Result<u32, VmError> {
        let n = inner.states.len();
        let mut steps = 0;
        loop {
            if steps > 2 * n {
                return Err(VmError::NoFreeFrame);
            }
            let idx = inner.hand;
            inner.hand = (inner.hand + 1) % n;
            steps += 1;

            let accessed = {
                let state = &inner.states[idx];
                if state.owners.is_empty() || state.pin_count > 0 {
                    continue;
                }
                let mut accessed = false;
                for o in &state.owners {
                    if ctx.pagedir.query_and_clear_accessed(o.pid, o.vaddr) {
                        accessed = true;
                    }
                }
                accessed
            };
            if accessed {
                // Second chance: bit cleared, evicted next sweep if cold
                continue;
            }

            self.write_out_victim(inner, idx, ctx)?;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(idx as u32);
        }
    }

    /// Unmap every owner of the victim, write its contents out if dirty,
    /// and demote every owner's page table entry to the same destination.
    fn write_out_victim(
        &self,
        inner: &mut TableInner,
        idx: usize,
        ctx: &EvictCtx<'_>,
    ) -> Result<(), VmError> {
        let owners = inner.states[idx].owners.clone();
        debug_assert!(!owners.is_empty());

        // A never-written shared page is byte-identical across owners, so
        // one owner's backing metadata describes them all.
        let (is_mmap, backing) = ctx
            .spaces
            .get(owners[0].pid)
            .and_then(|s| s.page_meta(owners[0].vaddr))
            .unwrap_or((false, None));

        let mut dirty = inner.states[idx].forced_dirty;
        for o in &owners {
            if ctx.pagedir.query_and_clear_dirty(o.pid, o.vaddr) {
                dirty = true;
            }
            ctx.pagedir.clear_mapping(o.pid, o.vaddr);
        }

        let dest = if dirty && is_mmap {
            let backing = match &backing {
                Some(b) => b,
                None => return Err(VmError::Io),
            };
            let data = self.data[idx].lock();
            match backing.file.write_at(&data[..backing.read_bytes], backing.offset) {
                Ok(n) if n == backing.read_bytes => {
                    self.stats.file_writebacks.fetch_add(1, Ordering::Relaxed);
                    EvictDest::File
                }
                _ => {
                    // Fatal filesystem error: the page is discarded and the
                    // entries fall back to the file they can no longer
                    // faithfully describe.
                    error!(
                        "evict: mmap write-back failed, page at frame {} discarded",
                        idx
                    );
                    drop(data);
                    self.demote_owners(&owners, EvictDest::File, ctx);
                    let state = &mut inner.states[idx];
                    state.owners.clear();
                    state.forced_dirty = false;
                    inner.free.push(idx as u32);
                    return Err(VmError::Io);
                }
            }
        } else if dirty {
            let slot = match ctx.swap.alloc() {
                Some(slot) => slot,
                None => {
                    // Undo: the victim keeps its frame; dirtiness moved
                    // from the consumed hardware bits into the software
                    // flag, and the mappings come back.
                    let state = &mut inner.states[idx];
                    state.forced_dirty = true;
                    let shared = owners.len() > 1;
                    for o in &owners {
                        let writable = !shared
                            && ctx
                                .spaces
                                .get(o.pid)
                                .map(|s| s.is_writable(o.vaddr))
                                .unwrap_or(false);
                        ctx.pagedir.install_mapping(o.pid, o.vaddr, FrameId(idx as u32), writable);
                    }
                    return Err(VmError::SwapExhausted);
                }
            };
            for _ in 1..owners.len() {
                ctx.swap.add_ref(slot);
            }
            let data = self.data[idx].lock();
            if ctx.swap.write_page(slot, &data).is_err() {
                drop(data);
                for _ in 0..owners.len() {
                    ctx.swap.release(slot);
                }
                let state = &mut inner.states[idx];
                state.forced_dirty = true;
                let shared = owners.len() > 1;
                for o in &owners {
                    let writable = !shared
                        && ctx
                            .spaces
                            .get(o.pid)
                            .map(|s| s.is_writable(o.vaddr))
                            .unwrap_or(false);
                    ctx.pagedir.install_mapping(o.pid, o.vaddr, FrameId(idx as u32), writable);
                }
                error!("evict: swap write failed for frame {}", idx);
                return Err(VmError::Io);
            }
            self.stats.swap_outs.fetch_add(1, Ordering::Relaxed);
            EvictDest::Swap(slot)
        } else if backing.is_some() {
            self.stats.clean_reverts.fetch_add(1, Ordering::Relaxed);
            EvictDest::File
        } else {
            self.stats.clean_reverts.fetch_add(1, Ordering::Relaxed);
            EvictDest::Zero
        };

        trace!("evict: frame {} -> {:?} ({} owners)", idx, dest, owners.len());
        self.demote_owners(&owners, dest, ctx);
        let state = &mut inner.states[idx];
        state.owners.clear();
        state.forced_dirty = false;
        Ok(())
    }

    fn demote_owners(&self, owners: &[Owner], dest: EvictDest, ctx: &EvictCtx<'_>) {
        for o in owners {
            if let Some(space) = ctx.spaces.get(o.pid) {
                space.mark_evicted(o.vaddr, dest);
            }
        }
    }
}
