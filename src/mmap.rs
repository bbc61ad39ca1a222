//! Memory-Mapped File Regions
//!
//! Associates contiguous virtual ranges with an open file. Mapping is
//! entirely lazy: one `File`-status, writable entry per covered page and
//! no I/O until the first fault. Unmapping writes dirty resident pages
//! back to the file at their recorded offsets; pages still in `File`
//! status were never loaded, hence never modified, and are never written.

use alloc::sync::Arc;
use log::{debug, warn};

use crate::error::MmapError;
use crate::frame::{EvictCtx, FrameTable};
use crate::page::{is_page_aligned, round_page, VmProt, PAGE_SIZE};
use crate::space::{AddressSpace, PageStatus};
use crate::storage::BackingFile;
use crate::types::{Owner, ProcessId};

/// Map `length` bytes of `file` starting at `offset` to `addr`
pub(crate) fn mmap(
    space: &AddressSpace,
    addr: u64,
    length: u64,
    file: Arc<dyn BackingFile>,
    offset: u64,
) -> Result<(), MmapError> {
    if !is_page_aligned(addr) {
        return Err(MmapError::Misaligned);
    }
    if length == 0 {
        return Err(MmapError::EmptyRange);
    }

    let len = round_page(length);
    let pages = len / PAGE_SIZE as u64;

    for i in 0..pages {
        if space.lookup(addr + i * PAGE_SIZE as u64).is_some() {
            return Err(MmapError::Overlap);
        }
    }

    let file_len = file.len();
    for i in 0..pages {
        let va = addr + i * PAGE_SIZE as u64;
        let off = offset + i * PAGE_SIZE as u64;
        let read_bytes = if file_len > off {
            PAGE_SIZE.min((file_len - off) as usize)
        } else {
            0
        };
        let result = space.insert_file(
            va,
            Arc::clone(&file),
            off,
            read_bytes,
            PAGE_SIZE - read_bytes,
            VmProt::DEFAULT,
            true,
        );
        if let Err(e) = result {
            // A racing map slipped in after the overlap check; undo the
            // pages installed so far
            for j in 0..i {
                space.remove(addr + j * PAGE_SIZE as u64);
            }
            return Err(e.into());
        }
    }

    space.add_region(addr, len);
    debug!(
        "mmap: {:?} mapped {:#x}..{:#x} at file offset {:#x}",
        space.pid(),
        addr,
        addr + len,
        offset
    );
    Ok(())
}

/// Unmap every page in `[addr, addr + length)`, writing dirty resident
/// pages back to the file first
pub(crate) fn munmap(
    frames: &FrameTable,
    ctx: &EvictCtx<'_>,
    space: &AddressSpace,
    addr: u64,
    length: u64,
) -> Result<(), MmapError> {
    if !is_page_aligned(addr) {
        return Err(MmapError::Misaligned);
    }
    if length == 0 {
        return Err(MmapError::EmptyRange);
    }

    let len = round_page(length);
    let pages = len / PAGE_SIZE as u64;
    let pid = space.pid();

    let mut found = false;
    let mut result = Ok(());
    for i in 0..pages {
        let va = addr + i * PAGE_SIZE as u64;
        let entry = match space.lookup(va) {
            Some(entry) => entry,
            None => continue,
        };
        if !entry.is_mmap {
            continue;
        }
        found = true;

        if let Err(e) = drop_page(frames, ctx, space, pid, va) {
            warn!("munmap: write-back failed for {:?} {:#x}: {}", pid, va, e);
            result = Err(MmapError::Io);
        }
    }

    if !found {
        return Err(MmapError::NotMapped);
    }
    space.remove_region(addr);
    result
}

/// Tear down one page: write a dirty resident mmap page back to its file,
/// then remove the entry and release whatever it still held. Pages in
/// `File` or `Zero` status were never loaded, hence never modified, and
/// trigger no I/O. Also used page-by-page at address-space teardown.
pub(crate) fn drop_page(
    frames: &FrameTable,
    ctx: &EvictCtx<'_>,
    space: &AddressSpace,
    pid: ProcessId,
    va: u64,
) -> Result<(), crate::error::VmError> {
    let owner = Owner::new(pid, va);

    // Write-back happens while the entry still exists so the evictor and
    // this path agree on the page's backing metadata
    let mut result = Ok(());
    if let Some(entry) = space.lookup(va) {
        if let PageStatus::Frame(id) = entry.status {
            let writeback = if entry.is_mmap {
                entry.backing.as_ref()
            } else {
                None
            };
            result = frames.remove_owner(ctx, id, owner, writeback);
        }
    }

    // Drop the entry and any reference it still carries. For pages handled
    // above the release is a no-op (the owner is already gone); it does
    // real work when a concurrent fault made the page resident in between.
    match space.remove(va).map(|e| e.status) {
        Some(PageStatus::Swap(slot)) => {
            ctx.swap.release(slot);
        }
        Some(PageStatus::Frame(id)) => {
            ctx.pagedir.clear_mapping(pid, va);
            frames.release(id, owner, ctx.pagedir, ctx.spaces);
        }
        _ => {}
    }
    result
}
