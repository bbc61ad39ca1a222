//! Copy-on-Write Address Space Duplication
//!
//! At fork, resident pages are shared instead of copied: the frame gains
//! the child as an owner, both sides' hardware mappings go read-only, and
//! the logical `writable` flag stays set so the resolver's write-fault
//! path can materialize private copies lazily. Cold pages (`Zero`, `File`,
//! `Swap`) just duplicate their descriptions; swapped pages share the slot
//! by reference count.

use log::debug;

use crate::error::ForkError;
use crate::frame::FrameTable;
use crate::pagedir::PageDir;
use crate::space::{PageStatus, Spaces};
use crate::swap::SwapManager;
use crate::types::{Owner, ProcessId};

/// Clone `parent`'s address space into a newly-registered `child` space.
/// The caller tears the child down if this fails.
pub(crate) fn fork_address_space(
    frames: &FrameTable,
    swap: &SwapManager,
    pagedir: &dyn PageDir,
    spaces: &Spaces,
    parent: ProcessId,
    child: ProcessId,
) -> Result<(), ForkError> {
    let parent_space = spaces.get(parent).ok_or(ForkError::NoParent)?;
    let child_space = spaces.create(child).ok_or(ForkError::ChildNotEmpty)?;

    let mut shared = 0usize;
    for (va, entry) in parent_space.pages() {
        let mut child_entry = entry.clone();
        child_entry.loading = false;

        match entry.status {
            PageStatus::Frame(id) => {
                // Share the frame; the new owner's mapping is read-only
                // by the frame table's contract
                frames.share(id, Owner::new(child, va), pagedir);
                if entry.prot.can_write() {
                    // Downgrade the parent's hardware mapping too; its
                    // logical permission is untouched
                    pagedir.install_mapping(parent, va, id, false);
                }
                shared += 1;
            }
            PageStatus::Swap(slot) => {
                // Both descriptions reference one page image
                swap.add_ref(slot);
            }
            PageStatus::Zero | PageStatus::File => {}
        }

        if child_space.install_entry(va, child_entry).is_err() {
            // Cannot happen on a freshly-created space; bail defensively
            return Err(ForkError::ChildNotEmpty);
        }
    }

    for (start, len) in parent_space.region_list() {
        child_space.add_region(start, len);
    }

    debug!(
        "fork: {:?} -> {:?}, {} pages ({} shared frames)",
        parent,
        child,
        child_space.page_count(),
        shared
    );
    Ok(())
}
