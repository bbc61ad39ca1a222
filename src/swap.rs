//! Swap Manager
//!
//! A fixed-size bitmap over disk-backed slots, each holding exactly one
//! page image. Slots carry a reference count: when a copy-on-write shared
//! frame with no file backing is evicted, its image is written once and
//! every owner's page table entry references the same slot, so the slot
//! must outlive all but the last swap-in.
//!
//! The bitmap mutex is only ever acquired while the frame table lock is
//! already held (eviction, swap-in), which fixes the lock order
//! frame table -> swap manager and rules out deadlock between the two.
//!
//! The swap area is not self-describing: slot-to-page associations live
//! only in page table entries and are gone after a restart, at which point
//! the whole area is treated as free.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::storage::{BlockDevice, DeviceError};
use crate::types::SwapSlot;

// ============================================================================
// Bitmap State
// ============================================================================

struct SwapInner {
    /// One bit per slot, 1 = allocated
    bitmap: Vec<u64>,
    /// Reference count per slot; nonzero iff the bit is set
    refs: Vec<u32>,
    free: usize,
}

impl SwapInner {
    fn set(&mut self, slot: usize) {
        self.bitmap[slot / 64] |= 1 << (slot % 64);
    }

    fn clear(&mut self, slot: usize) {
        self.bitmap[slot / 64] &= !(1 << (slot % 64));
    }

    fn is_set(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }
}

// ============================================================================
// Swap Manager
// ============================================================================

/// Bitmap slot allocator over a page-granular block device
pub struct SwapManager {
    device: Arc<dyn BlockDevice>,
    total: usize,
    inner: Mutex<SwapInner>,
}

impl SwapManager {
    pub fn new(device: Arc<dyn BlockDevice>, slot_count: usize) -> Self {
        let words = slot_count.div_ceil(64);
        Self {
            device,
            total: slot_count,
            inner: Mutex::new(SwapInner {
                bitmap: vec![0u64; words],
                refs: vec![0u32; slot_count],
                free: slot_count,
            }),
        }
    }

    /// Allocate a slot with one reference; `None` when the area is full
    pub fn alloc(&self) -> Option<SwapSlot> {
        let mut inner = self.inner.lock();
        for (word_idx, word) in inner.bitmap.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = word_idx * 64 + bit;
            if slot >= self.total {
                break;
            }
            inner.set(slot);
            inner.refs[slot] = 1;
            inner.free -= 1;
            return Some(SwapSlot(slot as u32));
        }
        None
    }

    /// Add a reference to an allocated slot (copy-on-write sharing, fork)
    pub fn add_ref(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.is_set(slot.index()));
        inner.refs[slot.index()] += 1;
    }

    /// Drop one reference; frees the slot when the last reference goes.
    /// Returns true if the slot was actually freed.
    pub fn release(&self, slot: SwapSlot) -> bool {
        let mut inner = self.inner.lock();
        let idx = slot.index();
        debug_assert!(inner.is_set(idx) && inner.refs[idx] > 0);
        inner.refs[idx] -= 1;
        if inner.refs[idx] == 0 {
            inner.clear(idx);
            inner.free += 1;
            true
        } else {
            false
        }
    }

    /// Write one page image to a slot
    pub fn write_page(&self, slot: SwapSlot, buf: &[u8]) -> Result<(), DeviceError> {
        self.device.write_slot(slot.index(), buf)
    }

    /// Read one page image from a slot
    pub fn read_page(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.device.read_slot(slot.index(), buf)
    }

    pub fn total_slots(&self) -> usize {
        self.total
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().free
    }

    /// Whether a slot is currently allocated
    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        self.inner.lock().is_set(slot.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;
    use crate::storage::MemDisk;

    fn manager(slots: usize) -> SwapManager {
        SwapManager::new(MemDisk::new(slots), slots)
    }

    #[test]
    fn test_alloc_free_reuse() {
        let swap = manager(4);
        assert_eq!(swap.free_slots(), 4);

        let a = swap.alloc().unwrap();
        let b = swap.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(swap.free_slots(), 2);

        assert!(swap.release(a));
        assert_eq!(swap.free_slots(), 3);

        // Freed slot is available again
        let c = swap.alloc().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_exhaustion() {
        let swap = manager(2);
        let _a = swap.alloc().unwrap();
        let _b = swap.alloc().unwrap();
        assert!(swap.alloc().is_none());
    }

    #[test]
    fn test_shared_slot_refcounts() {
        let swap = manager(2);
        let slot = swap.alloc().unwrap();
        swap.add_ref(slot);

        // First release keeps the slot alive for the other referent
        assert!(!swap.release(slot));
        assert!(swap.is_allocated(slot));

        assert!(swap.release(slot));
        assert!(!swap.is_allocated(slot));
    }

    #[test]
    fn test_page_image_round_trip() {
        let swap = manager(8);
        let slot = swap.alloc().unwrap();

        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        swap.write_page(slot, &page).unwrap();

        let mut back = [0u8; PAGE_SIZE];
        swap.read_page(slot, &mut back).unwrap();
        assert_eq!(page[..], back[..]);
    }
}
