//! External Storage Contracts
//!
//! The VM subsystem consumes two byte sinks it does not implement: a
//! byte-addressable file interface from the file system (executable
//! segments, memory-mapped files) and a page-granular block interface from
//! the swap device. Both are traits here; [`MemFile`] and [`MemDisk`] are
//! the in-memory reference devices used by hosted tests and early bring-up.
//!
//! Device errors are terminal for the operation in progress: no retry
//! policy lives at this layer.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use thiserror::Error;

use crate::page::PAGE_SIZE;

// ============================================================================
// Errors
// ============================================================================

/// A file or block device operation failed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("device i/o error")]
pub struct DeviceError;

// ============================================================================
// Contracts
// ============================================================================

/// Byte-addressable file consumed from the file system
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read.
    /// Reads past the end of the file return fewer bytes (possibly zero).
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, DeviceError>;

    /// Write `buf` at `offset`, extending the file if needed; returns
    /// bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, DeviceError>;

    /// Current file length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Page-granular swap device: one page image per slot
pub trait BlockDevice: Send + Sync {
    /// Read one whole page from `slot` into `buf` (`buf.len() == PAGE_SIZE`)
    fn read_slot(&self, slot: usize, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Write one whole page from `buf` to `slot`
    fn write_slot(&self, slot: usize, buf: &[u8]) -> Result<(), DeviceError>;
}

// ============================================================================
// In-Memory File
// ============================================================================

/// In-memory [`BackingFile`]
pub struct MemFile {
    bytes: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(Vec::new()),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(bytes.to_vec()),
        })
    }

    /// Create a zero-filled file of `len` bytes
    pub fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0u8; len]),
        })
    }

    /// Snapshot of the full file contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, DeviceError> {
        let bytes = self.bytes.lock();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, DeviceError> {
        let mut bytes = self.bytes.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> u64 {
        self.bytes.lock().len() as u64
    }
}

// ============================================================================
// In-Memory Swap Disk
// ============================================================================

/// In-memory [`BlockDevice`] with one page buffer per slot
pub struct MemDisk {
    slots: Mutex<Vec<Vec<u8>>>,
}

impl MemDisk {
    pub fn new(slot_count: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![vec![0u8; PAGE_SIZE]; slot_count]),
        })
    }
}

impl BlockDevice for MemDisk {
    fn read_slot(&self, slot: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let slots = self.slots.lock();
        let src = slots.get(slot).ok_or(DeviceError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_slot(&self, slot: usize, buf: &[u8]) -> Result<(), DeviceError> {
        let mut slots = self.slots.lock();
        let dst = slots.get_mut(slot).ok_or(DeviceError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}
