//! Error Taxonomy
//!
//! Every failure the subsystem can produce, split by the surface that
//! raises it. Fault and allocation paths return [`VmError`]; the
//! supplemental page table's contract violations surface as [`SptError`];
//! mapping and fork entry points wrap those in [`MmapError`] / [`ForkError`].
//! The crate only ever *returns* these: terminating the offending process
//! is the trap layer's policy, not ours.

use thiserror::Error;

/// Faults and frame/swap allocation failures
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Fault address has no mapping and fails the stack-growth heuristic,
    /// or the access violates the page's protection
    #[error("segmentation fault")]
    SegmentationFault,

    /// No free swap slot during eviction write-out
    #[error("swap space exhausted")]
    SwapExhausted,

    /// Eviction cannot make progress: every frame is pinned
    #[error("no evictable frame")]
    NoFreeFrame,

    /// Backing file or swap device I/O failed; never retried here
    #[error("backing store i/o failed")]
    Io,
}

/// Supplemental page table contract violations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SptError {
    /// An entry already exists at the target page
    #[error("duplicate mapping")]
    DuplicateMapping,

    /// Address is not page-aligned, or no entry exists where one must
    #[error("invalid address")]
    InvalidAddress,
}

/// Errors from `mmap` / `munmap`
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    /// Address is not page-aligned
    #[error("misaligned mapping address")]
    Misaligned,

    /// The requested range overlaps an existing mapping
    #[error("mapping overlaps existing pages")]
    Overlap,

    /// Zero-length mapping requested
    #[error("empty mapping range")]
    EmptyRange,

    /// No mapping exists in the range given to `munmap`
    #[error("no mapping at address")]
    NotMapped,

    /// Write-back to the backing file failed
    #[error("write-back i/o failed")]
    Io,
}

impl From<SptError> for MmapError {
    fn from(err: SptError) -> Self {
        match err {
            SptError::DuplicateMapping => MmapError::Overlap,
            SptError::InvalidAddress => MmapError::Misaligned,
        }
    }
}

/// Errors from `fork_address_space`
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// The child process already has an address space
    #[error("child address space already exists")]
    ChildNotEmpty,

    /// The parent process has no address space
    #[error("parent address space missing")]
    NoParent,

    /// Swap ran out while duplicating the parent; the partially-built
    /// child has been torn down
    #[error("swap space exhausted during fork")]
    SwapExhausted,
}
