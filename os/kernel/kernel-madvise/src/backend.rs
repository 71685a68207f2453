//! # Collaborators
//!
//! The advice code drives reclaim, file I/O, faults and memory-failure
//! handling but does not implement them. Each is a trait the embedding
//! kernel (or a test) provides.

use crate::error::FaultError;
use crate::space::{AddressSpace, MmapGuard};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::Resched;
use kernel_vmem::{Folio, FolioKind, FrameNumber, VirtualAddress};

/// Privileges a task may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// System administration, required for memory-failure injection.
    SysAdmin,
    /// Influencing other processes' scheduling and memory.
    SysNice,
}

/// The task on whose behalf advice is given.
pub trait Task: Resched {
    /// Whether the task is being killed. Long operations abort with
    /// `Interrupted` when this turns true.
    fn fatal_signal_pending(&self) -> bool {
        false
    }

    fn capable(&self, _cap: Capability) -> bool {
        false
    }

    /// Identity of the task's own address space, if it has one.
    fn address_space_id(&self) -> Option<u64> {
        None
    }

    /// Whether the task may inspect and modify `target`.
    fn may_access(&self, _target: &AddressSpace) -> bool {
        true
    }
}

/// The LRU and reclaim engine.
pub trait Reclaimer: Send + Sync {
    /// Take `folio` off its LRU list for reclaim.
    fn isolate(&self, folio: &Arc<Folio>) -> bool {
        folio.isolate_lru()
    }

    /// Return an isolated folio to its LRU list.
    fn putback(&self, folio: &Arc<Folio>) {
        folio.putback_lru();
    }

    fn deactivate(&self, folio: &Arc<Folio>) {
        let _ = folio.deactivate();
    }

    /// Write out and free isolated folios.
    fn reclaim(&self, folios: Vec<Arc<Folio>>);

    /// Flush per-CPU LRU caches so recently added folios are isolatable.
    fn drain(&self) {}
}

/// Errors of [`BackingFile`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("operation not supported")]
    NotSupported,
    #[error("permission denied")]
    PermissionDenied,
    #[error("I/O error")]
    Io,
}

/// A file (or shared-memory object) backing a mapping. Offsets are in bytes.
pub trait BackingFile: Send + Sync {
    /// Start reading `[offset, offset + len)` into the page cache.
    fn advise_readahead(&self, _offset: u64, _len: u64) {}

    /// Swap in the pages of a shared-memory object.
    fn swapin_range(&self, _offset: u64, _len: u64) {}

    /// Free the backing store of `[offset, offset + len)`.
    fn punch_hole(&self, offset: u64, len: u64) -> Result<(), FileError>;

    /// Direct-access files have no page cache to read into.
    fn is_dax(&self) -> bool {
        false
    }

    /// Whether the caller owns the file or may write it. Only then may its
    /// page cache be paged out on the caller's behalf.
    fn may_pageout(&self) -> bool {
        false
    }
}

/// Result of a [`FaultResolver`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Pages made present, starting at the requested address.
    pub pages: usize,
    /// The resolver released the address-space lock at some point; the
    /// caller must revalidate everything it derived from the mapping tree.
    pub lock_dropped: bool,
}

/// Makes pages present, as a page fault would.
pub trait FaultResolver: Send + Sync {
    /// Resolve faults for a prefix of `range`. Must make progress (at least
    /// one page) or fail.
    fn resolve(
        &self,
        space: &AddressSpace,
        guard: &mut MmapGuard<'_>,
        task: &dyn Task,
        range: Range<VirtualAddress>,
        write: bool,
    ) -> Result<Resolved, FaultError>;
}

/// Source of fresh folios.
pub trait FolioAllocator: Send + Sync {
    fn allocate(&self, order: u8, kind: FolioKind) -> Option<Arc<Folio>>;
}

/// Hands out frames in ascending order until `limit` frames are used.
#[derive(Debug)]
pub struct SequentialAllocator {
    next: AtomicU64,
    limit: u64,
}

impl SequentialAllocator {
    #[must_use]
    pub const fn new(first: FrameNumber, frames: u64) -> Self {
        Self {
            next: AtomicU64::new(first.as_u64()),
            limit: first.as_u64() + frames,
        }
    }
}

impl FolioAllocator for SequentialAllocator {
    fn allocate(&self, order: u8, kind: FolioKind) -> Option<Arc<Folio>> {
        let frames = 1u64 << order;
        let pfn = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                let end = next.checked_add(frames)?;
                (end <= self.limit).then_some(end)
            })
            .ok()?;
        Some(Folio::new(FrameNumber::new(pfn), order, kind))
    }
}

/// Why a memory-failure request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryFailureError {
    #[error("memory failure handling is not supported for this frame")]
    NotSupported,
    #[error("frame is busy")]
    Busy,
    #[error("frame is already poisoned")]
    Poisoned,
}

/// Hardware-error handling for physical frames.
pub trait MemoryFailure: Send + Sync {
    /// Migrate the contents of `pfn` away and take the frame offline.
    fn soft_offline(&self, pfn: FrameNumber) -> Result<(), MemoryFailureError>;

    /// Treat `pfn` as having suffered an uncorrectable error.
    fn memory_failure(&self, pfn: FrameNumber) -> Result<(), MemoryFailureError>;
}
