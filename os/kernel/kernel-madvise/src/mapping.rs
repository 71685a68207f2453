//! # Mappings
//!
//! A [`Mapping`] is a page-aligned, half-open range of an address space with
//! uniform attributes: permissions and hints ([`VmFlags`]), what backs it
//! ([`Backing`]), an optional [`AnonName`] and the identity of its anonymous
//! reverse map.

use crate::backend::BackingFile;
use crate::config::ANON_NAME_LEN_MAX;
use crate::error::AdviseError;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_vmem::VirtualAddress;
use kernel_vmem::info::{PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    /// Attributes of a [`Mapping`]. Bit positions follow Linux `VM_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const SHARED = 1 << 3;
        const MAYREAD = 1 << 4;
        const MAYWRITE = 1 << 5;
        const MAYEXEC = 1 << 6;
        const MAYSHARE = 1 << 7;
        /// Raw frames without page-group state.
        const PFNMAP = 1 << 10;
        /// Pages are locked in memory.
        const LOCKED = 1 << 13;
        /// Memory-mapped I/O.
        const IO = 1 << 14;
        const SEQ_READ = 1 << 15;
        const RAND_READ = 1 << 16;
        /// Not inherited across fork.
        const DONTCOPY = 1 << 17;
        const DONTEXPAND = 1 << 18;
        /// Backed by explicitly reserved huge pages.
        const HUGETLB = 1 << 22;
        /// Zero-filled in a forked child.
        const WIPEONFORK = 1 << 25;
        const DONTDUMP = 1 << 26;
        const MIXEDMAP = 1 << 28;
        const HUGEPAGE = 1 << 29;
        const NOHUGEPAGE = 1 << 30;
        const MERGEABLE = 1 << 31;
        /// Contents may be dropped under memory pressure.
        const DROPPABLE = 1 << 32;
        /// Attributes and extent can no longer change.
        const SEALED = 1 << 33;

        const SPECIAL = Self::IO.bits()
            | Self::DONTEXPAND.bits()
            | Self::PFNMAP.bits()
            | Self::MIXEDMAP.bits();
        const READ_HINTS = Self::SEQ_READ.bits() | Self::RAND_READ.bits();
    }
}

/// A shared, immutable name tag of anonymous memory.
///
/// Clones share one allocation; equality is by content.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AnonName(Arc<str>);

impl AnonName {
    /// Validate and allocate a name: shorter than [`ANON_NAME_LEN_MAX`],
    /// printable ASCII, none of `` \ ` $ [ ] ``.
    pub fn new(name: &str) -> Result<Self, AdviseError> {
        if name.len() >= ANON_NAME_LEN_MAX || !name.bytes().all(is_valid_name_byte) {
            return Err(AdviseError::InvalidArgument);
        }
        Ok(Self(Arc::from(name)))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of live handles to this allocation.
    #[must_use]
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

const fn is_valid_name_byte(b: u8) -> bool {
    b > 0x1f && b < 0x7f && !matches!(b, b'\\' | b'`' | b'$' | b'[' | b']')
}

impl fmt::Debug for AnonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[anon:{}]", self.0)
    }
}

impl fmt::Display for AnonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a mapping's pages come from. `pgoff` is the file page mapped at the
/// mapping's start.
#[derive(Clone)]
pub enum Backing {
    Anonymous,
    File {
        file: Arc<dyn BackingFile>,
        pgoff: u64,
    },
    /// Anonymous shared memory; behaves like anonymous memory for naming.
    SharedMemory {
        file: Arc<dyn BackingFile>,
        pgoff: u64,
    },
}

impl Backing {
    #[must_use]
    pub const fn file(&self) -> Option<&Arc<dyn BackingFile>> {
        match self {
            Self::Anonymous => None,
            Self::File { file, .. } | Self::SharedMemory { file, .. } => Some(file),
        }
    }

    #[must_use]
    pub const fn pgoff(&self) -> u64 {
        match self {
            Self::Anonymous => 0,
            Self::File { pgoff, .. } | Self::SharedMemory { pgoff, .. } => *pgoff,
        }
    }

    fn advanced(&self, pages: u64) -> Self {
        match self {
            Self::Anonymous => Self::Anonymous,
            Self::File { file, pgoff } => Self::File {
                file: Arc::clone(file),
                pgoff: pgoff + pages,
            },
            Self::SharedMemory { file, pgoff } => Self::SharedMemory {
                file: Arc::clone(file),
                pgoff: pgoff + pages,
            },
        }
    }

    /// Whether `next`, placed `pages` after `self`, maps the continuation of
    /// the same object.
    fn continues_into(&self, next: &Self, pages: u64) -> bool {
        match (self, next) {
            (Self::Anonymous, Self::Anonymous) => true,
            (Self::File { file: a, pgoff: pa }, Self::File { file: b, pgoff: pb })
            | (
                Self::SharedMemory { file: a, pgoff: pa },
                Self::SharedMemory { file: b, pgoff: pb },
            ) => Arc::ptr_eq(a, b) && pa + pages == *pb,
            _ => false,
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::File { pgoff, .. } => f.debug_struct("File").field("pgoff", pgoff).finish(),
            Self::SharedMemory { pgoff, .. } => {
                f.debug_struct("SharedMemory").field("pgoff", pgoff).finish()
            }
        }
    }
}

static NEXT_ANON_VMA: AtomicU64 = AtomicU64::new(1);

/// One mapping of an address space.
pub struct Mapping {
    start: VirtualAddress,
    end: VirtualAddress,
    flags: VmFlags,
    backing: Backing,
    anon_name: Option<AnonName>,
    /// Reverse-map identity, 0 until first attached.
    anon_vma: AtomicU64,
    page_size: u64,
}

impl Mapping {
    fn new(start: VirtualAddress, end: VirtualAddress, flags: VmFlags, backing: Backing) -> Self {
        debug_assert!(start < end);
        Self {
            start,
            end,
            flags,
            backing,
            anon_name: None,
            anon_vma: AtomicU64::new(0),
            page_size: PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn anonymous(start: VirtualAddress, end: VirtualAddress, flags: VmFlags) -> Self {
        Self::new(start, end, flags, Backing::Anonymous)
    }

    #[must_use]
    pub fn file(
        start: VirtualAddress,
        end: VirtualAddress,
        flags: VmFlags,
        file: Arc<dyn BackingFile>,
        pgoff: u64,
    ) -> Self {
        Self::new(start, end, flags, Backing::File { file, pgoff })
    }

    #[must_use]
    pub fn shared_memory(
        start: VirtualAddress,
        end: VirtualAddress,
        flags: VmFlags,
        file: Arc<dyn BackingFile>,
        pgoff: u64,
    ) -> Self {
        Self::new(start, end, flags, Backing::SharedMemory { file, pgoff })
    }

    /// Back the mapping with reserved huge pages of `page_size` bytes.
    #[must_use]
    pub fn with_hugetlb(mut self, page_size: u64) -> Self {
        self.flags |= VmFlags::HUGETLB;
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: AnonName) -> Self {
        self.anon_name = Some(name);
        self
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> VmFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    #[inline]
    #[must_use]
    pub const fn anon_name(&self) -> Option<&AnonName> {
        self.anon_name.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end
    }

    #[inline]
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self.backing, Backing::Anonymous)
    }

    #[inline]
    #[must_use]
    pub const fn is_shmem(&self) -> bool {
        matches!(self.backing, Backing::SharedMemory { .. })
    }

    #[inline]
    #[must_use]
    pub const fn is_hugetlb(&self) -> bool {
        self.flags.contains(VmFlags::HUGETLB)
    }

    /// Size of the pages backing the mapping.
    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Byte offset into the backing object that `va` maps.
    #[must_use]
    pub fn file_offset(&self, va: VirtualAddress) -> u64 {
        (va - self.start) + (self.backing.pgoff() << PAGE_SHIFT)
    }

    /// Sealed, private, and not writable: the contents cannot be recreated,
    /// so discarding them is refused.
    #[must_use]
    pub fn is_sealed_read_only_anon(&self) -> bool {
        self.flags.contains(VmFlags::SEALED)
            && self.backing.file().is_none()
            && !self.flags.intersects(VmFlags::SHARED | VmFlags::WRITE)
    }

    #[must_use]
    pub fn anon_vma(&self) -> Option<u64> {
        match self.anon_vma.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Attach a reverse-map identity if there is none yet. Safe under the
    /// shared lock: concurrent callers agree on one identity.
    pub fn prepare_anon_vma(&self) -> u64 {
        if let Some(id) = self.anon_vma() {
            return id;
        }
        let fresh = NEXT_ANON_VMA.fetch_add(1, Ordering::Relaxed);
        match self
            .anon_vma
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(existing) => existing,
        }
    }

    pub(crate) const fn set_flags(&mut self, flags: VmFlags) {
        self.flags = flags;
    }

    /// Replace the name. The new name is acquired before the old one is
    /// released, so replacing a name with itself never frees it.
    pub(crate) fn set_anon_name(&mut self, name: Option<&AnonName>) {
        self.anon_name = name.cloned();
    }

    /// Cut the mapping at `at`, keeping `[start, at)` and returning `[at, end)`.
    pub(crate) fn split_off(&mut self, at: VirtualAddress) -> Self {
        debug_assert!(self.start < at && at < self.end);
        let tail = Self {
            start: at,
            end: self.end,
            flags: self.flags,
            backing: self.backing.advanced((at - self.start) >> PAGE_SHIFT),
            anon_name: self.anon_name.clone(),
            anon_vma: AtomicU64::new(self.anon_vma.load(Ordering::Acquire)),
            page_size: self.page_size,
        };
        self.end = at;
        tail
    }

    /// Whether `next` can be absorbed into `self` without changing what
    /// either maps.
    pub(crate) fn can_merge_with(&self, next: &Self) -> bool {
        let (a, b) = (self.anon_vma(), next.anon_vma());
        self.end == next.start
            && self.flags == next.flags
            && !self.flags.intersects(VmFlags::SPECIAL)
            && self.page_size == next.page_size
            && self.anon_name == next.anon_name
            && (a.is_none() || b.is_none() || a == b)
            && self.backing.continues_into(&next.backing, self.len() >> PAGE_SHIFT)
    }

    /// Extend `self` over `next`, which must be mergeable.
    pub(crate) fn absorb(&mut self, next: &Self) {
        debug_assert!(self.can_merge_with(next));
        self.end = next.end;
        if self.anon_vma().is_none()
            && let Some(id) = next.anon_vma()
        {
            self.anon_vma.store(id, Ordering::Release);
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("flags", &self.flags)
            .field("backing", &self.backing)
            .field("anon_name", &self.anon_name)
            .finish_non_exhaustive()
    }
}
