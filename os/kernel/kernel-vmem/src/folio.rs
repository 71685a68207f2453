//! # Page groups
//!
//! A [`Folio`] describes a naturally sized group of `2^order` physically
//! contiguous frames that are managed as one unit: they share LRU membership,
//! dirty/active state and the swap-cache slot. Leaf entries reference a folio
//! plus the index of the frame inside it.
//!
//! Map counts are maintained by the entry types themselves
//! ([`PresentPte`](crate::PresentPte) and [`HugeLeaf`](crate::HugeLeaf)), so a
//! folio's counts always equal the number of live entries pointing at it.

use crate::entry::SwapEntry;
use crate::info::PAGE_SIZE;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use kernel_sync::SpinLock;

bitflags! {
    /// Reclaim and I/O state of a [`Folio`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FolioFlags: u32 {
        /// Held by a [`FolioLock`].
        const LOCKED = 1 << 0;
        /// On an LRU list and therefore isolatable.
        const LRU = 1 << 1;
        /// On the active LRU list.
        const ACTIVE = 1 << 2;
        /// Referenced since last scanned.
        const REFERENCED = 1 << 3;
        /// Contents differ from the backing store.
        const DIRTY = 1 << 4;
        /// Was active before being deactivated; refaults are treated as thrashing.
        const WORKINGSET = 1 << 5;
        /// Backed by swap when anonymous; cleared for lazy-free folios.
        const SWAPBACKED = 1 << 6;
        /// Present in the swap cache.
        const SWAPCACHE = 1 << 7;
        /// Must not be reclaimed (for example, locked in memory).
        const UNEVICTABLE = 1 << 8;
        /// Contents lost to a hardware memory error.
        const HWPOISON = 1 << 9;
        /// Accessed since idle tracking last looked.
        const YOUNG = 1 << 10;
    }
}

/// Physical frame number.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, n: usize) -> Self {
        Self(self.0 + n as u64)
    }
}

/// What a folio caches.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FolioKind {
    /// Process-private memory, backed by swap.
    Anonymous,
    /// Page-cache memory of a file or shared memory object.
    File,
}

/// Why a large folio could not be split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("folio is a single page")]
    NotLarge,
    #[error("folio is mapped by more than one entry set")]
    Shared,
    #[error("folio has elevated pins")]
    Pinned,
    #[error("folio is not fully mapped by this leaf table")]
    PartiallyMapped,
}

/// A group of contiguous frames managed as one unit.
pub struct Folio {
    pfn: FrameNumber,
    order: u8,
    kind: FolioKind,
    flags: AtomicU32,
    /// Number of leaf entries mapping one of our frames.
    pte_mapcount: AtomicUsize,
    /// Number of huge entries mapping the whole folio.
    entire_mapcount: AtomicUsize,
    /// Long-term references that forbid splitting and migration.
    pincount: AtomicUsize,
    swap: SpinLock<Option<SwapEntry>>,
}

impl Folio {
    /// Create a folio of `2^order` frames starting at `pfn`, on the LRU.
    #[must_use]
    pub fn new(pfn: FrameNumber, order: u8, kind: FolioKind) -> Arc<Self> {
        let flags = match kind {
            FolioKind::Anonymous => FolioFlags::LRU | FolioFlags::SWAPBACKED,
            FolioKind::File => FolioFlags::LRU,
        };
        Arc::new(Self::with_flags(pfn, order, kind, flags))
    }

    fn with_flags(pfn: FrameNumber, order: u8, kind: FolioKind, flags: FolioFlags) -> Self {
        Self {
            pfn,
            order,
            kind,
            flags: AtomicU32::new(flags.bits()),
            pte_mapcount: AtomicUsize::new(0),
            entire_mapcount: AtomicUsize::new(0),
            pincount: AtomicUsize::new(0),
            swap: SpinLock::new(None),
        }
    }

    #[inline]
    #[must_use]
    pub const fn pfn(&self) -> FrameNumber {
        self.pfn
    }

    #[inline]
    #[must_use]
    pub const fn order(&self) -> u8 {
        self.order
    }

    #[inline]
    #[must_use]
    pub const fn nr_pages(&self) -> usize {
        1 << self.order
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        PAGE_SIZE << self.order
    }

    #[inline]
    #[must_use]
    pub const fn is_large(&self) -> bool {
        self.order > 0
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> FolioKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn is_anon(&self) -> bool {
        self.kind == FolioKind::Anonymous
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> FolioFlags {
        FolioFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn test(&self, flag: FolioFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline]
    pub fn set(&self, flag: FolioFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear(&self, flag: FolioFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Clear `flag`, returning whether it was set.
    #[inline]
    pub fn test_and_clear(&self, flag: FolioFlags) -> bool {
        FolioFlags::from_bits_retain(self.flags.fetch_and(!flag.bits(), Ordering::AcqRel))
            .contains(flag)
    }

    /// Set `flag`, returning whether it was already set.
    #[inline]
    pub fn test_and_set(&self, flag: FolioFlags) -> bool {
        FolioFlags::from_bits_retain(self.flags.fetch_or(flag.bits(), Ordering::AcqRel))
            .contains(flag)
    }

    /// Take the folio lock without waiting.
    #[inline]
    pub fn try_lock(&self) -> Option<FolioLock<'_>> {
        (!self.test_and_set(FolioFlags::LOCKED)).then_some(FolioLock { folio: self })
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.test(FolioFlags::LOCKED)
    }

    /// Leaf entries currently mapping frames of this folio.
    #[inline]
    #[must_use]
    pub fn pte_mapcount(&self) -> usize {
        self.pte_mapcount.load(Ordering::Acquire)
    }

    /// Huge entries currently mapping the whole folio.
    #[inline]
    #[must_use]
    pub fn entire_mapcount(&self) -> usize {
        self.entire_mapcount.load(Ordering::Acquire)
    }

    /// Total number of mappings of any kind.
    #[inline]
    #[must_use]
    pub fn mapcount(&self) -> usize {
        self.pte_mapcount() + self.entire_mapcount()
    }

    #[inline]
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapcount() > 0
    }

    /// Whether the folio is (probably) mapped into more than one place.
    ///
    /// For large folios this is a heuristic: a folio mapped page by page
    /// exactly once is not shared, one mapped by more leaf entries than it has
    /// pages, or both entirely and page-wise, is.
    #[must_use]
    pub fn likely_mapped_shared(&self) -> bool {
        let ptes = self.pte_mapcount();
        let entire = self.entire_mapcount();
        if !self.is_large() {
            return ptes + entire > 1;
        }
        entire > 1 || (entire > 0 && ptes > 0) || ptes > self.nr_pages()
    }

    pub(crate) fn inc_pte_mapcount(&self) {
        self.pte_mapcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_pte_mapcount(&self) {
        let prev = self.pte_mapcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pte mapcount underflow");
    }

    pub(crate) fn inc_entire_mapcount(&self) {
        self.entire_mapcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_entire_mapcount(&self) {
        let prev = self.entire_mapcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "entire mapcount underflow");
    }

    /// Take a long-term pin (direct I/O, device access).
    pub fn pin(&self) {
        self.pincount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.pincount.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pincount.load(Ordering::Acquire) > 0
    }

    /// The swap slot caching this folio, if any.
    #[must_use]
    pub fn swap_entry(&self) -> Option<SwapEntry> {
        *self.swap.lock()
    }

    /// Associate the folio with the swap slot `entry`.
    pub fn add_to_swap_cache(&self, entry: SwapEntry) {
        *self.swap.lock() = Some(entry);
        self.set(FolioFlags::SWAPCACHE);
    }

    /// Drop the swap-cache association, returning the slot it held.
    pub fn delete_from_swap_cache(&self) -> Option<SwapEntry> {
        let entry = self.swap.lock().take();
        self.clear(FolioFlags::SWAPCACHE);
        entry
    }

    /// Remove the folio from its LRU list. Fails if it is already isolated.
    pub fn isolate_lru(&self) -> bool {
        self.test_and_clear(FolioFlags::LRU)
    }

    /// Put an isolated folio back on its LRU list.
    pub fn putback_lru(&self) {
        self.set(FolioFlags::LRU);
    }

    /// Move an active folio to the inactive list.
    pub fn deactivate(&self) -> bool {
        let flags = self.flags();
        if !flags.contains(FolioFlags::LRU) || flags.contains(FolioFlags::UNEVICTABLE) {
            return false;
        }
        self.clear(FolioFlags::ACTIVE | FolioFlags::REFERENCED);
        true
    }

    /// Turn a swap-backed anonymous folio into a lazy-free one: clean
    /// lazy-free folios are discarded instead of swapped out.
    pub fn mark_lazyfree(&self) -> bool {
        let flags = self.flags();
        let eligible = self.is_anon()
            && flags.contains(FolioFlags::SWAPBACKED)
            && !flags.intersects(FolioFlags::SWAPCACHE | FolioFlags::UNEVICTABLE);
        if eligible {
            self.clear(FolioFlags::ACTIVE | FolioFlags::REFERENCED | FolioFlags::SWAPBACKED);
        }
        eligible
    }

    #[inline]
    #[must_use]
    pub fn is_lazyfree(&self) -> bool {
        self.is_anon() && !self.test(FolioFlags::SWAPBACKED)
    }

    /// Break a large folio into order-0 folios carrying over its state.
    ///
    /// Callers check that no mapping outside the leaf table being rewritten
    /// refers to the folio.
    pub(crate) fn split_to_singles(&self) -> Result<Vec<Arc<Self>>, SplitError> {
        if !self.is_large() {
            return Err(SplitError::NotLarge);
        }
        if self.is_pinned() {
            return Err(SplitError::Pinned);
        }
        let inherited = self.flags() - FolioFlags::LOCKED;
        let swap = self.swap_entry();
        let singles = (0..self.nr_pages())
            .map(|i| {
                let single = Self::with_flags(self.pfn.offset(i), 0, self.kind, inherited);
                if let Some(entry) = swap {
                    *single.swap.lock() = Some(entry.offset(i));
                }
                Arc::new(single)
            })
            .collect();
        self.clear(FolioFlags::LRU);
        Ok(singles)
    }
}

impl fmt::Debug for Folio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Folio")
            .field("pfn", &self.pfn)
            .field("order", &self.order)
            .field("kind", &self.kind)
            .field("flags", &self.flags())
            .field("mapcount", &self.mapcount())
            .finish_non_exhaustive()
    }
}

/// Exclusive ownership of a [`Folio`]'s lock bit.
pub struct FolioLock<'a> {
    folio: &'a Folio,
}

impl FolioLock<'_> {
    #[inline]
    #[must_use]
    pub const fn folio(&self) -> &Folio {
        self.folio
    }
}

impl Drop for FolioLock<'_> {
    fn drop(&mut self) {
        self.folio.clear(FolioFlags::LOCKED);
    }
}
