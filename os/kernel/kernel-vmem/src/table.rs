//! # Page-table tree
//!
//! Four levels, 512 entries each:
//!
//! ```text
//!  PageMapLevel4 → UpperDirectory → MiddleDirectory → PageTable
//!        │               │                 │               │
//!        │               │                 │               └─► PtEntry (4 KiB)
//!        │               │                 └─────────────────► PmdEntry: table or 2 MiB leaf
//!        │               └───────────────────────────────────► PudEntry: directory or 1 GiB leaf
//!        └───────────────────────────────────────────────────► upper directory, if any
//! ```
//!
//! The upper three levels are protected by one lock (the page-table lock of
//! the address space). Each leaf table carries its own [`SpinLock`] so walks
//! over different 2 MiB regions do not contend.

use crate::addr::{TableIndex, VirtualAddress};
use crate::counters::RssCounters;
use crate::entry::{HugeLeaf, PresentPte, PtEntry};
use crate::folio::{Folio, FolioLock, SplitError};
use crate::info::ENTRIES_PER_TABLE;
use crate::{Marker, PteBits, SwapEntry};
use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_sync::SpinLock;

/// A leaf table behind its split lock.
pub type LeafTable = Arc<SpinLock<PageTable>>;

/// The leaf level: 512 entries of 4 KiB each.
#[doc(alias = "PT")]
pub struct PageTable {
    entries: [PtEntry; ENTRIES_PER_TABLE],
    /// Set once the table has been unlinked from its directory. Anyone who
    /// locked it through a stale reference must look the slot up again.
    detached: bool,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| PtEntry::None),
            detached: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: TableIndex) -> &PtEntry {
        &self.entries[i.as_usize()]
    }

    #[inline]
    pub fn get_mut(&mut self, i: TableIndex) -> &mut PtEntry {
        &mut self.entries[i.as_usize()]
    }

    /// Store `e` at `i`, returning the previous entry.
    #[inline]
    pub fn set(&mut self, i: TableIndex, e: PtEntry) -> PtEntry {
        core::mem::replace(&mut self.entries[i.as_usize()], e)
    }

    #[inline]
    #[must_use]
    pub(crate) fn entries(&self) -> &[PtEntry] {
        &self.entries
    }

    #[inline]
    pub(crate) fn entries_mut(&mut self) -> &mut [PtEntry] {
        &mut self.entries
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PtEntry::is_none)
    }

    #[inline]
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.detached
    }

    /// Replace the large folio mapped at `at` with order-0 folios.
    ///
    /// All frames of the folio must be mapped, in order, by this table and
    /// by nothing else. The caller holds the folio lock.
    pub fn split_folio(&mut self, at: TableIndex, lock: &FolioLock<'_>) -> Result<(), SplitError> {
        let folio = lock.folio();
        let Some(pte) = self.get(at).present() else {
            return Err(SplitError::PartiallyMapped);
        };
        debug_assert!(core::ptr::eq(Arc::as_ptr(pte.folio()), folio));
        if !folio.is_large() {
            return Err(SplitError::NotLarge);
        }
        if folio.entire_mapcount() > 0 || folio.pte_mapcount() != folio.nr_pages() {
            return Err(SplitError::Shared);
        }
        let base = at
            .as_usize()
            .checked_sub(pte.index())
            .ok_or(SplitError::PartiallyMapped)?;
        let nr = folio.nr_pages();
        if base + nr > ENTRIES_PER_TABLE {
            return Err(SplitError::PartiallyMapped);
        }
        let fully_mapped = self.entries[base..base + nr]
            .iter()
            .enumerate()
            .all(|(i, e)| {
                e.present().is_some_and(|p| {
                    core::ptr::eq(Arc::as_ptr(p.folio()), folio) && p.index() == i
                })
            });
        if !fully_mapped {
            return Err(SplitError::PartiallyMapped);
        }

        let singles = folio.split_to_singles()?;
        for (slot, single) in self.entries[base..base + nr].iter_mut().zip(singles) {
            let bits = slot.present().map_or_else(PteBits::new, PresentPte::bits);
            *slot = PtEntry::Present(PresentPte::new(single, 0, bits));
        }
        Ok(())
    }
}

/// A middle-level entry.
#[derive(Default)]
pub enum PmdEntry {
    #[default]
    None,
    Table(LeafTable),
    Huge(HugeLeaf),
}

impl PmdEntry {
    #[inline]
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    #[must_use]
    pub const fn huge(&self) -> Option<&HugeLeaf> {
        match self {
            Self::Huge(leaf) => Some(leaf),
            _ => None,
        }
    }

    #[inline]
    pub const fn huge_mut(&mut self) -> Option<&mut HugeLeaf> {
        match self {
            Self::Huge(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Turn a 2 MiB leaf into a leaf table mapping the same folio page by page.
    ///
    /// Returns `false` if the entry is not a huge leaf of a full-size folio.
    pub fn split_huge(&mut self) -> bool {
        let Self::Huge(leaf) = self else {
            return false;
        };
        if leaf.folio().nr_pages() != ENTRIES_PER_TABLE {
            return false;
        }
        let mut table = PageTable::new();
        for (i, slot) in table.entries.iter_mut().enumerate() {
            *slot = PtEntry::Present(PresentPte::new(Arc::clone(leaf.folio()), i, leaf.bits()));
        }
        *self = Self::Table(Arc::new(SpinLock::new(table)));
        true
    }
}

/// The middle level: 512 entries of 2 MiB each.
#[doc(alias = "PMD")]
pub struct MiddleDirectory {
    entries: [PmdEntry; ENTRIES_PER_TABLE],
}

impl MiddleDirectory {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: core::array::from_fn(|_| PmdEntry::None),
        })
    }
}

/// An upper-level entry.
#[derive(Default)]
pub enum PudEntry {
    #[default]
    None,
    Table(Box<MiddleDirectory>),
    Huge(HugeLeaf),
}

impl PudEntry {
    #[inline]
    #[must_use]
    pub const fn is_huge(&self) -> bool {
        matches!(self, Self::Huge(_))
    }
}

/// The upper level: 512 entries of 1 GiB each.
#[doc(alias = "PUD")]
pub struct UpperDirectory {
    entries: [PudEntry; ENTRIES_PER_TABLE],
}

impl UpperDirectory {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: core::array::from_fn(|_| PudEntry::None),
        })
    }
}

/// The top level: 512 entries of 512 GiB each.
#[doc(alias = "PML4")]
pub struct PageMapLevel4 {
    entries: [Option<Box<UpperDirectory>>; ENTRIES_PER_TABLE],
}

impl PageMapLevel4 {
    fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| None),
        }
    }

    /// The upper-level slot covering `va`, allocating the directory if asked.
    pub(crate) fn pud_mut(&mut self, va: VirtualAddress, alloc: bool) -> Option<&mut PudEntry> {
        let slot = &mut self.entries[TableIndex::l4(va).as_usize()];
        if slot.is_none() && alloc {
            *slot = Some(UpperDirectory::new());
        }
        slot.as_mut()
            .map(|dir| &mut dir.entries[TableIndex::l3(va).as_usize()])
    }

    /// The middle-level slot covering `va`, allocating intermediate levels if
    /// asked. `None` if the path is absent or blocked by an upper huge leaf.
    pub(crate) fn pmd_mut(&mut self, va: VirtualAddress, alloc: bool) -> Option<&mut PmdEntry> {
        let pud = self.pud_mut(va, alloc)?;
        if pud_populate(pud, alloc) {
            pmd_in(pud, va)
        } else {
            None
        }
    }
}

/// Make sure `pud` points at a middle directory. Returns whether it does.
pub(crate) fn pud_populate(pud: &mut PudEntry, alloc: bool) -> bool {
    if matches!(pud, PudEntry::None) && alloc {
        *pud = PudEntry::Table(MiddleDirectory::new());
    }
    matches!(pud, PudEntry::Table(_))
}

/// The middle-level slot for `va` below `pud`.
pub(crate) fn pmd_in(pud: &mut PudEntry, va: VirtualAddress) -> Option<&mut PmdEntry> {
    match pud {
        PudEntry::Table(dir) => Some(&mut dir.entries[TableIndex::l2(va).as_usize()]),
        _ => None,
    }
}

/// Make sure `pmd` points at a leaf table. Returns the table if it does.
pub(crate) fn pmd_populate(pmd: &mut PmdEntry, alloc: bool) -> Option<LeafTable> {
    if pmd.is_none() && alloc {
        *pmd = PmdEntry::Table(Arc::new(SpinLock::new(PageTable::new())));
    }
    match pmd {
        PmdEntry::Table(table) => Some(Arc::clone(table)),
        _ => None,
    }
}

/// What a virtual address currently translates to.
#[derive(Debug, Clone)]
pub enum Translation {
    None,
    Present {
        folio: Arc<Folio>,
        index: usize,
        bits: PteBits,
    },
    Huge {
        folio: Arc<Folio>,
        bits: PteBits,
    },
    Swap(SwapEntry),
    Marker(Marker),
}

/// The page-table tree of one address space.
pub struct PageTables {
    root: SpinLock<PageMapLevel4>,
    counters: RssCounters,
}

impl Default for PageTables {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTables {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: SpinLock::new(PageMapLevel4::new()),
            counters: RssCounters::default(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn counters(&self) -> &RssCounters {
        &self.counters
    }

    pub(crate) const fn root(&self) -> &SpinLock<PageMapLevel4> {
        &self.root
    }

    /// Run `f` on the middle-level slot covering `va`.
    ///
    /// Returns `None` if the slot does not exist (and `alloc` is false) or an
    /// upper-level huge leaf covers `va`.
    pub fn with_pmd<R>(
        &self,
        va: VirtualAddress,
        alloc: bool,
        f: impl FnOnce(&mut PmdEntry) -> R,
    ) -> Option<R> {
        let mut root = self.root.lock();
        root.pmd_mut(va, alloc).map(f)
    }

    /// Run `f` on the upper-level slot covering `va`, allocating the path if asked.
    pub fn with_pud<R>(
        &self,
        va: VirtualAddress,
        alloc: bool,
        f: impl FnOnce(&mut PudEntry) -> R,
    ) -> Option<R> {
        let mut root = self.root.lock();
        root.pud_mut(va, alloc).map(f)
    }

    /// The leaf table covering `va`, allocating the path if asked.
    #[must_use]
    pub fn leaf_table(&self, va: VirtualAddress, alloc: bool) -> Option<LeafTable> {
        let mut root = self.root.lock();
        let pmd = root.pmd_mut(va, alloc)?;
        pmd_populate(pmd, alloc)
    }

    /// Run `f` on the locked leaf table covering `va`.
    ///
    /// Retries if the table is unlinked between lookup and locking.
    pub fn with_leaf<R>(
        &self,
        va: VirtualAddress,
        alloc: bool,
        mut f: impl FnMut(&mut PageTable) -> R,
    ) -> Option<R> {
        loop {
            let table = self.leaf_table(va, alloc)?;
            let mut guard = table.lock();
            if !guard.is_detached() {
                return Some(f(&mut guard));
            }
        }
    }

    /// Store `entry` for `va`, returning the previous entry.
    ///
    /// Fails with `entry` handed back if a huge leaf covers `va`.
    pub fn set_pte(&self, va: VirtualAddress, entry: PtEntry) -> Result<PtEntry, PtEntry> {
        let mut entry = Some(entry);
        let old = self.with_leaf(va, true, |table| {
            let e = entry.take().unwrap_or_default();
            table.set(TableIndex::l1(va), e)
        });
        match (old, entry) {
            (Some(old), _) => Ok(old),
            (None, Some(entry)) => Err(entry),
            (None, None) => Ok(PtEntry::None),
        }
    }

    /// Look up the translation of `va` without changing anything.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Translation {
        let table = {
            let mut root = self.root.lock();
            let Some(pud) = root.pud_mut(va, false) else {
                return Translation::None;
            };
            if let PudEntry::Huge(leaf) = pud {
                return Translation::Huge {
                    folio: Arc::clone(leaf.folio()),
                    bits: leaf.bits(),
                };
            }
            let Some(pmd) = pmd_in(pud, va) else {
                return Translation::None;
            };
            match pmd {
                PmdEntry::None => return Translation::None,
                PmdEntry::Huge(leaf) => {
                    return Translation::Huge {
                        folio: Arc::clone(leaf.folio()),
                        bits: leaf.bits(),
                    };
                }
                PmdEntry::Table(table) => Arc::clone(table),
            }
        };
        let guard = table.lock();
        match guard.get(TableIndex::l1(va)) {
            PtEntry::None => Translation::None,
            PtEntry::Present(pte) => Translation::Present {
                folio: Arc::clone(pte.folio()),
                index: pte.index(),
                bits: pte.bits(),
            },
            PtEntry::Swap(entry) => Translation::Swap(*entry),
            PtEntry::Marker(marker) => Translation::Marker(*marker),
        }
    }

    /// Unlink leaf tables in `[start, end)` that no longer hold any entry.
    ///
    /// Returns the number of tables freed.
    pub fn free_empty_tables(&self, start: VirtualAddress, end: VirtualAddress) -> usize {
        let mut freed = 0;
        let mut addr = start;
        while addr < end {
            let next = addr.next_boundary(crate::info::PMD_SIZE, end);
            let mut root = self.root.lock();
            if let Some(pmd) = root.pmd_mut(addr, false) {
                let unlink = match pmd {
                    PmdEntry::Table(table) => table.try_lock().is_some_and(|mut t| {
                        let empty = t.is_empty();
                        if empty {
                            t.detached = true;
                        }
                        empty
                    }),
                    _ => false,
                };
                if unlink {
                    *pmd = PmdEntry::None;
                    freed += 1;
                }
            }
            drop(root);
            addr = next;
        }
        freed
    }
}
