//! # Generic page-table walk
//!
//! [`PageTables::walk`] visits every populated entry of a virtual range
//! top-down and hands it to a [`PageWalkOps`] visitor:
//!
//! * `pud_entry` once per upper-level entry reached,
//! * `pmd_entry` once per middle-level entry reached,
//! * `pte_entry` for every non-empty leaf entry,
//! * `install_pte` for every empty leaf slot, if the visitor
//!   [installs](PageWalkOps::installs) entries. Installing visitors also get
//!   missing intermediate tables allocated for them.
//!
//! Upper- and middle-level callbacks run under the page-table lock of the
//! address space, leaf callbacks under the lock of the leaf table.
//!
//! Every [`RECLAIM_BATCH`] leaf slots the walker checks whether the scheduler
//! wants the processor back. If so it drops the leaf lock, yields, and carries
//! on from the current address. Visitors must therefore be idempotent per
//! address.

use crate::addr::{Size1G, TableIndex, VirtualAddress};
use crate::batch::{Batch, folio_pte_batch, swap_pte_batch};
use crate::entry::PtEntry;
use crate::folio::{FolioLock, SplitError};
use crate::info::{P4D_SIZE, PMD_SIZE, PUD_SIZE, RECLAIM_BATCH, USER_VA_END};
use crate::table::{
    LeafTable, PageTable, PageTables, PmdEntry, PudEntry, pmd_in, pmd_populate, pud_populate,
};
use alloc::sync::Arc;
use core::ops::Range;
use kernel_sync::{Resched, SpinLockGuard};

/// What an upper- or middle-level callback wants the walker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Descend into the entry (if it is a table).
    Continue,
    /// Treat the subtree as handled.
    Skip,
    /// Stop the walk: the caller has to resolve state the visitor cannot.
    Escalate,
}

/// What a leaf callback wants the walker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteAction {
    /// Move on by this many entries (at least one).
    Next(usize),
    /// Look at the same entry again, for example after splitting its folio.
    Again,
    /// Stop the walk: the caller has to resolve state the visitor cannot.
    Escalate,
}

/// How a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WalkOutcome {
    Completed,
    /// A callback escalated at this address.
    Escalated(VirtualAddress),
}

/// Per-level visitor of a page-table walk.
pub trait PageWalkOps {
    type Error;

    /// Whether empty leaf slots are offered to [`install_pte`](Self::install_pte).
    fn installs(&self) -> bool {
        false
    }

    fn pud_entry(
        &mut self,
        _pud: &mut PudEntry,
        _range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Self::Error> {
        Ok(WalkAction::Continue)
    }

    fn pmd_entry(
        &mut self,
        _pmd: &mut PmdEntry,
        _range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Self::Error> {
        Ok(WalkAction::Continue)
    }

    fn pte_entry(&mut self, _leaf: &mut LeafCursor<'_>) -> Result<PteAction, Self::Error> {
        Ok(PteAction::Next(1))
    }

    /// Produce an entry for the empty slot at `addr`, if any.
    fn install_pte(&mut self, _addr: VirtualAddress) -> Result<Option<PtEntry>, Self::Error> {
        Ok(None)
    }
}

/// A locked leaf table positioned at one entry.
pub struct LeafCursor<'a> {
    table: &'a mut PageTable,
    addr: VirtualAddress,
    end: VirtualAddress,
}

impl LeafCursor<'_> {
    /// Address of the current entry.
    #[inline]
    #[must_use]
    pub const fn addr(&self) -> VirtualAddress {
        self.addr
    }

    /// End of the walked range inside this table.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Entries from the current one to the end of the range in this table.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.addr.pages_until(self.end)
    }

    #[inline]
    fn index(&self) -> usize {
        TableIndex::l1(self.addr).as_usize()
    }

    #[inline]
    #[must_use]
    pub fn entry(&self) -> &PtEntry {
        self.table.get(TableIndex::l1(self.addr))
    }

    #[inline]
    pub fn entry_mut(&mut self) -> &mut PtEntry {
        self.table.get_mut(TableIndex::l1(self.addr))
    }

    /// The `nr` entries starting at the current one.
    pub fn entries_mut(&mut self, nr: usize) -> &mut [PtEntry] {
        debug_assert!(nr <= self.remaining());
        let i = self.index();
        &mut self.table.entries_mut()[i..i + nr]
    }

    /// The folio run starting at the current entry, see [`folio_pte_batch`].
    #[must_use]
    pub fn batch(&self) -> Option<Batch> {
        let i = self.index();
        folio_pte_batch(&self.table.entries()[i..i + self.remaining()])
    }

    /// The swap run starting at the current entry, see [`swap_pte_batch`].
    #[must_use]
    pub fn swap_batch(&self) -> usize {
        let i = self.index();
        swap_pte_batch(&self.table.entries()[i..i + self.remaining()])
    }

    /// Split the large folio mapped by the current entry into single pages.
    pub fn split_folio(&mut self, lock: &FolioLock<'_>) -> Result<(), SplitError> {
        self.table.split_folio(TableIndex::l1(self.addr), lock)
    }
}

enum LeafOutcome {
    Done,
    Escalated(VirtualAddress),
    /// The table was unlinked while unlocked; look it up again from here.
    Detached(VirtualAddress),
}

enum Step {
    Skip(VirtualAddress),
    Leaf(LeafTable, VirtualAddress),
    Escalate(VirtualAddress),
}

impl PageTables {
    /// Walk `[start, end)` with `ops`. See the [module documentation](self).
    pub fn walk<O, S>(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        ops: &mut O,
        sched: &S,
    ) -> Result<WalkOutcome, O::Error>
    where
        O: PageWalkOps + ?Sized,
        S: Resched + ?Sized,
    {
        debug_assert!(end.as_u64() <= USER_VA_END);
        let installs = ops.installs();
        let mut addr = start;
        let mut visited_pud = None;

        while addr < end {
            let step = self.descend(addr, end, installs, &mut visited_pud, ops)?;
            match step {
                Step::Skip(next) => addr = next,
                Step::Escalate(at) => return Ok(WalkOutcome::Escalated(at)),
                Step::Leaf(table, leaf_end) => {
                    match walk_leaf(&table, addr, leaf_end, ops, sched)? {
                        LeafOutcome::Done => addr = leaf_end,
                        LeafOutcome::Escalated(at) => return Ok(WalkOutcome::Escalated(at)),
                        LeafOutcome::Detached(at) => addr = at,
                    }
                }
            }
        }
        Ok(WalkOutcome::Completed)
    }

    /// Resolve the upper levels for `addr` under the page-table lock.
    fn descend<O>(
        &self,
        addr: VirtualAddress,
        end: VirtualAddress,
        installs: bool,
        visited_pud: &mut Option<VirtualAddress>,
        ops: &mut O,
    ) -> Result<Step, O::Error>
    where
        O: PageWalkOps + ?Sized,
    {
        let mut root = self.root().lock();
        let Some(pud) = root.pud_mut(addr, installs) else {
            return Ok(Step::Skip(addr.next_boundary(P4D_SIZE, end)));
        };

        let pud_end = addr.next_boundary(PUD_SIZE, end);
        if matches!(pud, PudEntry::None) && !installs {
            return Ok(Step::Skip(pud_end));
        }
        let pud_base = addr.align_down::<Size1G>();
        if *visited_pud != Some(pud_base) {
            *visited_pud = Some(pud_base);
            match ops.pud_entry(pud, addr..pud_end)? {
                WalkAction::Continue => {}
                WalkAction::Skip => return Ok(Step::Skip(pud_end)),
                WalkAction::Escalate => return Ok(Step::Escalate(addr)),
            }
        }
        if !pud_populate(pud, installs) {
            return Ok(Step::Skip(pud_end));
        }
        let Some(pmd) = pmd_in(pud, addr) else {
            return Ok(Step::Skip(pud_end));
        };

        let pmd_end = addr.next_boundary(PMD_SIZE, end);
        if pmd.is_none() {
            if !installs {
                return Ok(Step::Skip(pmd_end));
            }
            let _ = pmd_populate(pmd, true);
        }
        match ops.pmd_entry(pmd, addr..pmd_end)? {
            WalkAction::Continue => {}
            WalkAction::Skip => return Ok(Step::Skip(pmd_end)),
            WalkAction::Escalate => return Ok(Step::Escalate(addr)),
        }
        match pmd {
            PmdEntry::Table(table) => Ok(Step::Leaf(Arc::clone(table), pmd_end)),
            PmdEntry::None | PmdEntry::Huge(_) => Ok(Step::Skip(pmd_end)),
        }
    }
}

fn walk_leaf<O, S>(
    table: &LeafTable,
    start: VirtualAddress,
    end: VirtualAddress,
    ops: &mut O,
    sched: &S,
) -> Result<LeafOutcome, O::Error>
where
    O: PageWalkOps + ?Sized,
    S: Resched + ?Sized,
{
    let installs = ops.installs();
    let mut guard = table.lock();
    if guard.is_detached() {
        return Ok(LeafOutcome::Detached(start));
    }

    let mut addr = start;
    let mut since_checkpoint = 0;
    while addr < end {
        if since_checkpoint == RECLAIM_BATCH {
            since_checkpoint = 0;
            if sched.need_resched() {
                SpinLockGuard::unlocked(&mut guard, || sched.cond_resched());
                if guard.is_detached() {
                    return Ok(LeafOutcome::Detached(addr));
                }
            }
        }
        since_checkpoint += 1;

        let index = TableIndex::l1(addr);
        if guard.get(index).is_none() {
            if installs && let Some(entry) = ops.install_pte(addr)? {
                guard.set(index, entry);
            }
            addr = addr.add_pages(1);
            continue;
        }

        let mut cursor = LeafCursor {
            table: &mut *guard,
            addr,
            end,
        };
        match ops.pte_entry(&mut cursor)? {
            PteAction::Next(nr) => {
                debug_assert!(nr > 0 && nr <= addr.pages_until(end));
                addr = addr.add_pages(nr.max(1));
            }
            PteAction::Again => {}
            PteAction::Escalate => return Ok(LeafOutcome::Escalated(addr)),
        }
    }
    Ok(LeafOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{HugeLeaf, Marker, PresentPte};
    use crate::info::PAGE_SIZE;
    use crate::{Folio, FolioKind, FrameNumber, PteBits};
    use core::convert::Infallible;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use kernel_sync::NeverResched;

    #[derive(Default)]
    struct Census {
        leaves: alloc::vec::Vec<VirtualAddress>,
        pmds: usize,
    }

    impl PageWalkOps for Census {
        type Error = Infallible;

        fn pmd_entry(
            &mut self,
            _pmd: &mut PmdEntry,
            _range: Range<VirtualAddress>,
        ) -> Result<WalkAction, Infallible> {
            self.pmds += 1;
            Ok(WalkAction::Continue)
        }

        fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, Infallible> {
            self.leaves.push(leaf.addr());
            Ok(PteAction::Next(1))
        }
    }

    fn guard_at(pt: &PageTables, va: u64) {
        pt.set_pte(VirtualAddress::new(va), PtEntry::Marker(Marker::Guard))
            .unwrap();
    }

    #[test]
    fn visits_only_populated_entries_in_range() {
        let pt = PageTables::new();
        guard_at(&pt, 0x1000);
        guard_at(&pt, 0x3000);
        guard_at(&pt, 0x40_0000);
        guard_at(&pt, 0x80_0000);

        let mut census = Census::default();
        let outcome = pt
            .walk(
                VirtualAddress::new(0x2000),
                VirtualAddress::new(0x80_0000),
                &mut census,
                &NeverResched,
            )
            .unwrap();
        assert_eq!(outcome, WalkOutcome::Completed);
        assert_eq!(
            census.leaves,
            [VirtualAddress::new(0x3000), VirtualAddress::new(0x40_0000)]
        );
        assert_eq!(census.pmds, 2);
    }

    struct Installer;

    impl PageWalkOps for Installer {
        type Error = Infallible;

        fn installs(&self) -> bool {
            true
        }

        fn install_pte(&mut self, _addr: VirtualAddress) -> Result<Option<PtEntry>, Infallible> {
            Ok(Some(PtEntry::Marker(Marker::Guard)))
        }
    }

    #[test]
    fn installing_walk_allocates_tables() {
        let pt = PageTables::new();
        let start = VirtualAddress::new(0x1F_E000);
        let end = VirtualAddress::new(0x20_2000);
        pt.walk(start, end, &mut Installer, &NeverResched).unwrap();
        for va in (start.as_u64()..end.as_u64()).step_by(PAGE_SIZE as usize) {
            assert!(matches!(
                pt.translate(VirtualAddress::new(va)),
                crate::Translation::Marker(Marker::Guard)
            ));
        }
        assert!(matches!(pt.translate(end), crate::Translation::None));
    }

    struct EscalateOnHuge;

    impl PageWalkOps for EscalateOnHuge {
        type Error = Infallible;

        fn pmd_entry(
            &mut self,
            pmd: &mut PmdEntry,
            _range: Range<VirtualAddress>,
        ) -> Result<WalkAction, Infallible> {
            Ok(if pmd.huge().is_some() {
                WalkAction::Escalate
            } else {
                WalkAction::Continue
            })
        }
    }

    #[test]
    fn callbacks_can_escalate() {
        let pt = PageTables::new();
        let folio = Folio::new(FrameNumber::new(0), 9, FolioKind::Anonymous);
        pt.with_pmd(VirtualAddress::new(0x20_0000), true, |pmd| {
            *pmd = PmdEntry::Huge(HugeLeaf::new(folio, PteBits::user_page(true)));
        })
        .unwrap();
        guard_at(&pt, 0x1000);

        let outcome = pt
            .walk(
                VirtualAddress::new(0),
                VirtualAddress::new(0x40_0000),
                &mut EscalateOnHuge,
                &NeverResched,
            )
            .unwrap();
        assert_eq!(outcome, WalkOutcome::Escalated(VirtualAddress::new(0x20_0000)));
    }

    struct CountingResched {
        asked: AtomicUsize,
        yielded: AtomicUsize,
    }

    impl Resched for CountingResched {
        fn need_resched(&self) -> bool {
            self.asked.fetch_add(1, Ordering::Relaxed);
            true
        }

        fn cond_resched(&self) {
            self.yielded.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn yields_every_batch() {
        let pt = PageTables::new();
        let folio = Folio::new(FrameNumber::new(0), 0, FolioKind::Anonymous);
        for i in 0..100u64 {
            pt.set_pte(
                VirtualAddress::new(i * PAGE_SIZE),
                PtEntry::Present(PresentPte::new(
                    Arc::clone(&folio),
                    0,
                    PteBits::user_page(true),
                )),
            )
            .unwrap();
        }
        let sched = CountingResched {
            asked: AtomicUsize::new(0),
            yielded: AtomicUsize::new(0),
        };
        let mut census = Census::default();
        pt.walk(
            VirtualAddress::new(0),
            VirtualAddress::new(100 * PAGE_SIZE),
            &mut census,
            &sched,
        )
        .unwrap();
        assert_eq!(census.leaves.len(), 100);
        assert_eq!(sched.yielded.load(Ordering::Relaxed), 100 / RECLAIM_BATCH);
    }
}
