//! Discarding memory: `DontNeed` zaps the range at once, `Free` marks
//! anonymous pages lazily freeable so reclaim can drop them without writing
//! them out, and [`reclaim_lazyfree`] is that reclaim step.

use crate::behavior::Behavior;
use crate::dispatch::{Request, Target, Visit};
use crate::error::AdviseError;
use crate::mapping::{Mapping, VmFlags};
use crate::space::{AddressSpace, MmapGuard};
use alloc::sync::Arc;
use core::convert::Infallible;
use core::ops::Range;
use kernel_sync::Resched;
use kernel_vmem::info::ENTRIES_PER_TABLE;
use kernel_vmem::{
    FolioFlags, LeafCursor, Marker, PageWalkOps, PmdEntry, PteAction, PtEntry, RssCounters,
    RssKind, SwapBackend, VirtualAddress, WalkAction, ZapDetails,
};
use log::trace;

pub(crate) fn dontneed_or_free(
    req: &Request<'_>,
    guard: &mut MmapGuard<'_>,
    target: Target,
) -> Result<Visit, AdviseError> {
    let mapping = guard
        .tree()
        .get(target.mapping)
        .ok_or(AdviseError::NoMapping)?;
    let end = valid_end(mapping, target.start, target.end, req.behavior)?;
    if target.start == end {
        return Ok(Visit::Continue(target.end));
    }
    let advisor = req.advisor;
    let pt = req.space.page_tables();
    match req.behavior {
        Behavior::Free => {
            if !mapping.is_anonymous() {
                return Err(AdviseError::InvalidArgument);
            }
            advisor.reclaimer.drain();
            let mut ops = LazyFree {
                swap: advisor.swap,
                nr_swap: 0,
                marked: 0,
            };
            let Ok(_) = pt.walk(target.start, end, &mut ops, req.task);
            pt.counters().add(RssKind::Swap, ops.nr_swap);
            trace!(
                "free {}..{end}: {} pages lazy, {} swap slots released",
                target.start,
                ops.marked,
                -ops.nr_swap
            );
        }
        _ => {
            let details = ZapDetails {
                even_cows: true,
                keep_guards: true,
                reclaim_tables: true,
            };
            let stats = pt.zap_range(target.start, end, details, advisor.swap, req.task);
            trace!("dontneed {}..{end}: {stats:?}", target.start);
        }
    }
    Ok(Visit::Continue(target.end))
}

/// Check that `mapping` may be discarded and return the end of the part
/// that is. Huge-page mappings only discard whole pages: the start must be
/// aligned and the end is rounded down.
fn valid_end(
    mapping: &Mapping,
    start: VirtualAddress,
    end: VirtualAddress,
    behavior: Behavior,
) -> Result<VirtualAddress, AdviseError> {
    let flags = mapping.flags();
    if !mapping.is_hugetlb() {
        let mut forbidden = VmFlags::PFNMAP;
        if behavior != Behavior::DontNeedLocked {
            forbidden |= VmFlags::LOCKED;
        }
        if flags.intersects(forbidden) {
            return Err(AdviseError::InvalidArgument);
        }
        return Ok(end);
    }
    if !matches!(behavior, Behavior::DontNeed | Behavior::DontNeedLocked) {
        return Err(AdviseError::InvalidArgument);
    }
    let size = mapping.page_size();
    if start.as_u64() & (size - 1) != 0 {
        return Err(AdviseError::InvalidArgument);
    }
    let rounded = VirtualAddress::new(end.as_u64() & !(size - 1));
    Ok(rounded.max(start))
}

struct LazyFree<'a> {
    swap: &'a dyn SwapBackend,
    nr_swap: isize,
    marked: usize,
}

impl PageWalkOps for LazyFree<'_> {
    type Error = Infallible;

    fn pmd_entry(
        &mut self,
        pmd: &mut PmdEntry,
        range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Infallible> {
        let Some(leaf) = pmd.huge_mut() else {
            return Ok(WalkAction::Continue);
        };
        let folio = Arc::clone(leaf.folio());
        if folio.entire_mapcount() != 1 || folio.pte_mapcount() != 0 {
            return Ok(WalkAction::Skip);
        }
        if range.start.pages_until(range.end) != ENTRIES_PER_TABLE {
            let _ = pmd.split_huge();
            return Ok(WalkAction::Continue);
        }
        let Some(lock) = folio.try_lock() else {
            return Ok(WalkAction::Skip);
        };
        folio.clear(FolioFlags::DIRTY);
        drop(lock);
        let bits = leaf.bits();
        if bits.young() || bits.dirty() {
            leaf.set_bits(bits.mkold_clean());
        }
        if folio.mark_lazyfree() {
            self.marked += folio.nr_pages();
        }
        Ok(WalkAction::Skip)
    }

    fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, Infallible> {
        let folio = match leaf.entry() {
            PtEntry::None | PtEntry::Marker(Marker::Guard) => return Ok(PteAction::Next(1)),
            PtEntry::Marker(Marker::Poisoned) => {
                leaf.entry_mut().take();
                return Ok(PteAction::Next(1));
            }
            PtEntry::Swap(entry) => {
                let entry = *entry;
                let nr = leaf.swap_batch();
                self.swap.free_swap_slots(entry, nr);
                for e in leaf.entries_mut(nr) {
                    e.take();
                }
                #[allow(clippy::cast_possible_wrap)]
                let freed = nr as isize;
                self.nr_swap -= freed;
                return Ok(PteAction::Next(nr));
            }
            PtEntry::Present(pte) => Arc::clone(pte.folio()),
        };
        let Some(batch) = leaf.batch() else {
            return Ok(PteAction::Next(1));
        };
        let nr = batch.nr;

        if folio.is_large() && nr < folio.nr_pages() {
            if folio.likely_mapped_shared() {
                return Ok(PteAction::Next(nr));
            }
            let Some(lock) = folio.try_lock() else {
                return Ok(PteAction::Next(nr));
            };
            return Ok(match leaf.split_folio(&lock) {
                Ok(()) => PteAction::Again,
                Err(e) => {
                    trace!("free: cannot split {folio:?} at {}: {e}", leaf.addr());
                    PteAction::Next(nr)
                }
            });
        }

        // Only a folio this address space maps exclusively may be retagged.
        if folio.mapcount() != folio.nr_pages() {
            return Ok(PteAction::Next(nr));
        }
        if folio.test(FolioFlags::SWAPCACHE) || folio.test(FolioFlags::DIRTY) {
            let Some(lock) = folio.try_lock() else {
                return Ok(PteAction::Next(nr));
            };
            if !self.swap.is_swap_cache_reclaimable(&folio) {
                return Ok(PteAction::Next(nr));
            }
            folio.clear(FolioFlags::DIRTY);
            drop(lock);
        }
        if batch.any_young || batch.any_dirty {
            for e in leaf.entries_mut(nr) {
                if let Some(pte) = e.present_mut() {
                    pte.set_bits(pte.bits().mkold_clean());
                }
            }
        }
        if folio.mark_lazyfree() {
            self.marked += nr;
        }
        Ok(PteAction::Next(nr))
    }
}

/// Drop lazily freeable pages in `range` that were neither written nor
/// accessed since they were marked. Returns the number of pages dropped.
///
/// Pages written again are turned back into ordinary anonymous memory.
pub(crate) fn reclaim_lazyfree<S: Resched + ?Sized>(
    space: &AddressSpace,
    range: Range<VirtualAddress>,
    sched: &S,
) -> usize {
    let mut ops = LazyFreeReclaim {
        counters: space.counters(),
        freed: 0,
    };
    let Ok(_) = space
        .page_tables()
        .walk(range.start, range.end, &mut ops, sched);
    trace!("reclaimed {} lazy-free pages in {}..{}", ops.freed, range.start, range.end);
    ops.freed
}

struct LazyFreeReclaim<'a> {
    counters: &'a RssCounters,
    freed: usize,
}

impl PageWalkOps for LazyFreeReclaim<'_> {
    type Error = Infallible;

    fn pmd_entry(
        &mut self,
        pmd: &mut PmdEntry,
        _range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Infallible> {
        let Some(leaf) = pmd.huge() else {
            return Ok(WalkAction::Continue);
        };
        let folio = Arc::clone(leaf.folio());
        let bits = leaf.bits();
        if !folio.is_lazyfree() || folio.entire_mapcount() != 1 || folio.pte_mapcount() != 0 {
            return Ok(WalkAction::Skip);
        }
        if bits.dirty() || folio.test(FolioFlags::DIRTY) {
            folio.set(FolioFlags::SWAPBACKED);
            return Ok(WalkAction::Skip);
        }
        if bits.young() {
            return Ok(WalkAction::Skip);
        }
        let Some(lock) = folio.try_lock() else {
            return Ok(WalkAction::Skip);
        };
        *pmd = PmdEntry::None;
        drop(lock);
        let _ = folio.isolate_lru();
        #[allow(clippy::cast_possible_wrap)]
        self.counters.add(RssKind::Anon, -(folio.nr_pages() as isize));
        self.freed += folio.nr_pages();
        Ok(WalkAction::Skip)
    }

    fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, Infallible> {
        let Some(folio) = leaf.entry().present().map(|pte| Arc::clone(pte.folio())) else {
            return Ok(PteAction::Next(1));
        };
        let Some(batch) = leaf.batch() else {
            return Ok(PteAction::Next(1));
        };
        let nr = batch.nr;
        if !folio.is_lazyfree() || nr != folio.nr_pages() || folio.mapcount() != nr {
            return Ok(PteAction::Next(nr));
        }
        if batch.any_dirty || folio.test(FolioFlags::DIRTY) {
            folio.set(FolioFlags::SWAPBACKED);
            return Ok(PteAction::Next(nr));
        }
        if batch.any_young {
            return Ok(PteAction::Next(nr));
        }
        let Some(lock) = folio.try_lock() else {
            return Ok(PteAction::Next(nr));
        };
        for e in leaf.entries_mut(nr) {
            e.take();
        }
        drop(lock);
        let _ = folio.isolate_lru();
        #[allow(clippy::cast_possible_wrap)]
        self.counters
            .add(RssCounters::kind_of(&folio), -(nr as isize));
        self.freed += nr;
        Ok(PteAction::Next(nr))
    }
}
