//! `Cold` and `Pageout`: age the pages of a range so reclaim picks them
//! first, or isolate them and reclaim them right away.
//!
//! Only folios this address space maps exclusively are touched; shared ones
//! belong to someone else's working set too.

use crate::backend::{Reclaimer, Task};
use crate::behavior::Behavior;
use crate::dispatch::{Request, Target, Visit};
use crate::error::AdviseError;
use crate::mapping::{Mapping, VmFlags};
use crate::space::MmapGuard;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_vmem::info::ENTRIES_PER_TABLE;
use kernel_vmem::{
    Folio, FolioFlags, LeafCursor, PageWalkOps, PmdEntry, PteAction, PtEntry, VirtualAddress,
    WalkAction, WalkOutcome,
};
use log::trace;

pub(crate) fn cold_or_pageout(
    req: &Request<'_>,
    guard: &mut MmapGuard<'_>,
    target: Target,
) -> Result<Visit, AdviseError> {
    let mapping = guard
        .tree()
        .get(target.mapping)
        .ok_or(AdviseError::NoMapping)?;
    if !can_age(mapping) {
        return Err(AdviseError::InvalidArgument);
    }
    let pageout = req.behavior == Behavior::Pageout;
    let file_pageout = mapping
        .backing()
        .file()
        .is_none_or(|file| file.may_pageout());
    // Shared file pages the caller may not write stay where they are.
    if pageout && !file_pageout && mapping.flags().contains(VmFlags::MAYSHARE) {
        return Ok(Visit::Continue(target.end));
    }

    let reclaimer = req.advisor.reclaimer;
    reclaimer.drain();
    let mut ops = Aging {
        pageout,
        anon_only: pageout && !file_pageout,
        task: req.task,
        reclaimer,
        isolated: Vec::new(),
        aged: 0,
    };
    let walked = req
        .space
        .page_tables()
        .walk(target.start, target.end, &mut ops, req.task);
    trace!(
        "{:?} {}..{}: {} folios aged, {} isolated",
        req.behavior,
        target.start,
        target.end,
        ops.aged,
        ops.isolated.len()
    );
    // Folios isolated before an interruption still go to reclaim.
    if !ops.isolated.is_empty() {
        reclaimer.reclaim(core::mem::take(&mut ops.isolated));
    }
    let outcome = walked?;
    debug_assert_eq!(outcome, WalkOutcome::Completed);
    Ok(Visit::Continue(target.end))
}

/// Locked, raw-frame and huge-page mappings are not on the LRU.
fn can_age(mapping: &Mapping) -> bool {
    !mapping
        .flags()
        .intersects(VmFlags::LOCKED | VmFlags::PFNMAP | VmFlags::HUGETLB)
}

struct Aging<'a> {
    pageout: bool,
    /// Page out anonymous folios only; set for private mappings of files
    /// the caller may not write.
    anon_only: bool,
    task: &'a dyn Task,
    reclaimer: &'a dyn Reclaimer,
    isolated: Vec<Arc<Folio>>,
    aged: usize,
}

impl Aging<'_> {
    /// Age one folio that is fully mapped by the range.
    fn age(&mut self, folio: &Arc<Folio>) {
        folio.clear(FolioFlags::REFERENCED);
        folio.test_and_clear(FolioFlags::YOUNG);
        if folio.test(FolioFlags::ACTIVE) {
            folio.set(FolioFlags::WORKINGSET);
        }
        self.aged += 1;
        if !self.pageout {
            self.reclaimer.deactivate(folio);
        } else if self.reclaimer.isolate(folio) {
            if folio.test(FolioFlags::UNEVICTABLE) {
                self.reclaimer.putback(folio);
            } else {
                self.isolated.push(Arc::clone(folio));
            }
        }
    }

    fn skips(&self, folio: &Folio) -> bool {
        self.anon_only && !folio.is_anon()
    }
}

impl PageWalkOps for Aging<'_> {
    type Error = AdviseError;

    fn pmd_entry(
        &mut self,
        pmd: &mut PmdEntry,
        range: Range<VirtualAddress>,
    ) -> Result<WalkAction, AdviseError> {
        if self.task.fatal_signal_pending() {
            return Err(AdviseError::Interrupted);
        }
        let Some(leaf) = pmd.huge_mut() else {
            return Ok(WalkAction::Continue);
        };
        let folio = Arc::clone(leaf.folio());
        if folio.likely_mapped_shared() || self.skips(&folio) {
            return Ok(WalkAction::Skip);
        }
        if range.start.pages_until(range.end) != ENTRIES_PER_TABLE {
            let Some(lock) = folio.try_lock() else {
                return Ok(WalkAction::Skip);
            };
            let split = pmd.split_huge();
            drop(lock);
            return Ok(if split {
                WalkAction::Continue
            } else {
                WalkAction::Skip
            });
        }
        let bits = leaf.bits();
        if !self.pageout && bits.young() {
            leaf.set_bits(bits.with_young(false));
        }
        self.age(&folio);
        Ok(WalkAction::Skip)
    }

    fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, AdviseError> {
        let Some(folio) = leaf.entry().present().map(|pte| Arc::clone(pte.folio())) else {
            return Ok(PteAction::Next(1));
        };
        let Some(batch) = leaf.batch() else {
            return Ok(PteAction::Next(1));
        };
        let nr = batch.nr;

        if folio.is_large() && nr < folio.nr_pages() {
            if folio.likely_mapped_shared() || self.skips(&folio) {
                return Ok(PteAction::Next(nr));
            }
            let Some(lock) = folio.try_lock() else {
                return Ok(PteAction::Next(nr));
            };
            return Ok(match leaf.split_folio(&lock) {
                Ok(()) => PteAction::Again,
                Err(e) => {
                    trace!("cannot split {folio:?} at {}: {e}", leaf.addr());
                    PteAction::Next(nr)
                }
            });
        }

        if !folio.test(FolioFlags::LRU) || folio.mapcount() != folio.nr_pages() {
            return Ok(PteAction::Next(nr));
        }
        if self.skips(&folio) {
            return Ok(PteAction::Next(nr));
        }
        if !self.pageout && batch.any_young {
            for e in leaf.entries_mut(nr) {
                if let PtEntry::Present(pte) = e {
                    pte.set_bits(pte.bits().with_young(false));
                }
            }
        }
        self.age(&folio);
        Ok(PteAction::Next(nr))
    }
}
