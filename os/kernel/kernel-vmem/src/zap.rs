//! # Zapping
//!
//! Tears down every mapping in a range: present pages are unmapped (their
//! dirty and access state handed to the folio), swap slots are released, and
//! poison markers dropped. Guard markers survive unless asked otherwise, so
//! discarding memory never removes a guard region.

use crate::addr::VirtualAddress;
use crate::counters::{RssCounters, RssKind};
use crate::entry::{Marker, PtEntry};
use crate::folio::FolioFlags;
use crate::info::ENTRIES_PER_TABLE;
use crate::swap::SwapBackend;
use crate::table::{PageTables, PmdEntry, PudEntry};
use crate::walk::{LeafCursor, PageWalkOps, PteAction, WalkAction};
use core::convert::Infallible;
use core::ops::Range;
use kernel_sync::Resched;
use log::trace;

/// Knobs of a zap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZapDetails {
    /// Also unmap anonymous copy-on-write pages of file mappings (and swap
    /// entries). Off only for page-cache truncation, which must keep private
    /// copies intact.
    pub even_cows: bool,
    /// Leave guard markers in place.
    pub keep_guards: bool,
    /// Unlink leaf tables that end up empty.
    pub reclaim_tables: bool,
}

impl Default for ZapDetails {
    fn default() -> Self {
        Self {
            even_cows: true,
            keep_guards: true,
            reclaim_tables: false,
        }
    }
}

/// What a zap removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZapStats {
    /// Base pages unmapped.
    pub pages: usize,
    /// Swap slots released.
    pub swap_entries: usize,
    /// Markers cleared.
    pub markers: usize,
    /// Leaf tables unlinked.
    pub tables: usize,
}

struct Zapper<'a> {
    details: ZapDetails,
    swap: &'a dyn SwapBackend,
    counters: &'a RssCounters,
    stats: ZapStats,
}

impl Zapper<'_> {
    fn drop_huge(&mut self, leaf: &crate::HugeLeaf) {
        let folio = leaf.folio();
        let bits = leaf.bits();
        if bits.dirty() {
            folio.set(FolioFlags::DIRTY);
        }
        if bits.young() {
            folio.set(FolioFlags::REFERENCED);
        }
        self.stats.pages += folio.nr_pages();
        #[allow(clippy::cast_possible_wrap)]
        self.counters
            .add(RssCounters::kind_of(folio), -(folio.nr_pages() as isize));
    }
}

impl PageWalkOps for Zapper<'_> {
    type Error = Infallible;

    fn pud_entry(
        &mut self,
        pud: &mut PudEntry,
        range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Infallible> {
        let PudEntry::Huge(leaf) = pud else {
            return Ok(WalkAction::Continue);
        };
        // Upper-level leaves cannot be split; partial zaps leave them alone.
        if range.end - range.start != leaf.folio().size() {
            return Ok(WalkAction::Skip);
        }
        self.drop_huge(leaf);
        *pud = PudEntry::None;
        Ok(WalkAction::Skip)
    }

    fn pmd_entry(
        &mut self,
        pmd: &mut PmdEntry,
        range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Infallible> {
        let Some(leaf) = pmd.huge() else {
            return Ok(WalkAction::Continue);
        };
        if !self.details.even_cows && leaf.folio().is_anon() {
            return Ok(WalkAction::Skip);
        }
        if range.start.pages_until(range.end) == ENTRIES_PER_TABLE {
            self.drop_huge(leaf);
            *pmd = PmdEntry::None;
            return Ok(WalkAction::Skip);
        }
        // Partially covered: continue on a leaf table mapping the same folio.
        pmd.split_huge();
        Ok(WalkAction::Continue)
    }

    fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, Infallible> {
        let entry = leaf.entry_mut();
        match entry {
            PtEntry::None => {}
            PtEntry::Present(pte) => {
                let folio = pte.folio();
                if !self.details.even_cows && folio.is_anon() {
                    return Ok(PteAction::Next(1));
                }
                let bits = pte.bits();
                if bits.dirty() {
                    folio.set(FolioFlags::DIRTY);
                }
                if bits.young() {
                    folio.set(FolioFlags::REFERENCED);
                }
                self.counters.add(RssCounters::kind_of(folio), -1);
                self.stats.pages += 1;
                entry.take();
            }
            PtEntry::Swap(_) => {
                if !self.details.even_cows {
                    return Ok(PteAction::Next(1));
                }
                let nr = leaf.swap_batch();
                if let PtEntry::Swap(first) = *leaf.entry() {
                    self.swap.free_swap_slots(first, nr);
                }
                leaf.entries_mut(nr).iter_mut().for_each(|e| drop(e.take()));
                #[allow(clippy::cast_possible_wrap)]
                self.counters.add(RssKind::Swap, -(nr as isize));
                self.stats.swap_entries += nr;
                return Ok(PteAction::Next(nr));
            }
            PtEntry::Marker(Marker::Guard) if self.details.keep_guards => {}
            PtEntry::Marker(_) => {
                self.stats.markers += 1;
                entry.take();
            }
        }
        Ok(PteAction::Next(1))
    }
}

impl PageTables {
    /// Remove all mappings in `[start, end)`. See the [module documentation](self).
    pub fn zap_range<S>(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        details: ZapDetails,
        swap: &dyn SwapBackend,
        sched: &S,
    ) -> ZapStats
    where
        S: Resched + ?Sized,
    {
        let mut zapper = Zapper {
            details,
            swap,
            counters: self.counters(),
            stats: ZapStats::default(),
        };
        let Ok(_) = self.walk(start, end, &mut zapper, sched);
        if details.reclaim_tables {
            zapper.stats.tables = self.free_empty_tables(start, end);
        }
        trace!("zapped {start}..{end}: {:?}", zapper.stats);
        zapper.stats
    }
}
