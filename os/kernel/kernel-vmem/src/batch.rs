//! # Page-group batching
//!
//! Neighbouring leaf entries that map consecutive frames of the same folio
//! with compatible bits are treated as one unit by the reclaim handlers.

use crate::entry::PtEntry;

/// A run of entries mapping one folio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// Number of entries in the run (at least one).
    pub nr: usize,
    /// Some entry in the run had its access bit set.
    pub any_young: bool,
    /// Some entry in the run had its dirty bit set.
    pub any_dirty: bool,
    /// Some entry in the run permitted writes.
    pub any_writable: bool,
}

/// Measure the run starting at `entries[0]`.
///
/// `entries` is the part of the leaf table still inside the caller's range, so
/// the run never extends past it. Access, dirty, soft-dirty and write bits do
/// not break a run; they are aggregated into the result instead.
///
/// Returns `None` if `entries[0]` is not present.
#[must_use]
pub fn folio_pte_batch(entries: &[PtEntry]) -> Option<Batch> {
    let first = entries.first()?.present()?;
    let bits = first.bits();
    let mut batch = Batch {
        nr: 1,
        any_young: bits.young(),
        any_dirty: bits.dirty(),
        any_writable: bits.writable(),
    };
    if !first.folio().is_large() {
        return Some(batch);
    }

    let mut prev = first;
    for entry in &entries[1..] {
        let Some(next) = entry.present() else {
            break;
        };
        if !prev.continues_into(next) {
            break;
        }
        let bits = next.bits();
        batch.nr += 1;
        batch.any_young |= bits.young();
        batch.any_dirty |= bits.dirty();
        batch.any_writable |= bits.writable();
        prev = next;
    }
    Some(batch)
}

/// Number of entries from `entries[0]` on that are swap entries for
/// consecutive slots. Zero if `entries[0]` is not a swap entry.
#[must_use]
pub fn swap_pte_batch(entries: &[PtEntry]) -> usize {
    let Some(PtEntry::Swap(first)) = entries.first() else {
        return 0;
    };
    entries
        .iter()
        .enumerate()
        .take_while(|(i, e)| matches!(e, PtEntry::Swap(s) if *s == first.offset(*i)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Folio, FolioKind, FrameNumber, PresentPte, PteBits, SwapEntry};
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn map(folio: &Arc<Folio>, range: core::ops::Range<usize>, bits: PteBits) -> Vec<PtEntry> {
        range
            .map(|i| PtEntry::Present(PresentPte::new(Arc::clone(folio), i, bits)))
            .collect()
    }

    #[test]
    fn batches_whole_folio_and_aggregates_bits() {
        let folio = Folio::new(FrameNumber::new(0), 2, FolioKind::Anonymous);
        let clean = PteBits::user_page(false).with_young(false);
        let mut entries = map(&folio, 0..4, clean);
        entries[2].present_mut().unwrap().set_bits(clean.with_dirty(true).with_soft_dirty(true));
        entries[3].present_mut().unwrap().set_bits(clean.with_young(true));

        let batch = folio_pte_batch(&entries).unwrap();
        assert_eq!(batch.nr, 4);
        assert!(batch.any_dirty);
        assert!(batch.any_young);
        assert!(!batch.any_writable);
    }

    #[test]
    fn batch_is_limited_by_remaining_range() {
        let folio = Folio::new(FrameNumber::new(0), 2, FolioKind::Anonymous);
        let entries = map(&folio, 0..4, PteBits::user_page(true));
        assert_eq!(folio_pte_batch(&entries[..2]).unwrap().nr, 2);
        assert_eq!(folio_pte_batch(&entries[1..]).unwrap().nr, 3);
    }

    #[test]
    fn batch_stops_at_other_folio_or_hole() {
        let a = Folio::new(FrameNumber::new(0), 1, FolioKind::Anonymous);
        let b = Folio::new(FrameNumber::new(2), 1, FolioKind::Anonymous);
        let mut entries = map(&a, 0..2, PteBits::user_page(true));
        entries.extend(map(&b, 0..2, PteBits::user_page(true)));
        assert_eq!(folio_pte_batch(&entries).unwrap().nr, 2);

        let mut holes = map(&a, 0..1, PteBits::user_page(true));
        holes.push(PtEntry::None);
        assert_eq!(folio_pte_batch(&holes).unwrap().nr, 1);
        assert!(folio_pte_batch(&holes[1..]).is_none());
    }

    #[test]
    fn batch_stops_when_user_bit_differs() {
        let folio = Folio::new(FrameNumber::new(0), 1, FolioKind::File);
        let mut entries = map(&folio, 0..2, PteBits::user_page(true));
        entries[1].present_mut().unwrap().set_bits(PteBits::new());
        assert_eq!(folio_pte_batch(&entries).unwrap().nr, 1);
    }

    #[test]
    fn swap_runs_need_consecutive_slots() {
        let entries = [
            PtEntry::Swap(SwapEntry::new(10)),
            PtEntry::Swap(SwapEntry::new(11)),
            PtEntry::Swap(SwapEntry::new(13)),
        ];
        assert_eq!(swap_pte_batch(&entries), 2);
        assert_eq!(swap_pte_batch(&entries[2..]), 1);
        assert_eq!(swap_pte_batch(&[PtEntry::None]), 0);
    }
}
