//! # Leaf and huge entries

use crate::bits::PteBits;
use crate::folio::{Folio, FrameNumber};
use alloc::sync::Arc;
use core::fmt;

/// Token identifying a slot on the swap device.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SwapEntry(u64);

impl SwapEntry {
    #[inline]
    #[must_use]
    pub const fn new(slot: u64) -> Self {
        Self(slot)
    }

    #[inline]
    #[must_use]
    pub const fn slot(self) -> u64 {
        self.0
    }

    /// The entry `n` slots further on.
    #[inline]
    #[must_use]
    pub const fn offset(self, n: usize) -> Self {
        Self(self.0 + n as u64)
    }
}

/// Non-present entries that are neither empty nor swapped.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Marker {
    /// Any access faults fatally. Installed by guard-page advice.
    Guard,
    /// The page was lost to a memory error; access reports poison.
    Poisoned,
}

/// A present leaf entry mapping frame `index` of `folio`.
///
/// Owning a `PresentPte` accounts for one leaf mapping of the folio.
pub struct PresentPte {
    folio: Arc<Folio>,
    index: usize,
    bits: PteBits,
}

impl PresentPte {
    #[must_use]
    pub fn new(folio: Arc<Folio>, index: usize, bits: PteBits) -> Self {
        debug_assert!(index < folio.nr_pages());
        folio.inc_pte_mapcount();
        Self { folio, index, bits }
    }

    #[inline]
    #[must_use]
    pub const fn folio(&self) -> &Arc<Folio> {
        &self.folio
    }

    /// Index of the mapped frame inside its folio.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn bits(&self) -> PteBits {
        self.bits
    }

    #[inline]
    pub const fn set_bits(&mut self, bits: PteBits) {
        self.bits = bits;
    }

    #[inline]
    #[must_use]
    pub fn pfn(&self) -> FrameNumber {
        self.folio.pfn().offset(self.index)
    }

    /// Whether `next` maps the frame directly following ours in the same
    /// folio with batch-compatible bits.
    #[inline]
    #[must_use]
    pub fn continues_into(&self, next: &Self) -> bool {
        Arc::ptr_eq(&self.folio, &next.folio)
            && next.index == self.index + 1
            && next.bits.batch_key() == self.bits.batch_key()
    }
}

impl Clone for PresentPte {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.folio), self.index, self.bits)
    }
}

impl Drop for PresentPte {
    fn drop(&mut self) {
        self.folio.dec_pte_mapcount();
    }
}

impl fmt::Debug for PresentPte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentPte")
            .field("pfn", &self.pfn())
            .field("index", &self.index)
            .field("bits", &self.bits)
            .finish()
    }
}

/// A middle- or upper-level entry mapping a whole folio at once.
pub struct HugeLeaf {
    folio: Arc<Folio>,
    bits: PteBits,
}

impl HugeLeaf {
    #[must_use]
    pub fn new(folio: Arc<Folio>, bits: PteBits) -> Self {
        folio.inc_entire_mapcount();
        Self { folio, bits }
    }

    #[inline]
    #[must_use]
    pub const fn folio(&self) -> &Arc<Folio> {
        &self.folio
    }

    #[inline]
    #[must_use]
    pub const fn bits(&self) -> PteBits {
        self.bits
    }

    #[inline]
    pub const fn set_bits(&mut self, bits: PteBits) {
        self.bits = bits;
    }
}

impl Drop for HugeLeaf {
    fn drop(&mut self) {
        self.folio.dec_entire_mapcount();
    }
}

impl fmt::Debug for HugeLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HugeLeaf")
            .field("folio", &self.folio)
            .field("bits", &self.bits)
            .finish()
    }
}

/// A leaf page-table entry.
#[derive(Default, Debug)]
pub enum PtEntry {
    #[default]
    None,
    Present(PresentPte),
    Swap(SwapEntry),
    Marker(Marker),
}

impl PtEntry {
    #[inline]
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    #[inline]
    #[must_use]
    pub const fn is_guard(&self) -> bool {
        matches!(self, Self::Marker(Marker::Guard))
    }

    #[inline]
    #[must_use]
    pub const fn present(&self) -> Option<&PresentPte> {
        match self {
            Self::Present(pte) => Some(pte),
            _ => None,
        }
    }

    #[inline]
    pub const fn present_mut(&mut self) -> Option<&mut PresentPte> {
        match self {
            Self::Present(pte) => Some(pte),
            _ => None,
        }
    }

    /// Replace the entry with [`PtEntry::None`], returning the old value.
    #[inline]
    pub fn take(&mut self) -> Self {
        core::mem::take(self)
    }
}
