//! # Software page-table entry bits
//!
//! The per-entry state tracked for a present mapping. The physical frame is not
//! part of the bit pattern: it is reached through the entry's page group.

use bitfield_struct::bitfield;

/// Permission and tracking bits of a present leaf entry.
#[bitfield(u64)]
pub struct PteBits {
    /// Writes through this entry are permitted.
    pub writable: bool,
    /// Accessible from user mode.
    pub user: bool,
    /// Set on access; cleared by aging ("young").
    pub young: bool,
    /// Set on write.
    pub dirty: bool,
    /// Written since soft-dirty tracking was last reset.
    pub soft_dirty: bool,
    /// Anonymous page known to be mapped only by this address space.
    pub exclusive: bool,
    #[bits(58)]
    __: u64,
}

impl PteBits {
    /// Bits for a fresh user mapping.
    #[inline]
    #[must_use]
    pub const fn user_page(writable: bool) -> Self {
        Self::new()
            .with_user(true)
            .with_writable(writable)
            .with_young(true)
    }

    /// The bits that must agree for two neighbouring entries to be batched.
    ///
    /// Access, dirty, soft-dirty and write permission are ignored; they are
    /// aggregated by the batcher instead.
    #[inline]
    #[must_use]
    pub const fn batch_key(self) -> u64 {
        self.with_young(false)
            .with_dirty(false)
            .with_soft_dirty(false)
            .with_writable(false)
            .into_bits()
    }

    /// Clear the access and dirty bits.
    #[inline]
    #[must_use]
    pub const fn mkold_clean(self) -> Self {
        self.with_young(false).with_dirty(false)
    }
}
