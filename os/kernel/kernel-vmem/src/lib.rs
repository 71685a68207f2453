//! # Virtual Memory Support
//!
//! A software model of a four-level page-table tree and of the physical page
//! groups it maps, as used by the memory-advice code.
//!
//! ## What you get
//! - A [`VirtualAddress`] newtype plus [`PageSize`] markers for 4 KiB / 2 MiB / 1 GiB.
//! - [`Folio`]s: groups of `2^order` frames sharing LRU, dirty and swap-cache state.
//! - Leaf entries ([`PtEntry`]) that are empty, present, swapped out or markers,
//!   and huge leaves ([`HugeLeaf`]) at the two middle levels.
//! - The [`PageTables`] tree with per-leaf-table locks.
//! - A generic, visitor-based [walk](PageTables::walk) with "skip subtree" and
//!   "escalate" outcomes and scheduler checkpoints.
//! - [Batching](folio_pte_batch) of entries that map one folio.
//! - [Zapping](PageTables::zap_range) of ranges.
//!
//! ## Address layout
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PUD  |  PMD  |  PT   | Offset |
//! ```
//!
//! ## Accounting
//!
//! Every entry that maps a folio holds a strong reference to it and counts as
//! one mapping. Dropping the entry drops both, so a folio no entry refers to
//! is unmapped by construction.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod addr;
mod batch;
mod bits;
mod counters;
mod entry;
mod folio;
pub mod info;
mod swap;
mod table;
mod walk;
mod zap;

pub use addr::{PageSize, Size1G, Size2M, Size4K, TableIndex, VirtualAddress};
pub use batch::{Batch, folio_pte_batch, swap_pte_batch};
pub use bits::PteBits;
pub use counters::{RssCounters, RssKind};
pub use entry::{HugeLeaf, Marker, PresentPte, PtEntry, SwapEntry};
pub use folio::{Folio, FolioFlags, FolioKind, FolioLock, FrameNumber, SplitError};
pub use swap::{NoSwap, SwapBackend};
pub use table::{
    LeafTable, MiddleDirectory, PageMapLevel4, PageTable, PageTables, PmdEntry, PudEntry,
    Translation, UpperDirectory,
};
pub use walk::{LeafCursor, PageWalkOps, PteAction, WalkAction, WalkOutcome};
pub use zap::{ZapDetails, ZapStats};
