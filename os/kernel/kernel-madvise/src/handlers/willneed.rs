//! `WillNeed`: start reading a range in ahead of use.
//!
//! Anonymous memory has its swapped-out pages read back asynchronously,
//! shared memory asks its object to swap in, and file mappings start
//! read-ahead with the address-space lock released.

use crate::dispatch::{Request, Target, Visit};
use crate::error::AdviseError;
use crate::mapping::Backing;
use crate::space::MmapGuard;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::Infallible;
use kernel_vmem::{LeafCursor, PageWalkOps, PteAction, PtEntry, SwapEntry, VirtualAddress};
use log::{debug, trace};

pub(crate) fn willneed(
    req: &Request<'_>,
    guard: &mut MmapGuard<'_>,
    target: Target,
) -> Result<Visit, AdviseError> {
    let mapping = guard
        .tree()
        .get(target.mapping)
        .ok_or(AdviseError::NoMapping)?;
    let offset = mapping.file_offset(target.start);
    let len = target.end - target.start;

    match mapping.backing() {
        Backing::Anonymous => {
            let mut ops = SwapIn::default();
            let Ok(_) = req
                .space
                .page_tables()
                .walk(target.start, target.end, &mut ops, req.task);
            trace!("willneed: {} swap entries to read", ops.entries.len());
            for (entry, addr) in ops.entries {
                // The folio lands in the swap cache; the next fault maps it.
                let _ = req.advisor.swap.read_swap_async(entry, addr);
            }
            req.advisor.reclaimer.drain();
            Ok(Visit::Continue(target.end))
        }
        Backing::SharedMemory { file, .. } => {
            file.swapin_range(offset, len);
            req.advisor.reclaimer.drain();
            Ok(Visit::Continue(target.end))
        }
        Backing::File { file, .. } => {
            if file.is_dax() {
                return Ok(Visit::Continue(target.end));
            }
            let file = Arc::clone(file);
            debug!("willneed: read-ahead of {len:#x} bytes at file offset {offset:#x}");
            guard.with_unlocked(|| file.advise_readahead(offset, len));
            Ok(Visit::LockDropped)
        }
    }
}

/// Collects swap entries under the page-table lock; reading them needs the
/// lock released.
#[derive(Default)]
struct SwapIn {
    entries: Vec<(SwapEntry, VirtualAddress)>,
}

impl PageWalkOps for SwapIn {
    type Error = Infallible;

    fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, Infallible> {
        if let PtEntry::Swap(entry) = leaf.entry() {
            self.entries.push((*entry, leaf.addr()));
        }
        Ok(PteAction::Next(1))
    }
}
