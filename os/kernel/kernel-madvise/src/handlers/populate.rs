//! Prefaulting a range for reading or writing.

use crate::behavior::Behavior;
use crate::dispatch::Request;
use crate::error::AdviseError;
use crate::space::MmapGuard;
use core::ops::Range;
use kernel_vmem::VirtualAddress;
use log::debug;

/// Fault in `range` until all of it is present or the resolver fails.
///
/// The resolver is asked for at most `fault_batch` pages per call.
///
/// The resolver may give up the lock; the range is re-resolved from the
/// address reached, so mappings that changed meanwhile are seen as they are
/// now.
pub(crate) fn populate(
    req: &Request<'_>,
    guard: &mut MmapGuard<'_>,
    range: Range<VirtualAddress>,
) -> Result<(), AdviseError> {
    let write = req.behavior == Behavior::PopulateWrite;
    let faults = req.advisor.faults;
    let batch = req.advisor.tunables.fault_batch.max(1);
    let mut addr = range.start;
    while addr < range.end {
        let end = addr.add_pages(batch.min(addr.pages_until(range.end)));
        let resolved = faults.resolve(req.space, guard, req.task, addr..end, write)?;
        if resolved.lock_dropped {
            debug!("populate: lock dropped while faulting at {addr}");
        }
        if resolved.pages == 0 {
            return Err(AdviseError::OutOfMemory);
        }
        addr = addr.add_pages(resolved.pages.min(addr.pages_until(end)));
    }
    Ok(())
}
