//! Memory-failure injection: `HwPoison` and `SoftOffline` on the frames
//! behind a range, for testing hardware-error handling.
//!
//! Runs without holding the address-space lock across the whole range; each
//! page is translated (and faulted in if needed) on its own.

use crate::backend::{Capability, MemoryFailureError};
use crate::behavior::{Behavior, LockMode};
use crate::dispatch::Request;
use crate::error::{AdviseError, FaultError};
use core::ops::Range;
use kernel_vmem::info::PAGE_SIZE;
use kernel_vmem::{Folio, FrameNumber, Translation, VirtualAddress};
use log::info;

pub(crate) fn inject(req: &Request<'_>, range: Range<VirtualAddress>) -> Result<(), AdviseError> {
    if !req.task.capable(Capability::SysAdmin) {
        return Err(AdviseError::PermissionDenied);
    }
    let Some(handler) = req.advisor.memory_failure else {
        return Err(AdviseError::InvalidArgument);
    };

    let mut addr = range.start;
    while addr < range.end {
        let (pfn, remaining) = resolve_frame(req, addr)?;
        if req.behavior == Behavior::SoftOffline {
            info!("soft offlining pfn {:#x} at address {addr}", pfn.as_u64());
            handler.soft_offline(pfn)?;
        } else {
            info!(
                "injecting memory failure for pfn {:#x} at address {addr}",
                pfn.as_u64()
            );
            match handler.memory_failure(pfn) {
                Ok(()) | Err(MemoryFailureError::NotSupported) => {}
                Err(e) => return Err(e.into()),
            }
        }
        // One injection per folio; its other frames go down with it.
        addr = addr.add_pages(remaining);
    }
    Ok(())
}

/// The frame mapped at `addr` and the number of pages from `addr` to the end
/// of its folio, faulting the page in first if it is not present.
fn resolve_frame(
    req: &Request<'_>,
    addr: VirtualAddress,
) -> Result<(FrameNumber, usize), AdviseError> {
    if let Some(found) = frame_at(req, addr) {
        return Ok(found);
    }
    {
        let mut guard = req.space.lock(LockMode::Shared, req.task)?;
        let end = addr + PAGE_SIZE;
        req.advisor
            .faults
            .resolve(req.space, &mut guard, req.task, addr..end, false)
            .map_err(|e| match e {
                FaultError::NoMapping => AdviseError::Fault,
                e => AdviseError::from(e),
            })?;
    }
    frame_at(req, addr).ok_or(AdviseError::Fault)
}

fn frame_at(req: &Request<'_>, addr: VirtualAddress) -> Option<(FrameNumber, usize)> {
    match req.space.page_tables().translate(addr) {
        Translation::Present { folio, index, .. } => Some(located(&folio, index)),
        Translation::Huge { folio, .. } => {
            #[allow(clippy::cast_possible_truncation)]
            let index = ((addr.as_u64() & (folio.size() - 1)) / PAGE_SIZE) as usize;
            Some(located(&folio, index))
        }
        Translation::None | Translation::Swap(_) | Translation::Marker(_) => None,
    }
}

const fn located(folio: &Folio, index: usize) -> (FrameNumber, usize) {
    (folio.pfn().offset(index), folio.nr_pages() - index)
}
