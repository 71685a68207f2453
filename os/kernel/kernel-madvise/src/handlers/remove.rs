//! `Remove`: free a range of a shared file mapping together with its backing
//! store, punching a hole into the file.

use crate::dispatch::{Request, Target, Visit};
use crate::error::AdviseError;
use crate::mapping::VmFlags;
use crate::space::MmapGuard;
use alloc::sync::Arc;
use kernel_vmem::ZapDetails;
use log::debug;

pub(crate) fn remove(
    req: &Request<'_>,
    guard: &mut MmapGuard<'_>,
    target: Target,
) -> Result<Visit, AdviseError> {
    let mapping = guard
        .tree()
        .get(target.mapping)
        .ok_or(AdviseError::NoMapping)?;
    if mapping.flags().contains(VmFlags::LOCKED) {
        return Err(AdviseError::InvalidArgument);
    }
    let Some(file) = mapping.backing().file().map(Arc::clone) else {
        return Err(AdviseError::InvalidArgument);
    };
    if !mapping.flags().contains(VmFlags::SHARED | VmFlags::MAYWRITE) {
        return Err(AdviseError::AccessDenied);
    }
    let offset = mapping.file_offset(target.start);
    let len = target.end - target.start;

    // Private copies made by earlier writes through other mappings stay;
    // truncation never touches anonymous memory.
    let details = ZapDetails {
        even_cows: false,
        keep_guards: true,
        reclaim_tables: false,
    };
    let _ = req.space.page_tables().zap_range(
        target.start,
        target.end,
        details,
        req.advisor.swap,
        req.task,
    );

    debug!("remove: punching {len:#x} bytes at file offset {offset:#x}");
    guard.with_unlocked(|| file.punch_hole(offset, len))?;
    Ok(Visit::LockDropped)
}
