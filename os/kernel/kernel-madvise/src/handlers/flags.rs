//! Behaviors that only change mapping attributes.

use crate::behavior::Behavior;
use crate::dispatch::{Request, Target, Visit};
use crate::error::AdviseError;
use crate::mapping::{Mapping, VmFlags};
use crate::mutator;
use crate::space::MmapGuard;

pub(crate) fn update(
    req: &Request<'_>,
    guard: &mut MmapGuard<'_>,
    target: Target,
) -> Result<Visit, AdviseError> {
    let max_map_count = req.advisor.tunables.max_map_count;
    let tree = guard.tree_mut().ok_or(AdviseError::InvalidArgument)?;
    let mapping = tree.get(target.mapping).ok_or(AdviseError::NoMapping)?;
    let flags = updated_flags(mapping, req.behavior)?;
    let name = mapping.anon_name().cloned();
    let end = mutator::update(
        tree,
        target.mapping,
        target.range(),
        flags,
        name.as_ref(),
        max_map_count,
    )?;
    Ok(Visit::Continue(end))
}

/// The flags `mapping` ends up with under `behavior`.
fn updated_flags(mapping: &Mapping, behavior: Behavior) -> Result<VmFlags, AdviseError> {
    let mut flags = mapping.flags();
    match behavior {
        Behavior::Normal => flags.remove(VmFlags::READ_HINTS),
        Behavior::Sequential => {
            flags.remove(VmFlags::RAND_READ);
            flags.insert(VmFlags::SEQ_READ);
        }
        Behavior::Random => {
            flags.remove(VmFlags::SEQ_READ);
            flags.insert(VmFlags::RAND_READ);
        }
        Behavior::DontFork => flags.insert(VmFlags::DONTCOPY),
        Behavior::DoFork => {
            if flags.contains(VmFlags::IO) {
                return Err(AdviseError::InvalidArgument);
            }
            flags.remove(VmFlags::DONTCOPY);
        }
        Behavior::WipeOnFork => {
            if mapping.backing().file().is_some() || flags.contains(VmFlags::SHARED) {
                return Err(AdviseError::InvalidArgument);
            }
            flags.insert(VmFlags::WIPEONFORK);
        }
        Behavior::KeepOnFork => {
            if flags.contains(VmFlags::DROPPABLE) {
                return Err(AdviseError::InvalidArgument);
            }
            flags.remove(VmFlags::WIPEONFORK);
        }
        Behavior::DontDump => flags.insert(VmFlags::DONTDUMP),
        Behavior::DoDump => {
            let special = !flags.contains(VmFlags::HUGETLB) && flags.intersects(VmFlags::SPECIAL);
            if special || flags.contains(VmFlags::DROPPABLE) {
                return Err(AdviseError::InvalidArgument);
            }
            flags.remove(VmFlags::DONTDUMP);
        }
        Behavior::Mergeable => {
            let ineligible = VmFlags::MERGEABLE
                | VmFlags::SHARED
                | VmFlags::MAYSHARE
                | VmFlags::SPECIAL
                | VmFlags::HUGETLB
                | VmFlags::DROPPABLE;
            if !flags.intersects(ineligible) {
                flags.insert(VmFlags::MERGEABLE);
            }
        }
        Behavior::Unmergeable => flags.remove(VmFlags::MERGEABLE),
        Behavior::HugePage => {
            flags.remove(VmFlags::NOHUGEPAGE);
            flags.insert(VmFlags::HUGEPAGE);
        }
        Behavior::NoHugePage => {
            flags.remove(VmFlags::HUGEPAGE);
            flags.insert(VmFlags::NOHUGEPAGE);
        }
        _ => return Err(AdviseError::InvalidArgument),
    }
    Ok(flags)
}
