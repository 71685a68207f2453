//! # Mapping mutator
//!
//! Applies new attributes to a sub-range of one mapping: splits the mapping
//! at the range edges, updates the piece in the middle, then merges it with
//! neighbours that ended up identical. Requires the exclusive lock.

use crate::error::MappingError;
use crate::mapping::{AnonName, VmFlags};
use crate::tree::MappingTree;
use core::ops::Range;
use kernel_vmem::VirtualAddress;
use log::trace;

/// Give `range` (inside the mapping starting at `mapping`) the attributes
/// `flags` and `name`.
///
/// Returns the end of the mapping that now covers `range.start`, which is
/// where the caller's walk continues.
pub fn update(
    tree: &mut MappingTree,
    mapping: VirtualAddress,
    range: Range<VirtualAddress>,
    flags: VmFlags,
    name: Option<&AnonName>,
    max_map_count: usize,
) -> Result<VirtualAddress, MappingError> {
    let m = tree.get(mapping).ok_or(MappingError::NotFound)?;
    debug_assert!(m.start() <= range.start && range.end <= m.end());
    if m.flags() == flags && m.anon_name() == name {
        return Ok(m.end());
    }
    if m.anon_name() != name && m.backing().file().is_some() && !m.is_shmem() {
        return Err(MappingError::FileBacked);
    }

    tree.split(range.start, max_map_count)?;
    tree.split(range.end, max_map_count)?;

    let target = tree.get_mut(range.start).ok_or(MappingError::NotFound)?;
    target.set_flags(flags);
    if target.is_anonymous() || target.is_shmem() {
        target.set_anon_name(name);
    }
    tree.touch();

    let merged = tree.merge_around(range.start).ok_or(MappingError::NotFound)?;
    trace!(
        "updated {}..{} to {flags:?}, now part of {}..{}",
        range.start,
        range.end,
        merged.start(),
        merged.end()
    );
    Ok(merged.end())
}
