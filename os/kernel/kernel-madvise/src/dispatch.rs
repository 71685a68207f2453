//! # Range dispatcher
//!
//! Entry points of the crate. A request names a byte range; the dispatcher
//! validates it, takes the address-space lock in the mode the behavior needs,
//! and hands every mapping the range touches to the behavior's handler,
//! clipped to the range.
//!
//! Holes between mappings do not stop the walk: the mappings around them
//! are still advised and the request reports `NoMapping` at the end.
//!
//! Handlers may give up the lock (for I/O). Only the address survives that;
//! the next mapping is looked up again from the tree.

use crate::backend::{Capability, FaultResolver, MemoryFailure, Reclaimer, Task};
use crate::behavior::{Behavior, LockMode};
use crate::config::Tunables;
use crate::error::AdviseError;
use crate::handlers::{discard, flags, guard, inject, populate, reclaim, remove, willneed};
use crate::mapping::AnonName;
use crate::mutator;
use crate::space::{AddressSpace, MmapGuard};
use core::ops::Range;
use kernel_vmem::info::{PAGE_SIZE, USER_VA_END};
use kernel_vmem::{Size4K, SwapBackend, VirtualAddress};
use log::{debug, trace};

/// One entry of a vectorized request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub base: u64,
    pub len: u64,
}

impl IoVec {
    #[must_use]
    pub const fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }
}

/// Result of a vectorized request: how far it got and why it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VectorAdvice {
    /// Bytes of fully advised entries, as requested (not page aligned).
    pub advised: u64,
    pub error: Option<AdviseError>,
}

impl VectorAdvice {
    /// Collapse into a single result: partial progress wins over the error.
    pub fn into_result(self) -> Result<u64, AdviseError> {
        match self.error {
            Some(e) if self.advised == 0 => Err(e),
            _ => Ok(self.advised),
        }
    }
}

/// The part of a mapping a handler is asked to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target {
    /// Start of the mapping, its key in the tree.
    pub mapping: VirtualAddress,
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl Target {
    pub(crate) const fn range(&self) -> Range<VirtualAddress> {
        self.start..self.end
    }
}

/// How a handler left things.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visit {
    /// The lock was held throughout; the mapping covering the target now
    /// ends here.
    Continue(VirtualAddress),
    /// The lock was released and retaken.
    LockDropped,
}

/// Applies memory advice to address spaces.
///
/// Holds the collaborators every request needs; the acting task and the
/// target address space are passed per call.
pub struct Advisor<'a> {
    pub(crate) swap: &'a dyn SwapBackend,
    pub(crate) reclaimer: &'a dyn Reclaimer,
    pub(crate) faults: &'a dyn FaultResolver,
    pub(crate) memory_failure: Option<&'a dyn MemoryFailure>,
    pub(crate) tunables: Tunables,
}

/// One request being carried out.
pub(crate) struct Request<'r> {
    pub advisor: &'r Advisor<'r>,
    pub task: &'r dyn Task,
    pub space: &'r AddressSpace,
    pub behavior: Behavior,
}

impl<'a> Advisor<'a> {
    #[must_use]
    pub fn new(
        swap: &'a dyn SwapBackend,
        reclaimer: &'a dyn Reclaimer,
        faults: &'a dyn FaultResolver,
    ) -> Self {
        Self {
            swap,
            reclaimer,
            faults,
            memory_failure: None,
            tunables: Tunables::new(),
        }
    }

    #[must_use]
    pub fn with_memory_failure(mut self, handler: &'a dyn MemoryFailure) -> Self {
        self.memory_failure = Some(handler);
        self
    }

    #[must_use]
    pub const fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    #[inline]
    #[must_use]
    pub const fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Apply `behavior` to `[start, start + len)` of `space`.
    ///
    /// `start` must be page aligned; `len` is rounded up to whole pages. An
    /// empty range succeeds without doing anything.
    pub fn advise(
        &self,
        task: &dyn Task,
        space: &AddressSpace,
        start: u64,
        len: u64,
        behavior: Behavior,
    ) -> Result<(), AdviseError> {
        if !behavior.is_supported() {
            return Err(AdviseError::InvalidArgument);
        }
        let range = page_range(start, len)?;
        if range.is_empty() {
            return Ok(());
        }
        let req = Request {
            advisor: self,
            task,
            space,
            behavior,
        };
        trace!("advise {behavior:?} on {}..{}", range.start, range.end);
        match behavior.lock_mode() {
            LockMode::Unlocked => inject::inject(&req, range),
            mode => {
                let mut guard = space.lock(mode, task)?;
                req.apply(&mut guard, range)
            }
        }
    }

    /// [`advise`](Self::advise) with a raw behavior code.
    pub fn advise_code(
        &self,
        task: &dyn Task,
        space: &AddressSpace,
        start: u64,
        len: u64,
        code: i32,
    ) -> Result<(), AdviseError> {
        self.advise(task, space, start, len, Behavior::try_from(code)?)
    }

    /// Apply `behavior` to every entry of `iov` in order, under one lock
    /// acquisition.
    ///
    /// Stops at the first entry that fails. An entry that asks to be
    /// restarted is retried after yielding the lock, unless the task is
    /// being killed.
    pub fn advise_vector(
        &self,
        task: &dyn Task,
        space: &AddressSpace,
        iov: &[IoVec],
        behavior: Behavior,
    ) -> VectorAdvice {
        let mut out = VectorAdvice::default();
        if !behavior.is_supported() {
            out.error = Some(AdviseError::InvalidArgument);
            return out;
        }
        let req = Request {
            advisor: self,
            task,
            space,
            behavior,
        };
        let mut guard = match behavior.lock_mode() {
            LockMode::Unlocked => None,
            mode => match space.lock(mode, task) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    out.error = Some(e);
                    return out;
                }
            },
        };

        for entry in iov {
            let range = match page_range(entry.base, entry.len) {
                Ok(range) => range,
                Err(e) => {
                    out.error = Some(e);
                    return out;
                }
            };
            loop {
                let result = if range.is_empty() {
                    Ok(())
                } else if let Some(guard) = guard.as_mut() {
                    req.apply(guard, range.clone())
                } else {
                    inject::inject(&req, range.clone())
                };
                match result {
                    Ok(()) => {
                        out.advised += entry.len;
                        break;
                    }
                    Err(AdviseError::Restart) => {
                        if task.fatal_signal_pending() {
                            out.error = Some(AdviseError::Interrupted);
                            return out;
                        }
                        debug!("restarting {behavior:?} on {}..{}", range.start, range.end);
                        match guard.as_mut() {
                            Some(guard) => guard.with_unlocked(|| task.cond_resched()),
                            None => task.cond_resched(),
                        }
                    }
                    Err(e) => {
                        out.error = Some(e);
                        return out;
                    }
                }
            }
        }
        out
    }

    /// Vectorized advice on another task's address space.
    ///
    /// `flags` is reserved and must be zero. Only non-destructive hints may
    /// target a foreign address space, and only with [`Capability::SysNice`].
    pub fn process_advise(
        &self,
        task: &dyn Task,
        target: &AddressSpace,
        iov: &[IoVec],
        code: i32,
        flags: u32,
    ) -> VectorAdvice {
        let checked = check_process_advise(task, target, code, flags);
        match checked {
            Ok(behavior) => self.advise_vector(task, target, iov, behavior),
            Err(e) => VectorAdvice {
                advised: 0,
                error: Some(e),
            },
        }
    }

    /// Name the anonymous memory in `[start, start + len)`, or clear its name.
    pub fn set_anon_name(
        &self,
        task: &dyn Task,
        space: &AddressSpace,
        start: u64,
        len: u64,
        name: Option<&str>,
    ) -> Result<(), AdviseError> {
        if !cfg!(feature = "anon-vma-name") {
            return Err(AdviseError::InvalidArgument);
        }
        let name = name.map(AnonName::new).transpose()?;
        let range = page_range(start, len)?;
        if range.is_empty() {
            return Ok(());
        }
        let max_map_count = self.tunables.max_map_count;
        let mut guard = space.lock(LockMode::Exclusive, task)?;
        walk_mappings(&mut guard, range, |guard, target| {
            let tree = guard.tree_mut().ok_or(AdviseError::InvalidArgument)?;
            let mapping = tree.get(target.mapping).ok_or(AdviseError::NoMapping)?;
            if mapping.backing().file().is_some() && !mapping.is_shmem() {
                return Err(AdviseError::BadFile);
            }
            let flags = mapping.flags();
            let end = mutator::update(
                tree,
                target.mapping,
                target.range(),
                flags,
                name.as_ref(),
                max_map_count,
            )?;
            Ok(Visit::Continue(end))
        })
    }

    /// Discard clean lazy-free pages in `[start, start + len)`, as reclaim
    /// would under memory pressure. Returns the number of pages freed.
    pub fn reclaim_lazyfree(
        &self,
        task: &dyn Task,
        space: &AddressSpace,
        start: u64,
        len: u64,
    ) -> Result<usize, AdviseError> {
        let range = page_range(start, len)?;
        let guard = space.lock(LockMode::Shared, task)?;
        let mut freed = 0;
        for mapping in guard.tree().overlapping(range.start, range.end) {
            if !mapping.is_anonymous() {
                continue;
            }
            let start = mapping.start().max(range.start);
            let end = mapping.end().min(range.end);
            freed += discard::reclaim_lazyfree(space, start..end, task);
        }
        Ok(freed)
    }
}

impl Request<'_> {
    pub(crate) fn apply(
        &self,
        guard: &mut MmapGuard<'_>,
        range: Range<VirtualAddress>,
    ) -> Result<(), AdviseError> {
        match self.behavior {
            Behavior::PopulateRead | Behavior::PopulateWrite => {
                populate::populate(self, guard, range)
            }
            _ => walk_mappings(guard, range, |guard, target| self.visit(guard, target)),
        }
    }

    fn visit(&self, guard: &mut MmapGuard<'_>, target: Target) -> Result<Visit, AdviseError> {
        let mapping = guard
            .tree()
            .get(target.mapping)
            .ok_or(AdviseError::NoMapping)?;
        if self.behavior.is_discard() && mapping.is_sealed_read_only_anon() {
            return Err(AdviseError::PermissionDenied);
        }
        match self.behavior {
            Behavior::WillNeed => willneed::willneed(self, guard, target),
            Behavior::Remove => remove::remove(self, guard, target),
            Behavior::Cold | Behavior::Pageout => reclaim::cold_or_pageout(self, guard, target),
            Behavior::DontNeed | Behavior::DontNeedLocked | Behavior::Free => {
                discard::dontneed_or_free(self, guard, target)
            }
            Behavior::GuardInstall => guard::install(self, guard, target),
            Behavior::GuardRemove => guard::remove(self, guard, target),
            b if b.is_flag_update() => flags::update(self, guard, target),
            _ => Err(AdviseError::InvalidArgument),
        }
    }
}

fn check_process_advise(
    task: &dyn Task,
    target: &AddressSpace,
    code: i32,
    flags: u32,
) -> Result<Behavior, AdviseError> {
    if flags != 0 {
        return Err(AdviseError::InvalidArgument);
    }
    let behavior = Behavior::try_from(code)?;
    if task.address_space_id() == Some(target.id()) {
        return Ok(behavior);
    }
    if !behavior.is_remote_allowed() {
        return Err(AdviseError::InvalidArgument);
    }
    if !task.may_access(target) || !task.capable(Capability::SysNice) {
        return Err(AdviseError::PermissionDenied);
    }
    Ok(behavior)
}

/// Page-align a user range. `start` must already be aligned and the range
/// must end in the user half of the address space.
pub(crate) fn page_range(start: u64, len: u64) -> Result<Range<VirtualAddress>, AdviseError> {
    let start = VirtualAddress::new(start);
    if !start.is_aligned::<Size4K>() {
        return Err(AdviseError::InvalidArgument);
    }
    let len = len
        .checked_add(PAGE_SIZE - 1)
        .ok_or(AdviseError::InvalidArgument)?
        & !(PAGE_SIZE - 1);
    let end = start.checked_add(len).ok_or(AdviseError::InvalidArgument)?;
    if end.as_u64() > USER_VA_END {
        return Err(AdviseError::InvalidArgument);
    }
    Ok(start..end)
}

/// Where a walk over mappings stands. Only the address is trusted across a
/// lock drop; the generation tells whether the tree changed meanwhile.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    addr: VirtualAddress,
    generation: u64,
}

/// Call `visit` for every mapping intersecting `range`, clipped to it.
pub(crate) fn walk_mappings<F>(
    guard: &mut MmapGuard<'_>,
    range: Range<VirtualAddress>,
    mut visit: F,
) -> Result<(), AdviseError>
where
    F: FnMut(&mut MmapGuard<'_>, Target) -> Result<Visit, AdviseError>,
{
    let end = range.end;
    let mut cursor = Cursor {
        addr: range.start,
        generation: guard.tree().generation(),
    };
    let mut unmapped = false;

    while cursor.addr < end {
        let Some((mstart, mend)) = guard
            .tree()
            .find(cursor.addr)
            .map(|m| (m.start(), m.end()))
        else {
            return Err(AdviseError::NoMapping);
        };
        if cursor.addr < mstart {
            unmapped = true;
            cursor.addr = mstart;
            if cursor.addr >= end {
                break;
            }
        }

        let clip = mend.min(end);
        let target = Target {
            mapping: mstart,
            start: cursor.addr,
            end: clip,
        };
        match visit(guard, target)? {
            Visit::Continue(prev_end) => cursor.addr = clip.max(prev_end),
            Visit::LockDropped => {
                cursor.addr = clip;
                let generation = guard.tree().generation();
                if generation != cursor.generation {
                    debug!("mappings changed while unlocked; resuming at {}", cursor.addr);
                }
            }
        }
        cursor.generation = guard.tree().generation();
    }

    if unmapped {
        Err(AdviseError::NoMapping)
    } else {
        Ok(())
    }
}
