//! # Guard regions
//!
//! `GuardInstall` turns every page of an anonymous range into a guard marker
//! that faults on any access. The markers are written optimistically; if the
//! walk meets anything but an empty slot or an existing marker, the range is
//! zapped (markers survive zaps) and the walk is tried again. Faults racing
//! with the walk can repopulate the range, so after
//! [`MAX_GUARD_RETRIES`](crate::config::MAX_GUARD_RETRIES) zaps the request
//! gives up with [`AdviseError::Restart`] and lets the caller come back
//! without holding the lock.
//!
//! `GuardRemove` clears the markers again and nothing else.

use crate::dispatch::{Request, Target, Visit};
use crate::error::AdviseError;
use crate::mapping::{Mapping, VmFlags};
use crate::space::MmapGuard;
use core::convert::Infallible;
use core::ops::Range;
use kernel_vmem::{
    LeafCursor, Marker, PageWalkOps, PmdEntry, PteAction, PtEntry, PudEntry, VirtualAddress,
    WalkAction, WalkOutcome, ZapDetails,
};
use log::{debug, warn};

/// Where a guard installation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStep {
    /// Walk the range, writing markers into empty slots.
    Walk,
    /// The walk found populated entries; zap them before walking again.
    Zap,
    /// Every page carries a marker.
    Done,
    /// Out of attempts; the caller should retry the whole request.
    Restart,
}

/// Bounded retry loop of a guard installation.
///
/// ```
/// # use kernel_madvise::{GuardRetry, GuardStep};
/// let mut retry = GuardRetry::new(2);
/// retry.walked(true);
/// assert_eq!(retry.step(), GuardStep::Zap);
/// retry.zapped();
/// retry.walked(true);
/// retry.zapped();
/// assert_eq!(retry.step(), GuardStep::Restart);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardRetry {
    budget: u32,
    attempt: u32,
    step: GuardStep,
}

impl GuardRetry {
    /// A fresh installation allowed `budget` zaps.
    #[must_use]
    pub const fn new(budget: u32) -> Self {
        Self {
            budget,
            attempt: 0,
            step: if budget == 0 {
                GuardStep::Restart
            } else {
                GuardStep::Walk
            },
        }
    }

    #[inline]
    #[must_use]
    pub const fn step(&self) -> GuardStep {
        self.step
    }

    /// Walks that ended in a zap so far.
    #[inline]
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Record the end of a walk. `escalated` is whether it met a populated
    /// entry.
    pub const fn walked(&mut self, escalated: bool) {
        if matches!(self.step, GuardStep::Walk) {
            self.step = if escalated {
                GuardStep::Zap
            } else {
                GuardStep::Done
            };
        }
    }

    /// Record a zap of the range.
    pub const fn zapped(&mut self) {
        if matches!(self.step, GuardStep::Zap) {
            self.attempt += 1;
            self.step = if self.attempt >= self.budget {
                GuardStep::Restart
            } else {
                GuardStep::Walk
            };
        }
    }
}

/// Anonymous, non-special memory the caller may write. Locked mappings may
/// only lose their guards: installing would zap locked pages.
fn is_valid_guard_mapping(mapping: &Mapping, allow_locked: bool) -> bool {
    let mut disallowed = VmFlags::SPECIAL | VmFlags::HUGETLB;
    if !allow_locked {
        disallowed |= VmFlags::LOCKED;
    }
    mapping.is_anonymous()
        && mapping.flags() & (VmFlags::MAYWRITE | disallowed) == VmFlags::MAYWRITE
}

pub(crate) fn install(
    req: &Request<'_>,
    guard: &MmapGuard<'_>,
    target: Target,
) -> Result<Visit, AdviseError> {
    let mapping = guard
        .tree()
        .get(target.mapping)
        .ok_or(AdviseError::NoMapping)?;
    if !is_valid_guard_mapping(mapping, false) {
        return Err(AdviseError::InvalidArgument);
    }
    // Markers make the range non-empty; fork must copy its tables.
    mapping.prepare_anon_vma();

    let tables = req.space.page_tables();
    let expected = target.start.pages_until(target.end);
    let mut retry = GuardRetry::new(req.advisor.tunables.guard_install_retries);
    loop {
        match retry.step() {
            GuardStep::Walk => {
                let mut ops = GuardInstaller { pages: 0 };
                let Ok(outcome) = tables.walk(target.start, target.end, &mut ops, req.task);
                let escalated = matches!(outcome, WalkOutcome::Escalated(_));
                if !escalated && ops.pages != expected {
                    warn!(
                        "guard install on {}..{} marked {} of {expected} pages",
                        target.start, target.end, ops.pages
                    );
                }
                retry.walked(escalated);
            }
            GuardStep::Zap => {
                let stats = tables.zap_range(
                    target.start,
                    target.end,
                    ZapDetails::default(),
                    req.advisor.swap,
                    req.task,
                );
                debug!(
                    "guard install on {}..{}: zapped {} pages (attempt {})",
                    target.start,
                    target.end,
                    stats.pages + stats.swap_entries,
                    retry.attempts() + 1
                );
                retry.zapped();
            }
            GuardStep::Done => return Ok(Visit::Continue(target.end)),
            GuardStep::Restart => return Err(AdviseError::Restart),
        }
    }
}

pub(crate) fn remove(
    req: &Request<'_>,
    guard: &MmapGuard<'_>,
    target: Target,
) -> Result<Visit, AdviseError> {
    let mapping = guard
        .tree()
        .get(target.mapping)
        .ok_or(AdviseError::NoMapping)?;
    if !is_valid_guard_mapping(mapping, true) {
        return Err(AdviseError::InvalidArgument);
    }
    let mut ops = GuardRemover { removed: 0 };
    let Ok(_) = req
        .space
        .page_tables()
        .walk(target.start, target.end, &mut ops, req.task);
    debug!(
        "removed {} guard markers from {}..{}",
        ops.removed, target.start, target.end
    );
    Ok(Visit::Continue(target.end))
}

struct GuardInstaller {
    pages: usize,
}

impl PageWalkOps for GuardInstaller {
    type Error = Infallible;

    fn installs(&self) -> bool {
        true
    }

    fn pud_entry(
        &mut self,
        pud: &mut PudEntry,
        _range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Infallible> {
        Ok(if matches!(pud, PudEntry::Huge(_)) {
            WalkAction::Escalate
        } else {
            WalkAction::Continue
        })
    }

    fn pmd_entry(
        &mut self,
        pmd: &mut PmdEntry,
        _range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Infallible> {
        Ok(if pmd.huge().is_some() {
            WalkAction::Escalate
        } else {
            WalkAction::Continue
        })
    }

    fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, Infallible> {
        if leaf.entry().is_guard() {
            self.pages += 1;
            return Ok(PteAction::Next(1));
        }
        Ok(PteAction::Escalate)
    }

    fn install_pte(&mut self, _addr: VirtualAddress) -> Result<Option<PtEntry>, Infallible> {
        self.pages += 1;
        Ok(Some(PtEntry::Marker(Marker::Guard)))
    }
}

struct GuardRemover {
    removed: usize,
}

impl PageWalkOps for GuardRemover {
    type Error = Infallible;

    fn pud_entry(
        &mut self,
        pud: &mut PudEntry,
        _range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Infallible> {
        // A huge leaf cannot hold markers.
        Ok(if matches!(pud, PudEntry::Huge(_)) {
            WalkAction::Skip
        } else {
            WalkAction::Continue
        })
    }

    fn pmd_entry(
        &mut self,
        pmd: &mut PmdEntry,
        _range: Range<VirtualAddress>,
    ) -> Result<WalkAction, Infallible> {
        Ok(if pmd.huge().is_some() {
            WalkAction::Skip
        } else {
            WalkAction::Continue
        })
    }

    fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, Infallible> {
        let entry = leaf.entry_mut();
        if entry.is_guard() {
            entry.take();
            self.removed += 1;
        }
        Ok(PteAction::Next(1))
    }
}
