//! # Address spaces
//!
//! An [`AddressSpace`] pairs the mapping tree, guarded by a reader/writer
//! lock, with the page tables. Advice holds the lock through an
//! [`MmapGuard`], which can give it up temporarily around blocking work.

use crate::backend::Task;
use crate::behavior::LockMode;
use crate::config::DEFAULT_MAX_MAP_COUNT;
use crate::error::{AdviseError, MappingError};
use crate::mapping::Mapping;
use crate::tree::MappingTree;
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{NeverResched, ReadGuard, RwLock, WriteGuard};
use kernel_vmem::info::USER_VA_END;
use kernel_vmem::{PageTables, RssCounters, SwapBackend, VirtualAddress, ZapDetails};
use log::{debug, trace};

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

pub struct AddressSpace {
    id: u64,
    mappings: RwLock<MappingTree>,
    page_tables: PageTables,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            mappings: RwLock::new(MappingTree::new()),
            page_tables: PageTables::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn page_tables(&self) -> &PageTables {
        &self.page_tables
    }

    #[inline]
    #[must_use]
    pub const fn counters(&self) -> &RssCounters {
        self.page_tables.counters()
    }

    /// Add a mapping.
    pub fn map(&self, mapping: Mapping) -> Result<(), MappingError> {
        trace!(
            "space {}: map {}..{}",
            self.id,
            mapping.start(),
            mapping.end()
        );
        self.mappings.write().insert(mapping)
    }

    /// Remove `[start, end)` and everything mapped in it.
    pub fn unmap(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        swap: &dyn SwapBackend,
    ) -> Result<(), MappingError> {
        if !start.is_aligned::<kernel_vmem::Size4K>()
            || start >= end
            || end.as_u64() > USER_VA_END
        {
            return Err(MappingError::InvalidRange);
        }
        let mut tree = self.mappings.write();
        let removed = tree.remove_range(start, end, DEFAULT_MAX_MAP_COUNT)?;
        for m in &removed {
            let details = ZapDetails {
                keep_guards: false,
                reclaim_tables: true,
                ..ZapDetails::default()
            };
            let _ = self
                .page_tables
                .zap_range(m.start(), m.end(), details, swap, &NeverResched);
        }
        debug!("space {}: unmapped {start}..{end}", self.id);
        Ok(())
    }

    /// Run `f` on the mapping tree under the shared lock.
    pub fn with_mappings<R>(&self, f: impl FnOnce(&MappingTree) -> R) -> R {
        f(&self.mappings.read())
    }

    /// Take the address-space lock in `mode`. Exclusive acquisition gives up
    /// with `Interrupted` once `task` has a fatal signal pending.
    pub fn lock(&self, mode: LockMode, task: &dyn Task) -> Result<MmapGuard<'_>, AdviseError> {
        let state = match mode {
            LockMode::Shared => Held::Shared(self.mappings.read()),
            LockMode::Exclusive => Held::Exclusive(
                self.mappings
                    .write_killable(|| task.fatal_signal_pending())
                    .ok_or(AdviseError::Interrupted)?,
            ),
            LockMode::Unlocked => Held::Released,
        };
        Ok(MmapGuard {
            lock: &self.mappings,
            mode,
            state,
        })
    }
}

enum Held<'a> {
    Shared(ReadGuard<'a, MappingTree>),
    Exclusive(WriteGuard<'a, MappingTree>),
    Released,
}

/// The address-space lock, held shared or exclusive.
pub struct MmapGuard<'a> {
    lock: &'a RwLock<MappingTree>,
    mode: LockMode,
    state: Held<'a>,
}

impl MmapGuard<'_> {
    #[inline]
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// The mapping tree.
    ///
    /// # Panics
    /// On a guard taken in [`LockMode::Unlocked`].
    #[must_use]
    pub fn tree(&self) -> &MappingTree {
        match &self.state {
            Held::Shared(tree) => tree,
            Held::Exclusive(tree) => tree,
            Held::Released => unreachable!("mapping tree accessed without the address-space lock"),
        }
    }

    /// The mapping tree, if the lock is held exclusively.
    pub fn tree_mut(&mut self) -> Option<&mut MappingTree> {
        match &mut self.state {
            Held::Exclusive(tree) => Some(tree),
            Held::Shared(_) | Held::Released => None,
        }
    }

    /// Release the lock, run `f`, and take the lock again in the same mode.
    ///
    /// Everything derived from the tree before the call is stale afterwards.
    pub fn with_unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        drop(mem::replace(&mut self.state, Held::Released));
        let result = f();
        self.state = match self.mode {
            LockMode::Shared => Held::Shared(self.lock.read()),
            LockMode::Exclusive => Held::Exclusive(self.lock.write()),
            LockMode::Unlocked => Held::Released,
        };
        result
    }
}
