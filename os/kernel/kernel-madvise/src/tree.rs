//! # Mapping tree
//!
//! The ordered set of mappings of one address space, keyed by start address.
//! Mappings never overlap. Every structural or attribute change bumps the
//! [generation](MappingTree::generation), which is how code that dropped the
//! address-space lock detects that its view went stale.

use crate::error::MappingError;
use crate::mapping::Mapping;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Bound;
use kernel_vmem::VirtualAddress;
use kernel_vmem::info::USER_VA_END;

#[derive(Debug, Default)]
pub struct MappingTree {
    mappings: BTreeMap<VirtualAddress, Mapping>,
    generation: u64,
}

impl MappingTree {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
            generation: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    #[inline]
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) const fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    /// The mapping starting exactly at `start`.
    #[must_use]
    pub fn get(&self, start: VirtualAddress) -> Option<&Mapping> {
        self.mappings.get(&start)
    }

    pub(crate) fn get_mut(&mut self, start: VirtualAddress) -> Option<&mut Mapping> {
        self.mappings.get_mut(&start)
    }

    fn key_containing(&self, va: VirtualAddress) -> Option<VirtualAddress> {
        self.mappings
            .range(..=va)
            .next_back()
            .filter(|(_, m)| m.end() > va)
            .map(|(k, _)| *k)
    }

    #[must_use]
    pub fn find_containing(&self, va: VirtualAddress) -> Option<&Mapping> {
        self.mappings.get(&self.key_containing(va)?)
    }

    /// The first mapping that ends above `va`: the one containing it, or the
    /// next one after it.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Mapping> {
        self.find_containing(va).or_else(|| {
            self.mappings
                .range((Bound::Excluded(va), Bound::Unbounded))
                .next()
                .map(|(_, m)| m)
        })
    }

    /// Mappings intersecting `[start, end)`, in address order.
    pub fn overlapping(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> impl Iterator<Item = &Mapping> {
        let first = self.key_containing(start).unwrap_or(start);
        self.mappings.range(first..end).map(|(_, m)| m)
    }

    /// Add `mapping`. It must lie in the user half of the address space.
    pub fn insert(&mut self, mapping: Mapping) -> Result<(), MappingError> {
        if mapping.start() >= mapping.end() || mapping.end().as_u64() > USER_VA_END {
            return Err(MappingError::InvalidRange);
        }
        if self
            .overlapping(mapping.start(), mapping.end())
            .next()
            .is_some()
        {
            return Err(MappingError::Overlap);
        }
        self.mappings.insert(mapping.start(), mapping);
        self.touch();
        Ok(())
    }

    /// Make `at` a mapping boundary. A no-op if it already is one or no
    /// mapping contains it.
    pub(crate) fn split(
        &mut self,
        at: VirtualAddress,
        max_map_count: usize,
    ) -> Result<(), MappingError> {
        let Some(key) = self.key_containing(at) else {
            return Ok(());
        };
        if key == at {
            return Ok(());
        }
        if self.mappings.len() >= max_map_count {
            return Err(MappingError::TooManyMappings);
        }
        let Some(head) = self.mappings.get_mut(&key) else {
            return Ok(());
        };
        let tail = head.split_off(at);
        self.mappings.insert(at, tail);
        self.touch();
        Ok(())
    }

    /// Merge the mapping containing `va` with compatible neighbours and
    /// return the result.
    pub(crate) fn merge_around(&mut self, va: VirtualAddress) -> Option<&Mapping> {
        let mut key = self.key_containing(va)?;
        let mut merged = false;

        let end = self.mappings.get(&key)?.end();
        let absorb_next = matches!(
            (self.mappings.get(&key), self.mappings.get(&end)),
            (Some(cur), Some(next)) if cur.can_merge_with(next)
        );
        if absorb_next
            && let Some(next) = self.mappings.remove(&end)
            && let Some(cur) = self.mappings.get_mut(&key)
        {
            cur.absorb(&next);
            merged = true;
        }

        if let Some(prev_key) = self.mappings.range(..key).next_back().map(|(k, _)| *k) {
            let absorb_into_prev = matches!(
                (self.mappings.get(&prev_key), self.mappings.get(&key)),
                (Some(prev), Some(cur)) if prev.can_merge_with(cur)
            );
            if absorb_into_prev
                && let Some(cur) = self.mappings.remove(&key)
                && let Some(prev) = self.mappings.get_mut(&prev_key)
            {
                prev.absorb(&cur);
                key = prev_key;
                merged = true;
            }
        }

        if merged {
            self.touch();
        }
        self.mappings.get(&key)
    }

    /// Remove `[start, end)` from the tree, splitting mappings that straddle
    /// its edges. Returns the removed pieces.
    pub(crate) fn remove_range(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        max_map_count: usize,
    ) -> Result<Vec<Mapping>, MappingError> {
        self.split(start, max_map_count)?;
        self.split(end, max_map_count)?;
        let keys: Vec<_> = self.mappings.range(start..end).map(|(k, _)| *k).collect();
        let removed: Vec<_> = keys
            .into_iter()
            .filter_map(|k| self.mappings.remove(&k))
            .collect();
        if !removed.is_empty() {
            self.touch();
        }
        Ok(removed)
    }
}
