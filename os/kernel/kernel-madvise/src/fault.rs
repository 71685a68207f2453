//! # Demand faulting
//!
//! [`DemandFaulter`] is the default [`FaultResolver`]: it makes pages present
//! the way an anonymous or page-cache fault would, allocating fresh folios,
//! breaking copy-on-write sharing on write, and reading swapped pages back.

use crate::backend::{FaultResolver, FolioAllocator, Resolved, Task};
use crate::config::DEFAULT_FAULT_BATCH;
use crate::error::FaultError;
use crate::mapping::{Mapping, VmFlags};
use crate::space::{AddressSpace, MmapGuard};
use alloc::sync::Arc;
use core::ops::Range;
use kernel_vmem::info::PMD_SIZE;
use kernel_vmem::{
    Folio, FolioKind, HugeLeaf, Marker, PmdEntry, PresentPte, PtEntry, PteBits, RssCounters,
    RssKind, SwapBackend, SwapEntry, TableIndex, VirtualAddress,
};
use log::trace;

/// Resolves faults from a folio allocator and a swap device.
pub struct DemandFaulter<'a> {
    allocator: &'a dyn FolioAllocator,
    swap: &'a dyn SwapBackend,
    batch: usize,
}

/// What a fault at one address may do.
#[derive(Debug, Clone, Copy)]
struct Access {
    write: bool,
    shared: bool,
    /// The mapping permits writes.
    may_write: bool,
    /// Kind of folio a fresh page gets.
    kind: FolioKind,
    huge: bool,
}

impl Access {
    fn check(mapping: &Mapping, write: bool) -> Result<Self, FaultError> {
        let flags = mapping.flags();
        if flags.intersects(VmFlags::IO | VmFlags::PFNMAP) {
            return Err(FaultError::InvalidArgument);
        }
        let needed = if write { VmFlags::WRITE } else { VmFlags::READ };
        if !flags.contains(needed) {
            return Err(FaultError::Fault);
        }
        let shared = flags.contains(VmFlags::SHARED);
        let kind = if mapping.is_anonymous() || (write && !shared) {
            FolioKind::Anonymous
        } else {
            FolioKind::File
        };
        Ok(Self {
            write,
            shared,
            may_write: flags.contains(VmFlags::WRITE),
            kind,
            huge: mapping.is_hugetlb() && mapping.page_size() == PMD_SIZE,
        })
    }

    /// Bits of a freshly installed page of `kind`.
    fn bits(self, kind: FolioKind) -> PteBits {
        let private = kind == FolioKind::Anonymous;
        PteBits::user_page(self.may_write && (self.shared || private))
            .with_dirty(self.write)
            .with_exclusive(private)
    }
}

enum Outcome {
    Mapped(usize),
    SwapIn(SwapEntry),
    Failed(FaultError),
}

impl<'a> DemandFaulter<'a> {
    #[must_use]
    pub const fn new(allocator: &'a dyn FolioAllocator, swap: &'a dyn SwapBackend) -> Self {
        Self {
            allocator,
            swap,
            batch: DEFAULT_FAULT_BATCH,
        }
    }

    /// Resolve at most `batch` pages per call.
    #[must_use]
    pub const fn with_batch(mut self, batch: usize) -> Self {
        self.batch = if batch == 0 { 1 } else { batch };
        self
    }

    fn fault_page(&self, space: &AddressSpace, addr: VirtualAddress, access: Access) -> Outcome {
        let counters = space.counters();
        let outcome = space.page_tables().with_leaf(addr, true, |table| {
            let slot = table.get_mut(TableIndex::l1(addr));
            match &mut *slot {
                PtEntry::None => {
                    let Some(folio) = self.allocator.allocate(0, access.kind) else {
                        return Outcome::Failed(FaultError::OutOfMemory);
                    };
                    counters.add(RssCounters::kind_of(&folio), 1);
                    *slot = PtEntry::Present(PresentPte::new(folio, 0, access.bits(access.kind)));
                    Outcome::Mapped(1)
                }
                PtEntry::Present(pte) => {
                    let bits = pte.bits();
                    if !access.write || bits.writable() {
                        let dirty = bits.dirty() || access.write;
                        pte.set_bits(bits.with_young(true).with_dirty(dirty));
                        return Outcome::Mapped(1);
                    }
                    let folio = pte.folio();
                    let reuse = access.shared
                        || (folio.is_anon() && !folio.likely_mapped_shared());
                    if reuse {
                        pte.set_bits(bits.with_writable(true).with_young(true).with_dirty(true));
                        return Outcome::Mapped(1);
                    }
                    let old = RssCounters::kind_of(folio);
                    let Some(copy) = self.allocator.allocate(0, FolioKind::Anonymous) else {
                        return Outcome::Failed(FaultError::OutOfMemory);
                    };
                    *slot = PtEntry::Present(PresentPte::new(
                        copy,
                        0,
                        access.bits(FolioKind::Anonymous),
                    ));
                    counters.add(old, -1);
                    counters.add(RssKind::Anon, 1);
                    Outcome::Mapped(1)
                }
                PtEntry::Swap(entry) => Outcome::SwapIn(*entry),
                PtEntry::Marker(Marker::Guard) => Outcome::Failed(FaultError::Fault),
                PtEntry::Marker(Marker::Poisoned) => Outcome::Failed(FaultError::Poisoned),
            }
        });
        // A huge leaf already maps the address.
        outcome.unwrap_or(Outcome::Mapped(1))
    }

    fn fault_huge(
        &self,
        space: &AddressSpace,
        addr: VirtualAddress,
        end: VirtualAddress,
        access: Access,
    ) -> Outcome {
        let pages = addr.pages_until(addr.next_boundary(PMD_SIZE, end));
        let counters = space.counters();
        let outcome = space.page_tables().with_pmd(addr, true, |pmd| match pmd {
            PmdEntry::None => {
                let Some(folio) = self.allocator.allocate(9, access.kind) else {
                    return Outcome::Failed(FaultError::OutOfMemory);
                };
                #[allow(clippy::cast_possible_wrap)]
                counters.add(RssCounters::kind_of(&folio), folio.nr_pages() as isize);
                *pmd = PmdEntry::Huge(HugeLeaf::new(folio, access.bits(access.kind)));
                Outcome::Mapped(pages)
            }
            PmdEntry::Huge(leaf) => {
                let bits = leaf.bits();
                leaf.set_bits(bits.with_young(true).with_dirty(bits.dirty() || access.write));
                Outcome::Mapped(pages)
            }
            PmdEntry::Table(_) => Outcome::Failed(FaultError::InvalidArgument),
        });
        outcome.unwrap_or(Outcome::Mapped(pages))
    }

    /// Map a folio read back from swap if the entry still refers to `entry`.
    fn install_swapped(
        &self,
        space: &AddressSpace,
        addr: VirtualAddress,
        entry: SwapEntry,
        folio: &Arc<Folio>,
        access: Access,
    ) -> bool {
        let installed = space
            .page_tables()
            .with_leaf(addr, false, |table| {
                let slot = table.get_mut(TableIndex::l1(addr));
                if !matches!(slot, PtEntry::Swap(e) if *e == entry) {
                    return false;
                }
                let bits = access.bits(FolioKind::Anonymous);
                *slot = PtEntry::Present(PresentPte::new(Arc::clone(folio), 0, bits));
                true
            })
            .unwrap_or(false);
        if installed {
            space.counters().add(RssKind::Swap, -1);
            space.counters().add(RssKind::Anon, 1);
            if folio.delete_from_swap_cache().is_some() {
                self.swap.free_swap_slots(entry, 1);
            }
        }
        installed
    }
}

impl FaultResolver for DemandFaulter<'_> {
    fn resolve(
        &self,
        space: &AddressSpace,
        guard: &mut MmapGuard<'_>,
        task: &dyn Task,
        range: Range<VirtualAddress>,
        write: bool,
    ) -> Result<Resolved, FaultError> {
        let mut addr = range.start;
        let mut pages = 0;
        let mut lock_dropped = false;
        let mut failure = None;

        while addr < range.end && pages < self.batch {
            if task.fatal_signal_pending() {
                failure = Some(FaultError::Interrupted);
                break;
            }
            let access = match guard.tree().find_containing(addr) {
                Some(mapping) => Access::check(mapping, write),
                None => Err(FaultError::NoMapping),
            };
            let access = match access {
                Ok(access) => access,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let outcome = if access.huge {
                self.fault_huge(space, addr, range.end, access)
            } else {
                self.fault_page(space, addr, access)
            };
            match outcome {
                Outcome::Mapped(n) => {
                    pages += n;
                    addr = addr.add_pages(n);
                }
                Outcome::SwapIn(entry) => {
                    lock_dropped = true;
                    let read = guard.with_unlocked(|| self.swap.read_swap_async(entry, addr));
                    let Some(folio) = read else {
                        failure = Some(FaultError::Io);
                        break;
                    };
                    trace!("swapped in {entry:?} at {addr}");
                    // The next round revalidates the mapping and sees either
                    // the installed page or whatever replaced the entry.
                    let _ = self.install_swapped(space, addr, entry, &folio, access);
                }
                Outcome::Failed(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            Some(e) if pages == 0 => Err(e),
            _ => Ok(Resolved {
                pages,
                lock_dropped,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SequentialAllocator;
    use crate::behavior::LockMode;
    use kernel_sync::Resched;
    use kernel_vmem::info::PAGE_SIZE;
    use kernel_vmem::{FrameNumber, NoSwap, Translation};

    struct Idle;
    impl Resched for Idle {}
    impl Task for Idle {}

    fn va(page: u64) -> VirtualAddress {
        VirtualAddress::new(page * PAGE_SIZE)
    }

    fn space_with(mapping: Mapping) -> AddressSpace {
        let space = AddressSpace::new();
        space.map(mapping).unwrap();
        space
    }

    #[test]
    fn resolves_in_batches() {
        let alloc = SequentialAllocator::new(FrameNumber::new(0x100), 64);
        let faulter = DemandFaulter::new(&alloc, &NoSwap).with_batch(3);
        let space = space_with(Mapping::anonymous(va(0), va(8), VmFlags::READ | VmFlags::WRITE));
        let mut guard = space.lock(LockMode::Shared, &Idle).unwrap();
        let r = faulter.resolve(&space, &mut guard, &Idle, va(0)..va(8), true).unwrap();
        assert_eq!(r.pages, 3);
        assert!(!r.lock_dropped);
        assert_eq!(space.counters().get(RssKind::Anon), 3);
        let Translation::Present { bits, .. } = space.page_tables().translate(va(2)) else {
            panic!("page not mapped");
        };
        assert!(bits.writable() && bits.dirty());
    }

    #[test]
    fn permissions_and_markers_are_honoured() {
        let alloc = SequentialAllocator::new(FrameNumber::new(0x100), 64);
        let faulter = DemandFaulter::new(&alloc, &NoSwap);
        let space = space_with(Mapping::anonymous(va(0), va(4), VmFlags::READ));
        let mut guard = space.lock(LockMode::Shared, &Idle).unwrap();
        assert_eq!(
            faulter.resolve(&space, &mut guard, &Idle, va(0)..va(4), true),
            Err(FaultError::Fault)
        );
        space
            .page_tables()
            .set_pte(va(1), PtEntry::Marker(Marker::Guard))
            .unwrap();
        let r = faulter.resolve(&space, &mut guard, &Idle, va(0)..va(4), false).unwrap();
        assert_eq!(r.pages, 1);
        assert_eq!(
            faulter.resolve(&space, &mut guard, &Idle, va(1)..va(4), false),
            Err(FaultError::Fault)
        );
        assert_eq!(
            faulter.resolve(&space, &mut guard, &Idle, va(4)..va(5), false),
            Err(FaultError::NoMapping)
        );
    }

    #[test]
    fn writing_a_shared_page_breaks_cow() {
        let alloc = SequentialAllocator::new(FrameNumber::new(0x100), 64);
        let faulter = DemandFaulter::new(&alloc, &NoSwap);
        let space = space_with(Mapping::anonymous(va(0), va(1), VmFlags::READ | VmFlags::WRITE));
        let folio = Folio::new(FrameNumber::new(7), 0, FolioKind::Anonymous);
        let bits = PteBits::user_page(false);
        space
            .page_tables()
            .set_pte(va(0), PtEntry::Present(PresentPte::new(folio.clone(), 0, bits)))
            .unwrap();
        // A second mapping elsewhere makes the folio shared.
        let other = PresentPte::new(folio.clone(), 0, bits);
        space.counters().add(RssKind::Anon, 1);

        let mut guard = space.lock(LockMode::Shared, &Idle).unwrap();
        faulter.resolve(&space, &mut guard, &Idle, va(0)..va(1), true).unwrap();
        let Translation::Present { folio: now, bits, .. } = space.page_tables().translate(va(0))
        else {
            panic!("page not mapped");
        };
        assert!(!Arc::ptr_eq(&now, &folio));
        assert!(bits.writable());
        assert_eq!(folio.mapcount(), 1);
        drop(other);
        assert_eq!(space.counters().get(RssKind::Anon), 1);
    }

    #[test]
    fn hugetlb_mappings_get_huge_leaves() {
        let alloc = SequentialAllocator::new(FrameNumber::new(0), 2048);
        let faulter = DemandFaulter::new(&alloc, &NoSwap);
        let base = VirtualAddress::new(PMD_SIZE);
        let space = space_with(
            Mapping::anonymous(base, base + 2 * PMD_SIZE, VmFlags::READ | VmFlags::WRITE)
                .with_hugetlb(PMD_SIZE),
        );
        let mut guard = space.lock(LockMode::Shared, &Idle).unwrap();
        let end = base + 2 * PMD_SIZE;
        let r = faulter.resolve(&space, &mut guard, &Idle, base..end, false).unwrap();
        assert_eq!(r.pages, 512);
        let r = faulter
            .resolve(&space, &mut guard, &Idle, base + PMD_SIZE..end, false)
            .unwrap();
        assert_eq!(r.pages, 512);
        assert_eq!(space.counters().get(RssKind::Anon), 1024);
        assert!(matches!(
            space.page_tables().translate(base + PMD_SIZE),
            Translation::Huge { .. }
        ));
    }
}
