#![allow(dead_code)]

use kernel_madvise::{
    AddressSpace, Advisor, BackingFile, Capability, DemandFaulter, FileError, MemoryFailure,
    MemoryFailureError, Reclaimer, SequentialAllocator, Task, VmFlags,
};
use kernel_sync::Resched;
use kernel_vmem::info::PAGE_SIZE;
use kernel_vmem::{Folio, FrameNumber, SwapBackend, SwapEntry, Translation, VirtualAddress};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const RW: VmFlags = VmFlags::READ
    .union(VmFlags::WRITE)
    .union(VmFlags::MAYREAD)
    .union(VmFlags::MAYWRITE);

pub fn va(page: u64) -> VirtualAddress {
    VirtualAddress::new(page * PAGE_SIZE)
}

pub fn pages(n: u64) -> u64 {
    n * PAGE_SIZE
}

/// A task with a configurable identity, privileges and kill state.
#[derive(Default)]
pub struct TestTask {
    pub space: Option<u64>,
    pub caps: Vec<Capability>,
    pub killed: AtomicBool,
}

impl TestTask {
    pub fn of(space: &AddressSpace) -> Self {
        Self {
            space: Some(space.id()),
            ..Self::default()
        }
    }

    pub fn with_caps(mut self, caps: &[Capability]) -> Self {
        self.caps = caps.to_vec();
        self
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }
}

impl Resched for TestTask {}

impl Task for TestTask {
    fn fatal_signal_pending(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    fn capable(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    fn address_space_id(&self) -> Option<u64> {
        self.space
    }
}

/// Records what reclaim was asked to do.
#[derive(Default)]
pub struct RecordingReclaimer {
    pub reclaimed: Mutex<Vec<FrameNumber>>,
    pub deactivated: AtomicUsize,
    pub drains: AtomicUsize,
}

impl RecordingReclaimer {
    pub fn reclaimed(&self) -> Vec<FrameNumber> {
        self.reclaimed.lock().unwrap().clone()
    }
}

impl Reclaimer for RecordingReclaimer {
    fn deactivate(&self, folio: &Arc<Folio>) {
        self.deactivated.fetch_add(1, Ordering::Relaxed);
        let _ = folio.deactivate();
    }

    fn reclaim(&self, folios: Vec<Arc<Folio>>) {
        self.reclaimed
            .lock()
            .unwrap()
            .extend(folios.iter().map(|f| f.pfn()));
    }

    fn drain(&self) {
        self.drains.fetch_add(1, Ordering::Relaxed);
    }
}

/// A swap device that only counts.
#[derive(Default)]
pub struct CountingSwap {
    pub freed: AtomicUsize,
    pub reads: Mutex<Vec<(SwapEntry, VirtualAddress)>>,
}

impl SwapBackend for CountingSwap {
    fn free_swap_slots(&self, _entry: SwapEntry, nr: usize) {
        self.freed.fetch_add(nr, Ordering::Relaxed);
    }

    fn read_swap_async(&self, entry: SwapEntry, addr: VirtualAddress) -> Option<Arc<Folio>> {
        self.reads.lock().unwrap().push((entry, addr));
        None
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// A file that records the calls it gets.
#[derive(Default)]
pub struct MemFile {
    pub readahead: Mutex<Vec<(u64, u64)>>,
    pub swapins: Mutex<Vec<(u64, u64)>>,
    pub holes: Mutex<Vec<(u64, u64)>>,
    pub dax: bool,
    pub writable: bool,
    /// Runs inside `advise_readahead`, while the address-space lock is free.
    pub on_readahead: Option<Hook>,
}

impl MemFile {
    pub fn writable() -> Self {
        Self {
            writable: true,
            ..Self::default()
        }
    }
}

impl BackingFile for MemFile {
    fn advise_readahead(&self, offset: u64, len: u64) {
        self.readahead.lock().unwrap().push((offset, len));
        if let Some(hook) = &self.on_readahead {
            hook();
        }
    }

    fn swapin_range(&self, offset: u64, len: u64) {
        self.swapins.lock().unwrap().push((offset, len));
    }

    fn punch_hole(&self, offset: u64, len: u64) -> Result<(), FileError> {
        if !self.writable {
            return Err(FileError::PermissionDenied);
        }
        self.holes.lock().unwrap().push((offset, len));
        Ok(())
    }

    fn is_dax(&self) -> bool {
        self.dax
    }

    fn may_pageout(&self) -> bool {
        self.writable
    }
}

/// Records injected failures.
#[derive(Default)]
pub struct RecordingFailures {
    pub poisoned: Mutex<Vec<FrameNumber>>,
    pub offlined: Mutex<Vec<FrameNumber>>,
    pub poison_result: Option<MemoryFailureError>,
    pub offline_result: Option<MemoryFailureError>,
}

impl MemoryFailure for RecordingFailures {
    fn soft_offline(&self, pfn: FrameNumber) -> Result<(), MemoryFailureError> {
        self.offlined.lock().unwrap().push(pfn);
        self.offline_result.map_or(Ok(()), Err)
    }

    fn memory_failure(&self, pfn: FrameNumber) -> Result<(), MemoryFailureError> {
        self.poisoned.lock().unwrap().push(pfn);
        self.poison_result.map_or(Ok(()), Err)
    }
}

/// The collaborators of an [`Advisor`], owned in one place.
pub struct Env {
    pub alloc: SequentialAllocator,
    pub swap: CountingSwap,
    pub reclaimer: RecordingReclaimer,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            alloc: SequentialAllocator::new(FrameNumber::new(0x1000), 1 << 20),
            swap: CountingSwap::default(),
            reclaimer: RecordingReclaimer::default(),
        }
    }
}

impl Env {
    pub fn faulter(&self) -> DemandFaulter<'_> {
        DemandFaulter::new(&self.alloc, &self.swap)
    }

    pub fn advisor<'a>(&'a self, faulter: &'a DemandFaulter<'a>) -> Advisor<'a> {
        Advisor::new(&self.swap, &self.reclaimer, faulter)
    }
}

/// The folio mapped at `addr`, if a base page is present there.
pub fn folio_at(space: &AddressSpace, addr: VirtualAddress) -> Option<Arc<Folio>> {
    match space.page_tables().translate(addr) {
        Translation::Present { folio, .. } | Translation::Huge { folio, .. } => Some(folio),
        _ => None,
    }
}

pub fn is_guard(space: &AddressSpace, addr: VirtualAddress) -> bool {
    matches!(
        space.page_tables().translate(addr),
        Translation::Marker(kernel_vmem::Marker::Guard)
    )
}
