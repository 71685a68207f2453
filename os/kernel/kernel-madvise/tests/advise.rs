mod common;

use common::{Env, MemFile, RW, RecordingFailures, TestTask, folio_at, pages, va};
use core::ops::Range;
use kernel_madvise::{
    AddressSpace, AdviseError, Advisor, Behavior, Capability, DemandFaulter, FaultError,
    FaultResolver, IoVec, Mapping, MappingError, MemoryFailureError, MmapGuard, Resolved, Task,
    Tunables, VmFlags, errno,
};
use kernel_vmem::info::USER_VA_END;
use kernel_vmem::{NoSwap, PtEntry, RssKind, SwapEntry, VirtualAddress};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn anon_space(last: u64) -> AddressSpace {
    let space = AddressSpace::new();
    space.map(Mapping::anonymous(va(0), va(last), RW)).unwrap();
    space
}

fn flags_at(space: &AddressSpace, page: u64) -> VmFlags {
    space.with_mappings(|t| t.find_containing(va(page)).unwrap().flags())
}

#[test]
fn bad_requests_are_rejected_up_front() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = anon_space(4);
    let task = TestTask::of(&space);

    assert_eq!(
        advisor.advise_code(&task, &space, 0, pages(1), 999),
        Err(AdviseError::InvalidArgument)
    );
    assert_eq!(
        advisor.advise_code(&task, &space, 0, pages(1), Behavior::Collapse.code()),
        Err(AdviseError::InvalidArgument)
    );
    assert_eq!(
        advisor.advise(&task, &space, 1, pages(1), Behavior::DontNeed),
        Err(AdviseError::InvalidArgument)
    );
    assert_eq!(
        advisor.advise(&task, &space, 0, u64::MAX, Behavior::DontNeed),
        Err(AdviseError::InvalidArgument)
    );
    // Empty ranges succeed, even where nothing is mapped.
    advisor
        .advise(&task, &space, pages(100), 0, Behavior::DontNeed)
        .unwrap();
    assert_eq!(
        advisor.advise(&task, &space, pages(100), 1, Behavior::DontNeed),
        Err(AdviseError::NoMapping)
    );
}

#[test]
fn addresses_beyond_user_space_are_rejected() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = anon_space(4);
    let task = TestTask::of(&space);
    advisor
        .advise(&task, &space, 0, pages(4), Behavior::PopulateWrite)
        .unwrap();

    // Would share page-table slots with the mapping at 0.
    let high = VirtualAddress::new(1 << 48);
    assert_eq!(
        space.map(Mapping::anonymous(high, high.add_pages(4), RW)),
        Err(MappingError::InvalidRange)
    );
    for behavior in [Behavior::DontNeed, Behavior::Free, Behavior::GuardInstall] {
        assert_eq!(
            advisor.advise(&task, &space, 1 << 48, pages(4), behavior),
            Err(AdviseError::InvalidArgument)
        );
    }
    assert!((0..4).all(|p| folio_at(&space, va(p)).is_some()));
    assert_eq!(space.counters().get(RssKind::Anon), 4);

    // The last user page is still usable.
    let last = USER_VA_END - pages(1);
    space
        .map(Mapping::anonymous(VirtualAddress::new(last), VirtualAddress::new(USER_VA_END), RW))
        .unwrap();
    advisor
        .advise(&task, &space, last, pages(1), Behavior::PopulateWrite)
        .unwrap();
    assert!(folio_at(&space, VirtualAddress::new(last)).is_some());
    assert_eq!(
        advisor.advise(&task, &space, last, pages(2), Behavior::DontNeed),
        Err(AdviseError::InvalidArgument)
    );
}

#[test]
fn holes_are_reported_after_advising_the_rest() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = AddressSpace::new();
    space.map(Mapping::anonymous(va(0), va(2), RW)).unwrap();
    space.map(Mapping::anonymous(va(4), va(6), RW)).unwrap();
    let task = TestTask::of(&space);

    let err = advisor
        .advise(&task, &space, 0, pages(6), Behavior::DontFork)
        .unwrap_err();
    assert_eq!(err, AdviseError::NoMapping);
    assert_eq!(err.errno(), errno::ENOMEM);
    assert!(flags_at(&space, 0).contains(VmFlags::DONTCOPY));
    assert!(flags_at(&space, 4).contains(VmFlags::DONTCOPY));
}

#[test]
fn attribute_changes_split_and_merge() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = anon_space(8);
    let task = TestTask::of(&space);

    advisor
        .advise(&task, &space, pages(2), pages(2), Behavior::DontFork)
        .unwrap();
    assert_eq!(space.with_mappings(|t| t.len()), 3);
    assert!(flags_at(&space, 2).contains(VmFlags::DONTCOPY));
    assert!(!flags_at(&space, 4).contains(VmFlags::DONTCOPY));

    // Applying the same advice again changes nothing.
    let generation = space.with_mappings(|t| t.generation());
    advisor
        .advise(&task, &space, pages(2), pages(2), Behavior::DontFork)
        .unwrap();
    assert_eq!(space.with_mappings(|t| t.generation()), generation);

    advisor
        .advise(&task, &space, pages(2), pages(2), Behavior::DoFork)
        .unwrap();
    assert_eq!(space.with_mappings(|t| t.len()), 1);
    assert_eq!(flags_at(&space, 0), RW);
}

#[test]
fn mapping_limit_is_a_transient_failure() {
    let env = Env::default();
    let faulter = env.faulter();
    let tunables = Tunables {
        max_map_count: 2,
        ..Tunables::new()
    };
    let advisor = env.advisor(&faulter).with_tunables(tunables);
    let space = anon_space(8);
    let task = TestTask::of(&space);

    let err = advisor
        .advise(&task, &space, pages(2), pages(2), Behavior::Random)
        .unwrap_err();
    assert_eq!(err, AdviseError::ResourceExhausted);
    assert_eq!(err.errno(), errno::EAGAIN);
}

#[test]
fn vector_stops_at_the_first_failing_entry() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = anon_space(8);
    let task = TestTask::of(&space);
    advisor
        .advise(&task, &space, 0, pages(8), Behavior::PopulateWrite)
        .unwrap();

    let iov = [
        IoVec::new(0, pages(2)),
        IoVec::new(pages(2), 5),
        IoVec::new(pages(10), pages(1)),
        IoVec::new(pages(4), pages(1)),
    ];
    let out = advisor.advise_vector(&task, &space, &iov, Behavior::DontNeed);
    assert_eq!(out.advised, pages(2) + 5);
    assert_eq!(out.error, Some(AdviseError::NoMapping));
    assert_eq!(out.into_result(), Ok(pages(2) + 5));

    assert!((0..3).all(|p| folio_at(&space, va(p)).is_none()));
    assert!(folio_at(&space, va(4)).is_some());
    assert_eq!(space.counters().get(RssKind::Anon), 5);

    let out = advisor.advise_vector(&task, &space, &iov[2..], Behavior::DontNeed);
    assert_eq!(out.into_result(), Err(AdviseError::NoMapping));
}

#[test]
fn remote_advice_is_limited_to_hints() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = anon_space(4);
    let iov = [IoVec::new(0, pages(4))];

    let outsider = TestTask::default();
    let out = advisor.process_advise(&outsider, &space, &iov, Behavior::Cold.code(), 0);
    assert_eq!(out.error, Some(AdviseError::PermissionDenied));

    let admin = TestTask::default().with_caps(&[Capability::SysNice]);
    let out = advisor.process_advise(&admin, &space, &iov, Behavior::Cold.code(), 0);
    assert_eq!(out.into_result(), Ok(pages(4)));
    let out = advisor.process_advise(&admin, &space, &iov, Behavior::DontNeed.code(), 0);
    assert_eq!(out.error, Some(AdviseError::InvalidArgument));
    let out = advisor.process_advise(&admin, &space, &iov, Behavior::Cold.code(), 1);
    assert_eq!(out.error, Some(AdviseError::InvalidArgument));

    // Advising oneself through the remote interface is not restricted.
    let own = TestTask::of(&space);
    let out = advisor.process_advise(&own, &space, &iov, Behavior::DontNeed.code(), 0);
    assert_eq!(out.into_result(), Ok(pages(4)));
}

#[test]
fn anonymous_memory_can_be_named() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = anon_space(8);
    let file = Arc::new(MemFile::default());
    space
        .map(Mapping::file(va(10), va(12), RW, file, 0))
        .unwrap();
    let task = TestTask::of(&space);
    let name_at = |page| {
        space.with_mappings(|t| {
            t.find_containing(va(page))
                .unwrap()
                .anon_name()
                .map(|n| n.as_str().to_owned())
        })
    };

    advisor
        .set_anon_name(&task, &space, pages(2), pages(2), Some("heap"))
        .unwrap();
    assert_eq!(space.with_mappings(|t| t.len()), 4);
    assert_eq!(name_at(2).as_deref(), Some("heap"));
    assert_eq!(name_at(0), None);

    advisor
        .set_anon_name(&task, &space, 0, pages(8), Some("heap"))
        .unwrap();
    assert_eq!(space.with_mappings(|t| t.len()), 2);
    assert_eq!(name_at(7).as_deref(), Some("heap"));

    advisor
        .set_anon_name(&task, &space, 0, pages(8), None)
        .unwrap();
    assert_eq!(name_at(3), None);

    assert_eq!(
        advisor.set_anon_name(&task, &space, 0, pages(8), Some("a[1]")),
        Err(AdviseError::InvalidArgument)
    );
    let long = "x".repeat(80);
    assert_eq!(
        advisor.set_anon_name(&task, &space, 0, pages(8), Some(&long)),
        Err(AdviseError::InvalidArgument)
    );
    advisor
        .set_anon_name(&task, &space, 0, pages(8), Some(&long[..79]))
        .unwrap();
    assert_eq!(
        advisor.set_anon_name(&task, &space, pages(10), pages(2), Some("file")),
        Err(AdviseError::BadFile)
    );
    assert_eq!(AdviseError::BadFile.errno(), errno::EBADF);
}

#[test]
fn willneed_revalidates_after_dropping_the_lock() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = Arc::new(AddressSpace::new());
    let unmapper = Arc::clone(&space);
    let file = Arc::new(MemFile {
        on_readahead: Some(Box::new(move || {
            unmapper.unmap(va(4), va(6), &NoSwap).unwrap();
        })),
        ..MemFile::default()
    });
    let ro = VmFlags::READ | VmFlags::MAYREAD;
    space
        .map(Mapping::file(va(0), va(4), ro, Arc::clone(&file) as _, 0))
        .unwrap();
    space.map(Mapping::anonymous(va(4), va(8), RW)).unwrap();
    space
        .page_tables()
        .set_pte(va(7), PtEntry::Swap(SwapEntry::new(9)))
        .unwrap();
    let task = TestTask::of(&space);

    assert_eq!(
        advisor.advise(&task, &space, 0, pages(8), Behavior::WillNeed),
        Err(AdviseError::NoMapping)
    );
    assert_eq!(*file.readahead.lock().unwrap(), vec![(0, pages(4))]);
    // The anonymous tail that survived the unmap was still advised.
    assert_eq!(
        *env.swap.reads.lock().unwrap(),
        vec![(SwapEntry::new(9), va(7))]
    );
}

#[test]
fn willneed_on_shared_memory_swaps_in() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = AddressSpace::new();
    let shm = Arc::new(MemFile::default());
    let flags = RW | VmFlags::SHARED | VmFlags::MAYSHARE;
    space
        .map(Mapping::shared_memory(va(0), va(4), flags, Arc::clone(&shm) as _, 2))
        .unwrap();
    let task = TestTask::of(&space);

    advisor
        .advise(&task, &space, pages(1), pages(2), Behavior::WillNeed)
        .unwrap();
    assert_eq!(*shm.swapins.lock().unwrap(), vec![(pages(3), pages(2))]);
    assert!(shm.readahead.lock().unwrap().is_empty());
}

#[test]
fn populate_reports_fault_failures() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = AddressSpace::new();
    space
        .map(Mapping::anonymous(va(0), va(2), VmFlags::READ | VmFlags::MAYREAD))
        .unwrap();
    space
        .map(Mapping::anonymous(va(4), va(6), RW | VmFlags::PFNMAP))
        .unwrap();
    let task = TestTask::of(&space);

    assert_eq!(
        advisor.advise(&task, &space, 0, pages(2), Behavior::PopulateWrite),
        Err(AdviseError::Fault)
    );
    // Pages before a hole are populated; the hole is out of memory.
    assert_eq!(
        advisor.advise(&task, &space, 0, pages(4), Behavior::PopulateRead),
        Err(AdviseError::OutOfMemory)
    );
    assert!(folio_at(&space, va(1)).is_some());
    assert_eq!(
        advisor.advise(&task, &space, pages(4), pages(2), Behavior::PopulateRead),
        Err(AdviseError::InvalidArgument)
    );
}

/// Counts how often the populate loop asks for faults.
struct CountingResolver<'a> {
    inner: DemandFaulter<'a>,
    calls: AtomicUsize,
}

impl FaultResolver for CountingResolver<'_> {
    fn resolve(
        &self,
        space: &AddressSpace,
        guard: &mut MmapGuard<'_>,
        task: &dyn Task,
        range: Range<VirtualAddress>,
        write: bool,
    ) -> Result<Resolved, FaultError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.resolve(space, guard, task, range, write)
    }
}

#[test]
fn populate_asks_for_faults_in_batches() {
    let env = Env::default();
    let resolver = CountingResolver {
        inner: env.faulter(),
        calls: AtomicUsize::new(0),
    };
    let space = anon_space(16);
    let task = TestTask::of(&space);

    let advisor = Advisor::new(&env.swap, &env.reclaimer, &resolver);
    assert_eq!(advisor.tunables().fault_batch, 16);
    advisor
        .advise(&task, &space, 0, pages(16), Behavior::PopulateWrite)
        .unwrap();
    assert_eq!(resolver.calls.swap(0, Ordering::Relaxed), 1);

    advisor
        .advise(&task, &space, 0, pages(16), Behavior::DontNeed)
        .unwrap();
    let tunables = Tunables {
        fault_batch: 4,
        ..Tunables::new()
    };
    let advisor = Advisor::new(&env.swap, &env.reclaimer, &resolver).with_tunables(tunables);
    advisor
        .advise(&task, &space, 0, pages(16), Behavior::PopulateWrite)
        .unwrap();
    assert_eq!(resolver.calls.load(Ordering::Relaxed), 4);
    assert_eq!(space.counters().get(RssKind::Anon), 16);
}

#[test]
fn memory_failure_injection() {
    let env = Env::default();
    let faulter = env.faulter();
    let failures = RecordingFailures::default();
    let advisor = env.advisor(&faulter).with_memory_failure(&failures);
    let space = anon_space(2);
    let admin = TestTask::of(&space).with_caps(&[Capability::SysAdmin]);

    assert_eq!(
        advisor.advise(&TestTask::of(&space), &space, 0, pages(2), Behavior::HwPoison),
        Err(AdviseError::PermissionDenied)
    );

    advisor
        .advise(&admin, &space, 0, pages(2), Behavior::HwPoison)
        .unwrap();
    let expected: Vec<_> = (0..2)
        .map(|p| folio_at(&space, va(p)).expect("faulted in").pfn())
        .collect();
    assert_eq!(*failures.poisoned.lock().unwrap(), expected);

    assert_eq!(
        advisor.advise(&admin, &space, pages(4), pages(1), Behavior::SoftOffline),
        Err(AdviseError::Fault)
    );

    let no_handler = env.advisor(&faulter);
    assert_eq!(
        no_handler.advise(&admin, &space, 0, pages(1), Behavior::HwPoison),
        Err(AdviseError::InvalidArgument)
    );
}

#[test]
fn memory_failure_results_are_mapped() {
    let env = Env::default();
    let faulter = env.faulter();
    let failures = RecordingFailures {
        poison_result: Some(MemoryFailureError::NotSupported),
        offline_result: Some(MemoryFailureError::Busy),
        ..RecordingFailures::default()
    };
    let advisor = env.advisor(&faulter).with_memory_failure(&failures);
    let space = anon_space(2);
    let admin = TestTask::of(&space).with_caps(&[Capability::SysAdmin]);

    // Frames the handler cannot poison are skipped.
    advisor
        .advise(&admin, &space, 0, pages(2), Behavior::HwPoison)
        .unwrap();
    assert_eq!(failures.poisoned.lock().unwrap().len(), 2);

    let err = advisor
        .advise(&admin, &space, 0, pages(2), Behavior::SoftOffline)
        .unwrap_err();
    assert_eq!(err, AdviseError::Busy);
    assert_eq!(failures.offlined.lock().unwrap().len(), 1);
}
