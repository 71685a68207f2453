use core::convert::Infallible;
use kernel_sync::Resched;
use kernel_vmem::info::{PAGE_SIZE, PMD_SIZE, RECLAIM_BATCH};
use kernel_vmem::{
    LeafCursor, Marker, PageTables, PageWalkOps, PtEntry, PteAction, TableIndex, VirtualAddress,
    WalkOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};

fn va(page: u64) -> VirtualAddress {
    VirtualAddress::new(page * PAGE_SIZE)
}

#[derive(Default)]
struct Census {
    seen: Vec<VirtualAddress>,
}

impl PageWalkOps for Census {
    type Error = Infallible;

    fn pte_entry(&mut self, leaf: &mut LeafCursor<'_>) -> Result<PteAction, Infallible> {
        self.seen.push(leaf.addr());
        Ok(PteAction::Next(1))
    }
}

/// Always wants the processor back and runs `on_yield` when given it.
struct Busy<F: Fn(usize)> {
    yields: AtomicUsize,
    on_yield: F,
}

impl<F: Fn(usize)> Busy<F> {
    const fn new(on_yield: F) -> Self {
        Self {
            yields: AtomicUsize::new(0),
            on_yield,
        }
    }
}

impl<F: Fn(usize)> Resched for Busy<F> {
    fn need_resched(&self) -> bool {
        true
    }

    fn cond_resched(&self) {
        let n = self.yields.fetch_add(1, Ordering::Relaxed);
        (self.on_yield)(n);
    }
}

fn guards(pt: &PageTables, pages: core::ops::Range<u64>) {
    for p in pages {
        pt.set_pte(va(p), PtEntry::Marker(Marker::Guard)).unwrap();
    }
}

#[test]
fn leaf_lock_is_released_while_yielding() {
    let pt = PageTables::new();
    guards(&pt, 0..64);

    // Writing the table from the yield would deadlock if the walker still
    // held its lock.
    let sched = Busy::new(|n| {
        if n == 0 {
            pt.set_pte(va(100), PtEntry::Marker(Marker::Guard)).unwrap();
        }
    });
    let mut census = Census::default();
    let outcome = pt.walk(va(0), va(128), &mut census, &sched).unwrap();

    assert_eq!(outcome, WalkOutcome::Completed);
    assert_eq!(census.seen.len(), 65);
    assert_eq!(census.seen.last(), Some(&va(100)));
    assert_eq!(sched.yields.load(Ordering::Relaxed), 128 / RECLAIM_BATCH - 1);
}

#[test]
fn walk_survives_table_freed_while_yielding() {
    let pt = PageTables::new();
    guards(&pt, 0..40);

    let sched = Busy::new(|n| {
        if n == 0 {
            pt.with_leaf(va(0), false, |table| {
                for p in 0..40 {
                    let _ = table.set(TableIndex::l1(va(p)), PtEntry::None);
                }
            })
            .unwrap();
            assert_eq!(pt.free_empty_tables(va(0), VirtualAddress::new(PMD_SIZE)), 1);
        }
    });
    let mut census = Census::default();
    let outcome = pt.walk(va(0), va(64), &mut census, &sched).unwrap();

    assert_eq!(outcome, WalkOutcome::Completed);
    assert_eq!(census.seen.len(), RECLAIM_BATCH);
    assert_eq!(sched.yields.load(Ordering::Relaxed), 1);
}
