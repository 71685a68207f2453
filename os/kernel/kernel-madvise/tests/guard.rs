mod common;

use common::{Env, RW, TestTask, is_guard, pages, va};
use kernel_madvise::{AddressSpace, AdviseError, Behavior, IoVec, Mapping, Tunables, VmFlags};
use kernel_vmem::{RssKind, Translation};
use std::thread;

fn anon_space(last: u64, flags: VmFlags) -> AddressSpace {
    let space = AddressSpace::new();
    space.map(Mapping::anonymous(va(0), va(last), flags)).unwrap();
    space
}

#[test]
fn guards_replace_populated_pages_and_survive_discards() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = anon_space(8, RW);
    let task = TestTask::of(&space);

    advisor
        .advise(&task, &space, 0, pages(8), Behavior::PopulateWrite)
        .unwrap();
    assert_eq!(space.counters().get(RssKind::Anon), 8);

    advisor
        .advise(&task, &space, pages(2), pages(4), Behavior::GuardInstall)
        .unwrap();
    assert!((2..6).all(|p| is_guard(&space, va(p))));
    assert!(!is_guard(&space, va(1)) && !is_guard(&space, va(6)));
    assert_eq!(space.counters().get(RssKind::Anon), 4);
    assert!(space.with_mappings(|t| t.get(va(0)).unwrap().anon_vma().is_some()));

    // Touching a guard page faults.
    assert_eq!(
        advisor.advise(&task, &space, pages(3), pages(1), Behavior::PopulateRead),
        Err(AdviseError::Fault)
    );

    // Installing again is a no-op.
    advisor
        .advise(&task, &space, pages(2), pages(4), Behavior::GuardInstall)
        .unwrap();

    advisor
        .advise(&task, &space, 0, pages(8), Behavior::DontNeed)
        .unwrap();
    assert!((2..6).all(|p| is_guard(&space, va(p))));
    assert_eq!(space.counters().get(RssKind::Anon), 0);

    advisor
        .advise(&task, &space, 0, pages(8), Behavior::GuardRemove)
        .unwrap();
    assert!((0..8).all(|p| matches!(space.page_tables().translate(va(p)), Translation::None)));
    advisor
        .advise(&task, &space, pages(3), pages(1), Behavior::PopulateRead)
        .unwrap();
}

#[test]
fn guards_need_plain_writable_anonymous_memory() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);

    let read_only = anon_space(4, VmFlags::READ | VmFlags::MAYREAD);
    let task = TestTask::of(&read_only);
    assert_eq!(
        advisor.advise(&task, &read_only, 0, pages(4), Behavior::GuardInstall),
        Err(AdviseError::InvalidArgument)
    );

    let locked = anon_space(4, RW | VmFlags::LOCKED);
    let task = TestTask::of(&locked);
    assert_eq!(
        advisor.advise(&task, &locked, 0, pages(4), Behavior::GuardInstall),
        Err(AdviseError::InvalidArgument)
    );
    // Removing guards from locked memory is fine.
    advisor
        .advise(&task, &locked, 0, pages(4), Behavior::GuardRemove)
        .unwrap();
}

#[test]
fn exhausted_retries_ask_for_a_restart() {
    let env = Env::default();
    let faulter = env.faulter();
    let tunables = Tunables {
        guard_install_retries: 0,
        ..Tunables::new()
    };
    let advisor = env.advisor(&faulter).with_tunables(tunables);
    let space = anon_space(4, RW);
    let task = TestTask::of(&space);

    let err = advisor
        .advise(&task, &space, 0, pages(4), Behavior::GuardInstall)
        .unwrap_err();
    assert_eq!(err, AdviseError::Restart);
    assert!(err.is_retryable());

    // The vectorized form retries by itself, unless the task is dying.
    task.kill();
    let vec = [IoVec::new(0, pages(4))];
    let out = advisor.advise_vector(&task, &space, &vec, Behavior::GuardInstall);
    assert_eq!(out.advised, 0);
    assert_eq!(out.error, Some(AdviseError::Interrupted));
}

#[test]
fn installation_wins_against_racing_faults() {
    let env = Env::default();
    let faulter = env.faulter();
    let advisor = env.advisor(&faulter);
    let space = anon_space(64, RW);
    let task = TestTask::of(&space);

    thread::scope(|s| {
        s.spawn(|| {
            let faulting = TestTask::of(&space);
            for _ in 0..200 {
                // Stops with a fault once it runs into a guard.
                let _ = advisor.advise(&faulting, &space, 0, pages(64), Behavior::PopulateWrite);
            }
        });
        s.spawn(|| {
            let mut restarts = 0;
            loop {
                match advisor.advise(&task, &space, 0, pages(64), Behavior::GuardInstall) {
                    Err(AdviseError::Restart) => restarts += 1,
                    result => {
                        assert_eq!(result, Ok(()));
                        break;
                    }
                }
            }
            log::debug!("guard install restarted {restarts} times");
        });
    });

    assert!((0..64).all(|p| is_guard(&space, va(p))));
    assert_eq!(space.counters().get(RssKind::Anon), 0);
}
