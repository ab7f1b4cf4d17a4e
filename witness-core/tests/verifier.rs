use std::sync::Arc;

use witness_core::{
    AcquireFlags, Capacity, Context, Degraded, Exhausted, FatalError, LockClass, LockFlags,
    LockObject, OrderEntry, Policy, Recorder, Site, Verifier, VerifierConfig, Violation,
};

fn verifier(config: VerifierConfig) -> (Verifier, Arc<Recorder>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let recorder = Arc::new(Recorder::new());
    let verifier = Verifier::new(config).unwrap().with_trap(recorder.clone());
    (verifier, recorder)
}

fn seeded(chains: &[&[(&str, LockClass)]]) -> VerifierConfig {
    VerifierConfig {
        policy: Policy {
            order: chains
                .iter()
                .map(|chain| {
                    chain
                        .iter()
                        .map(|&(name, class)| OrderEntry::new(name, class))
                        .collect()
                })
                .collect(),
            ..Policy::default()
        },
        ..VerifierConfig::default()
    }
}

fn sleep_lock(verifier: &Verifier, name: &str) -> LockObject {
    lock_object(verifier, name, LockClass::SleepMutex, LockFlags::WITNESS)
}

fn lock_object(verifier: &Verifier, name: &str, class: LockClass, flags: LockFlags) -> LockObject {
    let object = LockObject::new(name, class, flags);
    verifier.init(&object).unwrap();
    object
}

fn site(line: u32) -> Site {
    Site::new("verifier.rs", line)
}

fn acquire(verifier: &Verifier, cx: Context, object: &LockObject, line: u32) {
    verifier
        .lock(cx, object, AcquireFlags::empty(), site(line))
        .unwrap();
}

fn release(verifier: &Verifier, cx: Context, object: &LockObject) {
    verifier.unlock(cx, object, site(0)).unwrap();
}

const T1: Context = Context::new(1, 0);
const T2: Context = Context::new(2, 0);
const T3: Context = Context::new(3, 0);

#[test]
fn learned_order_is_irreversible() {
    let (verifier, recorder) = verifier(VerifierConfig::default());
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");

    acquire(&verifier, T1, &a, 10);
    acquire(&verifier, T1, &b, 11);
    release(&verifier, T1, &b);
    release(&verifier, T1, &a);
    assert!(verifier.is_ordered_before("A", "B"));
    assert!(recorder.is_empty());

    acquire(&verifier, T2, &b, 20);
    acquire(&verifier, T2, &a, 21);

    let violations = recorder.take();
    assert_eq!(violations.len(), 1);
    match violations[0] {
        Violation::Reversal {
            ref first,
            ref second,
            ref third,
        } => {
            assert_eq!(&*first.name, "A");
            assert_eq!(first.object, None);
            assert_eq!(first.site, Some(site(10)));
            assert_eq!(&*second.name, "B");
            assert_eq!(second.object, Some(b.id()));
            assert_eq!(second.site, Some(site(20)));
            assert_eq!(third.object, Some(a.id()));
            assert_eq!(third.site, Some(site(21)));
        }
        ref other => panic!("unexpected violation {other:?}"),
    }

    // The reversal was not learned.
    assert!(verifier.is_ordered_before("A", "B"));
    assert!(!verifier.is_ordered_before("B", "A"));
}

#[test]
fn blessed_pairs_are_not_reported() {
    let mut config = VerifierConfig::default();
    config.policy.blessed = vec![("B".to_string(), "A".to_string())];
    let (verifier, recorder) = verifier(config);
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");

    acquire(&verifier, T1, &a, 1);
    acquire(&verifier, T1, &b, 2);
    release(&verifier, T1, &b);
    release(&verifier, T1, &a);

    acquire(&verifier, T2, &b, 3);
    acquire(&verifier, T2, &a, 4);
    assert!(recorder.is_empty());
}

#[test]
fn consistent_order_across_threads() {
    let (verifier, recorder) = verifier(VerifierConfig::default());
    let verifier = Arc::new(verifier);
    let a = Arc::new(sleep_lock(&verifier, "A"));
    let b = Arc::new(sleep_lock(&verifier, "B"));

    // Each thread holds both locks only while holding `outer`, so the
    // instances are never actually contended.
    let outer = parking_lot::Mutex::new(());
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let cx = Context::current();
                for _ in 0..50 {
                    let _outer = outer.lock();
                    acquire(&verifier, cx, &a, 1);
                    acquire(&verifier, cx, &b, 2);
                    release(&verifier, cx, &b);
                    release(&verifier, cx, &a);
                }
                assert_eq!(verifier.thread_exit(cx), 0);
            });
        }
    });
    assert!(recorder.is_empty());
    assert_eq!(verifier.stats().lock_list_chunks.in_use, 0);
}

#[test]
fn duplicates_are_reported_once() {
    let (verifier, recorder) = verifier(VerifierConfig::default());
    let first = sleep_lock(&verifier, "vnode interlock");
    let second = sleep_lock(&verifier, "vnode interlock");

    for _ in 0..3 {
        acquire(&verifier, T1, &first, 1);
        acquire(&verifier, T1, &second, 2);
        release(&verifier, T1, &second);
        release(&verifier, T1, &first);
    }

    let violations = recorder.take();
    assert_eq!(
        violations,
        vec![Violation::Duplicate {
            name: Arc::from("vnode interlock"),
            first: Some(site(1)),
            second: site(2),
        }]
    );
}

#[test]
fn duplicate_allowed_names_are_quiet() {
    let (verifier, recorder) = verifier(VerifierConfig::kernel());
    let parent = sleep_lock(&verifier, "process lock");
    let child = sleep_lock(&verifier, "process lock");

    acquire(&verifier, T1, &parent, 1);
    acquire(&verifier, T1, &child, 2);
    assert!(recorder.is_empty());
}

#[test]
fn well_nested_release_leaves_nothing_held() {
    let (verifier, recorder) = verifier(VerifierConfig::default());
    let locks: Vec<_> = (0..7)
        .map(|i| sleep_lock(&verifier, &format!("level {i}")))
        .collect();

    for (line, lock) in locks.iter().enumerate() {
        acquire(&verifier, T1, lock, line as u32);
    }
    assert_eq!(verifier.list_locks(T1).len(), locks.len());
    assert!(verifier.stats().lock_list_chunks.in_use > 1);

    for lock in locks.iter().rev() {
        release(&verifier, T1, lock);
    }
    assert!(verifier.list_locks(T1).is_empty());
    assert_eq!(verifier.about_to_block(T1, None, site(99)), 0);
    assert_eq!(verifier.stats().lock_list_chunks.in_use, 0);
    assert!(recorder.is_empty());
}

#[test]
fn idle_threads_have_no_stack() {
    let (verifier, _recorder) = verifier(VerifierConfig::default());
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");

    for thread in 100..400 {
        let cx = Context::new(thread, 0);
        acquire(&verifier, cx, &a, 1);
        release(&verifier, cx, &a);
    }
    assert_eq!(verifier.stats().threads, 0);

    acquire(&verifier, T1, &a, 10);
    acquire(&verifier, T2, &b, 20);
    assert_eq!(verifier.stats().threads, 2);
    release(&verifier, T1, &a);
    assert_eq!(verifier.stats().threads, 1);
    release(&verifier, T2, &b);
    assert_eq!(verifier.stats().threads, 0);
    assert_eq!(verifier.stats().lock_list_chunks.in_use, 0);
}

#[test]
fn witness_exhaustion_degrades() {
    let config = VerifierConfig {
        capacity: Capacity {
            witnesses: 2,
            ..Capacity::default()
        },
        ..VerifierConfig::default()
    };
    let (verifier, recorder) = verifier(config);
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");
    assert!(verifier.degraded().is_none());

    // No room for a third name.
    let c = sleep_lock(&verifier, "C");
    assert!(!c.is_watched());
    assert!(verifier.is_dead());
    assert_eq!(
        verifier.degraded(),
        Some(Degraded::Exhausted(Exhausted {
            kind: "witness",
            capacity: 2,
        }))
    );

    // Locks keep working, unchecked.
    for cx in [T1, T2] {
        let (x, y) = if cx == T1 { (&a, &b) } else { (&b, &a) };
        acquire(&verifier, cx, x, 1);
        acquire(&verifier, cx, y, 2);
        acquire(&verifier, cx, &c, 3);
        release(&verifier, cx, &c);
        release(&verifier, cx, y);
        release(&verifier, cx, x);
    }
    assert!(recorder.is_empty());
    assert!(verifier.stats().dead);
}

#[test]
fn lock_list_exhaustion_degrades() {
    let config = VerifierConfig {
        capacity: Capacity {
            lock_list_chunks: 1,
            ..Capacity::default()
        },
        ..VerifierConfig::default()
    };
    let (verifier, _recorder) = verifier(config);
    let locks: Vec<_> = (0..4)
        .map(|i| sleep_lock(&verifier, &format!("lock {i}")))
        .collect();
    for lock in &locks {
        acquire(&verifier, T1, lock, 1);
    }
    assert!(matches!(
        verifier.degraded(),
        Some(Degraded::Exhausted(Exhausted { kind: "lock list", .. }))
    ));
    for lock in locks.iter().rev() {
        release(&verifier, T1, lock);
    }
    assert_eq!(verifier.about_to_block(T1, None, site(1)), 0);
}

#[test]
fn seeded_order_is_reported_once_across_threads() {
    let config = seeded(&[&[("A", LockClass::SleepMutex), ("B", LockClass::SleepMutex)]]);
    let (verifier, recorder) = verifier(config);
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");

    for cx in [T1, T2, T3] {
        acquire(&verifier, cx, &b, 1);
        acquire(&verifier, cx, &a, 2);
        release(&verifier, cx, &a);
        release(&verifier, cx, &b);
    }
    let violations = recorder.take();
    assert_eq!(violations.len(), 1);
    assert!(matches!(violations[0], Violation::Reversal { .. }));

    // Going the right way is still fine.
    acquire(&verifier, T1, &a, 3);
    acquire(&verifier, T1, &b, 4);
    assert!(recorder.is_empty());
}

#[test]
fn sleeping_with_a_spin_lock_held() {
    let config = seeded(&[&[("S", LockClass::SpinMutex)]]);
    let (verifier, recorder) = verifier(config);
    let g = lock_object(
        &verifier,
        "G",
        LockClass::SharedExclusive,
        LockFlags::WITNESS | LockFlags::SLEEPABLE,
    );
    let s = lock_object(&verifier, "S", LockClass::SpinMutex, LockFlags::WITNESS);

    acquire(&verifier, T1, &g, 1);
    acquire(&verifier, T1, &s, 2);
    assert_eq!(verifier.about_to_block(T1, None, site(3)), 1);
    assert_eq!(
        recorder.take(),
        vec![Violation::Sleeping {
            check_only: false,
            site: site(3),
            name: Arc::from("S"),
            held_site: Some(site(2)),
        }]
    );

    // The lock the suspension itself gives up is exempt.
    assert_eq!(verifier.could_block(T1, Some(&s), site(4)), 0);
    release(&verifier, T1, &s);
    assert_eq!(verifier.about_to_block(T1, None, site(5)), 0);
}

#[test]
fn privileged_lock_may_be_held_across_sleep() {
    let (verifier, recorder) = verifier(VerifierConfig::kernel());
    let giant = sleep_lock(&verifier, "Giant");
    let proc_lock = sleep_lock(&verifier, "process lock");

    acquire(&verifier, T1, &giant, 1);
    assert_eq!(verifier.about_to_block(T1, None, site(2)), 0);
    acquire(&verifier, T1, &proc_lock, 3);
    assert_eq!(verifier.could_block(T1, None, site(4)), 1);
    let violations = recorder.take();
    assert_eq!(
        violations[0].to_string(),
        "verifier.rs:4: could sleep with \"process lock\" locked from verifier.rs:3"
    );
}

#[test]
fn blockable_lock_under_spin_lock() {
    let config = seeded(&[&[("S", LockClass::SpinMutex)]]);
    let (verifier, recorder) = verifier(config);
    let s = lock_object(&verifier, "S", LockClass::SpinMutex, LockFlags::WITNESS);
    let m = sleep_lock(&verifier, "M");

    acquire(&verifier, T1, &s, 1);
    acquire(&verifier, T1, &m, 2);
    assert_eq!(
        recorder.take(),
        vec![Violation::BlockableUnderSpin {
            class: LockClass::SleepMutex,
            name: Arc::from("M"),
            site: site(2),
        }]
    );
    assert_eq!(verifier.list_locks(T1).len(), 2);
}

#[test]
fn spin_locks_are_per_cpu() {
    let config = VerifierConfig {
        cpus: 2,
        ..seeded(&[&[("S1", LockClass::SpinMutex), ("S2", LockClass::SpinMutex)]])
    };
    let (verifier, recorder) = verifier(config);
    let s1 = lock_object(&verifier, "S1", LockClass::SpinMutex, LockFlags::WITNESS);
    let s2 = lock_object(&verifier, "S2", LockClass::SpinMutex, LockFlags::WITNESS);

    // Different processors: no relation between the two acquisitions.
    acquire(&verifier, Context::new(1, 1), &s2, 1);
    acquire(&verifier, Context::new(2, 0), &s1, 2);
    assert!(recorder.is_empty());
    assert_eq!(verifier.list_locks(Context::new(9, 1)).len(), 1);

    let s3 = lock_object(&verifier, "S1", LockClass::SpinMutex, LockFlags::WITNESS);
    assert_eq!(
        verifier.lock(Context::new(1, 2), &s3, AcquireFlags::empty(), site(3)),
        Err(FatalError::UnknownCpu { cpu: 2, count: 2 })
    );
    assert!(!s3.is_locked());
}

#[test]
fn try_acquisitions_are_not_checked() {
    let (verifier, recorder) = verifier(VerifierConfig::default());
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");

    acquire(&verifier, T1, &a, 1);
    verifier.lock(T1, &b, AcquireFlags::TRY, site(2)).unwrap();
    assert_eq!(verifier.list_locks(T1).len(), 2);
    release(&verifier, T1, &a);
    release(&verifier, T1, &b);
    assert!(!verifier.is_ordered_before("A", "B"));

    acquire(&verifier, T2, &b, 3);
    acquire(&verifier, T2, &a, 4);
    assert!(recorder.is_empty());
    assert!(verifier.is_ordered_before("B", "A"));
}

#[test]
fn recursion() {
    let (verifier, _recorder) = verifier(VerifierConfig::default());
    let recursable = lock_object(
        &verifier,
        "recursable",
        LockClass::SleepMutex,
        LockFlags::WITNESS | LockFlags::RECURSABLE,
    );
    acquire(&verifier, T1, &recursable, 1);
    acquire(&verifier, T1, &recursable, 2);
    assert_eq!(recursable.recursion(), 1);
    assert_eq!(verifier.list_locks(T1).len(), 1);
    release(&verifier, T1, &recursable);
    assert!(recursable.is_locked());
    release(&verifier, T1, &recursable);
    assert!(!recursable.is_locked());

    let plain = sleep_lock(&verifier, "plain");
    acquire(&verifier, T1, &plain, 3);
    assert!(matches!(
        verifier.lock(T1, &plain, AcquireFlags::empty(), site(4)),
        Err(FatalError::RecursedNonRecursable { .. })
    ));
}

#[test]
fn fatal_usage_errors() {
    let (verifier, _recorder) = verifier(VerifierConfig::kernel());
    let a = sleep_lock(&verifier, "A");

    assert!(matches!(
        verifier.init(&a),
        Err(FatalError::AlreadyInitialized { .. })
    ));
    assert!(matches!(
        verifier.unlock(T1, &a, site(1)),
        Err(FatalError::ReleaseNotHeld { .. })
    ));

    acquire(&verifier, T1, &a, 2);
    assert!(matches!(
        verifier.unlock(T2, &a, site(3)),
        Err(FatalError::ReleaseNotHeld { .. })
    ));
    assert!(matches!(
        verifier.destroy(&a),
        Err(FatalError::DestroyedWhileHeld { .. })
    ));
    release(&verifier, T1, &a);
    verifier.destroy(&a).unwrap();
    assert!(matches!(
        verifier.lock(T1, &a, AcquireFlags::empty(), site(4)),
        Err(FatalError::UseAfterDestroy { .. })
    ));
    assert!(matches!(
        verifier.destroy(&a),
        Err(FatalError::UseAfterDestroy { .. })
    ));

    let fresh = LockObject::new("fresh", LockClass::SleepMutex, LockFlags::WITNESS);
    assert!(matches!(
        verifier.lock(T1, &fresh, AcquireFlags::empty(), site(5)),
        Err(FatalError::NotInitialized { .. })
    ));

    let mismatch = LockObject::new("allproc", LockClass::SleepMutex, LockFlags::WITNESS);
    assert_eq!(
        verifier.init(&mismatch),
        Err(FatalError::InconsistentLockClass {
            name: Arc::from("allproc"),
            class: LockClass::SleepMutex,
            earlier: LockClass::SharedExclusive,
        })
    );

    let undeclared = LockObject::new("undeclared", LockClass::SpinMutex, LockFlags::WITNESS);
    assert_eq!(
        verifier.init(&undeclared),
        Err(FatalError::UnorderedLockClass {
            name: Arc::from("undeclared"),
        })
    );

    let sleepable = LockObject::new(
        "sleepable mutex",
        LockClass::SleepMutex,
        LockFlags::WITNESS | LockFlags::SLEEPABLE,
    );
    assert_eq!(
        verifier.init(&sleepable).unwrap_err().to_string(),
        "lock (sleep mutex) sleepable mutex can not be sleepable"
    );
}

#[test]
fn unwatched_locks_are_ignored() {
    let mut config = seeded(&[&[("S", LockClass::SpinMutex)]]);
    config.skip_spin = true;
    let (verifier, recorder) = verifier(config);

    let quiet = lock_object(&verifier, "A", LockClass::SleepMutex, LockFlags::empty());
    let s = lock_object(&verifier, "undeclared", LockClass::SpinMutex, LockFlags::WITNESS);
    assert!(!quiet.is_watched());
    assert!(!s.is_watched());

    acquire(&verifier, T1, &s, 1);
    acquire(&verifier, T1, &quiet, 2);
    assert!(verifier.list_locks(T1).is_empty());
    assert_eq!(verifier.about_to_block(T1, None, site(3)), 0);
    release(&verifier, T1, &quiet);
    release(&verifier, T1, &s);
    assert!(recorder.is_empty());
}

#[test]
fn retired_witnesses_keep_their_order() {
    let (verifier, recorder) = verifier(VerifierConfig::default());
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");
    acquire(&verifier, T1, &a, 1);
    acquire(&verifier, T1, &b, 2);
    release(&verifier, T1, &b);
    release(&verifier, T1, &a);

    verifier.destroy(&a).unwrap();
    assert!(verifier.dump().contains("(dead)"));

    let revived = sleep_lock(&verifier, "A");
    assert!(!verifier.dump().contains("(dead)"));
    acquire(&verifier, T2, &b, 3);
    acquire(&verifier, T2, &revived, 4);
    assert_eq!(recorder.len(), 1);
    assert_eq!(verifier.stats().witnesses.in_use, 2);
}

#[test]
fn saved_sites_can_be_restored() {
    let (verifier, _recorder) = verifier(VerifierConfig::default());
    let a = sleep_lock(&verifier, "A");
    acquire(&verifier, T1, &a, 1);
    let saved = verifier.save_site(&a);
    assert_eq!(saved, Some(site(1)));

    release(&verifier, T1, &a);
    acquire(&verifier, T1, &a, 2);
    verifier.restore_site(T1, &a, site(1));
    assert_eq!(a.site(), Some(site(1)));
    assert_eq!(verifier.list_locks(T1).locks[0].site, site(1));
}

#[test]
fn thread_exit_reports_held_locks() {
    let (verifier, _recorder) = verifier(VerifierConfig::default());
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");
    acquire(&verifier, T1, &a, 1);
    acquire(&verifier, T1, &b, 2);
    assert_eq!(verifier.thread_exit(T1), 2);
    assert_eq!(verifier.stats().lock_list_chunks.in_use, 0);
    assert_eq!(verifier.thread_exit(T1), 0);
}

#[test]
fn level_fast_path_agrees() {
    let config = VerifierConfig {
        use_levels: true,
        ..VerifierConfig::default()
    };
    let (verifier, recorder) = verifier(config);
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");
    let c = sleep_lock(&verifier, "C");

    for (first, second) in [(&a, &b), (&b, &c), (&a, &c)] {
        acquire(&verifier, T1, first, 1);
        acquire(&verifier, T1, second, 2);
        release(&verifier, T1, second);
        release(&verifier, T1, first);
    }
    assert!(recorder.is_empty());

    acquire(&verifier, T1, &c, 3);
    acquire(&verifier, T1, &a, 4);
    assert_eq!(recorder.len(), 1);
}

#[test]
fn graph_dump() {
    let (verifier, _recorder) = verifier(VerifierConfig::kernel());
    let _never = sleep_lock(&verifier, "never acquired");
    let dump = verifier.dump();

    assert!(dump.starts_with(
        "Sleep locks:\n\
         0 Giant -- last acquired @ order list:0\n\
         1  proctree -- last acquired @ order list:0\n\
         2   allproc -- last acquired @ order list:0\n"
    ));
    assert!(dump.contains("\nSpin locks:\n0 sio -- last acquired @ order list:0\n"));
    assert!(dump.contains(&format!("7 {:7}smp rendezvous", "")));
    assert!(dump.ends_with("\nLocks which were never acquired:\nnever acquired\n"));
}

#[test]
fn held_lock_listing() {
    let (verifier, _recorder) = verifier(VerifierConfig::default());
    let a = sleep_lock(&verifier, "A");
    let b = sleep_lock(&verifier, "B");
    acquire(&verifier, T1, &a, 1);
    acquire(&verifier, T1, &b, 2);

    let listing = verifier.list_locks(T1);
    assert_eq!(
        listing.to_string(),
        format!(
            "\t(sleep mutex) B ({}) locked at verifier.rs:2\n\
             \t(sleep mutex) A ({}) locked at verifier.rs:1\n",
            b.id(),
            a.id()
        )
    );
}
