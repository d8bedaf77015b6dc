// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Multi-threaded scenarios that exercise the scheduler together with the
//! synchronization primitives.
//!
//! Every test runs a "main" thread inside the scheduler that creates the
//! worker threads and joins them, like a regular program would.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::info;

use strand::mutex::Mutex;
use strand::once::Once;
use strand::rwsem::RwSemaphore;
use strand::scheduler::SmpScheduler;
use strand::tcb::Environment;
use strand::tls::{self, TlsKey};
use strand::{ExitStatus, Priority, StrandError, ThreadId};

/// Spawns `main` on core 0, runs the scheduler until everything is done and
/// returns the exit status of `main`.
fn run_main<F>(s: &SmpScheduler, main: F) -> ExitStatus
where
    F: 'static + FnOnce() -> usize + Send,
{
    let tid = s
        .spawn(move |_| main(), ptr::null_mut(), Priority::DEFAULT, 0)
        .expect("Can't spawn main thread");
    s.run_until_idle(0);
    s.try_join(tid)
        .expect("Main thread vanished")
        .expect("Main thread did not finish")
}

fn join_all(tids: Vec<ThreadId>) -> Vec<ExitStatus> {
    let t = Environment::thread();
    tids.into_iter()
        .map(|tid| t.join(tid).expect("Can't join thread"))
        .collect()
}

#[test]
fn once_with_600_racing_threads() {
    let _r = env_logger::try_init();
    const THD_COUNT: usize = 600;

    static ONCE: Once = Once::new();
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let s: SmpScheduler = Default::default();
    let status = run_main(&s, || {
        let t = Environment::thread();
        let mut tids = Vec::with_capacity(THD_COUNT);
        for _i in 0..THD_COUNT {
            let tid = t
                .spawn(
                    |_| {
                        ONCE.call_once(|| {
                            // Give the others a chance to pile up
                            Environment::thread().yield_now();
                            COUNTER.fetch_add(1, Ordering::SeqCst);
                        })
                        .expect("call_once failed");
                        0
                    },
                    ptr::null_mut(),
                )
                .expect("Can't spawn thread");
            tids.push(tid);
        }

        info!("Waiting for the threads to finish");
        let statuses = join_all(tids);
        assert!(statuses.iter().all(|s| *s == ExitStatus::Value(0)));
        COUNTER.load(Ordering::SeqCst)
    });

    assert_eq!(status, ExitStatus::Value(1));
    assert!(ONCE.is_completed());
    assert_eq!(s.thread_count(), 0);
}

#[test]
fn recursive_lock_scenario() {
    let _r = env_logger::try_init();

    static LOCK: Mutex = Mutex::new_recursive();

    let s: SmpScheduler = Default::default();
    let status = run_main(&s, || {
        let t = Environment::thread();

        let t0 = t
            .spawn(
                |_| {
                    for _i in 0..10 {
                        LOCK.lock().unwrap();
                    }
                    assert_eq!(LOCK.hold_count(), 10);
                    Environment::thread().sleep(Duration::from_millis(100));

                    for _i in 0..9 {
                        LOCK.unlock().unwrap();
                    }
                    // Still ours, nobody else got in:
                    Environment::thread().sleep(Duration::from_millis(10));
                    assert_eq!(LOCK.owner(), Some(Environment::tid()));
                    assert_eq!(LOCK.hold_count(), 1);
                    LOCK.unlock().unwrap();
                    0
                },
                ptr::null_mut(),
            )
            .unwrap();

        let t1 = t
            .spawn(
                |_| {
                    LOCK.lock().unwrap();
                    LOCK.lock().unwrap();
                    Environment::thread().yield_now();
                    LOCK.unlock().unwrap();
                    LOCK.unlock().unwrap();

                    LOCK.lock().unwrap();
                    assert_eq!(LOCK.hold_count(), 1);
                    LOCK.unlock().unwrap();
                    0
                },
                ptr::null_mut(),
            )
            .unwrap();

        let t2 = t
            .spawn(
                |_| {
                    for _i in 0..200 {
                        LOCK.lock().unwrap();
                    }
                    assert_eq!(LOCK.hold_count(), 200);
                    for _i in 0..200 {
                        LOCK.unlock().unwrap();
                    }
                    0
                },
                ptr::null_mut(),
            )
            .unwrap();

        let statuses = join_all(vec![t0, t1, t2]);
        assert!(statuses.iter().all(|s| *s == ExitStatus::Value(0)));

        assert!(!LOCK.is_locked(), "Lock is still locked!");
        LOCK.destroy().unwrap();
        0
    });

    assert_eq!(status, ExitStatus::Value(0));
}

/// Operations the writers applied, in the order they held the lock.
#[derive(Debug, Clone, Copy)]
enum WriteOp {
    Add(u32),
    Mul(u32),
}

#[test]
fn rwsem_readers_and_writers() {
    let _r = env_logger::try_init();

    static SEM: RwSemaphore = RwSemaphore::new();
    static NUMBER: AtomicUsize = AtomicUsize::new(0);

    let ops: Arc<ArrayQueue<WriteOp>> = Arc::new(ArrayQueue::new(64));
    let reads = Arc::new(AtomicUsize::new(0));

    let writer = |op: WriteOp, iterations: usize, pause: u64, ops: Arc<ArrayQueue<WriteOp>>| {
        move |_arg: *mut u8| {
            for _i in 0..iterations {
                SEM.write_lock().unwrap();
                assert_eq!(SEM.read_count(), 0);
                let n = NUMBER.load(Ordering::Relaxed) as u32;
                let n = match op {
                    WriteOp::Add(v) => n.wrapping_add(v),
                    WriteOp::Mul(v) => n.wrapping_mul(v),
                };
                NUMBER.store(n as usize, Ordering::Relaxed);
                ops.push(op).expect("Op log full");
                SEM.write_unlock().unwrap();

                Environment::thread().sleep(Duration::from_millis(pause));
            }
            0
        }
    };

    let reader = |iterations: usize, pause: u64, reads: Arc<AtomicUsize>| {
        move |_arg: *mut u8| {
            for _i in 0..iterations {
                SEM.read_lock().unwrap();
                assert!(!SEM.is_write_locked());
                info!("Number: {}", NUMBER.load(Ordering::Relaxed));
                reads.fetch_add(1, Ordering::Relaxed);
                SEM.read_unlock().unwrap();

                Environment::thread().sleep(Duration::from_millis(pause));
            }
            0
        }
    };

    let w0 = writer(WriteOp::Add(8), 20, 10, ops.clone());
    let w1 = writer(WriteOp::Mul(3), 17, 5, ops.clone());
    let r0 = reader(12, 20, reads.clone());
    let r1 = reader(23, 16, reads.clone());

    let s: SmpScheduler = Default::default();
    let status = run_main(&s, move || {
        let t = Environment::thread();
        let tids = vec![
            t.spawn(w0, ptr::null_mut()).unwrap(),
            t.spawn(w1, ptr::null_mut()).unwrap(),
            t.spawn(r0, ptr::null_mut()).unwrap(),
            t.spawn(r1, ptr::null_mut()).unwrap(),
        ];
        let statuses = join_all(tids);
        assert!(statuses.iter().all(|s| *s == ExitStatus::Value(0)));

        SEM.read_lock().unwrap();
        let n = NUMBER.load(Ordering::Relaxed);
        SEM.read_unlock().unwrap();
        SEM.destroy().unwrap();
        n
    });

    // No lost updates: replaying the logged writes yields the final value.
    let mut expected: u32 = 0;
    let mut applied = 0;
    while let Some(op) = ops.pop() {
        expected = match op {
            WriteOp::Add(v) => expected.wrapping_add(v),
            WriteOp::Mul(v) => expected.wrapping_mul(v),
        };
        applied += 1;
    }
    assert_eq!(applied, 20 + 17);
    assert_eq!(reads.load(Ordering::Relaxed), 12 + 23);
    assert_eq!(status, ExitStatus::Value(expected as usize));
}

#[test]
fn tls_isolation_and_destructors() {
    let _r = env_logger::try_init();

    static ONCE: Once = Once::new();
    static KEY2: spin::Mutex<Option<TlsKey>> = spin::Mutex::new(None);
    static DESTROYED: spin::Mutex<Vec<usize>> = spin::Mutex::new(Vec::new());

    fn key2() -> TlsKey {
        KEY2.lock().expect("Key 2 not created")
    }

    let s: SmpScheduler = Default::default();
    let status = run_main(&s, || {
        let t = Environment::thread();
        let key1 = tls::create_key().unwrap();
        tls::set(key1, 0xdeadbeef as *mut u8).unwrap();
        assert_eq!(tls::get(key1), Ok(0xdeadbeef as *mut u8));

        let thd = move |arg: *mut u8| {
            let me = arg as usize;
            // Never set in this thread:
            assert_eq!(tls::get(key1), Ok(ptr::null_mut()));

            ONCE.call_once(|| {
                let key = tls::create_key_with_destructor(|value| {
                    DESTROYED.lock().push(value as usize);
                })
                .unwrap();
                *KEY2.lock() = Some(key);
            })
            .unwrap();

            tls::set(key2(), me as *mut u8).unwrap();
            if me & 0x1 == 1 {
                Environment::thread().sleep(Duration::from_millis(20));
            }
            assert_eq!(tls::get(key2()), Ok(me as *mut u8));
            me
        };

        let t1 = t.spawn(thd, 1 as *mut u8).unwrap();
        let t2 = t.spawn(thd, 2 as *mut u8).unwrap();

        // The destructor ran before join returned:
        assert_eq!(t.join(t2), Ok(ExitStatus::Value(2)));
        assert_eq!(*DESTROYED.lock(), vec![2]);
        assert_eq!(t.join(t1), Ok(ExitStatus::Value(1)));
        assert_eq!(*DESTROYED.lock(), vec![2, 1]);

        assert_eq!(tls::get(key1), Ok(0xdeadbeef as *mut u8));
        assert_eq!(tls::get(key2()), Ok(ptr::null_mut()));
        tls::delete_key(key1).unwrap();
        tls::delete_key(key2()).unwrap();
        assert_eq!(tls::get(key1), Err(StrandError::InvalidHandle));
        0
    });

    assert_eq!(status, ExitStatus::Value(0));
}

#[test]
fn delete_key_with_live_holders() {
    let _r = env_logger::try_init();

    let destroyed = Arc::new(AtomicUsize::new(0));
    let d = destroyed.clone();
    let key = tls::create_key_with_destructor(move |_value| {
        d.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let plain = tls::create_key().unwrap();

    let s: SmpScheduler = Default::default();
    let status = run_main(&s, move || {
        let t = Environment::thread();
        let holder = t
            .spawn(
                move |_| {
                    tls::set(key, 0x1 as *mut u8).unwrap();
                    tls::set(plain, 0x2 as *mut u8).unwrap();
                    Environment::thread().sleep(Duration::from_millis(10));
                    0
                },
                ptr::null_mut(),
            )
            .unwrap();

        // Let the holder store its values
        t.yield_now();
        assert_eq!(tls::delete_key(key), Err(StrandError::KeyInUse));
        // Without a destructor nothing can go missing:
        assert_eq!(tls::delete_key(plain), Ok(()));

        assert_eq!(t.join(holder), Ok(ExitStatus::Value(0)));
        tls::delete_key(key).unwrap();
        0
    });

    assert_eq!(status, ExitStatus::Value(0));
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn destructors_may_store_new_values() {
    let _r = env_logger::try_init();

    static KEY: spin::Mutex<Option<TlsKey>> = spin::Mutex::new(None);
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    let key = tls::create_key_with_destructor(|value| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        // Keep re-arming the key, the passes are bounded
        if let Some(key) = *KEY.lock() {
            let _r = tls::set(key, (value as usize + 1) as *mut u8);
        }
    })
    .unwrap();
    *KEY.lock() = Some(key);

    let s: SmpScheduler = Default::default();
    let status = run_main(&s, move || {
        tls::set(key, 0x1 as *mut u8).unwrap();
        0
    });

    assert_eq!(status, ExitStatus::Value(0));
    assert_eq!(CALLS.load(Ordering::SeqCst), tls::DESTRUCTOR_ITERATIONS);
    assert_eq!(tls::delete_key(key), Ok(()));
}

#[test]
fn panicking_destructor_does_not_stop_others() {
    let _r = env_logger::try_init();

    let destroyed = Arc::new(AtomicUsize::new(0));
    let d = destroyed.clone();
    let faulty = tls::create_key_with_destructor(|_value| panic!("TLS destructor fault")).unwrap();
    let counting = tls::create_key_with_destructor(move |value| {
        assert_eq!(value, 0x2 as *mut u8);
        d.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let s: SmpScheduler = Default::default();
    let status = run_main(&s, move || {
        let t = Environment::thread();
        let child = t
            .spawn(
                move |_| {
                    tls::set(faulty, 0x1 as *mut u8).unwrap();
                    tls::set(counting, 0x2 as *mut u8).unwrap();
                    5
                },
                ptr::null_mut(),
            )
            .unwrap();

        assert_eq!(t.join(child), Ok(ExitStatus::Value(5)));
        0
    });

    assert_eq!(status, ExitStatus::Value(0));
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    // Both values were consumed, so the keys are free again
    assert_eq!(tls::delete_key(faulty), Ok(()));
    assert_eq!(tls::delete_key(counting), Ok(()));
}

#[test]
fn exit_and_join_of_exited_thread() {
    let _r = env_logger::try_init();

    let s: SmpScheduler = Default::default();
    let status = run_main(&s, || {
        let t = Environment::thread();
        let child = t
            .spawn_with(
                |_| Environment::thread().exit(0x42),
                ptr::null_mut(),
                Priority::HIGHEST,
                0,
            )
            .unwrap();

        // The child runs first and is already gone:
        t.yield_now();
        assert_eq!(t.join(child), Ok(ExitStatus::Value(0x42)));
        assert_eq!(t.join(child), Err(StrandError::InvalidHandle));

        let faulty = t.spawn(|_| panic!("Thread fault"), ptr::null_mut()).unwrap();
        assert_eq!(t.join(faulty), Ok(ExitStatus::Abnormal));
        0
    });

    assert_eq!(status, ExitStatus::Value(0));
}
