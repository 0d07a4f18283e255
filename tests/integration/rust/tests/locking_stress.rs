//! Object-lock nesting, contention and wait/notify tests.

use integration_tests::TestVm;
use locking::LockWord;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use type_system::Object;

fn fresh_object(t: &TestVm) -> type_system::ObjRef {
    let object_class = t.vm.object_class().unwrap();
    Object::new_instance(&t.vm, &object_class).unwrap()
}

#[test]
fn test_nested_locking_under_contention() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 100;
    const DEPTH: usize = 5;

    let t = Arc::new(TestVm::boot(vec![]));
    let object = fresh_object(&t);
    let inside = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let t = t.clone();
            let object = object.clone();
            let inside = inside.clone();
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    // Acquire to depth K, observing perfect nesting.
                    for depth in 0..DEPTH {
                        object.lock(t.vm.locks());
                        if depth == 0 {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        }
                    }
                    for depth in (0..DEPTH).rev() {
                        if depth == 0 {
                            assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                        }
                        object.unlock(t.vm.locks()).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(inside.load(Ordering::SeqCst), 0);
    assert!(matches!(
        LockWord::decode(object.header().load(Ordering::Acquire)),
        LockWord::Unlocked { .. } | LockWord::Inflated { .. }
    ));
}

#[test]
fn test_unlock_without_ownership_is_rejected() {
    let t = TestVm::boot(vec![]);
    let object = fresh_object(&t);
    assert_eq!(
        object.unlock(t.vm.locks()),
        Err(core_types::VmError::IllegalMonitorState)
    );
    assert_eq!(
        object.notify(t.vm.locks()),
        Err(core_types::VmError::IllegalMonitorState)
    );
}

#[test]
fn test_wait_notify_handshake() {
    let t = Arc::new(TestVm::boot(vec![]));
    let object = fresh_object(&t);
    let observed = Arc::new(AtomicU32::new(0));

    let waiter = {
        let t = t.clone();
        let object = object.clone();
        let observed = observed.clone();
        std::thread::spawn(move || {
            object.lock(t.vm.locks());
            while observed.load(Ordering::SeqCst) == 0 {
                object.wait(t.vm.locks(), None).unwrap();
            }
            object.unlock(t.vm.locks()).unwrap();
        })
    };

    // Publish under the lock, then wake the waiter.
    loop {
        object.lock(t.vm.locks());
        let parked = matches!(
            LockWord::decode(object.header().load(Ordering::Acquire)),
            LockWord::Inflated { .. }
        );
        if parked {
            observed.store(1, Ordering::SeqCst);
            object.notify(t.vm.locks()).unwrap();
            object.unlock(t.vm.locks()).unwrap();
            break;
        }
        object.unlock(t.vm.locks()).unwrap();
        std::thread::yield_now();
    }
    waiter.join().unwrap();
}

#[test]
fn test_timed_wait_returns_with_lock_held() {
    let t = TestVm::boot(vec![]);
    let object = fresh_object(&t);
    object.lock(t.vm.locks());
    object
        .wait(t.vm.locks(), Some(Duration::from_millis(5)))
        .unwrap();
    // Still the owner after the timeout.
    object.unlock(t.vm.locks()).unwrap();
}

#[test]
fn test_hash_code_survives_inflation() {
    let t = TestVm::boot(vec![]);
    let object = fresh_object(&t);

    let before = object.hash_code(t.vm.locks());
    assert_ne!(before, 0);

    object.lock(t.vm.locks());
    assert_eq!(object.hash_code(t.vm.locks()), before);

    // Force inflation through the wait set, then check again.
    object
        .wait(t.vm.locks(), Some(Duration::from_millis(1)))
        .unwrap();
    assert!(matches!(
        LockWord::decode(object.header().load(Ordering::Acquire)),
        LockWord::Inflated { .. }
    ));
    assert_eq!(object.hash_code(t.vm.locks()), before);
    object.unlock(t.vm.locks()).unwrap();
    assert_eq!(object.hash_code(t.vm.locks()), before);
}

#[test]
fn test_distinct_objects_distinct_hashes() {
    let t = TestVm::boot(vec![]);
    let a = fresh_object(&t);
    let b = fresh_object(&t);
    assert_ne!(a.hash_code(t.vm.locks()), b.hash_code(t.vm.locks()));
}
