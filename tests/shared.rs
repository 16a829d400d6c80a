use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use matches::assert_matches;
use rand::Rng;

use hazrc::{control_block_domain, AtomicShared, MarkedShared, Shared, Weak};

#[derive(Debug)]
struct DropCount(Arc<AtomicUsize>);
impl Drop for DropCount {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn strong_weak_counts() {
    let shared = Shared::new(1);
    assert_eq!(Shared::strong_count(&shared), 1);
    assert_eq!(Shared::weak_count(&shared), 1);

    let cloned = shared.clone();
    assert_eq!(Shared::strong_count(&shared), 2);
    assert_eq!(*cloned, 1);

    let weak = Shared::downgrade(&shared);
    assert_eq!(Shared::weak_count(&shared), 2);
    assert!(!weak.expired());

    // the implicit weak reference is held as long as the strong count is
    // non-zero
    drop(cloned);
    drop(shared);
    assert!(weak.expired());
}

#[test]
fn value_dropped_with_last_strong() {
    let count = Arc::new(AtomicUsize::new(0));

    let shared = Shared::new(DropCount(Arc::clone(&count)));
    let weak = Shared::downgrade(&shared);
    let cloned = shared.clone();

    drop(shared);
    assert_eq!(count.load(Ordering::Relaxed), 0);

    // the weak reference does not keep the value alive
    drop(cloned);
    assert_eq!(count.load(Ordering::Relaxed), 1);
    drop(weak);
}

#[test]
fn upgrade_after_drop_fails() {
    let count = Arc::new(AtomicUsize::new(0));

    let shared = Shared::new(DropCount(Arc::clone(&count)));
    let weak = Shared::downgrade(&shared);

    let upgraded = weak.upgrade().expect("value still alive");
    drop(shared);
    drop(upgraded);

    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert!(weak.expired());
    assert_matches!(weak.upgrade(), None);
}

#[test]
fn racing_weak_upgrade_is_empty_or_valid() {
    for _ in 0..100 {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Shared::new(DropCount(Arc::clone(&count)));
        let weak = Shared::downgrade(&shared);

        let dropper = thread::spawn(move || drop(shared));
        let upgrader = thread::spawn(move || match weak.upgrade() {
            // an upgrade won the race: the value must not be destroyed yet
            Some(upgraded) => assert_eq!(upgraded.0.load(Ordering::Relaxed), 0),
            None => (),
        });

        dropper.join().unwrap();
        upgrader.join().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}

#[test]
fn from_box_and_deleter() {
    let count = Arc::new(AtomicUsize::new(0));

    let shared = Shared::from_box(Box::new(DropCount(Arc::clone(&count))));
    drop(shared);
    assert_eq!(count.load(Ordering::Relaxed), 1);

    let deleted = Arc::new(AtomicUsize::new(0));
    let raw = Box::into_raw(Box::new(7));
    let shared = {
        let deleted = Arc::clone(&deleted);
        unsafe {
            Shared::from_raw_with(std::ptr::NonNull::new(raw).unwrap(), move |ptr: *mut i32| {
                deleted.fetch_add(1, Ordering::Relaxed);
                drop(Box::from_raw(ptr));
            })
        }
    };
    assert_eq!(*shared, 7);
    drop(shared);
    assert_eq!(deleted.load(Ordering::Relaxed), 1);
}

#[test]
fn marked_equality_includes_the_mark() {
    let shared = Shared::new(1);

    let plain = MarkedShared::new(shared.clone());
    let mut marked = MarkedShared::new(shared);
    assert_eq!(plain, marked);

    marked.mark();
    assert!(marked.is_marked());
    // same value, same control block, different mark: unequal
    assert_ne!(plain, marked);

    marked.unmark();
    assert_eq!(plain, marked);

    marked.mark();
    let unwrapped = marked.into_shared();
    assert!(Shared::ptr_eq(&unwrapped, &plain.into_shared()));
}

#[test]
fn atomic_round_trip() {
    let shared = Shared::new(42);
    let atomic = AtomicShared::new(Some(shared.clone()));

    let loaded = atomic.load().expect("value stored");
    assert_eq!(*loaded, 42);
    assert!(Shared::ptr_eq(&loaded, &shared));

    let prev = atomic.swap(None).expect("value stored");
    assert!(Shared::ptr_eq(&prev, &shared));
    assert_matches!(atomic.load(), None);
}

#[test]
fn atomic_compare_exchange() {
    let first = Shared::new(1);
    let second = Shared::new(2);
    let atomic = AtomicShared::new(Some(first.clone()));

    // success transfers the previous value out
    let prev = atomic
        .compare_exchange(Some(&first), Some(second.clone()))
        .expect("expected value matches");
    assert!(Shared::ptr_eq(&prev.unwrap(), &first));

    // failure returns the rejected new value and a snapshot of the actual
    let err = atomic.compare_exchange(Some(&first), None).unwrap_err();
    assert!(Shared::ptr_eq(&err.current.unwrap(), &second));
    assert_matches!(err.new, None);

    // null expectation fails against a non-null value
    let replacement = Shared::new(3);
    let err = atomic.compare_exchange(None, Some(replacement)).unwrap_err();
    assert!(Shared::ptr_eq(&err.current.unwrap(), &second));
    assert_eq!(*err.new.unwrap(), 3);
}

#[test]
fn load_under_store() {
    const STORES: usize = 5_000;
    const READERS: usize = 3;

    struct Checked {
        value: u32,
        check: u32,
        _count: DropCount,
    }

    let count = Arc::new(AtomicUsize::new(0));
    let atomic = Arc::new(AtomicShared::new(None));

    let make = |count: &Arc<AtomicUsize>, value: u32| {
        Shared::new(Checked { value, check: !value, _count: DropCount(Arc::clone(count)) })
    };

    atomic.store(Some(make(&count, 0)));

    let writer = {
        let count = Arc::clone(&count);
        let atomic = Arc::clone(&atomic);
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..STORES {
                atomic.store(Some(make(&count, rng.gen())));
            }
        })
    };

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let atomic = Arc::clone(&atomic);
            thread::spawn(move || {
                for _ in 0..STORES {
                    // every loaded value must be intact, however stale
                    let loaded = atomic.load().expect("never stored null");
                    assert_eq!(loaded.check, !loaded.value);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    // exactly one value (the final one) is still owned by the atomic
    drop(atomic);
    assert_eq!(count.load(Ordering::Relaxed), STORES + 1);
}

#[test]
fn reentrant_destruction_is_iterative() {
    const DEPTH: usize = 10_000;

    struct Node {
        _next: Option<Shared<Node>>,
        _count: DropCount,
    }

    let count = Arc::new(AtomicUsize::new(0));

    let mut head: Option<Shared<Node>> = None;
    for _ in 0..DEPTH {
        head = Some(Shared::new(Node { _next: head.take(), _count: DropCount(Arc::clone(&count)) }));
    }

    // dropping the head unravels the entire chain without recursing
    drop(head);
    assert_eq!(count.load(Ordering::Relaxed), DEPTH);
}

#[test]
fn control_blocks_are_reclaimed() {
    const BLOCKS: usize = 500;

    let count = Arc::new(AtomicUsize::new(0));
    let retired_before = control_block_domain().retired_count();
    let reclaimed_before = control_block_domain().reclaimed_count();

    {
        let count = Arc::clone(&count);
        thread::spawn(move || {
            for _ in 0..BLOCKS {
                let shared = Shared::new(DropCount(Arc::clone(&count)));
                let weak = Shared::downgrade(&shared);
                drop(shared);
                drop(weak);
            }
            // the thread exit detaches from the control block domain, which
            // adopts and reclaims everything unprotected
        })
        .join()
        .unwrap();
    }

    assert_eq!(count.load(Ordering::Relaxed), BLOCKS);
    assert!(control_block_domain().retired_count() >= retired_before + BLOCKS as u64);
    assert!(control_block_domain().reclaimed_count() >= reclaimed_before + BLOCKS as u64);
}

#[test]
fn weak_count_coherence() {
    // weak_count >= 1 + (strong_count > 0) at every observation point
    let shared = Shared::new(1);
    let weaks: Vec<Weak<i32>> = (0..4).map(|_| Shared::downgrade(&shared)).collect();

    assert_eq!(Shared::strong_count(&shared), 1);
    assert_eq!(Shared::weak_count(&shared), 5);

    drop(weaks);
    assert_eq!(Shared::weak_count(&shared), 1);
}
