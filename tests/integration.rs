use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

use hazrc::{Config, Domain};

struct DropCount(Arc<AtomicUsize>);
impl Drop for DropCount {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

fn leak_counted(count: &Arc<AtomicUsize>) -> *mut DropCount {
    Box::into_raw(Box::new(DropCount(Arc::clone(count))))
}

#[test]
fn scan_triggers_at_exact_threshold() {
    static DOMAIN: Domain = Domain::with_config(Config::with_params(10, 64));

    let count = Arc::new(AtomicUsize::new(0));
    let local = DOMAIN.attach();

    for _ in 0..9 {
        unsafe { local.retire_ptr(leak_counted(&count)) };
    }

    // one below the threshold: nothing must have been reclaimed yet
    assert_eq!(count.load(Ordering::Relaxed), 0);
    assert_eq!(DOMAIN.reclaimed_count(), 0);
    assert_eq!(DOMAIN.retired_count(), 9);

    // the tenth retire trips the scan, which reclaims all ten
    unsafe { local.retire_ptr(leak_counted(&count)) };
    assert_eq!(count.load(Ordering::Relaxed), 10);
    assert_eq!(DOMAIN.reclaimed_count(), 10);
    assert_eq!(DOMAIN.retired_count(), 10);
}

#[test]
fn threshold_one_reclaims_every_retire() {
    static DOMAIN: Domain = Domain::with_config(Config::with_params(1, 64));

    let count = Arc::new(AtomicUsize::new(0));
    let local = DOMAIN.attach();

    for expected in 1..=4 {
        unsafe { local.retire_ptr(leak_counted(&count)) };
        assert_eq!(count.load(Ordering::Relaxed), expected);
    }

    assert_eq!(DOMAIN.retired_count(), DOMAIN.reclaimed_count());
}

#[test]
fn address_reuse_is_no_double_retire() {
    static DOMAIN: Domain = Domain::with_config(Config::with_params(1, 64));

    let count = Arc::new(AtomicUsize::new(0));
    let local = DOMAIN.attach();

    // the first record is reclaimed before the second is allocated, so the
    // allocator may well hand out the same address again; retiring it anew
    // must be indistinguishable from retiring a fresh record
    unsafe { local.retire_ptr(leak_counted(&count)) };
    unsafe { local.retire_ptr(leak_counted(&count)) };

    assert_eq!(count.load(Ordering::Relaxed), 2);
    assert_eq!(DOMAIN.reclaimed_count(), 2);
}

#[test]
fn protected_record_survives_scans() {
    static DOMAIN: Domain = Domain::with_config(Config::with_params(1, 64));

    let count = Arc::new(AtomicUsize::new(0));
    let local = DOMAIN.attach();

    let src = AtomicPtr::new(leak_counted(&count));

    let mut guard = local.guard();
    let protected = guard.protect(&src);
    assert!(!protected.is_null());

    // unlink and retire; the scan triggered by the retire must spare the
    // protected record
    let unlinked = src.swap(std::ptr::null_mut(), Ordering::AcqRel);
    assert_eq!(unlinked, protected);
    unsafe { local.retire_ptr(unlinked) };
    assert_eq!(count.load(Ordering::Relaxed), 0);

    // dropping the guard without resetting releases its record with a
    // cleared slot; the next scan reclaims the leftover
    drop(guard);
    unsafe { local.retire_ptr(leak_counted(&count)) };
    assert_eq!(count.load(Ordering::Relaxed), 2);
}

#[test]
fn detached_leftovers_are_adopted() {
    static DOMAIN: Domain = Domain::with_config(Config::with_params(1000, 64));

    let count = Arc::new(AtomicUsize::new(0));

    let records: Vec<usize> =
        (0..3).map(|_| leak_counted(&count) as usize).collect();

    let local = DOMAIN.attach();
    let mut guard = local.guard();
    guard.protect_raw(records[0] as *const ());

    // a second thread retires all three records and detaches; its helping
    // scan reclaims the two unprotected ones but must leave the protected
    // one behind in its dormant block
    let t1 = {
        let records = records.clone();
        thread::spawn(move || {
            let local = DOMAIN.attach();
            for &record in &records {
                unsafe { local.retire_ptr(record as *mut DropCount) };
            }
        })
    };
    t1.join().unwrap();

    assert_eq!(count.load(Ordering::Relaxed), 2);
    assert_eq!(DOMAIN.retired_count(), 3);
    assert_eq!(DOMAIN.reclaimed_count(), 2);

    guard.reset_protection();

    // a third thread retires one more record and detaches; its helping scan
    // merges the orphaned leftover and reclaims both
    let t2 = {
        let count = Arc::clone(&count);
        thread::spawn(move || {
            let local = DOMAIN.attach();
            unsafe { local.retire_ptr(Box::into_raw(Box::new(DropCount(count)))) };
        })
    };
    t2.join().unwrap();

    assert_eq!(count.load(Ordering::Relaxed), 4);
    assert_eq!(DOMAIN.retired_count(), 4);
    assert_eq!(DOMAIN.reclaimed_count(), 4);
}

#[test]
fn domain_drop_reclaims_leftovers() {
    let count = Arc::new(AtomicUsize::new(0));

    {
        let domain = Domain::with_config(Config::with_params(1000, 64));
        let local = domain.attach();
        for _ in 0..10 {
            unsafe { local.retire_ptr(leak_counted(&count)) };
        }
        assert_eq!(count.load(Ordering::Relaxed), 0);

        // a thread vanishing without detach leaves its block acquired; the
        // domain still owns every leftover retire when it is dropped
        std::mem::forget(local);
    }

    assert_eq!(count.load(Ordering::Relaxed), 10);
}

#[test]
fn detach_thread_reclaims_before_exit() {
    let count = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let handle = {
        let count = Arc::clone(&count);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            for _ in 0..5 {
                unsafe { hazrc::retire_ptr(Box::into_raw(Box::new(DropCount(Arc::clone(&count))))) };
            }

            // nothing reclaimed yet (the global threshold is far away)
            assert_eq!(count.load(Ordering::Relaxed), 0);

            hazrc::detach_thread();

            // the explicit detach ran the helping scan while the thread is
            // still alive
            assert_eq!(count.load(Ordering::Relaxed), 5);
            barrier.wait();
        })
    };

    barrier.wait();
    handle.join().unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 5);
}

#[test]
fn guard_released_on_foreign_thread() {
    static VALUE: u32 = 0xDEAD_BEEF;

    // a guard may move between threads; releasing it routes its record
    // through the owning pool's overflow path
    let (tx, rx) = mpsc::channel();
    let t = thread::spawn(move || {
        let mut guard = hazrc::guard();
        guard.protect_raw(&VALUE as *const u32 as *const ());
        tx.send(guard).unwrap();
    });
    t.join().unwrap();

    let guard = rx.recv().unwrap();
    drop(guard);

    // the local state of this thread is unaffected
    let mut guards: Vec<_> = (0..4).map(|_| hazrc::guard()).collect();
    for guard in &mut guards {
        guard.protect_raw(&VALUE as *const u32 as *const ());
    }
}

struct Checked {
    value: usize,
    check: usize,
    count: Arc<AtomicUsize>,
}

impl Checked {
    fn boxed(value: usize, count: &Arc<AtomicUsize>) -> *mut Checked {
        Box::into_raw(Box::new(Self { value, check: !value, count: Arc::clone(count) }))
    }
}

impl Drop for Checked {
    fn drop(&mut self) {
        // poison the invariant so a reader of freed memory trips the assert
        self.check = 0;
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn classic_hazard_race() {
    const WRITES: usize = 20_000;
    const READERS: usize = 4;

    static DOMAIN: Domain = Domain::with_config(Config::with_params(8, 64));
    static SRC: AtomicPtr<Checked> = AtomicPtr::new(std::ptr::null_mut());
    static STOP: AtomicBool = AtomicBool::new(false);

    let count = Arc::new(AtomicUsize::new(0));
    SRC.store(Checked::boxed(0, &count), Ordering::Release);

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            thread::spawn(|| {
                let local = DOMAIN.attach();
                let mut guard = local.guard();
                while !STOP.load(Ordering::Relaxed) {
                    let record = guard.protect(&SRC);
                    if !record.is_null() {
                        // the guard pins the record: reading it is safe and
                        // its invariant must hold
                        let checked = unsafe { &*record };
                        assert_eq!(checked.check, !checked.value);
                    }
                    guard.reset_protection();
                }
            })
        })
        .collect();

    let writer = {
        let count = Arc::clone(&count);
        thread::spawn(move || {
            let local = DOMAIN.attach();
            for value in 1..=WRITES {
                let new = Checked::boxed(value, &count);
                let old = SRC.swap(new, Ordering::AcqRel);
                unsafe { local.retire_ptr(old) };
            }
            STOP.store(true, Ordering::Relaxed);
        })
    };

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    // retire the final record as well, then verify conservation
    let local = DOMAIN.attach();
    let last = SRC.swap(std::ptr::null_mut(), Ordering::AcqRel);
    unsafe { local.retire_ptr(last) };
    drop(local);

    assert_eq!(count.load(Ordering::Relaxed), WRITES + 1);
    assert_eq!(DOMAIN.retired_count(), (WRITES + 1) as u64);
    assert_eq!(DOMAIN.retired_count(), DOMAIN.reclaimed_count());
}
