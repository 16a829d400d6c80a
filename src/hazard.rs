//! Hazard records and the per-thread pools that own them.
//!
//! A hazard record is a single word of global memory through which a thread
//! advertises the pointer it is about to dereference. Records are allocated
//! in fixed-size batches, one batch per thread block, and are never freed
//! before their domain is dropped. A record is acquired and released through
//! its owning pool, which maintains two free paths:
//!
//! - a *local* path, a plain stack usable only by the pool-owning thread,
//! - an *overflow* path, a lock-free stack onto which any thread may release
//!   a record it does not own.
//!
//! The overflow path is drained back into the local path lazily, only once
//! the local path runs empty.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use arrayvec::ArrayVec;

use crate::config::RECORDS_PER_THREAD;
use crate::queue::{Link, RawList};

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardRecord
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single publishable hazard slot.
///
/// The slot is non-null exactly while an acquired record has a published
/// hazard; it is reset to null before the record returns to a free path.
/// The type is public because it appears in the [`LocalAccess`] interface,
/// but it is otherwise opaque.
///
/// [`LocalAccess`]: crate::LocalAccess
#[derive(Debug)]
pub struct HazardRecord {
    protected: AtomicPtr<()>,
    next: AtomicPtr<HazardRecord>,
    owner: AtomicPtr<PoolInner>,
}

/********** impl inherent *************************************************************************/

impl HazardRecord {
    #[inline]
    fn new() -> Self {
        Self {
            protected: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publishes `protect` in the record's slot.
    ///
    /// The store alone does not suffice to fend off a concurrent scan; the
    /// caller must issue a `SeqCst` fence before re-reading the source
    /// pointer it intends to validate.
    #[inline]
    pub fn protect(&self, protect: *const ()) {
        // (HAZ:1) this `Release` store pairs with the `Acquire` load (DOM:2) of a scanning
        // thread; the caller-issued `SeqCst` fence (GRD:1) orders it before the re-read
        self.protected.store(protect as *mut (), Ordering::Release);
    }

    /// Clears the record's slot.
    #[inline]
    pub fn clear(&self) {
        // (HAZ:2) this `Release` store synchronizes-with the `Acquire` load (DOM:2), ordering
        // all prior reads through the protected pointer before a subsequent reclamation
        self.protected.store(ptr::null_mut(), Ordering::Release);
    }

    /// Returns the currently protected pointer, if any.
    #[inline]
    pub fn protected(&self, order: Ordering) -> Option<NonNull<()>> {
        NonNull::new(self.protected.load(order))
    }

    /// Releases an acquired record to a pool that is (potentially) owned by
    /// another thread.
    ///
    /// # Safety
    ///
    /// `record` must have been acquired from its owning pool and that pool
    /// must still be alive.
    #[inline]
    pub unsafe fn release_remote(record: NonNull<HazardRecord>) {
        record.as_ref().clear();
        let owner = record.as_ref().owner.load(Ordering::Relaxed);
        debug_assert!(!owner.is_null(), "record released before its pool bound it");
        (*owner).overflow.push(record.as_ptr());
    }
}

/********** impl Link *****************************************************************************/

impl Link for HazardRecord {
    #[inline]
    fn next(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RecordPool
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A thread block's pool of hazard records.
///
/// The records themselves live behind a `Box`, so their addresses are stable
/// for the lifetime of the pool regardless of how the owning block moves
/// before it is linked into a registry.
#[derive(Debug)]
pub(crate) struct RecordPool {
    inner: Box<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    records: [HazardRecord; RECORDS_PER_THREAD],
    free: UnsafeCell<ArrayVec<NonNull<HazardRecord>, RECORDS_PER_THREAD>>,
    overflow: RawList<HazardRecord>,
}

// The `free` path is only ever touched by the thread owning the enclosing
// block, everything else is atomic.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

/********** impl inherent *************************************************************************/

impl RecordPool {
    /// Creates a new pool with all records on the local free path.
    pub fn new() -> Self {
        let inner = Box::new(PoolInner {
            records: [(); RECORDS_PER_THREAD].map(|_| HazardRecord::new()),
            free: UnsafeCell::new(ArrayVec::new()),
            overflow: RawList::new(),
        });

        // nothing else can reference the pool yet
        let owner = &*inner as *const PoolInner as *mut PoolInner;
        let free = unsafe { &mut *inner.free.get() };
        for record in &inner.records {
            record.owner.store(owner, Ordering::Relaxed);
            free.push(NonNull::from(record));
        }

        Self { inner }
    }

    /// Returns all records of the pool for scanning.
    #[inline]
    pub fn records(&self) -> &[HazardRecord] {
        &self.inner.records
    }

    /// Returns `true` if `record` belongs to this pool.
    #[inline]
    pub fn owns(&self, record: NonNull<HazardRecord>) -> bool {
        let owner = unsafe { record.as_ref().owner.load(Ordering::Relaxed) };
        ptr::eq(owner, &*self.inner)
    }

    /// Acquires a free record, draining the overflow path if the local one
    /// is empty.
    ///
    /// Returns `None` only if every record of the pool is currently in use.
    ///
    /// # Safety
    ///
    /// Must only be called by the thread owning the enclosing block.
    #[inline]
    pub unsafe fn acquire(&self) -> Option<NonNull<HazardRecord>> {
        let free = &mut *self.inner.free.get();
        free.pop().or_else(|| {
            for node in self.inner.overflow.take_all() {
                free.push(NonNull::new_unchecked(node));
            }

            free.pop()
        })
    }

    /// Releases `record` back to the local free path.
    ///
    /// # Safety
    ///
    /// Must only be called by the thread owning the enclosing block and
    /// `record` must belong to this pool.
    #[inline]
    pub unsafe fn release(&self, record: NonNull<HazardRecord>) {
        debug_assert!(self.owns(record), "record released into a foreign pool");
        record.as_ref().clear();
        (*self.inner.free.get()).push(record);
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use core::sync::atomic::Ordering;

    use crate::config::RECORDS_PER_THREAD;

    use super::{HazardRecord, RecordPool};

    #[test]
    fn protect_and_clear() {
        let pool = RecordPool::new();
        let record = unsafe { pool.acquire() }.unwrap();
        let value = 1;

        unsafe {
            record.as_ref().protect(&value as *const i32 as *const ());
            let protected = record.as_ref().protected(Ordering::Relaxed).unwrap();
            assert_eq!(protected.as_ptr() as usize, &value as *const i32 as usize);

            record.as_ref().clear();
            assert!(record.as_ref().protected(Ordering::Relaxed).is_none());

            pool.release(record);
        }
    }

    #[test]
    fn exhaust_pool() {
        let pool = RecordPool::new();
        let records: Vec<_> =
            (0..RECORDS_PER_THREAD).map(|_| unsafe { pool.acquire() }.unwrap()).collect();
        assert!(unsafe { pool.acquire() }.is_none());

        for record in records {
            unsafe { pool.release(record) };
        }
        assert!(unsafe { pool.acquire() }.is_some());
    }

    #[test]
    fn remote_release_rides_overflow() {
        let pool = RecordPool::new();
        let records: Vec<_> =
            (0..RECORDS_PER_THREAD).map(|_| unsafe { pool.acquire() }.unwrap()).collect();

        // a record released by a non-owner lands on the overflow path and is
        // only handed out again once the local path runs dry
        let (remote, rest) = records.split_first().unwrap();
        unsafe { HazardRecord::release_remote(*remote) };
        for record in rest {
            unsafe { pool.release(*record) };
        }

        let mut reacquired: Vec<NonNull<HazardRecord>> = Vec::new();
        for _ in 0..RECORDS_PER_THREAD {
            reacquired.push(unsafe { pool.acquire() }.unwrap());
        }
        assert!(reacquired.contains(remote));

        for record in reacquired {
            unsafe { pool.release(record) };
        }
    }
}
