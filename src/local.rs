//! Per-thread state blocks and the means of accessing them.
//!
//! A [`ThreadBlock`] aggregates everything one thread needs to participate
//! in a domain: its pool of hazard records, its retired set and its lifetime
//! counters. Blocks live inside registry entries and are owned by at most
//! one thread at a time; a thread that detaches leaves its block behind in a
//! dormant state from which either a later thread reacquires it wholesale or
//! a helping scan adopts its leftover retires.

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::Config;
use crate::domain::Domain;
use crate::hazard::{HazardRecord, RecordPool};
use crate::registry::Entry;
use crate::retired::{ReclaimFn, RetiredBox, RetiredHook, RetiredSet};

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadBlock
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The per-thread aggregate state of one domain participant.
#[derive(Debug)]
pub(crate) struct ThreadBlock {
    pool: RecordPool,
    inner: UnsafeCell<BlockInner>,
    /// Set while a scan is in progress on this block so that retires issued
    /// by reclaim functions do not recurse into another scan.
    scanning: Cell<bool>,
    retired_total: AtomicU64,
    reclaimed_total: AtomicU64,
}

#[derive(Debug)]
struct BlockInner {
    retired: RetiredSet,
}

// The record pool is safe for concurrent iteration and the retired set
// behind the `UnsafeCell` is only accessed by the block's current owner,
// which is unique (enforced by the registry's `active` flag).
unsafe impl Send for ThreadBlock {}
unsafe impl Sync for ThreadBlock {}

/********** impl inherent *************************************************************************/

impl ThreadBlock {
    pub fn new(config: &Config) -> Self {
        Self {
            pool: RecordPool::new(),
            inner: UnsafeCell::new(BlockInner {
                retired: RetiredSet::with_buckets(config.retired_buckets()),
            }),
            scanning: Cell::new(false),
            retired_total: AtomicU64::new(0),
            reclaimed_total: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn pool(&self) -> &RecordPool {
        &self.pool
    }

    /// Returns the block's retired set.
    ///
    /// # Safety
    ///
    /// The caller must be the block's current owner and must not hold any
    /// other reference into the set.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn retired_mut(&self) -> &mut RetiredSet {
        &mut (*self.inner.get()).retired
    }

    #[inline]
    pub fn set_scanning(&self, scanning: bool) -> bool {
        self.scanning.replace(scanning)
    }

    #[inline]
    pub fn count_retired(&self) {
        self.retired_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_reclaimed(&self, count: u64) {
        self.reclaimed_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn retired_total(&self) -> u64 {
        self.retired_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reclaimed_total(&self) -> u64 {
        self.reclaimed_total.load(Ordering::Relaxed)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// LocalAccess (trait)
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A trait for abstracting over the different means of reaching a thread's
/// local domain state: borrowing an explicit [`LocalHandle`] or going
/// through the implicit thread local state of one of the built-in global
/// domains.
///
/// # Safety
///
/// Implementations must hand out records of pools belonging to `domain()`
/// and must route released records back to their owning pool.
pub unsafe trait LocalAccess<'d>: Copy + Sized {
    /// Returns the domain whose local state this handle accesses.
    fn domain(self) -> &'d Domain;

    /// Acquires a hazard record for the current thread.
    ///
    /// # Panics
    ///
    /// Panics if every record of the thread's pool is already in use; the
    /// pool size is fixed at build time through `HAZRC_RECORDS_PER_THREAD`.
    fn acquire_record(self) -> NonNull<HazardRecord>;

    /// Releases an acquired record back to its pool.
    fn release_record(self, record: NonNull<HazardRecord>);

    /// Retires a bound hook into the domain.
    fn retire_hook(self, hook: NonNull<RetiredHook>);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// LocalHandle
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The handle representing one thread's attachment to a [`Domain`].
///
/// Dropping the handle detaches the thread: a helping scan merges whatever
/// dormant threads left behind, attempts to reclaim everything and releases
/// the thread block for reuse.
#[derive(Debug)]
pub struct LocalHandle<'d> {
    domain: &'d Domain,
    entry: &'d Entry<ThreadBlock>,
    // handles are tied to the thread that attached
    _not_send: core::marker::PhantomData<*mut ()>,
}

/********** impl inherent *************************************************************************/

impl<'d> LocalHandle<'d> {
    #[inline]
    pub(crate) fn new(domain: &'d Domain, entry: &'d Entry<ThreadBlock>) -> Self {
        Self { domain, entry, _not_send: core::marker::PhantomData }
    }

    /// Returns the domain this handle is attached to.
    #[inline]
    pub fn domain(&self) -> &'d Domain {
        self.domain
    }

    /// Creates a new [`Guard`](crate::Guard) for protecting pointers
    /// retireable into this handle's domain.
    #[inline]
    pub fn guard(&self) -> crate::guard::Guard<'d, &'_ LocalHandle<'d>> {
        crate::guard::Guard::with_access(self)
    }

    /// Retires the boxed value behind `ptr`, to be dropped and deallocated
    /// once no hazard record protects its address anymore.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained through [`Box::into_raw`], must not be
    /// reachable through any shared source anymore and must not be retired
    /// again.
    #[inline]
    pub unsafe fn retire_ptr<T>(&self, ptr: *mut T) {
        self.retire(RetiredBox::bind(ptr));
    }

    /// Retires an object through its embedded hook, without allocating.
    ///
    /// `reclaim` will be invoked with `hook` once no hazard record protects
    /// `key` anymore.
    ///
    /// # Safety
    ///
    /// The object containing `hook` must stay alive until `reclaim` is
    /// invoked, must not still be linked into any shared structure and must
    /// not be retired again; `key` must be the address readers protect.
    #[inline]
    pub unsafe fn retire_hooked(&self, hook: NonNull<RetiredHook>, key: usize, reclaim: ReclaimFn) {
        hook.as_ref().bind(key, reclaim);
        self.retire(hook);
    }

    #[inline]
    pub(crate) fn acquire_record_raw(&self) -> NonNull<HazardRecord> {
        unsafe { self.entry.data().pool().acquire() }.expect(
            "all hazard records of this thread are in use \
             (the pool size is fixed through HAZRC_RECORDS_PER_THREAD)",
        )
    }

    #[inline]
    pub(crate) fn release_record_raw(&self, record: NonNull<HazardRecord>) {
        let pool = self.entry.data().pool();
        if pool.owns(record) {
            unsafe { pool.release(record) };
        } else {
            unsafe { HazardRecord::release_remote(record) };
        }
    }

    #[inline]
    pub(crate) fn retire(&self, hook: NonNull<RetiredHook>) {
        self.domain.retire(self.entry, hook);
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for LocalHandle<'_> {
    #[inline]
    fn drop(&mut self) {
        self.domain.detach(self.entry);
    }
}

/********** impl LocalAccess **********************************************************************/

unsafe impl<'a, 'd> LocalAccess<'d> for &'a LocalHandle<'d> {
    #[inline]
    fn domain(self) -> &'d Domain {
        self.domain
    }

    #[inline]
    fn acquire_record(self) -> NonNull<HazardRecord> {
        self.acquire_record_raw()
    }

    #[inline]
    fn release_record(self, record: NonNull<HazardRecord>) {
        self.release_record_raw(record);
    }

    #[inline]
    fn retire_hook(self, hook: NonNull<RetiredHook>) {
        self.retire(hook);
    }
}
