//! The built-in global domain and its implicit thread local state.
//!
//! Threads attach to the global domain lazily on first use and detach
//! automatically when they exit (the thread local destructor drops the
//! handle). [`detach_thread`] detaches eagerly, which long-lived threads
//! should prefer once they are done touching hazard-protected structures.

use core::ptr::NonNull;
use std::cell::UnsafeCell;

use crate::domain::Domain;
use crate::guard::Guard;
use crate::hazard::HazardRecord;
use crate::local::{LocalAccess, LocalHandle};
use crate::retired::{RetiredBox, RetiredHook};

/// The global domain used by [`guard`] and [`retire_ptr`].
static GLOBAL: Domain = Domain::new();

thread_local! {
    static LOCAL: UnsafeCell<Option<LocalHandle<'static>>> = UnsafeCell::new(None);
}

/// Runs `f` with the thread's handle for the global domain, attaching first
/// if necessary.
fn with_local<R>(f: impl FnOnce(&LocalHandle<'static>) -> R) -> R {
    LOCAL.with(|cell| unsafe {
        if (*cell.get()).is_none() {
            *cell.get() = Some(GLOBAL.attach());
        }
        f((*cell.get()).as_ref().unwrap())
    })
}

/// Fallible variant of [`with_local`] for use on release paths that may run
/// during thread teardown, after the thread local was already dropped.
fn try_with_local<R>(f: impl FnOnce(&LocalHandle<'static>) -> R) -> Option<R> {
    LOCAL
        .try_with(|cell| unsafe {
            if (*cell.get()).is_none() {
                *cell.get() = Some(GLOBAL.attach());
            }
            f((*cell.get()).as_ref().unwrap())
        })
        .ok()
}

/// Returns a reference to the global domain.
#[inline]
pub fn global_domain() -> &'static Domain {
    &GLOBAL
}

/// Creates a new guard for protecting pointers retired into the global
/// domain.
#[inline]
pub fn guard() -> Guard<'static, GlobalAccess> {
    Guard::with_access(GlobalAccess)
}

/// Retires the boxed value behind `ptr` into the global domain.
///
/// # Safety
///
/// Same contract as [`LocalHandle::retire_ptr`]: `ptr` must stem from
/// [`Box::into_raw`], must be unreachable for new readers and must be
/// retired only once.
#[inline]
pub unsafe fn retire_ptr<T>(ptr: *mut T) {
    GlobalAccess.retire_hook(RetiredBox::bind(ptr));
}

/// Detaches the calling thread from the global domain.
///
/// Any records the thread retired but could not yet reclaim are left behind
/// for other threads to adopt. The thread re-attaches automatically if it
/// touches the global domain again.
#[inline]
pub fn detach_thread() {
    let handle = LOCAL.try_with(|cell| unsafe { (*cell.get()).take() }).ok().flatten();
    // the handle's drop runs the helping scan while the slot is already
    // empty, so re-entrant accesses observe a consistent state
    drop(handle);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// GlobalAccess
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [`LocalAccess`] through the implicit thread local state of the global
/// domain.
#[derive(Copy, Clone, Debug, Default)]
pub struct GlobalAccess;

/********** impl LocalAccess **********************************************************************/

unsafe impl LocalAccess<'static> for GlobalAccess {
    #[inline]
    fn domain(self) -> &'static Domain {
        &GLOBAL
    }

    #[inline]
    fn acquire_record(self) -> NonNull<HazardRecord> {
        with_local(|local| local.acquire_record_raw())
    }

    #[inline]
    fn release_record(self, record: NonNull<HazardRecord>) {
        // after thread local teardown the record can no longer be cached
        // locally and rides its home pool's overflow path instead
        if try_with_local(|local| local.release_record_raw(record)).is_none() {
            unsafe { HazardRecord::release_remote(record) };
        }
    }

    #[inline]
    fn retire_hook(self, hook: NonNull<RetiredHook>) {
        if try_with_local(|local| local.retire(hook)).is_none() {
            GLOBAL.retire_orphan(hook);
        }
    }
}
