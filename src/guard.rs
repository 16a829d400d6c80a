//! RAII guards owning one hazard record each.

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicPtr, Ordering};

use crate::domain::Domain;
use crate::hazard::HazardRecord;
use crate::local::LocalAccess;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An RAII guard holding one hazard record of its domain.
///
/// While a pointer is protected through a guard, no scan of the same domain
/// reclaims the object it refers to. A guard protects at most one pointer
/// at a time; protecting another pointer supersedes the previous
/// protection.
#[derive(Debug)]
pub struct Guard<'d, L: LocalAccess<'d>> {
    record: NonNull<HazardRecord>,
    local: L,
    _marker: PhantomData<&'d Domain>,
}

// Records remain valid for the lifetime of their domain and releasing a
// record from a foreign thread routes it through its pool's overflow path.
unsafe impl<'d, L: LocalAccess<'d> + Send> Send for Guard<'d, L> {}

/********** impl inherent *************************************************************************/

impl<'d, L: LocalAccess<'d>> Guard<'d, L> {
    /// Creates a new guard, acquiring a record through `local`.
    #[inline]
    pub(crate) fn with_access(local: L) -> Self {
        Self { record: local.acquire_record(), local, _marker: PhantomData }
    }

    /// Loads the pointer from `src` and protects it from reclamation.
    ///
    /// The snapshot is re-validated after publishing, repeating until a
    /// published value is confirmed to still be the current one. The
    /// returned pointer (unless null) is safe to dereference until the
    /// protection is reset or superseded.
    #[inline]
    pub fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        self.protect_with(src, |ptr| ptr as *const ())
    }

    /// Like [`protect`](Guard::protect), but publishes `map(ptr)` instead of
    /// the loaded pointer itself.
    ///
    /// This supports sources whose stored pointers carry a tag bit: readers
    /// publish (and scanners observe) the untagged address.
    #[inline]
    pub fn protect_with<T>(
        &mut self,
        src: &AtomicPtr<T>,
        map: impl Fn(*mut T) -> *const (),
    ) -> *mut T {
        let mut ptr = src.load(Ordering::Relaxed);
        loop {
            if ptr.is_null() {
                self.reset_protection();
                return ptr;
            }

            unsafe { self.record.as_ref() }.protect(map(ptr));
            // (GRD:1) this `SeqCst` fence synchronizes-with the `SeqCst` fence (DOM:1): a scan
            // fencing after the re-read below cannot miss the published hazard
            fence(Ordering::SeqCst);

            let current = src.load(Ordering::Acquire);
            if current == ptr {
                return ptr;
            }
            ptr = current;
        }
    }

    /// Publishes `expected` and confirms that `src` still holds it.
    ///
    /// On success the protection stands and `true` is returned; otherwise
    /// the protection is reset and the caller must re-read and retry.
    #[inline]
    pub fn try_protect<T>(&mut self, expected: *mut T, src: &AtomicPtr<T>) -> bool {
        if expected.is_null() {
            self.reset_protection();
            return src.load(Ordering::Acquire).is_null();
        }

        unsafe { self.record.as_ref() }.protect(expected as *const ());
        // (GRD:1) see above
        fence(Ordering::SeqCst);

        if src.load(Ordering::Acquire) == expected {
            true
        } else {
            self.reset_protection();
            false
        }
    }

    /// Unconditionally publishes `ptr` without validating any source.
    ///
    /// The caller is responsible for `ptr` still being live, e.g. because it
    /// is protected by another guard or because a reference is owned.
    #[inline]
    pub fn protect_raw(&mut self, ptr: *const ()) {
        unsafe { self.record.as_ref() }.protect(ptr);
        // (GRD:1) see above
        fence(Ordering::SeqCst);
    }

    /// Clears the guard's protection.
    #[inline]
    pub fn reset_protection(&mut self) {
        unsafe { self.record.as_ref() }.clear();
    }

    /// Returns the domain this guard protects pointers in.
    #[inline]
    pub fn domain(&self) -> &'d Domain {
        self.local.domain()
    }
}

/********** impl Drop *****************************************************************************/

impl<'d, L: LocalAccess<'d>> Drop for Guard<'d, L> {
    #[inline]
    fn drop(&mut self) {
        // releasing resets the slot before the record returns to a free path
        self.local.release_record(self.record);
    }
}
