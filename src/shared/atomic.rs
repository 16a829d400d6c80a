//! An atomically swappable strong pointer.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use super::control::{control_guard, ControlBlock};
use super::Shared;

////////////////////////////////////////////////////////////////////////////////////////////////////
// AtomicShared
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A location holding an optional [`Shared`] that can be loaded, stored and
/// compare-exchanged concurrently.
///
/// The location owns one strong reference to the stored value. Loading
/// works by protecting the control block with a hazard pointer before
/// touching its counts: even if the stored value is replaced and its last
/// reference dropped mid-load, the block is not reclaimed under the
/// reader, whose increment attempt then simply fails and retries against
/// the replacement.
pub struct AtomicShared<T> {
    block: AtomicPtr<ControlBlock>,
    _marker: PhantomData<Option<Shared<T>>>,
}

unsafe impl<T: Send + Sync> Send for AtomicShared<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicShared<T> {}

/********** impl inherent *************************************************************************/

impl<T> AtomicShared<T> {
    /// Creates a new location holding `shared`.
    #[inline]
    pub fn new(shared: Option<Shared<T>>) -> Self {
        Self { block: AtomicPtr::new(into_ptr(shared)), _marker: PhantomData }
    }

    /// Creates a new empty location.
    #[inline]
    pub const fn null() -> Self {
        Self { block: AtomicPtr::new(ptr::null_mut()), _marker: PhantomData }
    }

    /// Loads the stored value, acquiring a strong reference of its own.
    pub fn load(&self) -> Option<Shared<T>> {
        let mut guard = control_guard();
        loop {
            let block = guard.protect(&self.block);
            let block = match NonNull::new(block) {
                Some(block) => block,
                None => return None,
            };

            // the hazard keeps the block alive; if the count already hit
            // zero, the location must have been (or is being) swapped and
            // the next protect settles on the replacement
            if unsafe { block.as_ref() }.inc_strong_if_nonzero() {
                return Some(unsafe { Shared::from_block_ptr(block) });
            }
        }
    }

    /// Stores `shared`, dropping the previously stored value.
    #[inline]
    pub fn store(&self, shared: Option<Shared<T>>) {
        drop(self.swap(shared));
    }

    /// Stores `shared` and returns the previously stored value.
    #[inline]
    pub fn swap(&self, shared: Option<Shared<T>>) -> Option<Shared<T>> {
        // (ASP:1) this `AcqRel` swap releases the new value's construction to subsequent
        // loads and acquires the previous value for the returned owner
        let prev = self.block.swap(into_ptr(shared), Ordering::AcqRel);
        unsafe { from_ptr(prev) }
    }

    /// Stores `new` only if the location currently holds the same value as
    /// `current` (compared by control block identity).
    ///
    /// On success the previously stored value is returned with its strong
    /// reference transferred to the caller. On failure `new` is handed back
    /// together with a freshly acquired snapshot of the actual value.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Option<&Shared<T>>,
        new: Option<Shared<T>>,
    ) -> Result<Option<Shared<T>>, CompareExchangeError<T>> {
        let current = current.map(|s| Shared::block_ptr(s).as_ptr()).unwrap_or(ptr::null_mut());
        let desired = new.as_ref().map(|s| Shared::block_ptr(s).as_ptr()).unwrap_or(ptr::null_mut());

        match self.block.compare_exchange(current, desired, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(prev) => {
                mem::forget(new);
                Ok(unsafe { from_ptr(prev) })
            }
            Err(_) => Err(CompareExchangeError { current: self.load(), new }),
        }
    }

    /// Like [`compare_exchange`](AtomicShared::compare_exchange), but may
    /// fail spuriously.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: Option<&Shared<T>>,
        new: Option<Shared<T>>,
    ) -> Result<Option<Shared<T>>, CompareExchangeError<T>> {
        let current = current.map(|s| Shared::block_ptr(s).as_ptr()).unwrap_or(ptr::null_mut());
        let desired = new.as_ref().map(|s| Shared::block_ptr(s).as_ptr()).unwrap_or(ptr::null_mut());

        match self.block.compare_exchange_weak(current, desired, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(prev) => {
                mem::forget(new);
                Ok(unsafe { from_ptr(prev) })
            }
            Err(_) => Err(CompareExchangeError { current: self.load(), new }),
        }
    }

    /// Consumes the location and returns the stored value.
    #[inline]
    pub fn into_inner(mut self) -> Option<Shared<T>> {
        let block = *self.block.get_mut();
        mem::forget(self);
        unsafe { from_ptr(block) }
    }
}

#[inline]
fn into_ptr<T>(shared: Option<Shared<T>>) -> *mut ControlBlock {
    shared.map(Shared::into_block_ptr).unwrap_or(ptr::null_mut())
}

#[inline]
unsafe fn from_ptr<T>(block: *mut ControlBlock) -> Option<Shared<T>> {
    NonNull::new(block).map(|block| Shared::from_block_ptr(block))
}

/********** impl Default **************************************************************************/

impl<T> Default for AtomicShared<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

/********** impl From *****************************************************************************/

impl<T> From<Shared<T>> for AtomicShared<T> {
    #[inline]
    fn from(shared: Shared<T>) -> Self {
        Self::new(Some(shared))
    }
}

impl<T> From<Option<Shared<T>>> for AtomicShared<T> {
    #[inline]
    fn from(shared: Option<Shared<T>>) -> Self {
        Self::new(shared)
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for AtomicShared<T> {
    #[inline]
    fn drop(&mut self) {
        let block = *self.block.get_mut();
        drop(unsafe { from_ptr::<T>(block) });
    }
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for AtomicShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicShared")
            .field("block", &self.block.load(Ordering::Relaxed))
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// CompareExchangeError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The result of a failed
/// [`compare_exchange`](AtomicShared::compare_exchange).
pub struct CompareExchangeError<T> {
    /// A snapshot of the actually stored value, acquired like a
    /// [`load`](AtomicShared::load).
    pub current: Option<Shared<T>>,
    /// The rejected new value, returned to the caller.
    pub new: Option<Shared<T>>,
}

/********** impl Debug ****************************************************************************/

impl<T> fmt::Debug for CompareExchangeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompareExchangeError { .. }")
    }
}
