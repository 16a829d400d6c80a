//! A grow-only lock-free registry of per-thread state blocks.
//!
//! Every thread that participates in a domain owns exactly one registry
//! entry at a time. Entries are never unlinked: a departing thread merely
//! clears its entry's `active` flag, leaving the entry behind for the next
//! arriving thread to reacquire. This sidesteps the need for the registry to
//! reclaim its own memory, which would be circular. All entries are freed
//! when the registry itself is dropped.

use core::iter::FusedIterator;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

////////////////////////////////////////////////////////////////////////////////////////////////////
// Registry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An intrusive lock-free singly-linked list of [`Entry`] blocks.
#[derive(Debug)]
pub(crate) struct Registry<T> {
    head: AtomicPtr<Entry<T>>,
}

/********** impl inherent *************************************************************************/

impl<T> Registry<T> {
    /// Creates a new empty registry.
    #[inline]
    pub const fn new() -> Self {
        Self { head: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Acquires an entry for the calling thread.
    ///
    /// The list is first traversed in search of an inactive entry that can
    /// be taken over. If none is found, a new entry is initialized with
    /// `init` and pushed onto the head of the list.
    #[inline]
    pub fn acquire(&self, init: impl FnOnce() -> T) -> &Entry<T> {
        for entry in self.iter() {
            if entry.try_acquire() {
                return entry;
            }
        }

        self.insert(init)
    }

    /// Returns an iterator over *all* entries, whether active or not.
    ///
    /// The iterator visits at least every entry that was linked before the
    /// iteration began; entries pushed concurrently may or may not be seen.
    #[inline]
    pub fn iter(&self) -> Iter<'_, T> {
        // (REG:1) this `Acquire` load synchronizes-with the `Release` CAS (REG:2)
        Iter { curr: unsafe { self.head.load(Ordering::Acquire).as_ref() } }
    }

    #[cold]
    fn insert(&self, init: impl FnOnce() -> T) -> &Entry<T> {
        let entry = Box::leak(Box::new(Entry {
            data: init(),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        loop {
            let head = self.head.load(Ordering::Relaxed);
            entry.next.store(head, Ordering::Relaxed);

            // (REG:2) this `Release` CAS synchronizes-with the `Acquire` loads (REG:1), (REG:3),
            // making the new entry's data visible to all registry iterators
            if self
                .head
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return entry;
            }
        }
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for Registry<T> {
    fn drop(&mut self) {
        let mut curr = self.head.load(Ordering::Relaxed);
        while !curr.is_null() {
            let entry = unsafe { Box::from_raw(curr) };
            curr = entry.next.load(Ordering::Relaxed);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Entry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A registry entry holding one thread's state block.
#[derive(Debug)]
pub(crate) struct Entry<T> {
    data: T,
    active: AtomicBool,
    next: AtomicPtr<Entry<T>>,
}

/********** impl inherent *************************************************************************/

impl<T> Entry<T> {
    /// Returns a reference to the entry's data block.
    #[inline]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Returns `true` if the entry is currently owned by some thread.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Attempts to take exclusive ownership of the entry.
    ///
    /// On success, the acquiring thread observes every write the previous
    /// owner made before releasing the entry.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.is_active()
            // (REG:4) this `Acquire` CAS synchronizes-with the `Release` store (REG:5)
            && self
                .active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Gives up ownership of the entry, transferring all prior writes to the
    /// next acquiring thread.
    #[inline]
    pub fn release(&self) {
        debug_assert!(self.is_active(), "released entry must be owned");
        // (REG:5) this `Release` store synchronizes-with the `Acquire` CAS (REG:4)
        self.active.store(false, Ordering::Release);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Iter
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Iter<'a, T> {
    curr: Option<&'a Entry<T>>,
}

/********** impl Iterator *************************************************************************/

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a Entry<T>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.curr?;
        // (REG:3) this `Acquire` load synchronizes-with the `Release` CAS (REG:2)
        self.curr = unsafe { entry.next.load(Ordering::Acquire).as_ref() };
        Some(entry)
    }
}

/********** impl FusedIterator ********************************************************************/

impl<T> FusedIterator for Iter<'_, T> {}
