//! Storage for retired records until they can be safely reclaimed.
//!
//! # Retired Hooks
//!
//! Every object that can be retired embeds a [`RetiredHook`], the header
//! through which it is linked into a thread's retired set without any
//! per-retire allocation. The hook stores the *key* under which the object
//! was retired (by convention the address that readers publish in their
//! hazard slots) and the reclaim function to invoke once no hazard protects
//! that key anymore. Control blocks of shared pointers embed their hook
//! directly; arbitrary boxed values are retired through a small allocated
//! [`RetiredBox`] node whose key is the retired value's address rather than
//! the node's own.
//!
//! # Retired Sets
//!
//! Retired hooks are kept in a per-thread hashed set with a power-of-two
//! bucket count, keyed by the hook's key. The set is only ever accessed by
//! the thread owning the enclosing block (or by a thread that has taken the
//! block over wholesale), so none of its operations need atomics. During a
//! scan, entries whose key matches a published hazard are marked through the
//! tag bit of their chain link; the subsequent sweep unlinks and reclaims
//! everything unmarked.

use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::queue::Link;
use crate::tagged::MarkedPtr;

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredHook
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The function invoked to reclaim a retired object, receiving the object's
/// embedded hook.
pub type ReclaimFn = unsafe fn(*mut RetiredHook);

/// The intrusive header of a retirable object.
///
/// A hook must stay linked from the moment its object is retired until the
/// object is reclaimed; dropping a linked hook's object is a contract
/// violation.
#[derive(Debug)]
pub struct RetiredHook {
    next: AtomicPtr<RetiredHook>,
    key: Cell<usize>,
    reclaim: Cell<Option<ReclaimFn>>,
}

// Hooks are only mutated by the thread that currently owns the containing
// set (or queue chain); the `next` field is atomic for the sake of the
// orphan queue.
unsafe impl Send for RetiredHook {}
unsafe impl Sync for RetiredHook {}

/********** impl Default **************************************************************************/

impl Default for RetiredHook {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl inherent *************************************************************************/

impl RetiredHook {
    /// Creates a new unlinked hook.
    #[inline]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            key: Cell::new(0),
            reclaim: Cell::new(None),
        }
    }

    /// Binds the hook to `key` and `reclaim` at retire time.
    #[inline]
    pub(crate) fn bind(&self, key: usize, reclaim: ReclaimFn) {
        self.key.set(key);
        self.reclaim.set(Some(reclaim));
    }

    /// Returns the key under which the hook was retired.
    #[inline]
    pub(crate) fn key(&self) -> usize {
        self.key.get()
    }

    /// Invokes the bound reclaim function, consuming the hook.
    ///
    /// # Safety
    ///
    /// `hook` must have been bound by a retire and must be unlinked; it is
    /// invalid after the call.
    #[inline]
    pub(crate) unsafe fn reclaim(hook: *mut RetiredHook) {
        let reclaim = (*hook).reclaim.get().expect("reclaiming an unbound hook");
        reclaim(hook);
    }

    #[inline]
    fn chain(&self) -> MarkedPtr<RetiredHook> {
        MarkedPtr::from_usize(self.next.load(Ordering::Relaxed) as usize)
    }

    #[inline]
    fn set_chain(&self, chain: MarkedPtr<RetiredHook>) {
        self.next.store(chain.into_usize() as *mut _, Ordering::Relaxed);
    }
}

/********** impl Link *****************************************************************************/

impl Link for RetiredHook {
    #[inline]
    fn next(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredBox
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An allocated retire node wrapping a boxed value that does not itself
/// embed a hook.
///
/// The node's key is the *value's* address, since that is the address
/// readers protect, while the node lives at a different one.
#[repr(C)]
pub(crate) struct RetiredBox<T> {
    hook: RetiredHook,
    value: *mut T,
}

/********** impl inherent *************************************************************************/

impl<T> RetiredBox<T> {
    /// Wraps `value` for retiring and returns the node's hook, bound to the
    /// value's address.
    ///
    /// # Safety
    ///
    /// `value` must point to a live `Box`-allocated value that is reclaimed
    /// by nothing else.
    pub unsafe fn bind(value: *mut T) -> NonNull<RetiredHook> {
        let node = Box::leak(Box::new(Self { hook: RetiredHook::new(), value }));
        node.hook.bind(value as usize, Self::reclaim);
        NonNull::from(&node.hook)
    }

    unsafe fn reclaim(hook: *mut RetiredHook) {
        // the hook is the node's first field (`repr(C)`)
        let node = Box::from_raw(hook as *mut Self);
        drop(Box::from_raw(node.value));
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredSet
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A hashed set of retired hooks, keyed by retire key.
///
/// The bucket array is allocated once by the owning thread block; the set
/// itself never allocates.
#[derive(Debug)]
pub(crate) struct RetiredSet {
    buckets: Box<[*mut RetiredHook]>,
    mask: usize,
    len: usize,
}

/********** impl inherent *************************************************************************/

impl RetiredSet {
    /// Creates a new set with `buckets` chains.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is not a power of two.
    pub fn with_buckets(buckets: usize) -> Self {
        assert!(buckets.is_power_of_two(), "bucket count must be a power of two");
        Self { buckets: vec![ptr::null_mut(); buckets].into_boxed_slice(), mask: buckets - 1, len: 0 }
    }

    /// Returns the number of currently retired hooks.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `hook` into the set.
    ///
    /// Retiring the same key twice without an intervening reclaim is a
    /// contract violation and only detected in debug builds.
    pub fn insert(&mut self, hook: NonNull<RetiredHook>) {
        let key = unsafe { hook.as_ref().key() };
        debug_assert!(!self.contains(key), "key retired twice");

        let idx = self.bucket(key);
        unsafe { hook.as_ref().set_chain(MarkedPtr::new(self.buckets[idx])) };
        self.buckets[idx] = hook.as_ptr();
        self.len += 1;
    }

    /// Returns `true` if an entry with `key` is linked.
    pub fn contains(&self, key: usize) -> bool {
        let mut curr = self.buckets[self.bucket(key)];
        while !curr.is_null() {
            let hook = unsafe { &*curr };
            if hook.key() == key {
                return true;
            }
            curr = hook.chain().decompose_ptr();
        }

        false
    }

    /// Marks the entry with `key` (if any) as protected for the duration of
    /// the current scan.
    pub fn mark(&mut self, key: usize) {
        let mut curr = self.buckets[self.bucket(key)];
        while !curr.is_null() {
            let hook = unsafe { &*curr };
            if hook.key() == key {
                hook.set_chain(hook.chain().with_tag(true));
                return;
            }
            curr = hook.chain().decompose_ptr();
        }
    }

    /// Unlinks every unmarked entry and clears the mark on every other,
    /// returning the unlinked chain for reclamation.
    ///
    /// The reclaim functions must only be invoked *after* this call returns,
    /// once the set no longer references the drained hooks.
    pub fn sweep(&mut self) -> Drain {
        let mut drained: *mut RetiredHook = ptr::null_mut();

        for bucket in self.buckets.iter_mut() {
            let mut kept: *mut RetiredHook = ptr::null_mut();
            let mut curr = *bucket;

            while !curr.is_null() {
                let hook = unsafe { &*curr };
                let chain = hook.chain();
                if chain.decompose_tag() {
                    // protected during this scan: clear the mark and keep
                    hook.set_chain(MarkedPtr::new(kept));
                    kept = curr;
                } else {
                    hook.set_chain(MarkedPtr::new(drained));
                    drained = curr;
                    self.len -= 1;
                }
                curr = chain.decompose_ptr();
            }

            *bucket = kept;
        }

        Drain { curr: drained }
    }

    /// Unlinks *all* entries, returning them for reclamation.
    pub fn drain_all(&mut self) -> Drain {
        let mut drained: *mut RetiredHook = ptr::null_mut();

        for bucket in self.buckets.iter_mut() {
            let mut curr = *bucket;
            while !curr.is_null() {
                let hook = unsafe { &*curr };
                let next = hook.chain().decompose_ptr();
                hook.set_chain(MarkedPtr::new(drained));
                drained = curr;
                curr = next;
            }
            *bucket = ptr::null_mut();
        }

        self.len = 0;
        Drain { curr: drained }
    }

    /// Drains `other` into `self`, re-hashing every entry.
    pub fn merge(&mut self, other: &mut RetiredSet) {
        for hook in other.drain_all() {
            self.insert(unsafe { NonNull::new_unchecked(hook) });
        }
    }

    #[inline]
    fn bucket(&self, key: usize) -> usize {
        // keys are addresses of (at least) word-aligned allocations, so the
        // low bits carry no entropy
        (key >> 3).wrapping_mul(0x9E37_79B9) & self.mask
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Drain
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An iterator over hooks unlinked from a [`RetiredSet`].
///
/// The chain link is advanced *before* an item is yielded, so a yielded hook
/// may be reclaimed immediately.
pub(crate) struct Drain {
    curr: *mut RetiredHook,
}

/********** impl Iterator *************************************************************************/

impl Iterator for Drain {
    type Item = *mut RetiredHook;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.curr.is_null() {
            return None;
        }

        let hook = self.curr;
        self.curr = unsafe { (*hook).chain().decompose_ptr() };
        Some(hook)
    }
}
