//! Control blocks for the reference counted pointer types.
//!
//! A control block carries the strong and weak counts, the type-erased
//! accessor and destructor functions of the managed value and the retire
//! hook through which the block itself is eventually reclaimed. Blocks are
//! hazard protected objects: a thread loading a block pointer from an
//! [`AtomicShared`](crate::AtomicShared) publishes a hazard for it before
//! touching the counts, and the block is retired into a dedicated domain
//! once its weak count drops to zero, so the racing reader never observes
//! freed memory.
//!
//! # Count protocol
//!
//! `strong` starts at 1 and counts owning [`Shared`](crate::Shared)
//! handles. `weak` starts at 1 as well: it counts [`Weak`](crate::Weak)
//! handles plus one implicit reference held on behalf of all strong
//! handles. When `strong` reaches zero the value is destroyed and the
//! implicit weak reference is given up; when `weak` reaches zero nothing
//! can name the block anymore and it retires itself.
//!
//! # Reentrant destruction
//!
//! Destroying a value may drop further strong references, recursing
//! arbitrarily deep for linked structures. Zero-count blocks are therefore
//! pushed onto a thread local defer list which the outermost destroy
//! invocation drains iteratively.

use core::cell::{Cell, UnsafeCell};
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicIsize, Ordering};

use crate::domain::Domain;
use crate::guard::Guard;
use crate::hazard::HazardRecord;
use crate::local::{LocalAccess, LocalHandle};
use crate::queue::Link;
use crate::retired::RetiredHook;

/// The dedicated domain protecting and reclaiming control blocks.
static CONTROL_DOMAIN: Domain = Domain::new();

thread_local! {
    static CONTROL_LOCAL: UnsafeCell<Option<LocalHandle<'static>>> = UnsafeCell::new(None);
}

/// Returns the domain into which control blocks are retired.
///
/// Useful for inspecting reclamation progress, e.g. in tests:
/// `control_block_domain().reclaimed_count()` only catches up to
/// `retired_count()` once dropped blocks are no longer hazard protected.
#[inline]
pub fn control_block_domain() -> &'static Domain {
    &CONTROL_DOMAIN
}

fn with_control_local<R>(f: impl FnOnce(&LocalHandle<'static>) -> R) -> R {
    CONTROL_LOCAL.with(|cell| unsafe {
        if (*cell.get()).is_none() {
            *cell.get() = Some(CONTROL_DOMAIN.attach());
        }
        f((*cell.get()).as_ref().unwrap())
    })
}

fn try_with_control_local<R>(f: impl FnOnce(&LocalHandle<'static>) -> R) -> Option<R> {
    CONTROL_LOCAL
        .try_with(|cell| unsafe {
            if (*cell.get()).is_none() {
                *cell.get() = Some(CONTROL_DOMAIN.attach());
            }
            f((*cell.get()).as_ref().unwrap())
        })
        .ok()
}

/// Creates a guard for protecting control block pointers.
#[inline]
pub(crate) fn control_guard() -> Guard<'static, ControlAccess> {
    Guard::with_access(ControlAccess)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ControlAccess
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [`LocalAccess`] to the control block domain's thread local state.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ControlAccess;

/********** impl LocalAccess **********************************************************************/

unsafe impl LocalAccess<'static> for ControlAccess {
    #[inline]
    fn domain(self) -> &'static Domain {
        &CONTROL_DOMAIN
    }

    #[inline]
    fn acquire_record(self) -> NonNull<HazardRecord> {
        with_control_local(|local| local.acquire_record_raw())
    }

    #[inline]
    fn release_record(self, record: NonNull<HazardRecord>) {
        if try_with_control_local(|local| local.release_record_raw(record)).is_none() {
            unsafe { HazardRecord::release_remote(record) };
        }
    }

    #[inline]
    fn retire_hook(self, hook: NonNull<RetiredHook>) {
        if try_with_control_local(|local| local.retire(hook)).is_none() {
            CONTROL_DOMAIN.retire_orphan(hook);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ControlBlock
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The type-erased header shared by all control block layouts.
///
/// The hook is the first field and every concrete layout leads with this
/// header (`repr(C)`), so a `*mut RetiredHook`, a `*mut ControlBlock` and a
/// pointer to the concrete layout are all interchangeable.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct ControlBlock {
    hook: RetiredHook,
    strong: AtomicIsize,
    weak: AtomicIsize,
    get_value: unsafe fn(*mut ControlBlock) -> *mut (),
    drop_value: unsafe fn(*mut ControlBlock),
    drop_self: unsafe fn(*mut ControlBlock),
}

/********** impl inherent *************************************************************************/

impl ControlBlock {
    #[inline]
    fn new(
        get_value: unsafe fn(*mut ControlBlock) -> *mut (),
        drop_value: unsafe fn(*mut ControlBlock),
        drop_self: unsafe fn(*mut ControlBlock),
    ) -> Self {
        Self {
            hook: RetiredHook::new(),
            strong: AtomicIsize::new(1),
            weak: AtomicIsize::new(1),
            get_value,
            drop_value,
            drop_self,
        }
    }

    /// Returns the managed value's address.
    ///
    /// # Safety
    ///
    /// The caller must hold a strong reference.
    #[inline]
    pub unsafe fn value(block: NonNull<ControlBlock>) -> *mut () {
        (block.as_ref().get_value)(block.as_ptr())
    }

    #[inline]
    pub fn strong_count(&self) -> isize {
        self.strong.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn weak_count(&self) -> isize {
        self.weak.load(Ordering::Relaxed)
    }

    /// Increments the strong count.
    ///
    /// The increment cannot race with the final decrement because the
    /// caller itself holds a strong reference.
    #[inline]
    pub fn inc_strong(&self) {
        let prev = self.strong.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "strong count revived");
    }

    /// Increments the strong count unless it is zero.
    ///
    /// Fails when the value is already being (or has been) destroyed, in
    /// which case no strong reference can be created anymore.
    #[inline]
    pub fn inc_strong_if_nonzero(&self) -> bool {
        let mut count = self.strong.load(Ordering::Relaxed);
        while count > 0 {
            match self.strong.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }

        false
    }

    #[inline]
    pub fn inc_weak(&self) {
        self.weak.fetch_add(1, Ordering::Relaxed);
    }

    /// Gives up one strong reference, destroying the value when it was the
    /// last one.
    ///
    /// # Safety
    ///
    /// The caller must own the reference it gives up.
    #[inline]
    pub unsafe fn dec_strong(block: NonNull<ControlBlock>) {
        // (CNT:1) this `AcqRel` decrement makes all accesses through other references visible
        // to the thread dropping the last one
        if block.as_ref().strong.fetch_sub(1, Ordering::AcqRel) == 1 {
            defer_destroy(block);
        }
    }

    /// Gives up one weak reference, retiring the block when it was the last
    /// one.
    ///
    /// # Safety
    ///
    /// The caller must own the reference it gives up and the value must
    /// already be destroyed if this releases the implicit reference.
    #[inline]
    pub unsafe fn dec_weak(block: NonNull<ControlBlock>) {
        // (CNT:2) as (CNT:1), for the block itself
        if block.as_ref().weak.fetch_sub(1, Ordering::AcqRel) == 1 {
            let hook = NonNull::from(&block.as_ref().hook);
            hook.as_ref().bind(block.as_ptr() as usize, reclaim_block);
            ControlAccess.retire_hook(hook);
        }
    }

    #[inline]
    unsafe fn destroy_value(block: NonNull<ControlBlock>) {
        (block.as_ref().drop_value)(block.as_ptr());
        Self::dec_weak(block);
    }

    #[inline]
    unsafe fn defer_next(block: NonNull<ControlBlock>) -> *mut ControlBlock {
        block.as_ref().hook.next().load(Ordering::Relaxed) as *mut ControlBlock
    }

    #[inline]
    unsafe fn set_defer_next(block: NonNull<ControlBlock>, next: *mut ControlBlock) {
        block.as_ref().hook.next().store(next as *mut RetiredHook, Ordering::Relaxed);
    }
}

/// Reclaims a control block once no hazard protects it anymore.
unsafe fn reclaim_block(hook: *mut RetiredHook) {
    let block = hook as *mut ControlBlock;
    ((*block).drop_self)(block);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// defer list
////////////////////////////////////////////////////////////////////////////////////////////////////

struct DeferList {
    head: Cell<*mut ControlBlock>,
    in_progress: Cell<bool>,
}

thread_local! {
    static DEFER: DeferList = DeferList {
        head: Cell::new(ptr::null_mut()),
        in_progress: Cell::new(false),
    };
}

/// Destroys the value of a block whose strong count reached zero.
///
/// The block is queued on the thread local defer list; only the outermost
/// invocation drains the list, so destructors dropping further strong
/// references bottom out instead of recursing.
unsafe fn defer_destroy(block: NonNull<ControlBlock>) {
    let deferred = DEFER
        .try_with(|defer| {
            ControlBlock::set_defer_next(block, defer.head.get());
            defer.head.set(block.as_ptr());

            if !defer.in_progress.get() {
                defer.in_progress.set(true);
                loop {
                    let head = defer.head.get();
                    if head.is_null() {
                        break;
                    }
                    let head = NonNull::new_unchecked(head);
                    defer.head.set(ControlBlock::defer_next(head));
                    ControlBlock::destroy_value(head);
                }
                defer.in_progress.set(false);
            }
        })
        .is_ok();

    // during thread local teardown the list is gone; destroy directly,
    // recursion is then bounded by what still drops during teardown
    if !deferred {
        ControlBlock::destroy_value(block);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// block layouts
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The in-place layout: the value lives inside the same allocation as the
/// header. Destroying the value runs the destructor only; the storage is
/// freed together with the block.
#[repr(C)]
pub(crate) struct InlineBlock<T> {
    ctrl: ControlBlock,
    slot: UnsafeCell<MaybeUninit<T>>,
}

impl<T> InlineBlock<T> {
    /// Allocates a new block with `value` stored in place and both counts
    /// at one.
    pub fn alloc(value: T) -> NonNull<ControlBlock> {
        let block = Box::leak(Box::new(Self {
            ctrl: ControlBlock::new(Self::get_value, Self::drop_value, Self::drop_self),
            slot: UnsafeCell::new(MaybeUninit::new(value)),
        }));

        NonNull::from(&block.ctrl)
    }

    unsafe fn get_value(block: *mut ControlBlock) -> *mut () {
        let block = block as *mut Self;
        (*block).slot.get() as *mut ()
    }

    unsafe fn drop_value(block: *mut ControlBlock) {
        let block = block as *mut Self;
        ptr::drop_in_place((*block).slot.get() as *mut T);
    }

    unsafe fn drop_self(block: *mut ControlBlock) {
        drop(Box::from_raw(block as *mut Self));
    }
}

/// The out-of-place layout: the value keeps its own (boxed) allocation.
#[repr(C)]
pub(crate) struct BoxedBlock<T> {
    ctrl: ControlBlock,
    value: *mut T,
}

impl<T> BoxedBlock<T> {
    /// Allocates a new block taking ownership of `boxed`.
    pub fn alloc(boxed: Box<T>) -> NonNull<ControlBlock> {
        let value = Box::into_raw(boxed);
        let block = Box::leak(Box::new(Self {
            ctrl: ControlBlock::new(Self::get_value, Self::drop_value, Self::drop_self),
            value,
        }));

        NonNull::from(&block.ctrl)
    }

    unsafe fn get_value(block: *mut ControlBlock) -> *mut () {
        (*(block as *mut Self)).value as *mut ()
    }

    unsafe fn drop_value(block: *mut ControlBlock) {
        drop(Box::from_raw((*(block as *mut Self)).value));
    }

    unsafe fn drop_self(block: *mut ControlBlock) {
        drop(Box::from_raw(block as *mut Self));
    }
}

/// The custom-deleter layout: the value is released by invoking a caller
/// supplied closure instead of dropping a `Box`.
#[repr(C)]
pub(crate) struct DeleterBlock<T, D: FnOnce(*mut T)> {
    ctrl: ControlBlock,
    value: *mut T,
    deleter: ManuallyDrop<D>,
}

impl<T, D: FnOnce(*mut T)> DeleterBlock<T, D> {
    /// Allocates a new block managing `value` through `deleter`.
    pub fn alloc(value: *mut T, deleter: D) -> NonNull<ControlBlock> {
        let block = Box::leak(Box::new(Self {
            ctrl: ControlBlock::new(Self::get_value, Self::drop_value, Self::drop_self),
            value,
            deleter: ManuallyDrop::new(deleter),
        }));

        NonNull::from(&block.ctrl)
    }

    unsafe fn get_value(block: *mut ControlBlock) -> *mut () {
        (*(block as *mut Self)).value as *mut ()
    }

    unsafe fn drop_value(block: *mut ControlBlock) {
        let block = block as *mut Self;
        let deleter = ManuallyDrop::take(&mut (*block).deleter);
        deleter((*block).value);
    }

    unsafe fn drop_self(block: *mut ControlBlock) {
        drop(Box::from_raw(block as *mut Self));
    }
}
