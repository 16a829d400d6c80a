//! Hazard pointer based concurrent memory reclamation, together with
//! reference counted shared pointers built on top of it.
//!
//! # Hazard Pointers
//!
//! Lock-free data structures hand out pointers to shared heap records
//! without being able to tell when a removed record stops being read.
//! Before dereferencing such a pointer, a reader *publishes* it in a hazard
//! record and re-reads the source to confirm the snapshot is still current.
//! Removed records are *retired* rather than freed; a *scan* compares the
//! retired records against every published hazard and reclaims only what no
//! thread protects.
//!
//! Retirement is organized in [`Domain`]s. The free functions [`guard`] and
//! [`retire_ptr`] use a built-in global domain and per-thread state that is
//! managed automatically; independent domains can be created and attached
//! to explicitly via [`Domain::attach`].
//!
//! ```
//! use std::sync::atomic::{AtomicPtr, Ordering};
//!
//! let src = AtomicPtr::new(Box::into_raw(Box::new(1)));
//!
//! let mut guard = hazrc::guard();
//! let ptr = guard.protect(&src);
//! // `ptr` cannot be reclaimed while the guard protects it
//! assert_eq!(unsafe { *ptr }, 1);
//!
//! // unlink and retire; the value is dropped once unprotected
//! let prev = src.swap(std::ptr::null_mut(), Ordering::AcqRel);
//! unsafe { hazrc::retire_ptr(prev) };
//! ```
//!
//! # Shared Pointers
//!
//! [`Shared`] and [`Weak`] form a strong/weak reference counted pair like
//! the standard library's, with one structural difference: the control
//! block is itself a hazard protected object, retired into a dedicated
//! domain when the last weak reference disappears. That closes the classic
//! race of a lock-free reader loading a pointer out of an atomic while the
//! last owner drops it, and is what makes [`AtomicShared`] a safe
//! `load`/`store`/`compare_exchange` cell for strong pointers.

mod config;
mod default;
mod domain;
mod guard;
mod hazard;
mod local;
mod queue;
mod registry;
mod retired;
mod shared;
mod tagged;

pub use crate::config::{Config, ConfigBuilder};
pub use crate::default::{detach_thread, global_domain, guard, retire_ptr, GlobalAccess};
pub use crate::domain::Domain;
pub use crate::guard::Guard;
pub use crate::hazard::HazardRecord;
pub use crate::local::{LocalAccess, LocalHandle};
pub use crate::retired::{ReclaimFn, RetiredHook};
pub use crate::shared::{
    control_block_domain, AtomicShared, CompareExchangeError, MarkedShared, Shared, Weak,
};
