//! Reclamation domains.
//!
//! A [`Domain`] is an independent universe of hazard records and retired
//! objects: hazards published through one domain protect only objects
//! retired into the same domain. Domains are const-constructible so they
//! can back `static` items; independent domains can be created for subsystems
//! whose reclamation should not interfere with each other.

use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU64, Ordering};

use crate::config::Config;
use crate::local::{LocalHandle, ThreadBlock};
use crate::queue::RawList;
use crate::registry::{Entry, Registry};
use crate::retired::RetiredHook;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Domain
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A hazard pointer reclamation domain.
#[derive(Debug)]
pub struct Domain {
    registry: Registry<ThreadBlock>,
    config: Config,
    /// Hooks retired by threads whose local state was already torn down;
    /// adopted by the next scan in any thread.
    orphans: RawList<RetiredHook>,
    orphan_retires: AtomicU64,
}

/********** impl Default **************************************************************************/

impl Default for Domain {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl inherent *************************************************************************/

impl Domain {
    /// Creates a new domain with the default [`Config`].
    #[inline]
    pub const fn new() -> Self {
        Self::with_config(Config::DEFAULT)
    }

    /// Creates a new domain with the given `config`.
    #[inline]
    pub const fn with_config(config: Config) -> Self {
        Self {
            registry: Registry::new(),
            config,
            orphans: RawList::new(),
            orphan_retires: AtomicU64::new(0),
        }
    }

    /// Returns the domain's configuration.
    #[inline]
    pub fn config(&self) -> Config {
        self.config
    }

    /// Attaches the calling thread to the domain.
    ///
    /// Either a block left behind by a previously detached thread is
    /// reacquired or a new one is allocated and linked. The returned handle
    /// detaches the thread again when dropped.
    #[inline]
    pub fn attach(&self) -> LocalHandle<'_> {
        let entry = self.registry.acquire(|| ThreadBlock::new(&self.config));
        LocalHandle::new(self, entry)
    }

    /// Returns the total number of objects ever retired into this domain.
    #[inline]
    pub fn retired_count(&self) -> u64 {
        self.registry.iter().map(|entry| entry.data().retired_total()).sum::<u64>()
            + self.orphan_retires.load(Ordering::Relaxed)
    }

    /// Returns the total number of retired objects reclaimed so far.
    #[inline]
    pub fn reclaimed_count(&self) -> u64 {
        self.registry.iter().map(|entry| entry.data().reclaimed_total()).sum()
    }

    /// Retires `hook` into the set of `entry`'s block and initiates a scan
    /// once the set reaches the configured threshold.
    pub(crate) fn retire(&self, entry: &Entry<ThreadBlock>, hook: NonNull<RetiredHook>) {
        let block = entry.data();
        block.count_retired();
        // the caller owns the block, no other reference into the set exists
        let len = unsafe {
            let retired = block.retired_mut();
            retired.insert(hook);
            retired.len()
        };

        if len >= self.config.scan_threshold() as usize {
            self.scan(block);
        }
    }

    /// Retires `hook` without any thread-local state, pushing it onto the
    /// domain's orphan queue for adoption by the next scan.
    pub(crate) fn retire_orphan(&self, hook: NonNull<RetiredHook>) {
        self.orphan_retires.fetch_add(1, Ordering::Relaxed);
        unsafe { self.orphans.push(hook.as_ptr()) };
    }

    /// Attempts to reclaim the retired records in `block`'s set.
    ///
    /// Every record of every registered block is consulted, whether its
    /// block is currently owned or not: a hazard published by a since
    /// departed thread protects no less than one published by a live one.
    pub(crate) fn scan(&self, block: &ThreadBlock) {
        // a reclaim function may retire further records and re-trigger the
        // threshold; those retires are picked up by a later scan
        if block.set_scanning(true) {
            return;
        }

        // adopt everything retired without thread-local state first
        let retired = unsafe { block.retired_mut() };
        for hook in self.orphans.take_all() {
            retired.insert(unsafe { NonNull::new_unchecked(hook) });
        }

        if retired.is_empty() {
            block.set_scanning(false);
            return;
        }

        // (DOM:1) this `SeqCst` fence synchronizes-with the `SeqCst` fence (GRD:1) issued by
        // every reader between publishing a hazard and re-reading the source pointer: any
        // hazard published before a successful re-read is visible to the loads below
        fence(Ordering::SeqCst);

        for entry in self.registry.iter() {
            for record in entry.data().pool().records() {
                // (DOM:2) this `Acquire` load synchronizes-with the `Release` stores (HAZ:1),
                // (HAZ:2), ordering the protecting thread's reads before any reclamation
                if let Some(protected) = record.protected(Ordering::Acquire) {
                    retired.mark(protected.as_ptr() as usize);
                }
            }
        }

        let drained = retired.sweep();

        // the set is consistent again; reclaim functions are free to retire
        let mut reclaimed = 0;
        for hook in drained {
            unsafe { RetiredHook::reclaim(hook) };
            reclaimed += 1;
        }

        block.set_scanning(false);
        block.count_reclaimed(reclaimed);
    }

    /// Scans on behalf of departed threads: every dormant block is taken
    /// over, its leftover retires are merged into `entry`'s set and the
    /// block is released again, then a regular scan runs.
    pub(crate) fn help_scan(&self, entry: &Entry<ThreadBlock>) {
        let block = entry.data();
        for other in self.registry.iter() {
            if core::ptr::eq(other, entry) || !other.try_acquire() {
                continue;
            }

            // `other` is exclusively owned until released below
            unsafe { block.retired_mut().merge(other.data().retired_mut()) };
            other.release();
        }

        self.scan(block);
    }

    /// Detaches a thread: its remaining retires get one helping scan and the
    /// block goes dormant, to be reacquired or adopted later.
    pub(crate) fn detach(&self, entry: &Entry<ThreadBlock>) {
        self.help_scan(entry);
        entry.release();
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Domain {
    fn drop(&mut self) {
        // no guard can outlive the domain it borrows, so nothing is
        // protected anymore and every leftover retire is reclaimed
        for entry in self.registry.iter() {
            let block = entry.data();
            debug_assert!(
                block.pool().records().iter().all(|r| r.protected(Ordering::Relaxed).is_none()),
                "dropped domain with live hazard records"
            );

            let mut reclaimed = 0;
            for hook in unsafe { block.retired_mut().drain_all() } {
                unsafe { RetiredHook::reclaim(hook) };
                reclaimed += 1;
            }
            block.count_reclaimed(reclaimed);
        }

        for hook in self.orphans.take_all() {
            unsafe { RetiredHook::reclaim(hook) };
        }
    }
}
