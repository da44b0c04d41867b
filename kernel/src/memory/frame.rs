//! Frame Table
//!
//! Global registry of every allocated user frame, keyed by the frame's
//! kernel virtual address. Owns the pin flags and the eviction policy: when
//! the user pool runs dry, a two-pass clock sweep picks a victim, the
//! victim's page map decides where its contents go (file, swap, or nowhere),
//! and the frame returns to the pool.
//!
//! Lock order: frame table, then the victim's page map and page directory.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::pool::UserPool;
use super::swap::SwapManager;
use super::{is_user_vaddr, page_offset};
use crate::process::Process;

/// One allocated user frame.
pub struct FrameTableEntry {
    pub kpage: u64,
    /// User virtual page this frame backs.
    pub upage: u64,
    /// Process whose page map and page directory reference the frame.
    pub owner: Arc<Process>,
    /// Pinned frames are never eviction victims.
    pub pinned: bool,
}

/// Process-wide frame registry.
pub struct FrameTable {
    entries: Mutex<BTreeMap<u64, FrameTableEntry>>,
    evictions: AtomicU64,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            evictions: AtomicU64::new(0),
        }
    }

    /// Allocate a frame to back `upage` in `owner`'s address space, evicting
    /// if the pool is exhausted. The returned frame is pinned; the caller
    /// unpins once the frame is safe to evict.
    pub fn allocate(
        &self,
        pool: &UserPool,
        swap: &SwapManager,
        owner: &Arc<Process>,
        upage: u64,
    ) -> u64 {
        assert!(
            is_user_vaddr(upage) && page_offset(upage) == 0,
            "frame: {:#x} is not a user page",
            upage
        );

        let mut entries = self.entries.lock();

        let kpage = match pool.alloc() {
            Some(kpage) => kpage,
            None => {
                let victim = Self::select_victim(&mut entries);
                self.evict(&mut entries, pool, swap, victim);
                // eviction just returned a frame to the pool
                pool.alloc()
                    .unwrap_or_else(|| panic!("frame: pool still empty after eviction"))
            }
        };

        entries.insert(
            kpage,
            FrameTableEntry {
                kpage,
                upage,
                owner: Arc::clone(owner),
                pinned: true,
            },
        );
        kpage
    }

    /// Drop the entry for `kpage` and return the frame to the pool.
    pub fn free(&self, pool: &UserPool, kpage: u64) {
        let mut entries = self.entries.lock();
        if entries.remove(&kpage).is_some() {
            pool.free(kpage);
        }
    }

    /// Drop the entry for `kpage` only. Used by page-map teardown, where the
    /// page-directory sweep reclaims the physical frames afterwards.
    pub fn free_without_free_page(&self, kpage: u64) {
        self.entries.lock().remove(&kpage);
    }

    pub fn pin(&self, kpage: u64) {
        self.set_pinned(kpage, true);
    }

    pub fn unpin(&self, kpage: u64) {
        self.set_pinned(kpage, false);
    }

    fn set_pinned(&self, kpage: u64, pinned: bool) {
        match self.entries.lock().get_mut(&kpage) {
            Some(fte) => fte.pinned = pinned,
            None => panic!("frame: pin state change on unknown frame {:#x}", kpage),
        }
    }

    pub fn is_pinned(&self, kpage: u64) -> bool {
        match self.entries.lock().get(&kpage) {
            Some(fte) => fte.pinned,
            None => panic!("frame: pin query on unknown frame {:#x}", kpage),
        }
    }

    pub fn resident_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Snapshot of (kpage, upage, owner, pinned) for consistency audits.
    pub fn snapshot(&self) -> Vec<(u64, u64, Arc<Process>, bool)> {
        self.entries
            .lock()
            .values()
            .map(|fte| (fte.kpage, fte.upage, Arc::clone(&fte.owner), fte.pinned))
            .collect()
    }

    /// Two-pass clock sweep. Pass one gives every recently-used frame a
    /// second chance by clearing its accessed bit; pass two then returns the
    /// first unpinned frame. Every frame pinned is a pin-discipline bug.
    fn select_victim(entries: &mut BTreeMap<u64, FrameTableEntry>) -> u64 {
        for _pass in 0..2 {
            for fte in entries.values() {
                if fte.pinned {
                    continue;
                }
                let mut pagedir = fte.owner.pagedir.lock();
                if pagedir.is_accessed(fte.upage) {
                    pagedir.set_accessed(fte.upage, false);
                    continue;
                }
                return fte.kpage;
            }
        }
        panic!("frame: every frame is pinned, nothing to evict");
    }

    /// Push the victim's contents to their backing store, invalidate the
    /// owner's translation, and return the frame to the pool.
    fn evict(
        &self,
        entries: &mut BTreeMap<u64, FrameTableEntry>,
        pool: &UserPool,
        swap: &SwapManager,
        victim: u64,
    ) {
        let fte = entries
            .remove(&victim)
            .unwrap_or_else(|| panic!("frame: victim {:#x} vanished", victim));

        let hw_dirty = fte.owner.pagedir.lock().is_dirty(fte.upage);

        {
            let mut spt = fte.owner.spt.lock();
            let spte = spt.entry_mut(fte.upage).unwrap_or_else(|| {
                panic!(
                    "frame: evicting {:#x} with no page entry in owner {}",
                    fte.upage, fte.owner.pid
                )
            });
            spte.release_frame(fte.kpage, hw_dirty, swap);
        }

        // clear the translation so the owner's next touch faults
        fte.owner.pagedir.lock().clear_page(fte.upage);

        pool.free(fte.kpage);
        self.evictions.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "[FRAME] evicted {:#x} (upage {:#x}, pid {})",
            fte.kpage,
            fte.upage,
            fte.owner.pid
        );
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
