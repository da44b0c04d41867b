//! Virtual Memory Subsystem
//!
//! Demand paging for user processes: a fixed pool of physical frames, a
//! global frame table with clock eviction, per-process supplemental page
//! maps, and a swap partition for pages with nowhere else to go.
//!
//! The subsystem is built once at boot from [`VmConfig`] and handed to
//! every caller; there are no hidden singletons, so fixtures can stand up
//! isolated instances.

pub mod fault;
pub mod frame;
pub mod loader;
pub mod mmap;
pub mod page;
pub mod paging;
pub mod pool;
pub mod swap;

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::disk::BlockDevice;
use crate::process::Process;

pub use fault::{handle_page_fault, FaultOutcome};
pub use frame::FrameTable;
pub use page::{load_page, unpin_page, PageLocation, Spt};
pub use paging::PageDir;
pub use pool::UserPool;
pub use swap::SwapManager;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;
/// First address above user space.
pub const USER_TOP: u64 = 0xC000_0000;
/// How far the user stack may grow down from [`USER_TOP`].
pub const MAX_STACK: u64 = 8 * 1024 * 1024;
/// Accesses at most this far below the stack pointer count as stack growth.
pub const STACK_SLACK: u64 = 32;

/// Round `addr` down to its page base.
pub fn page_round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round `addr` up to the next page boundary.
pub fn page_round_up(addr: u64) -> u64 {
    page_round_down(addr + PAGE_SIZE as u64 - 1)
}

/// Byte offset of `addr` within its page.
pub fn page_offset(addr: u64) -> u64 {
    addr & (PAGE_SIZE as u64 - 1)
}

/// Whether `addr` lies in user space.
pub fn is_user_vaddr(addr: u64) -> bool {
    addr < USER_TOP
}

/// The bytes of the frame at `kpage`. Callers hold whatever lock covers
/// the frame's current use; two live slices to one frame never coexist.
pub(crate) fn frame_bytes(kpage: u64) -> &'static mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(kpage as *mut u8, PAGE_SIZE) }
}

/// Boot-time sizing of the subsystem.
pub struct VmConfig {
    /// Physical frames in the user pool.
    pub user_frames: usize,
}

/// Event counters, exported through [`Vm::stats`].
pub struct VmCounters {
    pub faults: AtomicU64,
    pub stack_growths: AtomicU64,
}

/// The assembled subsystem: frame pool, frame table, swap.
pub struct Vm {
    pub pool: UserPool,
    pub frames: FrameTable,
    pub swap: SwapManager,
    pub counters: VmCounters,
}

/// Point-in-time view of the subsystem.
#[derive(Debug, Clone, Copy)]
pub struct VmStats {
    pub frames_total: usize,
    pub frames_used: usize,
    pub evictions: u64,
    pub swap_slots: usize,
    pub swap_used: usize,
    pub faults: u64,
    pub stack_growths: u64,
}

impl Vm {
    /// Build the subsystem: reserve the frame pool and take over the swap
    /// device. Called once at boot, after the block layer is up.
    pub fn new(config: VmConfig, swap_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            pool: UserPool::new(config.user_frames),
            frames: FrameTable::new(),
            swap: SwapManager::new(swap_device),
            counters: VmCounters {
                faults: AtomicU64::new(0),
                stack_growths: AtomicU64::new(0),
            },
        }
    }

    /// Allocate a frame to back `upage` for `owner`, evicting when the
    /// pool is dry. Returned pinned; see [`FrameTable::allocate`].
    pub fn allocate_frame(&self, owner: &Arc<Process>, upage: u64) -> u64 {
        self.frames.allocate(&self.pool, &self.swap, owner, upage)
    }

    /// Drop the frame-table entry for `kpage` and return it to the pool.
    pub fn free_frame(&self, kpage: u64) {
        self.frames.free(&self.pool, kpage);
    }

    /// Drop only the frame-table entry; the page-directory sweep reclaims
    /// the physical frame during process teardown.
    pub fn free_frame_without_free_page(&self, kpage: u64) {
        self.frames.free_without_free_page(kpage);
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            frames_total: self.pool.total_frames(),
            frames_used: self.pool.used_frames(),
            evictions: self.frames.eviction_count(),
            swap_slots: self.swap.slot_count(),
            swap_used: self.swap.used_slots(),
            faults: self.counters.faults.load(Ordering::Relaxed),
            stack_growths: self.counters.stack_growths.load(Ordering::Relaxed),
        }
    }

    /// Assert the cross-structure invariants. `processes` must cover every
    /// process with live memory state, or the swap accounting check is
    /// meaningless. Panics on the first violation; meant for stress
    /// fixtures and debug builds.
    pub fn check_consistency(&self, processes: &[Arc<Process>]) {
        // every frame-table entry has a resident page entry and a live
        // translation behind it
        for (kpage, upage, owner, _pinned) in self.frames.snapshot() {
            let spt = owner.spt.lock();
            let spte = spt.entry(upage).unwrap_or_else(|| {
                panic!(
                    "consistency: frame {:#x} has no page entry (pid {}, upage {:#x})",
                    kpage, owner.pid, upage
                )
            });
            match spte.location {
                PageLocation::Frame { kpage: k } if k == kpage => {}
                _ => panic!(
                    "consistency: frame {:#x} not resident in pid {}",
                    kpage, owner.pid
                ),
            }
            drop(spt);

            let mapped = owner.pagedir.lock().get_page(upage);
            if mapped != Some(kpage) {
                panic!(
                    "consistency: pid {} maps {:#x} -> {:?}, frame table says {:#x}",
                    owner.pid, upage, mapped, kpage
                );
            }
        }

        // page entries agree with the page directory, and swap slots are
        // owned by exactly one page
        let mut slots = BTreeSet::new();
        let mut swapped = 0usize;
        for proc in processes {
            let spt = proc.spt.lock();
            let pagedir = proc.pagedir.lock();
            for (&upage, spte) in spt.iter() {
                match spte.location {
                    PageLocation::Frame { kpage } => {
                        assert_eq!(
                            pagedir.get_page(upage),
                            Some(kpage),
                            "consistency: resident {:#x} unmapped in pid {}",
                            upage,
                            proc.pid
                        );
                    }
                    PageLocation::Swapped { slot } => {
                        swapped += 1;
                        assert!(
                            slots.insert(slot),
                            "consistency: swap slot {} owned twice",
                            slot
                        );
                        assert_eq!(
                            pagedir.get_page(upage),
                            None,
                            "consistency: swapped {:#x} still mapped in pid {}",
                            upage,
                            proc.pid
                        );
                    }
                    PageLocation::Filesys | PageLocation::Zero => {
                        assert_eq!(
                            pagedir.get_page(upage),
                            None,
                            "consistency: non-resident {:#x} mapped in pid {}",
                            upage,
                            proc.pid
                        );
                    }
                }
            }
        }

        assert_eq!(
            swapped,
            self.swap.used_slots(),
            "consistency: swap bitmap population disagrees with page entries"
        );
    }
}
