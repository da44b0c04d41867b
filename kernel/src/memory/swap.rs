//! Swap Manager
//!
//! Slot allocator over the swap block device. The device is carved into
//! page-sized slots of [`SECTORS_PER_PAGE`] sectors; a word bitmap tracks
//! occupancy (bit set = slot holds a page). Slot contents have no header
//! and do not survive reboot.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::{frame_bytes, PAGE_SIZE};
use crate::disk::{BlockDevice, SECTOR_SIZE};

/// Sectors backing one page-sized slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

struct SwapInner {
    device: Arc<dyn BlockDevice>,
    /// Bit set = slot occupied.
    bitmap: Vec<u64>,
    slots: usize,
    used: usize,
}

/// Process-wide swap state. All operations, I/O included, run under one
/// mutex; a swap slot is never touched by two threads at once.
pub struct SwapManager {
    inner: Mutex<SwapInner>,
    swapped_out: AtomicU64,
    swapped_in: AtomicU64,
}

impl SwapManager {
    /// Take ownership of the swap device and zero the slot map.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = (device.sector_count() / SECTORS_PER_PAGE as u64) as usize;
        log::info!(
            "[SWAP] {} slots ({} KB) on a {}-sector device",
            slots,
            slots * PAGE_SIZE / 1024,
            device.sector_count()
        );
        Self {
            inner: Mutex::new(SwapInner {
                device,
                bitmap: vec![0u64; (slots + 63) / 64],
                slots,
                used: 0,
            }),
            swapped_out: AtomicU64::new(0),
            swapped_in: AtomicU64::new(0),
        }
    }

    /// Write the frame at `kpage` to the first free slot and return its
    /// index. Swap exhaustion is unrecoverable: the pin discipline keeps
    /// the working set below the frame budget, so running out of slots
    /// means the sizing of the swap partition is wrong.
    pub fn swap_out(&self, kpage: u64) -> usize {
        let mut inner = self.inner.lock();

        let slot = Self::first_free(&inner).unwrap_or_else(|| {
            panic!("swap: out of swap slots ({} in use)", inner.used)
        });

        let page = frame_bytes(kpage);
        for i in 0..SECTORS_PER_PAGE {
            let lba = (slot * SECTORS_PER_PAGE + i) as u64;
            inner
                .device
                .write_sector(lba, &page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }

        inner.bitmap[slot / 64] |= 1u64 << (slot % 64);
        inner.used += 1;
        self.swapped_out.fetch_add(1, Ordering::Relaxed);

        log::debug!("[SWAP] out {:#x} -> slot {}", kpage, slot);
        slot
    }

    /// Read `slot` back into the frame at `kpage` and release the slot.
    pub fn swap_in(&self, slot: usize, kpage: u64) {
        let mut inner = self.inner.lock();
        if !Self::occupied(&inner, slot) {
            panic!("swap: read from empty slot {}", slot);
        }

        let page = frame_bytes(kpage);
        for i in 0..SECTORS_PER_PAGE {
            let lba = (slot * SECTORS_PER_PAGE + i) as u64;
            inner
                .device
                .read_sector(lba, &mut page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }

        inner.bitmap[slot / 64] &= !(1u64 << (slot % 64));
        inner.used -= 1;
        self.swapped_in.fetch_add(1, Ordering::Relaxed);

        log::debug!("[SWAP] in slot {} -> {:#x}", slot, kpage);
    }

    /// Release `slot` without reading it (the page's owner is exiting).
    pub fn swap_free(&self, slot: usize) {
        let mut inner = self.inner.lock();
        if !Self::occupied(&inner, slot) {
            panic!("swap: free of empty slot {}", slot);
        }
        inner.bitmap[slot / 64] &= !(1u64 << (slot % 64));
        inner.used -= 1;
    }

    pub fn slot_count(&self) -> usize {
        self.inner.lock().slots
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used
    }

    /// (pages swapped out, pages swapped in) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.swapped_out.load(Ordering::Relaxed),
            self.swapped_in.load(Ordering::Relaxed),
        )
    }

    fn occupied(inner: &SwapInner, slot: usize) -> bool {
        if slot >= inner.slots {
            panic!("swap: slot {} out of range ({})", slot, inner.slots);
        }
        inner.bitmap[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    fn first_free(inner: &SwapInner) -> Option<usize> {
        for (idx, &word) in inner.bitmap.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let slot = idx * 64 + (!word).trailing_zeros() as usize;
            if slot < inner.slots {
                return Some(slot);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;
    use alloc::sync::Arc;

    fn swap_with_slots(slots: usize) -> SwapManager {
        SwapManager::new(Arc::new(RamDisk::new((slots * SECTORS_PER_PAGE) as u64)))
    }

    fn page_buf(fill: u8) -> (Vec<u8>, u64) {
        let mut buf = vec![fill; PAGE_SIZE];
        let kpage = buf.as_mut_ptr() as u64;
        (buf, kpage)
    }

    #[test]
    fn out_then_in_round_trips_bytes() {
        let swap = swap_with_slots(4);
        let (_keep, kpage) = page_buf(0x5A);
        let slot = swap.swap_out(kpage);
        assert_eq!(swap.used_slots(), 1);

        let (keep2, kpage2) = page_buf(0x00);
        swap.swap_in(slot, kpage2);
        assert!(keep2.iter().all(|&b| b == 0x5A));
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn slots_are_reused_lowest_first() {
        let swap = swap_with_slots(4);
        let (_a, ka) = page_buf(1);
        let (_b, kb) = page_buf(2);
        assert_eq!(swap.swap_out(ka), 0);
        assert_eq!(swap.swap_out(kb), 1);
        swap.swap_free(0);
        assert_eq!(swap.swap_out(ka), 0);
    }

    #[test]
    #[should_panic(expected = "empty slot")]
    fn swap_in_of_empty_slot_panics() {
        let swap = swap_with_slots(2);
        let (_b, kpage) = page_buf(0);
        swap.swap_in(1, kpage);
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn exhaustion_panics() {
        let swap = swap_with_slots(1);
        let (_a, ka) = page_buf(7);
        swap.swap_out(ka);
        swap.swap_out(ka);
    }
}
