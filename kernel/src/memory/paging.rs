//! Page Directory Model
//!
//! Per-process virtual-to-frame mapping with the access/dirty bookkeeping
//! the MMU keeps in hardware. The rest of the subsystem talks to this layer
//! only; swapping it for a real page-table walker changes nothing above it.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::{page_offset, PAGE_SIZE};

/// Page directory entry flags (low bits of the entry word; the frame
/// address occupies the page-aligned high bits).
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct PageFlags(u64);

impl PageFlags {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const ACCESSED: u64 = 1 << 5;
    pub const DIRTY: u64 = 1 << 6;

    pub const fn new(flags: u64) -> Self {
        Self(flags)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_present(&self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE != 0
    }
}

/// One directory entry: frame address plus flag bits.
#[derive(Clone, Copy)]
#[repr(transparent)]
struct PageDirEntry(u64);

impl PageDirEntry {
    const ADDR_MASK: u64 = !(PAGE_SIZE as u64 - 1);

    fn new(kpage: u64, flags: PageFlags) -> Self {
        Self((kpage & Self::ADDR_MASK) | flags.bits())
    }

    fn kpage(&self) -> u64 {
        self.0 & Self::ADDR_MASK
    }

    fn flags(&self) -> PageFlags {
        PageFlags(self.0 & !Self::ADDR_MASK)
    }

    fn set_flag(&mut self, bit: u64, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Software page directory for one process.
pub struct PageDir {
    entries: BTreeMap<u64, PageDirEntry>,
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Install `upage -> kpage`. Returns false when `upage` is already
    /// mapped (the caller treats that as an install failure, mirroring the
    /// hardware layer refusing to overwrite a live translation).
    pub fn set_page(&mut self, upage: u64, kpage: u64, writable: bool) -> bool {
        assert_eq!(page_offset(upage), 0, "pagedir: unaligned upage {:#x}", upage);
        assert_eq!(page_offset(kpage), 0, "pagedir: unaligned kpage {:#x}", kpage);

        if self.entries.contains_key(&upage) {
            return false;
        }
        let mut flags = PageFlags::PRESENT;
        if writable {
            flags |= PageFlags::WRITABLE;
        }
        self.entries
            .insert(upage, PageDirEntry::new(kpage, PageFlags::new(flags)));
        true
    }

    /// The frame `upage` currently maps to, if present.
    pub fn get_page(&self, upage: u64) -> Option<u64> {
        self.entries.get(&upage).map(|e| e.kpage())
    }

    /// Drop the translation for `upage`. Missing entries are ignored, the
    /// way `invlpg` on an absent translation is.
    pub fn clear_page(&mut self, upage: u64) {
        self.entries.remove(&upage);
    }

    pub fn is_writable(&self, upage: u64) -> bool {
        self.entries
            .get(&upage)
            .map(|e| e.flags().is_writable())
            .unwrap_or(false)
    }

    pub fn is_dirty(&self, upage: u64) -> bool {
        self.entries
            .get(&upage)
            .map(|e| e.flags().bits() & PageFlags::DIRTY != 0)
            .unwrap_or(false)
    }

    pub fn set_dirty(&mut self, upage: u64, dirty: bool) {
        if let Some(e) = self.entries.get_mut(&upage) {
            e.set_flag(PageFlags::DIRTY, dirty);
        }
    }

    pub fn is_accessed(&self, upage: u64) -> bool {
        self.entries
            .get(&upage)
            .map(|e| e.flags().bits() & PageFlags::ACCESSED != 0)
            .unwrap_or(false)
    }

    pub fn set_accessed(&mut self, upage: u64, accessed: bool) {
        if let Some(e) = self.entries.get_mut(&upage) {
            e.set_flag(PageFlags::ACCESSED, accessed);
        }
    }

    /// Snapshot of every live translation, for teardown and audits.
    pub fn mapped_pages(&self) -> Vec<(u64, u64)> {
        self.entries.iter().map(|(&u, e)| (u, e.kpage())).collect()
    }

    /// Remove every translation, returning the frames that were mapped.
    /// Process teardown reclaims these after the page map is destroyed.
    pub fn destroy(&mut self) -> Vec<u64> {
        let frames = self.entries.values().map(|e| e.kpage()).collect();
        self.entries.clear();
        frames
    }

    pub fn mapped_count(&self) -> usize {
        self.entries.len()
    }
}
