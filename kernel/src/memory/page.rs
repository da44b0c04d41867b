//! Supplemental Page Table
//!
//! Per-process map from user virtual page to where that page's contents
//! currently live: in a frame, on the file system, in a swap slot, or
//! nowhere yet (all zeros). The page-fault path materializes pages from
//! here; eviction and unmapping push them back out.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use super::swap::SwapManager;
use super::{frame_bytes, page_offset, Vm, PAGE_SIZE};
use crate::fs::File;
use crate::process::Process;

/// Where a page's contents currently live.
pub enum PageLocation {
    /// Resident in the frame at `kpage`.
    Frame { kpage: u64 },
    /// Recoverable from the backing file.
    Filesys,
    /// Held in swap slot `slot`.
    Swapped { slot: usize },
    /// Never materialized; reads as zeros.
    Zero,
}

/// File backing of a page. Retained while the page is resident so eviction
/// and unmapping know where the bytes came from and where dirty mapped
/// pages go back to.
pub struct FileBacking {
    pub file: Arc<dyn File>,
    pub offset: u64,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    /// True for `mmap` regions. Only these write dirty pages back to the
    /// file; a dirtied writable segment page goes to swap instead, so its
    /// bytes are never silently dropped.
    pub mapped: bool,
}

/// One page the process logically possesses.
pub struct Spte {
    pub upage: u64,
    pub writable: bool,
    /// Sticky software dirty bit. Set when the kernel stores through the
    /// frame alias, which the user-side page directory never sees.
    pub dirty: bool,
    pub backing: Option<FileBacking>,
    pub location: PageLocation,
}

impl Spte {
    /// Frame address when resident.
    pub fn kpage(&self) -> Option<u64> {
        match self.location {
            PageLocation::Frame { kpage } => Some(kpage),
            _ => None,
        }
    }

    /// Eviction writeback. Runs under the frame-table lock with the frame
    /// already removed from the table; decides where the contents go and
    /// records the page's new location.
    pub(crate) fn release_frame(&mut self, kpage: u64, hw_dirty: bool, swap: &SwapManager) {
        debug_assert!(matches!(self.location, PageLocation::Frame { .. }));
        let dirty = self.dirty || hw_dirty;

        match &self.backing {
            Some(backing) if backing.mapped => {
                if dirty && self.writable {
                    let page = frame_bytes(kpage);
                    backing
                        .file
                        .write_at(&page[..backing.read_bytes as usize], backing.offset);
                }
                self.dirty = false;
                self.location = PageLocation::Filesys;
            }
            Some(_) if !self.writable => {
                // clean by construction; the reload path re-reads the file
                self.location = PageLocation::Filesys;
            }
            _ => {
                let slot = swap.swap_out(kpage);
                self.location = PageLocation::Swapped { slot };
            }
        }
    }
}

/// Per-process supplemental page table.
pub struct Spt {
    entries: BTreeMap<u64, Spte>,
}

impl Spt {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Record a page recoverable from `file`; used by the executable
    /// loader. Returns false if `upage` already has an entry.
    pub fn install_filesys_entry(
        &mut self,
        upage: u64,
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> bool {
        self.install_file_entry(upage, file, offset, read_bytes, zero_bytes, writable, false)
    }

    /// Record one page of an `mmap` region.
    pub fn install_mapped_file_entry(
        &mut self,
        upage: u64,
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> bool {
        self.install_file_entry(upage, file, offset, read_bytes, zero_bytes, writable, true)
    }

    fn install_file_entry(
        &mut self,
        upage: u64,
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
        mapped: bool,
    ) -> bool {
        assert_eq!(page_offset(upage), 0, "spt: unaligned upage {:#x}", upage);
        assert_eq!(
            read_bytes as usize + zero_bytes as usize,
            PAGE_SIZE,
            "spt: file page split {} + {} != {}",
            read_bytes,
            zero_bytes,
            PAGE_SIZE
        );

        self.insert(Spte {
            upage,
            writable,
            dirty: false,
            backing: Some(FileBacking {
                file,
                offset,
                read_bytes,
                zero_bytes,
                mapped,
            }),
            location: PageLocation::Filesys,
        })
    }

    /// Record a lazily zero-filled page; used by stack growth.
    pub fn install_allzero_entry(&mut self, upage: u64) -> bool {
        assert_eq!(page_offset(upage), 0, "spt: unaligned upage {:#x}", upage);
        self.insert(Spte {
            upage,
            writable: true,
            dirty: false,
            backing: None,
            location: PageLocation::Zero,
        })
    }

    /// Record an already-resident anonymous page; used right after eagerly
    /// materializing one (the initial stack page).
    pub fn install_frame_entry(&mut self, upage: u64, kpage: u64, writable: bool) -> bool {
        assert_eq!(page_offset(upage), 0, "spt: unaligned upage {:#x}", upage);
        self.insert(Spte {
            upage,
            writable,
            dirty: false,
            backing: None,
            location: PageLocation::Frame { kpage },
        })
    }

    fn insert(&mut self, spte: Spte) -> bool {
        // one entry per user page
        if self.entries.contains_key(&spte.upage) {
            return false;
        }
        self.entries.insert(spte.upage, spte);
        true
    }

    pub fn has_entry(&self, upage: u64) -> bool {
        self.entries.contains_key(&upage)
    }

    pub fn entry(&self, upage: u64) -> Option<&Spte> {
        self.entries.get(&upage)
    }

    pub fn entry_mut(&mut self, upage: u64) -> Option<&mut Spte> {
        self.entries.get_mut(&upage)
    }

    pub fn remove(&mut self, upage: u64) -> Option<Spte> {
        self.entries.remove(&upage)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Spte)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drain(&mut self) -> BTreeMap<u64, Spte> {
        core::mem::take(&mut self.entries)
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}

enum LoadPlan {
    Resident {
        kpage: u64,
    },
    FromFile {
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: u32,
        writable: bool,
    },
    FromSwap {
        slot: usize,
        writable: bool,
    },
    ZeroFill,
}

/// Materialize `upage` for `proc`, the central page-in routine.
///
/// Returns false when no entry exists (the fault handler then consults the
/// stack-growth heuristic) or when the load itself fails (short file read,
/// translation install failure) — the caller terminates the process.
///
/// With `pin` the frame stays pinned on return and the caller must
/// eventually call [`unpin_page`]; otherwise the frame is unpinned before
/// returning. This is how syscalls touch user buffers without racing
/// eviction.
pub fn load_page(vm: &Vm, proc: &Arc<Process>, upage: u64, pin: bool) -> bool {
    let plan = {
        let spt = proc.spt.lock();
        let Some(spte) = spt.entry(upage) else {
            return false;
        };
        match &spte.location {
            PageLocation::Frame { kpage } => LoadPlan::Resident { kpage: *kpage },
            PageLocation::Filesys => {
                let backing = spte
                    .backing
                    .as_ref()
                    .unwrap_or_else(|| panic!("spt: file page {:#x} without backing", upage));
                LoadPlan::FromFile {
                    file: Arc::clone(&backing.file),
                    offset: backing.offset,
                    read_bytes: backing.read_bytes,
                    writable: spte.writable,
                }
            }
            PageLocation::Swapped { slot } => LoadPlan::FromSwap {
                slot: *slot,
                writable: spte.writable,
            },
            PageLocation::Zero => LoadPlan::ZeroFill,
        }
    };

    match plan {
        LoadPlan::Resident { kpage } => {
            if pin {
                vm.frames.pin(kpage);
            }
            true
        }
        LoadPlan::FromFile {
            file,
            offset,
            read_bytes,
            writable,
        } => {
            let kpage = vm.allocate_frame(proc, upage);
            let page = frame_bytes(kpage);
            if file.read_at(&mut page[..read_bytes as usize], offset) != read_bytes as usize {
                vm.free_frame(kpage);
                return false;
            }
            page[read_bytes as usize..].fill(0);
            finish_load(vm, proc, upage, kpage, writable, pin)
        }
        LoadPlan::FromSwap { slot, writable } => {
            let kpage = vm.allocate_frame(proc, upage);
            vm.swap.swap_in(slot, kpage);
            finish_load(vm, proc, upage, kpage, writable, pin)
        }
        LoadPlan::ZeroFill => {
            let kpage = vm.allocate_frame(proc, upage);
            frame_bytes(kpage).fill(0);
            finish_load(vm, proc, upage, kpage, true, pin)
        }
    }
}

/// Install the translation and flip the entry to resident.
fn finish_load(
    vm: &Vm,
    proc: &Arc<Process>,
    upage: u64,
    kpage: u64,
    writable: bool,
    pin: bool,
) -> bool {
    {
        let mut pagedir = proc.pagedir.lock();
        if !pagedir.set_page(upage, kpage, writable) {
            drop(pagedir);
            vm.free_frame(kpage);
            return false;
        }
        // the faulting access retries as soon as we return
        pagedir.set_dirty(upage, false);
        pagedir.set_accessed(upage, true);
    }

    {
        let mut spt = proc.spt.lock();
        match spt.entry_mut(upage) {
            Some(spte) => spte.location = PageLocation::Frame { kpage },
            None => panic!("spt: entry for {:#x} vanished during load", upage),
        }
    }

    if !pin {
        vm.frames.unpin(kpage);
    }
    true
}

/// Unpin the frame recorded for a resident page. Pairs with
/// `load_page(.., pin = true)`.
pub fn unpin_page(vm: &Vm, proc: &Arc<Process>, upage: u64) {
    let kpage = {
        let spt = proc.spt.lock();
        spt.entry(upage).and_then(|spte| spte.kpage())
    };
    match kpage {
        Some(kpage) => vm.frames.unpin(kpage),
        None => panic!("spt: unpin of non-resident page {:#x}", upage),
    }
}

/// Tear down one page of an `mmap` region, writing a dirty resident page
/// back to the file at `offset` (`size` bytes — short on the tail page).
pub fn unmap_page(vm: &Vm, proc: &Arc<Process>, upage: u64, offset: u64, size: usize) {
    let mut spt = proc.spt.lock();
    let Some(spte) = spt.entry_mut(upage) else {
        return;
    };

    match spte.location {
        PageLocation::Frame { kpage } => {
            let hw_dirty = proc.pagedir.lock().is_dirty(upage);
            if spte.dirty || hw_dirty {
                let backing = spte
                    .backing
                    .as_ref()
                    .unwrap_or_else(|| panic!("spt: mapped page {:#x} without backing", upage));
                let page = frame_bytes(kpage);
                backing.file.write_at(&page[..size], offset);
            }
            vm.free_frame(kpage);
            proc.pagedir.lock().clear_page(upage);
        }
        PageLocation::Filesys => {
            // never materialized (or discarded clean); nothing to write
        }
        PageLocation::Swapped { .. } | PageLocation::Zero => {
            panic!("spt: mapped-file page {:#x} in impossible state", upage)
        }
    }

    spt.remove(upage);
}

/// Release every page the process still holds: resident frames leave the
/// frame table (the page-directory sweep reclaims the physical frames),
/// swapped pages give their slots back. File writeback does not happen
/// here — live `mmap` regions must be unmapped before teardown.
pub fn destroy_spt(vm: &Vm, proc: &Arc<Process>) {
    let entries = proc.spt.lock().drain();
    for (_upage, spte) in entries {
        match spte.location {
            PageLocation::Frame { kpage } => vm.frames.free_without_free_page(kpage),
            PageLocation::Swapped { slot } => vm.swap.swap_free(slot),
            PageLocation::Filesys | PageLocation::Zero => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;
    use crate::fs::MemFile;
    use crate::memory::{VmConfig, PAGE_SIZE};
    use crate::process::Process;

    const UP: u64 = 0x0804_8000;

    fn vm_with_frames(frames: usize) -> Vm {
        Vm::new(
            VmConfig { user_frames: frames },
            Arc::new(RamDisk::new(64 * 8)),
        )
    }

    fn file_with_pattern(len: usize) -> Arc<dyn File> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        MemFile::with_contents(data)
    }

    #[test]
    fn duplicate_upage_rejected() {
        let mut spt = Spt::new();
        assert!(spt.install_allzero_entry(UP));
        assert!(!spt.install_allzero_entry(UP));
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn load_from_file_fills_and_zero_tails() {
        let vm = vm_with_frames(2);
        let proc = Process::new(1);
        let file = file_with_pattern(100);
        proc.spt
            .lock()
            .install_filesys_entry(UP, Arc::clone(&file), 0, 100, (PAGE_SIZE - 100) as u32, false);

        assert!(load_page(&vm, &proc, UP, false));

        let spt = proc.spt.lock();
        let kpage = spt.entry(UP).unwrap().kpage().unwrap();
        let page = crate::memory::frame_bytes(kpage);
        assert_eq!(page[0], 0);
        assert_eq!(page[99], 99 % 251);
        assert!(page[100..].iter().all(|&b| b == 0));
        assert_eq!(proc.pagedir.lock().get_page(UP), Some(kpage));
        assert!(!proc.pagedir.lock().is_writable(UP));
        assert!(!vm.frames.is_pinned(kpage));
    }

    #[test]
    fn short_read_fails_the_load_and_frees_the_frame() {
        let vm = vm_with_frames(2);
        let proc = Process::new(1);
        let file = file_with_pattern(10);
        // claims 100 readable bytes, file only has 10
        proc.spt
            .lock()
            .install_filesys_entry(UP, file, 0, 100, (PAGE_SIZE - 100) as u32, false);

        assert!(!load_page(&vm, &proc, UP, false));
        assert_eq!(vm.frames.resident_count(), 0);
        assert_eq!(vm.pool.used_frames(), 0);
    }

    #[test]
    fn zero_page_materializes_writable_and_zeroed() {
        let vm = vm_with_frames(2);
        let proc = Process::new(1);
        proc.spt.lock().install_allzero_entry(UP);

        assert!(load_page(&vm, &proc, UP, false));
        let spt = proc.spt.lock();
        let kpage = spt.entry(UP).unwrap().kpage().unwrap();
        assert!(crate::memory::frame_bytes(kpage).iter().all(|&b| b == 0));
        assert!(proc.pagedir.lock().is_writable(UP));
    }

    #[test]
    fn missing_entry_returns_false() {
        let vm = vm_with_frames(1);
        let proc = Process::new(1);
        assert!(!load_page(&vm, &proc, UP, false));
    }

    #[test]
    fn pinned_load_stays_pinned_until_unpin_page() {
        let vm = vm_with_frames(2);
        let proc = Process::new(1);
        proc.spt.lock().install_allzero_entry(UP);

        assert!(load_page(&vm, &proc, UP, true));
        let kpage = proc.spt.lock().entry(UP).unwrap().kpage().unwrap();
        assert!(vm.frames.is_pinned(kpage));

        // repeated pinned load of a resident page re-pins harmlessly
        assert!(load_page(&vm, &proc, UP, true));
        unpin_page(&vm, &proc, UP);
        assert!(!vm.frames.is_pinned(kpage));
    }

    #[test]
    fn swap_round_trip_preserves_bytes() {
        let vm = vm_with_frames(1);
        let proc = Process::new(1);
        proc.spt.lock().install_allzero_entry(UP);
        assert!(load_page(&vm, &proc, UP, false));

        let kpage = proc.spt.lock().entry(UP).unwrap().kpage().unwrap();
        crate::memory::frame_bytes(kpage)[..4].copy_from_slice(b"ABCD");
        proc.pagedir.lock().set_dirty(UP, true);

        // second page forces the first out to swap
        proc.spt.lock().install_allzero_entry(UP + PAGE_SIZE as u64);
        assert!(load_page(&vm, &proc, UP + PAGE_SIZE as u64, false));
        assert!(matches!(
            proc.spt.lock().entry(UP).unwrap().location,
            PageLocation::Swapped { .. }
        ));

        // faulting it back in evicts the other page and restores the bytes
        assert!(load_page(&vm, &proc, UP, false));
        let kpage = proc.spt.lock().entry(UP).unwrap().kpage().unwrap();
        assert_eq!(&crate::memory::frame_bytes(kpage)[..4], b"ABCD");
        assert_eq!(vm.swap.used_slots(), 1);
    }

    #[test]
    fn read_only_file_page_discards_on_eviction() {
        let vm = vm_with_frames(1);
        let proc = Process::new(1);
        let file = file_with_pattern(PAGE_SIZE);
        proc.spt
            .lock()
            .install_filesys_entry(UP, file, 0, PAGE_SIZE as u32, 0, false);
        assert!(load_page(&vm, &proc, UP, false));

        proc.spt.lock().install_allzero_entry(UP + PAGE_SIZE as u64);
        assert!(load_page(&vm, &proc, UP + PAGE_SIZE as u64, false));

        // discarded, not swapped
        assert!(matches!(
            proc.spt.lock().entry(UP).unwrap().location,
            PageLocation::Filesys
        ));
        assert_eq!(vm.swap.used_slots(), 0);
    }

    #[test]
    fn destroy_releases_frames_and_swap_slots() {
        let vm = vm_with_frames(1);
        let proc = Process::new(1);
        proc.spt.lock().install_allzero_entry(UP);
        assert!(load_page(&vm, &proc, UP, false));
        proc.spt.lock().install_allzero_entry(UP + PAGE_SIZE as u64);
        assert!(load_page(&vm, &proc, UP + PAGE_SIZE as u64, false));
        assert_eq!(vm.swap.used_slots(), 1);

        destroy_spt(&vm, &proc);
        assert_eq!(vm.swap.used_slots(), 0);
        assert_eq!(vm.frames.resident_count(), 0);
        // page-directory sweep reclaims the physical frames
        let frames = proc.pagedir.lock().destroy();
        for kpage in frames {
            vm.pool.free(kpage);
        }
        assert_eq!(vm.pool.used_frames(), 0);
    }
}
