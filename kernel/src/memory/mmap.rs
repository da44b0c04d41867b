//! Memory-Mapped File Regions
//!
//! Per-process registry of live `mmap` regions and the map/unmap
//! operations behind the `mmap`/`munmap` syscalls. A region holds its own
//! reopened file handle, so closing the original descriptor cannot
//! invalidate the mapping.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::page;
use super::{page_offset, Vm, PAGE_SIZE, USER_TOP};
use crate::fs::File;
use crate::process::Process;

/// Process-local mapping id, positive.
pub type MapId = i32;

/// One live `mmap` region.
pub struct MmapRegion {
    pub id: MapId,
    /// Private handle reopened at map time.
    pub file: Arc<dyn File>,
    /// Page-aligned base user address.
    pub base: u64,
    /// Total mapped bytes (the file length at map time).
    pub len: u64,
}

/// Per-process table of live regions.
pub struct MmapTable {
    regions: BTreeMap<MapId, MmapRegion>,
    next_id: MapId,
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> MapId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: MapId) -> Option<&MmapRegion> {
        self.regions.get(&id)
    }

    pub fn ids(&self) -> Vec<MapId> {
        self.regions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Map `file` (an already-reopened handle) at `addr`. Returns the region
/// id, or `None` for a null or unaligned address, an empty file, a region
/// that would leave user space, or any overlap with pages the process
/// already possesses. No page entry is installed unless the whole region
/// validates.
pub fn map_file(proc: &Arc<Process>, file: Arc<dyn File>, addr: u64) -> Option<MapId> {
    if addr == 0 || page_offset(addr) != 0 {
        return None;
    }
    let len = file.length();
    if len == 0 {
        return None;
    }
    let end = addr.checked_add(len)?;
    if end > USER_TOP {
        return None;
    }

    let pages = (len as usize + PAGE_SIZE - 1) / PAGE_SIZE;

    let mut spt = proc.spt.lock();
    for i in 0..pages {
        if spt.has_entry(addr + (i * PAGE_SIZE) as u64) {
            return None;
        }
    }

    for i in 0..pages {
        let offset = (i * PAGE_SIZE) as u64;
        let read_bytes = (len - offset).min(PAGE_SIZE as u64) as u32;
        let zero_bytes = PAGE_SIZE as u32 - read_bytes;
        let installed = spt.install_mapped_file_entry(
            addr + offset,
            Arc::clone(&file),
            offset,
            read_bytes,
            zero_bytes,
            true,
        );
        assert!(installed, "mmap: overlap appeared during install");
    }
    drop(spt);

    let mut mmaps = proc.mmaps.lock();
    let id = mmaps.alloc_id();
    log::debug!(
        "[MMAP] pid {} region {} at {:#x} ({} bytes)",
        proc.pid,
        id,
        addr,
        len
    );
    mmaps.regions.insert(
        id,
        MmapRegion {
            id,
            file,
            base: addr,
            len,
        },
    );
    Some(id)
}

/// Tear down region `id`: write dirty resident pages back, release frames
/// and page entries, drop the reopened handle. Unknown ids are ignored.
pub fn unmap_region(vm: &Vm, proc: &Arc<Process>, id: MapId) {
    let Some(region) = proc.mmaps.lock().regions.remove(&id) else {
        return;
    };

    let pages = (region.len as usize + PAGE_SIZE - 1) / PAGE_SIZE;
    for i in 0..pages {
        let offset = (i * PAGE_SIZE) as u64;
        // the tail page writes back only the bytes the file actually has
        let size = (region.len - offset).min(PAGE_SIZE as u64) as usize;
        page::unmap_page(vm, proc, region.base + offset, offset, size);
    }

    log::debug!("[MMAP] pid {} region {} unmapped", proc.pid, id);
    // region.file drops here, closing the reopened handle
}

/// Unmap every live region; the exit path runs this before page-map
/// teardown so dirty pages reach their files while the handles are alive.
pub fn unmap_all(vm: &Vm, proc: &Arc<Process>) {
    let ids = proc.mmaps.lock().ids();
    for id in ids {
        unmap_region(vm, proc, id);
    }
}
