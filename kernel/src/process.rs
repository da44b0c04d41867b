//! Process State
//!
//! The slice of a process the memory subsystem cares about: its page
//! directory, its supplemental page map, its live `mmap` regions, and its
//! open files. PID allocation, scheduling state and the rest of the
//! process manager live elsewhere.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::fs::File;
use crate::memory::mmap::{self, MmapTable};
use crate::memory::page::{self, Spt};
use crate::memory::paging::PageDir;
use crate::memory::Vm;

/// Process ID type
pub type Pid = u32;

/// Console descriptors; never backed by the fd table.
pub const FD_STDIN: i32 = 0;
pub const FD_STDOUT: i32 = 1;

/// One open descriptor: the handle plus its cursor.
pub struct FdEntry {
    pub file: Arc<dyn File>,
    pub pos: u64,
}

/// Per-process descriptor table. Descriptors start at 2.
pub struct FdTable {
    entries: BTreeMap<i32, FdEntry>,
    next_fd: i32,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_fd: 2,
        }
    }

    /// Register `file` and return its descriptor.
    pub fn open(&mut self, file: Arc<dyn File>) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.entries.insert(fd, FdEntry { file, pos: 0 });
        fd
    }

    pub fn get(&self, fd: i32) -> Option<Arc<dyn File>> {
        self.entries.get(&fd).map(|e| Arc::clone(&e.file))
    }

    pub fn pos(&self, fd: i32) -> Option<u64> {
        self.entries.get(&fd).map(|e| e.pos)
    }

    pub fn seek(&mut self, fd: i32, pos: u64) {
        if let Some(entry) = self.entries.get_mut(&fd) {
            entry.pos = pos;
        }
    }

    pub fn advance(&mut self, fd: i32, by: u64) {
        if let Some(entry) = self.entries.get_mut(&fd) {
            entry.pos += by;
        }
    }

    /// Close `fd`. Returns false for unknown descriptors.
    pub fn close(&mut self, fd: i32) -> bool {
        self.entries.remove(&fd).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-process memory state.
pub struct Process {
    pub pid: Pid,
    pub pagedir: Mutex<PageDir>,
    pub spt: Mutex<Spt>,
    pub mmaps: Mutex<MmapTable>,
    pub files: Mutex<FdTable>,
}

impl Process {
    pub fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            pagedir: Mutex::new(PageDir::new()),
            spt: Mutex::new(Spt::new()),
            mmaps: Mutex::new(MmapTable::new()),
            files: Mutex::new(FdTable::new()),
        })
    }
}

/// Tear down a process's memory on exit.
///
/// Order matters: live `mmap` regions are unmapped first so dirty pages
/// reach their files while the reopened handles are still alive; then the
/// page map releases frames and swap slots; finally the page-directory
/// sweep returns the physical frames to the pool, mirroring the hardware
/// teardown that reclaims them outside the frame table.
pub fn exit_process(vm: &Vm, proc: &Arc<Process>) {
    mmap::unmap_all(vm, proc);
    page::destroy_spt(vm, proc);

    let frames = proc.pagedir.lock().destroy();
    for kpage in frames {
        vm.pool.free(kpage);
    }

    log::debug!("[PROC] pid {} memory released", proc.pid);
}
