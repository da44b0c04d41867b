//! Syscall Surface
//!
//! The memory-facing system calls: mapping files, tearing mappings down,
//! and file I/O through user buffers. Argument fetch and dispatch live in
//! the trap layer; these entry points get decoded arguments plus the saved
//! user stack pointer (the stack-growth heuristic needs it).
//!
//! User-induced failures return -1 and never take the kernel down.

use alloc::sync::Arc;

use crate::memory::mmap::{self, MapId};
use crate::memory::{fault, frame_bytes, page_offset, page_round_down, Vm, PAGE_SIZE};
use crate::process::{Process, FD_STDIN, FD_STDOUT};

/// Map the file open on `fd` at page-aligned `addr`. Returns the positive
/// region id, or -1 on any invalid argument: a console descriptor, an
/// unknown descriptor, a null, unaligned or overlapping address, an empty
/// file, or a failed reopen.
pub fn sys_mmap(proc: &Arc<Process>, fd: i32, addr: u64) -> i64 {
    if fd == FD_STDIN || fd == FD_STDOUT {
        return -1;
    }
    let Some(file) = proc.files.lock().get(fd) else {
        return -1;
    };
    // private handle: close(fd) must not invalidate the mapping
    let Some(handle) = file.reopen() else {
        return -1;
    };
    match mmap::map_file(proc, handle, addr) {
        Some(id) => id as i64,
        None => -1,
    }
}

/// Tear down the region `id` returned by a prior `mmap`. Unknown ids are
/// silently ignored.
pub fn sys_munmap(vm: &Vm, proc: &Arc<Process>, id: MapId) {
    mmap::unmap_region(vm, proc, id);
}

/// Read up to `len` bytes from `fd` into the user buffer at `uaddr`.
/// Returns bytes read, or -1 for a console or unknown descriptor or an
/// unwritable buffer. The buffer pages stay pinned across the file I/O so
/// eviction cannot pull them out from under it.
pub fn sys_read(vm: &Vm, proc: &Arc<Process>, fd: i32, uaddr: u64, len: usize, esp: u64) -> i64 {
    if fd == FD_STDIN || fd == FD_STDOUT {
        return -1;
    }
    let Some(file) = proc.files.lock().get(fd) else {
        return -1;
    };
    if len == 0 {
        return 0;
    }
    if !fault::pin_user_buffer(vm, proc, uaddr, len, esp) {
        return -1;
    }

    let pos = proc.files.lock().pos(fd).unwrap_or(0);
    let mut done = 0usize;
    let mut failed = false;

    while done < len {
        let addr = uaddr + done as u64;
        let upage = page_round_down(addr);
        let off = page_offset(addr) as usize;
        let chunk = (PAGE_SIZE - off).min(len - done);

        let (kpage, writable) = {
            let pagedir = proc.pagedir.lock();
            (pagedir.get_page(upage), pagedir.is_writable(upage))
        };
        let kpage =
            kpage.unwrap_or_else(|| panic!("syscall: pinned page {:#x} not mapped", upage));
        if !writable {
            failed = true;
            break;
        }

        let n = file.read_at(&mut frame_bytes(kpage)[off..off + chunk], pos + done as u64);
        if n > 0 {
            // the store went through the kernel alias; record it by hand
            if let Some(spte) = proc.spt.lock().entry_mut(upage) {
                spte.dirty = true;
            }
            proc.pagedir.lock().set_accessed(upage, true);
        }
        done += n;
        if n < chunk {
            break;
        }
    }

    fault::unpin_user_buffer(vm, proc, uaddr, len);
    if failed {
        return -1;
    }
    proc.files.lock().advance(fd, done as u64);
    done as i64
}

/// Write `len` bytes from the user buffer at `uaddr` to `fd`. Returns
/// bytes written (short when the file runs out of room; files do not
/// grow), or -1 for a console or unknown descriptor or a bad buffer.
pub fn sys_write(vm: &Vm, proc: &Arc<Process>, fd: i32, uaddr: u64, len: usize, esp: u64) -> i64 {
    if fd == FD_STDIN || fd == FD_STDOUT {
        return -1;
    }
    let Some(file) = proc.files.lock().get(fd) else {
        return -1;
    };
    if len == 0 {
        return 0;
    }
    if !fault::pin_user_buffer(vm, proc, uaddr, len, esp) {
        return -1;
    }

    let pos = proc.files.lock().pos(fd).unwrap_or(0);
    let mut done = 0usize;

    while done < len {
        let addr = uaddr + done as u64;
        let upage = page_round_down(addr);
        let off = page_offset(addr) as usize;
        let chunk = (PAGE_SIZE - off).min(len - done);

        let kpage = proc
            .pagedir
            .lock()
            .get_page(upage)
            .unwrap_or_else(|| panic!("syscall: pinned page {:#x} not mapped", upage));
        proc.pagedir.lock().set_accessed(upage, true);

        let n = file.write_at(&frame_bytes(kpage)[off..off + chunk], pos + done as u64);
        done += n;
        if n < chunk {
            break;
        }
    }

    fault::unpin_user_buffer(vm, proc, uaddr, len);
    proc.files.lock().advance(fd, done as u64);
    done as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;
    use crate::fs::MemFile;
    use crate::memory::{VmConfig, USER_TOP};

    const ESP: u64 = 0xBFFF_FFF0;
    const BUF: u64 = 0xBFFF_0000;

    fn vm_with_frames(frames: usize) -> Vm {
        Vm::new(
            VmConfig { user_frames: frames },
            Arc::new(RamDisk::new(64 * 8)),
        )
    }

    #[test]
    fn mmap_rejects_console_and_unknown_fds() {
        let proc = Process::new(1);
        assert_eq!(sys_mmap(&proc, FD_STDIN, BUF), -1);
        assert_eq!(sys_mmap(&proc, FD_STDOUT, BUF), -1);
        assert_eq!(sys_mmap(&proc, 9, BUF), -1);
    }

    #[test]
    fn mmap_survives_closing_the_descriptor() {
        let vm = vm_with_frames(4);
        let proc = Process::new(1);
        let file = MemFile::with_contents(alloc::vec![0x42u8; PAGE_SIZE]);
        let fd = proc.files.lock().open(Arc::clone(&file));

        let id = sys_mmap(&proc, fd, 0x1000_0000);
        assert!(id > 0);
        assert!(proc.files.lock().close(fd));

        // mapping still pages in from the private handle
        let mut byte = [0u8; 1];
        assert!(fault::user_read(&vm, &proc, 0x1000_0000, &mut byte, ESP));
        assert_eq!(byte[0], 0x42);
        sys_munmap(&vm, &proc, id as i32);
    }

    #[test]
    fn read_lands_file_bytes_in_user_memory() {
        let vm = vm_with_frames(4);
        let proc = Process::new(1);
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let fd = proc.files.lock().open(MemFile::with_contents(data));

        assert_eq!(sys_read(&vm, &proc, fd, BUF, 100, BUF), 100);
        let mut out = [0u8; 100];
        assert!(fault::user_read(&vm, &proc, BUF, &mut out, BUF));
        assert_eq!(out[0], 0);
        assert_eq!(out[99], 99);

        // the cursor advanced; the next read hits end of file
        assert_eq!(sys_read(&vm, &proc, fd, BUF, 100, BUF), 0);
    }

    #[test]
    fn write_pulls_user_bytes_into_the_file() {
        let vm = vm_with_frames(4);
        let proc = Process::new(1);
        let file = MemFile::zeroed(64);
        let fd = proc.files.lock().open(Arc::clone(&file));

        assert!(fault::user_write(&vm, &proc, BUF, b"paging works", BUF));
        assert_eq!(sys_write(&vm, &proc, fd, BUF, 12, BUF), 12);

        let mut out = [0u8; 12];
        file.read_at(&mut out, 0);
        assert_eq!(&out, b"paging works");
    }

    #[test]
    fn read_into_read_only_buffer_fails() {
        let vm = vm_with_frames(4);
        let proc = Process::new(1);
        let seg = MemFile::zeroed(PAGE_SIZE);
        proc.spt
            .lock()
            .install_filesys_entry(0x0804_8000, seg, 0, PAGE_SIZE as u32, 0, false);
        let fd = proc.files.lock().open(MemFile::with_contents(alloc::vec![1u8; 16]));

        assert_eq!(sys_read(&vm, &proc, fd, 0x0804_8000, 16, ESP), -1);
    }

    #[test]
    fn buffers_past_user_space_fail() {
        let vm = vm_with_frames(4);
        let proc = Process::new(1);
        let fd = proc.files.lock().open(MemFile::zeroed(16));
        assert_eq!(sys_read(&vm, &proc, fd, USER_TOP - 4, 16, ESP), -1);
        assert_eq!(sys_read(&vm, &proc, fd, 0, 16, ESP), -1);
    }

    #[test]
    fn syscall_buffer_grows_the_stack() {
        let vm = vm_with_frames(4);
        let proc = Process::new(1);
        let fd = proc.files.lock().open(MemFile::with_contents(alloc::vec![9u8; 32]));

        // the buffer page was never touched; pinning installs it
        let esp = BUF;
        assert_eq!(sys_read(&vm, &proc, fd, BUF, 32, esp), 32);
        let mut out = [0u8; 32];
        assert!(fault::user_read(&vm, &proc, BUF, &mut out, esp));
        assert!(out.iter().all(|&b| b == 9));
    }
}
