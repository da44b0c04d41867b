//! Loader Boundary
//!
//! What the executable loader asks of the memory subsystem: one page entry
//! per segment page, split into file bytes and zero fill, plus an eagerly
//! materialized first stack page.

use alloc::sync::Arc;

use super::page::Spt;
use super::{frame_bytes, page_offset, Vm, PAGE_SIZE, USER_TOP};
use crate::fs::File;
use crate::process::Process;

/// Record a segment of `read_bytes` file bytes followed by `zero_bytes` of
/// zero fill, starting at `upage` and file `offset`, one page entry per
/// page. Nothing is read yet; the fault path pulls each page in on first
/// touch. Returns false if any page of the segment is already present.
pub fn install_segment(
    spt: &mut Spt,
    file: Arc<dyn File>,
    offset: u64,
    upage: u64,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
) -> bool {
    assert_eq!(
        (read_bytes + zero_bytes) % PAGE_SIZE,
        0,
        "loader: segment span {} + {} not page-multiple",
        read_bytes,
        zero_bytes
    );
    assert_eq!(page_offset(upage), 0, "loader: unaligned upage {:#x}", upage);
    assert_eq!(
        offset % PAGE_SIZE as u64,
        0,
        "loader: unaligned file offset {:#x}",
        offset
    );

    let mut read_left = read_bytes;
    let mut zero_left = zero_bytes;
    let mut upage = upage;
    let mut offset = offset;

    while read_left > 0 || zero_left > 0 {
        let page_read = read_left.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;

        if !spt.install_filesys_entry(
            upage,
            Arc::clone(&file),
            offset,
            page_read as u32,
            page_zero as u32,
            writable,
        ) {
            return false;
        }

        read_left -= page_read;
        zero_left -= page_zero;
        upage += PAGE_SIZE as u64;
        offset += page_read as u64;
    }
    true
}

/// Eagerly materialize the initial stack page just below the top of user
/// space, zeroed and writable.
pub fn setup_stack(vm: &Vm, proc: &Arc<Process>) -> bool {
    let upage = USER_TOP - PAGE_SIZE as u64;
    let kpage = vm.allocate_frame(proc, upage);
    frame_bytes(kpage).fill(0);

    if !proc.pagedir.lock().set_page(upage, kpage, true) {
        vm.free_frame(kpage);
        return false;
    }
    if !proc.spt.lock().install_frame_entry(upage, kpage, true) {
        proc.pagedir.lock().clear_page(upage);
        vm.free_frame(kpage);
        return false;
    }

    vm.frames.unpin(kpage);
    true
}
