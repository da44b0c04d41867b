//! Page Fault Resolution
//!
//! Entry points the trap layer and the syscall layer call into: resolving a
//! user page fault (demand load or stack growth), pinning user buffers for
//! syscall I/O, and copying between kernel and user memory.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::page::{self, PageLocation};
use super::{
    frame_bytes, is_user_vaddr, page_offset, page_round_down, Vm, MAX_STACK, PAGE_SIZE,
    STACK_SLACK, USER_TOP,
};
use crate::process::Process;

/// What the trap layer does after a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Translation installed; resume user code.
    Resolved,
    /// Unresolvable; terminate the process with exit status -1.
    Kill,
}

/// A user access at `addr` with stack pointer `esp` that misses the page
/// map is stack growth when it lands at most [`STACK_SLACK`] bytes below
/// `esp` and within [`MAX_STACK`] of the top of user space. (x86 `push`
/// touches 4 bytes below `esp`; `pusha` 32.)
fn is_stack_growth(addr: u64, esp: u64) -> bool {
    addr >= esp.saturating_sub(STACK_SLACK) && addr >= USER_TOP - MAX_STACK && addr < USER_TOP
}

/// Resolve a user page fault at `fault_addr`. `esp` is the user stack
/// pointer saved at trap entry.
pub fn handle_page_fault(vm: &Vm, proc: &Arc<Process>, fault_addr: u64, esp: u64) -> FaultOutcome {
    vm.counters.faults.fetch_add(1, Ordering::Relaxed);

    if !is_user_vaddr(fault_addr) {
        return FaultOutcome::Kill;
    }
    let upage = page_round_down(fault_addr);

    if page::load_page(vm, proc, upage, false) {
        return FaultOutcome::Resolved;
    }

    if is_stack_growth(fault_addr, esp) && proc.spt.lock().install_allzero_entry(upage) {
        vm.counters.stack_growths.fetch_add(1, Ordering::Relaxed);
        if page::load_page(vm, proc, upage, false) {
            return FaultOutcome::Resolved;
        }
    }

    log::debug!(
        "[FAULT] pid {} unresolvable fault at {:#x} (esp {:#x})",
        proc.pid,
        fault_addr,
        esp
    );
    FaultOutcome::Kill
}

/// Pin every page of the user buffer `[uaddr, uaddr + len)`, materializing
/// pages (including fresh stack pages) as needed. On success every page is
/// resident and pinned until [`unpin_user_buffer`]. On failure nothing is
/// left pinned and the caller terminates the process or fails the syscall.
pub fn pin_user_buffer(vm: &Vm, proc: &Arc<Process>, uaddr: u64, len: usize, esp: u64) -> bool {
    if len == 0 {
        return true;
    }
    let Some(end) = uaddr.checked_add(len as u64) else {
        return false;
    };
    if uaddr == 0 || !is_user_vaddr(end - 1) {
        return false;
    }

    let first = page_round_down(uaddr);
    let last = page_round_down(end - 1);

    let mut upage = first;
    loop {
        if !pin_one(vm, proc, upage, uaddr, esp) {
            let mut rollback = first;
            while rollback < upage {
                page::unpin_page(vm, proc, rollback);
                rollback += PAGE_SIZE as u64;
            }
            return false;
        }
        if upage == last {
            return true;
        }
        upage += PAGE_SIZE as u64;
    }
}

fn pin_one(vm: &Vm, proc: &Arc<Process>, upage: u64, uaddr: u64, esp: u64) -> bool {
    if !proc.spt.lock().has_entry(upage) {
        // the touched address inside this page, for the growth heuristic
        let probe = upage.max(uaddr);
        if !is_stack_growth(probe, esp) {
            return false;
        }
        if !proc.spt.lock().install_allzero_entry(upage) {
            return false;
        }
        vm.counters.stack_growths.fetch_add(1, Ordering::Relaxed);
    }
    page::load_page(vm, proc, upage, true)
}

/// Unpin a buffer previously pinned with [`pin_user_buffer`].
pub fn unpin_user_buffer(vm: &Vm, proc: &Arc<Process>, uaddr: u64, len: usize) {
    if len == 0 {
        return;
    }
    let first = page_round_down(uaddr);
    let last = page_round_down(uaddr + len as u64 - 1);
    let mut upage = first;
    while upage <= last {
        page::unpin_page(vm, proc, upage);
        upage += PAGE_SIZE as u64;
    }
}

/// Copy `buf` into user memory at `uaddr`, as a syscall storing into a user
/// buffer does. Pages are pinned across the copy; stores go through the
/// kernel alias, so the sticky dirty bit on each page entry is set by hand
/// (the user-side page directory never sees these stores).
pub fn copy_to_user(vm: &Vm, proc: &Arc<Process>, uaddr: u64, buf: &[u8], esp: u64) -> bool {
    if buf.is_empty() {
        return true;
    }
    if !pin_user_buffer(vm, proc, uaddr, buf.len(), esp) {
        return false;
    }

    let mut done = 0;
    let mut ok = true;
    while done < buf.len() {
        let addr = uaddr + done as u64;
        let upage = page_round_down(addr);
        let off = page_offset(addr) as usize;
        let chunk = (PAGE_SIZE - off).min(buf.len() - done);

        let (kpage, writable) = {
            let pagedir = proc.pagedir.lock();
            (pagedir.get_page(upage), pagedir.is_writable(upage))
        };
        let kpage = kpage
            .unwrap_or_else(|| panic!("fault: pinned page {:#x} not mapped", upage));
        if !writable {
            ok = false;
            break;
        }

        frame_bytes(kpage)[off..off + chunk].copy_from_slice(&buf[done..done + chunk]);
        {
            let mut spt = proc.spt.lock();
            if let Some(spte) = spt.entry_mut(upage) {
                spte.dirty = true;
            }
        }
        proc.pagedir.lock().set_accessed(upage, true);
        done += chunk;
    }

    unpin_user_buffer(vm, proc, uaddr, buf.len());
    ok
}

/// Copy user memory at `uaddr` into `buf`, pinning pages across the copy.
pub fn copy_from_user(vm: &Vm, proc: &Arc<Process>, uaddr: u64, buf: &mut [u8], esp: u64) -> bool {
    if buf.is_empty() {
        return true;
    }
    if !pin_user_buffer(vm, proc, uaddr, buf.len(), esp) {
        return false;
    }

    let mut done = 0;
    while done < buf.len() {
        let addr = uaddr + done as u64;
        let upage = page_round_down(addr);
        let off = page_offset(addr) as usize;
        let chunk = (PAGE_SIZE - off).min(buf.len() - done);

        let kpage = proc
            .pagedir
            .lock()
            .get_page(upage)
            .unwrap_or_else(|| panic!("fault: pinned page {:#x} not mapped", upage));
        buf[done..done + chunk].copy_from_slice(&frame_bytes(kpage)[off..off + chunk]);
        proc.pagedir.lock().set_accessed(upage, true);
        done += chunk;
    }

    unpin_user_buffer(vm, proc, uaddr, buf.len());
    true
}

/// A user-mode store to `[uaddr, uaddr + data.len())`: translate through
/// the page directory, fault on misses, and let the MMU bookkeeping
/// (accessed + dirty bits) happen as hardware would do it. Returns false
/// where the process would be terminated (bad address, read-only page).
pub fn user_write(vm: &Vm, proc: &Arc<Process>, uaddr: u64, data: &[u8], esp: u64) -> bool {
    let mut done = 0;
    while done < data.len() {
        let addr = uaddr + done as u64;
        if !is_user_vaddr(addr) {
            return false;
        }
        let upage = page_round_down(addr);
        let off = page_offset(addr) as usize;
        let chunk = (PAGE_SIZE - off).min(data.len() - done);

        let translation = {
            let pagedir = proc.pagedir.lock();
            pagedir.get_page(upage).map(|k| (k, pagedir.is_writable(upage)))
        };
        match translation {
            Some((_, false)) => return false,
            Some((kpage, true)) => {
                frame_bytes(kpage)[off..off + chunk].copy_from_slice(&data[done..done + chunk]);
                let mut pagedir = proc.pagedir.lock();
                pagedir.set_accessed(upage, true);
                pagedir.set_dirty(upage, true);
                done += chunk;
            }
            None => {
                if handle_page_fault(vm, proc, addr, esp) == FaultOutcome::Kill {
                    return false;
                }
            }
        }
    }
    true
}

/// A user-mode load from `[uaddr, uaddr + buf.len())`, the read-side twin
/// of [`user_write`].
pub fn user_read(vm: &Vm, proc: &Arc<Process>, uaddr: u64, buf: &mut [u8], esp: u64) -> bool {
    let mut done = 0;
    while done < buf.len() {
        let addr = uaddr + done as u64;
        if !is_user_vaddr(addr) {
            return false;
        }
        let upage = page_round_down(addr);
        let off = page_offset(addr) as usize;
        let chunk = (PAGE_SIZE - off).min(buf.len() - done);

        let translation = proc.pagedir.lock().get_page(upage);
        match translation {
            Some(kpage) => {
                buf[done..done + chunk].copy_from_slice(&frame_bytes(kpage)[off..off + chunk]);
                proc.pagedir.lock().set_accessed(upage, true);
                done += chunk;
            }
            None => {
                if handle_page_fault(vm, proc, addr, esp) == FaultOutcome::Kill {
                    return false;
                }
            }
        }
    }
    true
}

/// Consistency helper for audits: whether `upage` is resident per its page
/// entry.
pub fn is_resident(proc: &Arc<Process>, upage: u64) -> bool {
    matches!(
        proc.spt.lock().entry(upage).map(|s| &s.location),
        Some(PageLocation::Frame { .. })
    )
}
