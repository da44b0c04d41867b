//! End-to-end `mmap`/`munmap` through the syscall surface: overlap
//! validation, dirty write-back, tail-page handling, and eviction of
//! mapped pages.

use std::sync::Arc;

use tideos_kernel::disk::RamDisk;
use tideos_kernel::fs::MemFile;
use tideos_kernel::memory::swap::SECTORS_PER_PAGE;
use tideos_kernel::memory::{fault, Vm, VmConfig, PAGE_SIZE};
use tideos_kernel::process::{exit_process, Process};
use tideos_kernel::syscall::{sys_mmap, sys_munmap};

const ESP: u64 = 0xBFFF_FFF0;
const BASE: u64 = 0x1000_0000;

fn vm_with(frames: usize) -> Vm {
    Vm::new(
        VmConfig {
            user_frames: frames,
        },
        Arc::new(RamDisk::new((16 * SECTORS_PER_PAGE) as u64)),
    )
}

#[test]
fn written_pages_reach_the_file_after_munmap() {
    let vm = vm_with(4);
    let proc = Process::new(1);
    let file = MemFile::zeroed(2 * PAGE_SIZE);
    let fd = proc.files.lock().open(Arc::clone(&file));

    let id = sys_mmap(&proc, fd, BASE);
    assert!(id > 0);

    // page-aligned write into the second page
    let payload = b"written through the mapping";
    assert!(fault::user_write(
        &vm,
        &proc,
        BASE + PAGE_SIZE as u64,
        payload,
        ESP
    ));
    sys_munmap(&vm, &proc, id as i32);

    let mut out = vec![0u8; payload.len()];
    assert_eq!(file.read_at(&mut out, PAGE_SIZE as u64), payload.len());
    assert_eq!(&out, payload);
}

#[test]
fn overlapping_mapping_is_rejected_whole() {
    let vm = vm_with(4);
    let proc = Process::new(1);
    let six_kib = MemFile::zeroed(6 * 1024);
    let other = MemFile::zeroed(PAGE_SIZE);
    let fd1 = proc.files.lock().open(six_kib);
    let fd2 = proc.files.lock().open(other);

    assert_eq!(sys_mmap(&proc, fd1, BASE), 1);
    // overlaps the second page of the first region
    assert_eq!(sys_mmap(&proc, fd2, BASE + PAGE_SIZE as u64), -1);

    assert_eq!(proc.spt.lock().len(), 2);
    assert_eq!(proc.mmaps.lock().len(), 1);
    vm.check_consistency(&[proc]);
}

#[test]
fn single_byte_dirty_writeback() {
    let vm = vm_with(4);
    let proc = Process::new(1);
    let file = MemFile::zeroed(PAGE_SIZE);
    let fd = proc.files.lock().open(Arc::clone(&file));

    let id = sys_mmap(&proc, fd, BASE);
    assert!(id > 0);
    assert!(fault::user_write(&vm, &proc, BASE, &[0xAB], ESP));
    sys_munmap(&vm, &proc, id as i32);

    let mut byte = [0u8; 1];
    file.read_at(&mut byte, 0);
    assert_eq!(byte[0], 0xAB);
}

#[test]
fn tail_page_writes_back_only_the_file_bytes() {
    let vm = vm_with(4);
    let proc = Process::new(1);
    // 6 KiB: full page + 2 KiB tail
    let file = MemFile::with_contents(vec![0x11u8; 6 * 1024]);
    let fd = proc.files.lock().open(Arc::clone(&file));

    let id = sys_mmap(&proc, fd, BASE);
    assert!(id > 0);

    // dirty both pages, including bytes past the tail inside the mapping
    assert!(fault::user_write(&vm, &proc, BASE, &[0x22], ESP));
    assert!(fault::user_write(
        &vm,
        &proc,
        BASE + PAGE_SIZE as u64,
        &vec![0x33u8; PAGE_SIZE],
        ESP
    ));
    sys_munmap(&vm, &proc, id as i32);

    assert_eq!(file.length(), 6 * 1024);
    let mut head = [0u8; 1];
    file.read_at(&mut head, 0);
    assert_eq!(head[0], 0x22);
    let mut tail = vec![0u8; 2 * 1024];
    assert_eq!(
        file.read_at(&mut tail, PAGE_SIZE as u64),
        2 * 1024,
        "tail must stay 2 KiB"
    );
    assert!(tail.iter().all(|&b| b == 0x33));
}

#[test]
fn mapped_pages_evict_to_the_file_not_to_swap() {
    let vm = vm_with(1);
    let proc = Process::new(1);
    let file = MemFile::zeroed(PAGE_SIZE);
    let fd = proc.files.lock().open(Arc::clone(&file));

    let id = sys_mmap(&proc, fd, BASE);
    assert!(id > 0);
    assert!(fault::user_write(&vm, &proc, BASE, &[0x7E], ESP));

    // steal the only frame — the mapped page must go to its file
    proc.spt.lock().install_allzero_entry(0x2000_0000);
    assert!(fault::user_write(&vm, &proc, 0x2000_0000, &[1], ESP));

    assert_eq!(vm.swap.used_slots(), 0, "mapped pages never swap");
    let mut byte = [0u8; 1];
    file.read_at(&mut byte, 0);
    assert_eq!(byte[0], 0x7E, "mapped page written back on eviction");

    // reading it back steals the frame from the anonymous page, which swaps
    assert!(fault::user_read(&vm, &proc, BASE, &mut byte, ESP));
    assert_eq!(byte[0], 0x7E);
    assert_eq!(vm.swap.used_slots(), 1);
    sys_munmap(&vm, &proc, id as i32);
    vm.check_consistency(&[proc]);
}

#[test]
fn exit_with_live_mappings_flushes_them() {
    let vm = vm_with(4);
    let proc = Process::new(1);
    let file = MemFile::zeroed(PAGE_SIZE);
    let fd = proc.files.lock().open(Arc::clone(&file));

    assert!(sys_mmap(&proc, fd, BASE) > 0);
    assert!(fault::user_write(&vm, &proc, BASE, &[0xD4], ESP));

    // no munmap before exit; teardown must still write the page back
    exit_process(&vm, &proc);

    let mut byte = [0u8; 1];
    file.read_at(&mut byte, 0);
    assert_eq!(byte[0], 0xD4);
    assert_eq!(vm.stats().frames_used, 0);
    vm.check_consistency(&[]);
}

#[test]
fn region_ids_count_up_per_process() {
    let vm = vm_with(4);
    let proc = Process::new(1);
    let fd1 = proc.files.lock().open(MemFile::zeroed(PAGE_SIZE));
    let fd2 = proc.files.lock().open(MemFile::zeroed(PAGE_SIZE));

    assert_eq!(sys_mmap(&proc, fd1, BASE), 1);
    assert_eq!(sys_mmap(&proc, fd2, BASE + 0x10_0000), 2);
    sys_munmap(&vm, &proc, 1);
    // ids are not recycled
    let fd3 = proc.files.lock().open(MemFile::zeroed(PAGE_SIZE));
    assert_eq!(sys_mmap(&proc, fd3, BASE + 0x20_0000), 3);
}

#[test]
fn unmapping_twice_is_harmless() {
    let vm = vm_with(4);
    let proc = Process::new(1);
    let fd = proc.files.lock().open(MemFile::zeroed(PAGE_SIZE));
    let id = sys_mmap(&proc, fd, BASE);
    sys_munmap(&vm, &proc, id as i32);
    sys_munmap(&vm, &proc, id as i32);
    sys_munmap(&vm, &proc, 999);
    assert!(proc.spt.lock().is_empty());
}
