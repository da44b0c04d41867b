//! TideOS kernel — virtual memory subsystem.
//!
//! Demand paging over a fixed physical budget: user pages live in frames,
//! on the file system, in swap, or nowhere yet, and move between those
//! states through page faults, clock eviction, and `mmap`/`munmap`.
//!
//! Hardware-facing collaborators (block device, file handles, the page
//! directory) sit behind traits and small software models, so the whole
//! subsystem runs and is tested hosted; the trap layer and drivers plug in
//! underneath on real metal.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod disk;
pub mod fs;
pub mod memory;
pub mod process;
pub mod syscall;
