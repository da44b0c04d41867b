//! Block Device Layer
//!
//! Sector-granular storage interface used by the swap manager. The kernel
//! proper drives real controllers behind this trait; the RAM-backed device
//! here is what boots carry for swap bring-up and what the test suites use.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Disk sector size
pub const SECTOR_SIZE: usize = 512;

/// A device addressable in `SECTOR_SIZE` units.
///
/// Implementations serialize their own I/O; callers may hold subsystem locks
/// across calls. Out-of-range LBAs are a kernel bug, not an I/O error.
pub trait BlockDevice: Send + Sync {
    /// Total number of sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read one sector at `lba` into `buf` (`buf.len() == SECTOR_SIZE`).
    fn read_sector(&self, lba: u64, buf: &mut [u8]);

    /// Write one sector at `lba` from `buf` (`buf.len() == SECTOR_SIZE`).
    fn write_sector(&self, lba: u64, buf: &[u8]);
}

/// RAM-backed block device.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sectors: u64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    /// Create a zeroed device with `sectors` sectors.
    pub fn new(sectors: u64) -> Self {
        log::info!(
            "[DISK] RamDisk: {} sectors ({} KB)",
            sectors,
            sectors as usize * SECTOR_SIZE / 1024
        );
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            sectors,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// (reads, writes) sector counts since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
        )
    }

    fn check_access(&self, lba: u64, len: usize) {
        if lba >= self.sectors {
            panic!("disk: sector {} past end of device ({})", lba, self.sectors);
        }
        if len != SECTOR_SIZE {
            panic!("disk: buffer is {} bytes, want {}", len, SECTOR_SIZE);
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, lba: u64, buf: &mut [u8]) {
        self.check_access(lba, buf.len());
        let data = self.data.lock();
        let off = lba as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[off..off + SECTOR_SIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, lba: u64, buf: &[u8]) {
        self.check_access(lba, buf.len());
        let mut data = self.data.lock();
        let off = lba as usize * SECTOR_SIZE;
        data[off..off + SECTOR_SIZE].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}
