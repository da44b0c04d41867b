//! File Layer
//!
//! Opaque file handles as the memory subsystem sees them. The VFS proper
//! lives behind the [`File`] trait; [`MemFile`] is the RAM-backed
//! implementation used during bring-up and by the test suites.
//!
//! Handles synchronize internally, so eviction may write a dirty mapped
//! page back while the frame-table lock is held without re-entering any
//! lock the evicting thread already owns.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// An open file, positionless. Offsets are explicit on every call so that
/// concurrent users (the fault path, eviction, syscalls) never fight over a
/// shared cursor.
pub trait File: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns bytes read; short
    /// reads happen at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write up to `buf.len()` bytes at `offset`. Files do not grow: the
    /// write is clipped at the current length. Returns bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    /// Current file length in bytes.
    fn length(&self) -> u64;

    /// Open an independent handle to the same underlying inode. `mmap`
    /// keeps such a handle so `close(fd)` cannot invalidate the mapping.
    fn reopen(&self) -> Option<Arc<dyn File>>;
}

/// RAM-backed file contents shared by every handle reopened from it.
struct Inode {
    data: Mutex<Vec<u8>>,
}

/// In-memory file.
pub struct MemFile {
    inode: Arc<Inode>,
}

impl MemFile {
    /// Create an empty file.
    pub fn new() -> Arc<dyn File> {
        Self::with_contents(Vec::new())
    }

    /// Create a file holding `data`.
    pub fn with_contents(data: Vec<u8>) -> Arc<dyn File> {
        Arc::new(MemFile {
            inode: Arc::new(Inode {
                data: Mutex::new(data),
            }),
        })
    }

    /// Create a file of `len` zero bytes.
    pub fn zeroed(len: usize) -> Arc<dyn File> {
        Self::with_contents(alloc::vec![0u8; len])
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.inode.data.lock();
        if offset >= data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.inode.data.lock();
        if offset >= data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }

    fn reopen(&self) -> Option<Arc<dyn File>> {
        Some(Arc::new(MemFile {
            inode: Arc::clone(&self.inode),
        }))
    }
}
