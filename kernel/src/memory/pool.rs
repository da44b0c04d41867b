//! User Frame Pool
//!
//! Fixed-budget allocator for physical user frames. Tracks occupancy with a
//! word bitmap: each bit is one 4 KB frame, set = allocated. The pool owns a
//! page-aligned arena; a frame is named by the kernel virtual address of its
//! first byte (`kpage`).

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::PAGE_SIZE;

struct PoolInner {
    /// Arena base address, `PAGE_SIZE`-aligned.
    base: u64,
    /// Bit set = frame allocated.
    bitmap: Vec<u64>,
    total_frames: usize,
    /// Index of the word that satisfied the last allocation.
    next_hint: usize,
}

/// Fixed pool of user frames.
pub struct UserPool {
    inner: Mutex<PoolInner>,
    used: AtomicU64,
}

impl UserPool {
    /// Reserve an arena of `frames` user frames.
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "pool: zero-frame pool");

        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE)
            .expect("pool: bad arena layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "pool: arena allocation failed");

        log::info!(
            "[POOL] {} user frames ({} KB) at {:#x}",
            frames,
            frames * PAGE_SIZE / 1024,
            base as u64
        );

        let words = (frames + 63) / 64;
        Self {
            inner: Mutex::new(PoolInner {
                base: base as u64,
                bitmap: vec![0u64; words],
                total_frames: frames,
                next_hint: 0,
            }),
            used: AtomicU64::new(0),
        }
    }

    /// Allocate one frame, or `None` when the pool is exhausted (the caller
    /// evicts and retries).
    pub fn alloc(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        let words = inner.bitmap.len();

        for offset in 0..words {
            let idx = (inner.next_hint + offset) % words;
            let word = inner.bitmap[idx];
            if word == u64::MAX {
                continue;
            }

            let bit = (!word).trailing_zeros() as usize;
            let frame_index = idx * 64 + bit;
            if frame_index >= inner.total_frames {
                continue;
            }

            inner.bitmap[idx] |= 1u64 << bit;
            inner.next_hint = idx;
            self.used.fetch_add(1, Ordering::Relaxed);
            return Some(inner.base + (frame_index * PAGE_SIZE) as u64);
        }

        None
    }

    /// Return `kpage` to the pool. Freeing a frame that is not allocated is
    /// a kernel bug.
    pub fn free(&self, kpage: u64) {
        let mut inner = self.inner.lock();
        let frame_index = Self::index_of(&inner, kpage);
        let word = frame_index / 64;
        let bit = frame_index % 64;

        if inner.bitmap[word] & (1u64 << bit) == 0 {
            panic!("pool: double free of frame {:#x}", kpage);
        }
        inner.bitmap[word] &= !(1u64 << bit);
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    /// Whether `kpage` names a frame inside this pool's arena.
    pub fn contains(&self, kpage: u64) -> bool {
        let inner = self.inner.lock();
        kpage >= inner.base
            && kpage < inner.base + (inner.total_frames * PAGE_SIZE) as u64
            && (kpage - inner.base) % PAGE_SIZE as u64 == 0
    }

    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used.load(Ordering::Relaxed) as usize
    }

    pub fn free_frames(&self) -> usize {
        self.total_frames() - self.used_frames()
    }

    fn index_of(inner: &PoolInner, kpage: u64) -> usize {
        if kpage < inner.base || (kpage - inner.base) % PAGE_SIZE as u64 != 0 {
            panic!("pool: {:#x} is not a pool frame", kpage);
        }
        let index = ((kpage - inner.base) / PAGE_SIZE as u64) as usize;
        if index >= inner.total_frames {
            panic!("pool: {:#x} is past the arena", kpage);
        }
        index
    }
}

impl Drop for UserPool {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        let layout = Layout::from_size_align(inner.total_frames * PAGE_SIZE, PAGE_SIZE)
            .expect("pool: bad arena layout");
        unsafe { dealloc(inner.base as *mut u8, layout) };
    }
}
