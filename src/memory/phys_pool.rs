//! Physical frame pools: one contiguous physical range per domain, each with its
//! own occupancy bitmap and sleep-capable mutex.

use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::task::Domain;

use super::bitmap::Bitmap;

/// One allocator domain's physical memory: a contiguous range plus its
/// occupancy bitmap. The mutex guarding this (see `KERNEL_POOL`/`USER_POOL`)
/// also covers any page-table writes performed on the caller's behalf, so that
/// bitmap state and live PTEs never drift apart.
pub struct PhysPool {
    pub phys_start: u32,
    pub size: u32,
    bitmap: Bitmap,
}

impl PhysPool {
    pub fn new(phys_start: u32, size: u32, bitmap: Bitmap) -> Self {
        assert_eq!(phys_start % PAGE_SIZE, 0);
        assert_eq!(size % PAGE_SIZE, 0);
        PhysPool {
            phys_start,
            size,
            bitmap,
        }
    }

    pub fn frame_count(&self) -> usize {
        (self.size / PAGE_SIZE) as usize
    }

    fn contains(&self, frame_addr: u32) -> bool {
        frame_addr >= self.phys_start && frame_addr < self.phys_start + self.size
    }

    /// Allocate one frame from this pool, returning its physical address.
    /// `None` if the pool is full.
    pub fn palloc(&mut self) -> Option<u32> {
        let idx = self.bitmap.scan_one()?;
        self.bitmap.set(idx);
        Some(self.phys_start + idx as u32 * PAGE_SIZE)
    }

    /// Clear the occupancy bit for `frame_addr`. Does not touch page tables;
    /// callers that have already unmapped the frame call this directly, and
    /// `pfree` (below) uses it once it has picked the owning pool.
    pub fn free_bit(&mut self, frame_addr: u32) {
        assert!(
            self.contains(frame_addr),
            "frame 0x{:x} is not owned by this pool",
            frame_addr
        );
        let idx = (frame_addr - self.phys_start) / PAGE_SIZE;
        self.bitmap.clear(idx as usize);
    }

    pub fn is_set(&self, frame_addr: u32) -> bool {
        assert!(self.contains(frame_addr));
        let idx = (frame_addr - self.phys_start) / PAGE_SIZE;
        self.bitmap.get(idx as usize)
    }
}

/// The kernel's physical pool: lower half of memory above the boot-reserved
/// region. `None` until `mem_init` runs.
pub static KERNEL_POOL: Mutex<Option<PhysPool>> = Mutex::new(None);

/// The user physical pool: upper half of memory.
pub static USER_POOL: Mutex<Option<PhysPool>> = Mutex::new(None);

/// The mutex that owns a domain's physical pool.
pub fn pool_for(domain: Domain) -> &'static Mutex<Option<PhysPool>> {
    match domain {
        Domain::Kernel => &KERNEL_POOL,
        Domain::User => &USER_POOL,
    }
}

/// Free a physical frame's occupancy bit, picking the owning pool by comparing
/// the address against the user pool's start (frames below it are the kernel's).
/// Does not touch page tables — see `super::page_alloc::free_pages` for the
/// version that also tears down the mapping.
pub fn pfree(frame_addr: u32) {
    let mut user_guard = USER_POOL.lock();
    let user_start = user_guard.as_ref().expect("pools not initialized").phys_start;

    if frame_addr >= user_start {
        user_guard
            .as_mut()
            .unwrap()
            .free_bit(frame_addr);
    } else {
        drop(user_guard);
        KERNEL_POOL
            .lock()
            .as_mut()
            .expect("pools not initialized")
            .free_bit(frame_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(phys_start: u32, frames: usize) -> PhysPool {
        let bytes = vec![0u8; (frames + 7) / 8].into_boxed_slice();
        let bitmap = Bitmap::new(Box::leak(bytes), frames);
        PhysPool::new(phys_start, frames as u32 * PAGE_SIZE, bitmap)
    }

    #[test]
    fn palloc_returns_increasing_frames_and_sets_bits() {
        let mut p = pool(0x0020_0000, 4);
        let f0 = p.palloc().unwrap();
        let f1 = p.palloc().unwrap();
        assert_eq!(f0, 0x0020_0000);
        assert_eq!(f1, 0x0020_0000 + PAGE_SIZE);
        assert!(p.is_set(f0));
        assert!(p.is_set(f1));
    }

    #[test]
    fn palloc_fails_when_full() {
        let mut p = pool(0x0020_0000, 2);
        p.palloc().unwrap();
        p.palloc().unwrap();
        assert_eq!(p.palloc(), None);
    }

    #[test]
    fn free_bit_round_trips() {
        let mut p = pool(0x0020_0000, 2);
        let f = p.palloc().unwrap();
        p.free_bit(f);
        assert!(!p.is_set(f));
        assert_eq!(p.palloc(), Some(f));
    }
}
