//! The memory management subsystem: physical frame pools, virtual address
//! spaces, the page-table driver, the page allocator, and the heap allocator.
//!
//! Call `mem_init` once, early, before anything else in the kernel touches
//! memory beyond what the boot loader already mapped.

use core::ptr;
use core::slice;

use spin::Mutex;

use crate::config;

pub mod bitmap;
pub mod heap;
pub mod list;
pub mod paging;
pub mod page_alloc;
pub mod phys_pool;
pub mod virt_space;

pub use heap::KernelAllocator;
pub use page_alloc::addr_v2p;

use bitmap::Bitmap;
use phys_pool::PhysPool;
use virt_space::VirtAddrSpace;

/// Guards against calling any allocator entry point before `mem_init` has run.
static INITIALIZED: Mutex<bool> = Mutex::new(false);

/// Read the total installed RAM, in bytes, from the fixed low-memory word the
/// boot loader populated. Only valid before paging has been rearranged away
/// from the boot loader's identity mapping of low memory.
unsafe fn total_mem_bytes() -> u32 {
    ptr::read(config::TOTAL_MEM_ADDR as *const u32)
}

/// Carve a bitmap's backing storage out of the fixed region starting at
/// `config::BITMAP_BASE`. That region is covered by the boot loader's initial
/// page tables (it sits below `KERNEL_HEAP_START`), so it is safe to treat as
/// ordinary mapped memory without going through `paging::map`.
unsafe fn bitmap_at(offset: u32, bit_len: usize) -> Bitmap {
    let byte_len = (bit_len + 7) / 8;
    let addr = config::BITMAP_BASE + offset;
    let slice = slice::from_raw_parts_mut(addr as *mut u8, byte_len);
    ptr::write_bytes(slice.as_mut_ptr(), 0, byte_len);
    Bitmap::new(slice, bit_len)
}

/// Initialize the memory subsystem: split physical memory between the kernel
/// and user pools, lay out their occupancy bitmaps, and populate the kernel's
/// slab size-class descriptors. Must be called exactly once, before any other
/// function in this module.
pub fn mem_init() {
    let total_mem = unsafe { total_mem_bytes() };
    printk!("\tmem_init: {} bytes of RAM reported by the boot loader\n", total_mem);

    let usable = total_mem - config::KERNEL_POOL_PHYS_START;
    let total_frames = (usable / config::PAGE_SIZE) as usize;
    let kernel_frames = total_frames / 2 + total_frames % 2;
    let user_frames = total_frames / 2;

    let kernel_size = kernel_frames as u32 * config::PAGE_SIZE;
    let user_size = user_frames as u32 * config::PAGE_SIZE;

    let kernel_phys_start = config::KERNEL_POOL_PHYS_START;
    let user_phys_start = kernel_phys_start + kernel_size;

    // The kernel virtual bitmap tracks reservations one-for-one against the
    // kernel physical pool, the same way `kernel_vaddr.vaddr_bitmap` mirrors
    // `kernel_pool.pool_bitmap`'s length in the original design — not the
    // full address range up to the recursive-mapping window, which would be
    // orders of magnitude too large for the fixed bitmap region below.
    let kernel_vspace_pages = kernel_frames;

    let kernel_phys_bitmap = unsafe { bitmap_at(0, kernel_frames) };
    let kbm_bytes = (kernel_frames + 7) / 8;
    let user_phys_bitmap = unsafe { bitmap_at(kbm_bytes as u32, user_frames) };
    let ubm_bytes = (user_frames + 7) / 8;
    let kvbm_bytes = (kernel_vspace_pages + 7) / 8;
    assert!(
        (kbm_bytes + ubm_bytes + kvbm_bytes) as u32 <= config::BITMAP_REGION_SIZE,
        "bitmaps ({} bytes) overflow the fixed {}-byte bitmap region for {} bytes of RAM",
        kbm_bytes + ubm_bytes + kvbm_bytes,
        config::BITMAP_REGION_SIZE,
        total_mem
    );
    let kernel_virt_bitmap =
        unsafe { bitmap_at((kbm_bytes + ubm_bytes) as u32, kernel_vspace_pages) };
    // The fourth slot of this region is reserved for a per-task user virtual
    // bitmap in the fixed layout, but user virtual spaces actually live in
    // each task's control block (see `crate::task::Task`), so nothing is
    // placed here.

    *phys_pool::KERNEL_POOL.lock() = Some(PhysPool::new(kernel_phys_start, kernel_size, kernel_phys_bitmap));
    *phys_pool::USER_POOL.lock() = Some(PhysPool::new(user_phys_start, user_size, user_phys_bitmap));
    *virt_space::KERNEL_VSPACE.lock() =
        Some(VirtAddrSpace::new(config::KERNEL_HEAP_START, kernel_virt_bitmap));
    *heap::KERNEL_BLOCK_DESCS.lock() = Some(heap::block_desc_init());

    *INITIALIZED.lock() = true;

    printk!(
        "\tkernel_pool: start=0x{:x} size=0x{:x} ({} frames)\n",
        kernel_phys_start,
        kernel_size,
        kernel_frames
    );
    printk!(
        "\tuser_pool:   start=0x{:x} size=0x{:x} ({} frames)\n",
        user_phys_start,
        user_size,
        user_frames
    );
}

/// `get_a_page` under its implementation name (`page_alloc::alloc_page_at`).
pub use page_alloc::alloc_page_at as get_a_page;
/// `get_a_page_without_opvaddrbitmap` under its implementation name.
pub use page_alloc::alloc_page_at_no_bitmap as get_a_page_without_opvaddrbitmap;
pub use page_alloc::{get_kernel_pages, get_user_pages, mfree_page};
pub use heap::{sys_free, sys_malloc};

/// Clear a physical frame's occupancy bit without touching any mapping, for
/// teardown paths that have already dropped the PTE themselves.
pub fn free_a_phy_page(paddr: u32) {
    phys_pool::pfree(paddr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_memory_split_matches_scenario_s1() {
        // 32 MiB total, as in S1.
        let total_mem: u32 = 0x0200_0000;
        let usable = total_mem - config::KERNEL_POOL_PHYS_START;
        let total_frames = usable / config::PAGE_SIZE;
        let kernel_frames = total_frames / 2 + total_frames % 2;
        let user_frames = total_frames / 2;

        let kernel_size = kernel_frames * config::PAGE_SIZE;
        let user_size = user_frames * config::PAGE_SIZE;
        let user_phys_start = config::KERNEL_POOL_PHYS_START + kernel_size;

        assert_eq!(config::KERNEL_POOL_PHYS_START, 0x0020_0000);
        assert_eq!(kernel_size, 0x00F0_0000);
        assert_eq!(user_phys_start, 0x0110_0000);
        assert_eq!(user_size, 0x00F0_0000);
    }

    #[test]
    fn bitmaps_fit_in_the_fixed_region_for_scenario_s1() {
        // 32 MiB total, as in S1. The kernel virtual bitmap must mirror
        // kernel_frames, not the full address range up to the recursive
        // mapping window, or this assertion (and mem_init's own) would fail.
        let total_mem: u32 = 0x0200_0000;
        let usable = total_mem - config::KERNEL_POOL_PHYS_START;
        let total_frames = (usable / config::PAGE_SIZE) as usize;
        let kernel_frames = total_frames / 2 + total_frames % 2;
        let user_frames = total_frames / 2;
        let kernel_vspace_pages = kernel_frames;

        let kbm_bytes = (kernel_frames + 7) / 8;
        let ubm_bytes = (user_frames + 7) / 8;
        let kvbm_bytes = (kernel_vspace_pages + 7) / 8;

        assert!((kbm_bytes + ubm_bytes + kvbm_bytes) as u32 <= config::BITMAP_REGION_SIZE);
    }
}
