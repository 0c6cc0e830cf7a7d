//! The two-tier heap allocator: slab arenas for requests of 1024 bytes or
//! less, whole-page runs for anything larger.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr;

use spin::Mutex;

use crate::config::{self, DESC_COUNT, PAGE_SIZE};
use crate::interrupts::InterruptGuard;
use crate::task::{self, Domain};

use super::list::FreeList;
use super::page_alloc;
use super::phys_pool::{self, PhysPool};
use super::virt_space::VirtAddrSpace;

/// The power-of-two size classes, smallest first.
pub const SIZE_CLASSES: [usize; DESC_COUNT] = [16, 32, 64, 128, 256, 512, 1024];

/// Header of a slab-carrier or large-allocation page, always at the base of a
/// page-aligned region.
#[repr(C)]
struct Arena {
    /// Owning descriptor, or null for a large arena.
    desc: *mut BlockDesc,
    /// `true` for a multi-page raw allocation, `false` for a slab of blocks.
    large: bool,
    /// Pages occupied (large arenas) or free blocks remaining (slab arenas).
    cnt: u32,
}

/// Per-size-class bookkeeping: geometry plus the intrusive free-list of every
/// currently-free block of this class across all arenas in one domain.
pub struct BlockDesc {
    block_size: usize,
    blocks_per_arena: usize,
    free_list: FreeList,
}

impl BlockDesc {
    const fn new(block_size: usize) -> Self {
        BlockDesc {
            block_size,
            blocks_per_arena: (PAGE_SIZE as usize - size_of::<Arena>()) / block_size,
            free_list: FreeList::new(),
        }
    }
}

/// Populate the kernel's (or a fresh user task's) seven size-class descriptors.
pub fn block_desc_init() -> [BlockDesc; DESC_COUNT] {
    [
        BlockDesc::new(SIZE_CLASSES[0]),
        BlockDesc::new(SIZE_CLASSES[1]),
        BlockDesc::new(SIZE_CLASSES[2]),
        BlockDesc::new(SIZE_CLASSES[3]),
        BlockDesc::new(SIZE_CLASSES[4]),
        BlockDesc::new(SIZE_CLASSES[5]),
        BlockDesc::new(SIZE_CLASSES[6]),
    ]
}

/// The kernel's process-wide descriptor set. `None` until `mem_init` runs.
pub static KERNEL_BLOCK_DESCS: Mutex<Option<[BlockDesc; DESC_COUNT]>> = Mutex::new(None);

/// Run `f` against both the block-descriptor set and the virtual-address
/// space for `domain`, taken together under whatever single lock `domain`
/// uses to protect them.
///
/// For `Domain::User` both live in the same `Task`, so this takes exactly one
/// `task::with_current` borrow and splits it into its two fields; it must
/// never be implemented as two separate locks (one for the descriptors, one
/// for the vspace via `page_alloc::vspace_op`), since that would be two
/// nested acquisitions of the same non-reentrant `CURRENT` mutex from one
/// thread. For `Domain::Kernel` the descriptors and the vspace are two
/// distinct statics, so locking both in sequence is safe.
fn with_task_state<R>(
    domain: Domain,
    f: impl FnOnce(&mut [BlockDesc; DESC_COUNT], &mut VirtAddrSpace) -> R,
) -> R {
    match domain {
        Domain::Kernel => {
            let mut descs_guard = KERNEL_BLOCK_DESCS.lock();
            let descs = descs_guard.as_mut().expect("pools not initialized");
            let mut vspace_guard = super::virt_space::KERNEL_VSPACE.lock();
            let vspace = vspace_guard.as_mut().expect("pools not initialized");
            f(descs, vspace)
        }
        Domain::User => task::with_current(|t| f(&mut t.block_descs, &mut t.vspace))
            .expect("user domain operation with no current task"),
    }
}

fn arena2block(arena_addr: u32, block_size: usize, idx: usize) -> u32 {
    arena_addr + size_of::<Arena>() as u32 + (idx * block_size) as u32
}

fn block2arena(block_addr: u32) -> u32 {
    block_addr & !(PAGE_SIZE - 1)
}

/// Take one fresh page as a new slab arena for `desc` and link every one of
/// its blocks onto the descriptor's free-list. The list population runs with
/// interrupts disabled as one atomic group, because an interrupt handler may
/// itself allocate from the same size class.
///
/// Caller must already hold both `pool`'s domain mutex and `vspace`'s lock —
/// see `with_task_state`.
fn populate_new_arena(vspace: &mut VirtAddrSpace, pool: &mut PhysPool, desc: &mut BlockDesc) -> Option<()> {
    let base = page_alloc::alloc_pages(vspace, pool, 1)?;
    unsafe {
        ptr::write_bytes(base as *mut u8, 0, PAGE_SIZE as usize);
    }

    let arena = base as *mut Arena;
    unsafe {
        (*arena).desc = desc as *mut BlockDesc;
        (*arena).large = false;
        (*arena).cnt = desc.blocks_per_arena as u32;
    }

    {
        let _guard = InterruptGuard::new();
        for i in 0..desc.blocks_per_arena {
            let block = arena2block(base, desc.block_size, i);
            unsafe {
                desc.free_list.push(block as *mut u8);
            }
        }
    }

    Some(())
}

fn sys_malloc_large(domain: Domain, pool: &mut PhysPool, size: usize) -> Option<*mut u8> {
    let pages = (size + size_of::<Arena>() + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;
    let base = page_alloc::vspace_op(domain, |vs| page_alloc::alloc_pages(vs, pool, pages))?;
    unsafe {
        ptr::write_bytes(base as *mut u8, 0, pages * PAGE_SIZE as usize);
    }

    let arena = base as *mut Arena;
    unsafe {
        (*arena).desc = ptr::null_mut();
        (*arena).large = true;
        (*arena).cnt = pages as u32;
    }

    Some(unsafe { (base as *mut u8).add(size_of::<Arena>()) })
}

fn sys_malloc_slab(domain: Domain, pool: &mut PhysPool, size: usize) -> Option<*mut u8> {
    let class = SIZE_CLASSES.iter().position(|&s| s >= size)?;

    let result = with_task_state(domain, |descs, vspace| -> Option<*mut u8> {
        let desc = &mut descs[class];
        if desc.free_list.is_empty() {
            populate_new_arena(vspace, pool, desc)?;
        }
        let block = unsafe { desc.free_list.pop() }?;
        let arena = block2arena(block as u32) as *mut Arena;
        unsafe {
            (*arena).cnt -= 1;
        }
        Some(block)
    })?;

    unsafe {
        ptr::write_bytes(result, 0, SIZE_CLASSES[class]);
    }
    Some(result)
}

/// Allocate `size` bytes for the current task's domain.
///
/// Dispatches on size: zero and out-of-pool-range requests fail, requests
/// above 1024 bytes take the whole-page "large" path, everything else goes
/// through the slab path at the smallest size class that fits.
pub fn sys_malloc(size: usize) -> Option<*mut u8> {
    if size == 0 {
        return None;
    }

    let domain = task::domain();
    let mut pool_guard = phys_pool::pool_for(domain).lock();
    let pool = pool_guard.as_mut().expect("pools not initialized");

    if size as u32 >= pool.size {
        return None;
    }

    if size > config::MAX_SLAB_SIZE {
        sys_malloc_large(domain, pool, size)
    } else {
        sys_malloc_slab(domain, pool, size)
    }
}

/// Free a pointer previously returned by `sys_malloc`.
///
/// # Panics
/// If `ptr` is null, or if a slab block is found to belong to a different
/// descriptor's free-list than its own arena claims (`FreeList::remove`'s
/// defence against cross-arena corruption).
pub fn sys_free(ptr: *mut u8) {
    assert!(!ptr.is_null(), "sys_free called with a null pointer");

    let domain = task::domain();
    let mut pool_guard = phys_pool::pool_for(domain).lock();
    let pool = pool_guard.as_mut().expect("pools not initialized");

    let arena_addr = block2arena(ptr as u32);
    let arena = arena_addr as *mut Arena;
    let large = unsafe { (*arena).large };

    if large {
        let pages = unsafe { (*arena).cnt } as usize;
        page_alloc::vspace_op(domain, |vs| page_alloc::free_pages_locked(pool, vs, arena_addr, pages));
        return;
    }

    with_task_state(domain, |descs, vspace| {
        let desc_ptr = unsafe { (*arena).desc };
        let class = descs
            .iter()
            .position(|d| d as *const BlockDesc as *mut BlockDesc == desc_ptr)
            .expect("freed block's arena points at a descriptor outside this domain");
        let desc = &mut descs[class];

        unsafe {
            desc.free_list.push(ptr);
            (*arena).cnt += 1;

            if (*arena).cnt as usize == desc.blocks_per_arena {
                for i in 0..desc.blocks_per_arena {
                    let block = arena2block(arena_addr, desc.block_size, i);
                    desc.free_list.remove(block as *mut u8);
                }
                page_alloc::free_pages_locked(pool, vspace, arena_addr, 1);
            }
        }
    });
}

/// Adapter so ordinary `alloc::boxed::Box`/`alloc::vec::Vec` usage in kernel
/// code is serviced by `sys_malloc`/`sys_free` in the kernel domain, rather
/// than a second, independent allocator.
///
/// Rejects (returns null from `alloc`) any `Layout` whose alignment exceeds
/// what the request's size class naturally provides: a block from the 16-byte
/// class is only guaranteed 16-byte alignment, and the large path is only
/// guaranteed page alignment, so a caller asking for more than that is refused
/// rather than silently handed an under-aligned pointer.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();

        if size > config::MAX_SLAB_SIZE {
            if align > PAGE_SIZE as usize {
                return ptr::null_mut();
            }
        } else {
            match SIZE_CLASSES.iter().find(|&&class| class >= size) {
                Some(&class) if align <= class => {}
                _ => return ptr::null_mut(),
            }
        }

        sys_malloc(size).unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        sys_free(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_desc_init_doubles_from_16() {
        let descs = block_desc_init();
        for (i, d) in descs.iter().enumerate() {
            assert_eq!(d.block_size, SIZE_CLASSES[i]);
            assert_eq!(
                d.blocks_per_arena,
                (PAGE_SIZE as usize - size_of::<Arena>()) / SIZE_CLASSES[i]
            );
            assert!(d.free_list.is_empty());
        }
    }

    #[test]
    fn arena2block_and_block2arena_round_trip() {
        let arena_addr = 0xC010_0000u32;
        let block = arena2block(arena_addr, 64, 3);
        assert_eq!(block, arena_addr + size_of::<Arena>() as u32 + 3 * 64);
        assert_eq!(block2arena(block), arena_addr);
    }

    #[test]
    fn size_classes_are_inclusive_on_the_upper_bound() {
        assert_eq!(SIZE_CLASSES.iter().position(|&s| s >= 100), Some(3)); // 128
        assert_eq!(SIZE_CLASSES.iter().position(|&s| s >= 1024), Some(6)); // 1024
        assert_eq!(SIZE_CLASSES.iter().position(|&s| s >= 1025), None); // large path
    }

    #[test]
    fn large_path_page_count_matches_scenario_s4() {
        let size = 2000usize;
        let pages = (size + size_of::<Arena>() + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;
        assert_eq!(pages, 1);
    }

    #[test]
    fn alignment_above_size_class_is_rejected() {
        // A 4096-aligned request for 8 bytes must not be silently rounded up
        // into the 16-byte class, which only guarantees 16-byte alignment.
        let size = 8usize;
        let align = 4096usize;
        let class = SIZE_CLASSES.iter().find(|&&c| c >= size).copied();
        assert_eq!(class, Some(16));
        assert!(align > class.unwrap());
    }
}
