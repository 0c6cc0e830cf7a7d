//! Composes physical pools, virtual spaces and the page-table driver into
//! "give me N contiguous virtual pages backed by physical frames, mapped" and
//! its inverse.
//!
//! Every public entry point here acquires the relevant domain's pool mutex for
//! its entire duration and releases it on every exit path (the mutex guard's
//! `Drop` does this even on an early `?` return), including failure. The
//! virtual-space lock is separate: `vspace_op` takes it for exactly as long as
//! its own closure runs. `alloc_pages`/`free_pages_locked` never reach back
//! into `vspace_op` themselves — they take an already-borrowed `&mut
//! VirtAddrSpace` from the caller — because `task::with_current`'s guard is
//! not reentrant, and a caller that already holds it (as `memory::heap` does
//! while also holding the block-descriptor lock) would deadlock re-acquiring
//! it from inside here.

use core::ptr;

use crate::config::{self, PAGE_SIZE};
use crate::task::{self, Domain};

use super::paging;
use super::phys_pool::{self, PhysPool};
use super::virt_space::VirtAddrSpace;

/// Run `f` against the virtual-address space for `domain`: the kernel-wide one
/// for `Domain::Kernel`, or the current task's private one for `Domain::User`.
/// Takes the domain's vspace lock for exactly the duration of `f`; callers
/// that need the vspace alongside some other already-held lock on the same
/// domain (`memory::heap`'s block-descriptor operations) must not route
/// through here — see `pub(super)` note below.
pub(super) fn vspace_op<R>(domain: Domain, f: impl FnOnce(&mut VirtAddrSpace) -> R) -> R {
    match domain {
        Domain::Kernel => {
            let mut guard = super::virt_space::KERNEL_VSPACE.lock();
            f(guard.as_mut().expect("pools not initialized"))
        }
        Domain::User => task::with_current(|t| f(&mut t.vspace))
            .expect("user domain operation with no current task"),
    }
}

/// Reserve `n` contiguous virtual pages and map each one to a physical frame
/// from `pool` (the frames need not be contiguous). Caller must already hold
/// both `vspace`'s lock and `pool`'s domain mutex; this is the shared body
/// behind `get_kernel_pages`/`get_user_pages` and `memory::heap`'s arena
/// population, the latter of which reaches `vspace` through its own
/// already-held task lock rather than through `vspace_op`.
///
/// On physical exhaustion partway through, this returns `None` without rolling
/// back the virtual bits already set or the pages already mapped. That is a
/// known, intentionally-preserved defect — see DESIGN.md.
pub(super) fn alloc_pages(vspace: &mut VirtAddrSpace, pool: &mut PhysPool, n: usize) -> Option<u32> {
    let base = vspace.valloc(n)?;

    for i in 0..n {
        let v = base + i as u32 * PAGE_SIZE;
        match pool.palloc() {
            Some(frame) => unsafe { paging::map(v, frame) },
            None => {
                printk!(
                    "alloc_pages: physical exhaustion after {} of {} pages (vaddr bits and prior mappings left in place)\n",
                    i,
                    n
                );
                return None;
            }
        }
    }

    Some(base)
}

/// Allocate `n` zeroed pages from the kernel domain.
pub fn get_kernel_pages(n: usize) -> Option<u32> {
    let mut guard = phys_pool::KERNEL_POOL.lock();
    let pool = guard.as_mut().expect("pools not initialized");
    let base = vspace_op(Domain::Kernel, |vs| alloc_pages(vs, pool, n))?;
    unsafe {
        ptr::write_bytes(base as *mut u8, 0, n * PAGE_SIZE as usize);
    }
    Some(base)
}

/// Allocate `n` zeroed pages from the user domain.
pub fn get_user_pages(n: usize) -> Option<u32> {
    let mut guard = phys_pool::USER_POOL.lock();
    let pool = guard.as_mut().expect("pools not initialized");
    let base = vspace_op(Domain::User, |vs| alloc_pages(vs, pool, n))?;
    unsafe {
        ptr::write_bytes(base as *mut u8, 0, n * PAGE_SIZE as usize);
    }
    Some(base)
}

/// Reserve the specific page containing `v` and map it.
///
/// Refuses a cross-domain request: a kernel thread (no page directory) asking
/// for the user domain, or a user task asking for the kernel domain, halts
/// fatally rather than returning failure, matching `get_a_page`'s fatal-error
/// class in the source design.
///
/// Also preserves the source's `bit_idx > 0` assertion: allocating the very
/// first page of a virtual space through this entry point is refused. The
/// original intent is undocumented; we keep the restriction rather than
/// silently dropping it (see DESIGN.md).
pub fn alloc_page_at(domain: Domain, v: u32) -> Option<u32> {
    assert_eq!(
        task::domain(),
        domain,
        "cross-domain page request: caller is {:?}, requested {:?}",
        task::domain(),
        domain
    );

    let mut pool_guard = phys_pool::pool_for(domain).lock();
    let pool = pool_guard.as_mut().expect("pools not initialized");

    vspace_op(domain, |vs| {
        assert!(
            vs.index_of(v) > 0,
            "alloc_page_at refuses the first page of a virtual space (vaddr 0x{:x})",
            v
        );
        vs.reserve_at(v);
    });

    let frame = pool.palloc()?;
    unsafe {
        paging::map(v, frame);
    }
    Some(v)
}

/// Identical to `alloc_page_at`, but skips the virtual-bitmap update. Used
/// solely while rebuilding mappings during process forking, where the child's
/// virtual bitmap was already copied wholesale from the parent and must not be
/// touched again here.
pub fn alloc_page_at_no_bitmap(domain: Domain, v: u32) -> Option<u32> {
    assert_eq!(v % PAGE_SIZE, 0, "unaligned vaddr 0x{:x}", v);
    assert_eq!(
        task::domain(),
        domain,
        "cross-domain page request: caller is {:?}, requested {:?}",
        task::domain(),
        domain
    );

    let mut pool_guard = phys_pool::pool_for(domain).lock();
    let pool = pool_guard.as_mut().expect("pools not initialized");

    let frame = pool.palloc()?;
    unsafe {
        paging::map(v, frame);
    }
    Some(v)
}

/// Free `n` contiguous virtual pages starting at `base`: translate each to its
/// physical frame (one at a time, since the frames are not necessarily
/// contiguous), clear the frame's occupancy bit, unmap the PTE, and finally
/// release the virtual bits. Caller must already hold `pool`'s domain mutex
/// and `vspace`'s lock; this is the shared body behind `free_pages` and
/// `memory::heap::sys_free`'s large and slab-reclaim paths, both of which
/// reach `vspace` through their own already-held lock rather than through
/// `vspace_op`.
///
/// # Panics
/// If `base` is unaligned, `n` is zero, or any freed frame falls inside the
/// boot-reserved region — corrupting that region would take the kernel down
/// with it, so this is fatal rather than recoverable.
pub(super) fn free_pages_locked(pool: &mut PhysPool, vspace: &mut VirtAddrSpace, base: u32, n: usize) {
    assert_eq!(base % PAGE_SIZE, 0, "free_pages on unaligned base 0x{:x}", base);
    assert!(n >= 1, "free_pages called with n == 0");

    for i in 0..n {
        let v = base + i as u32 * PAGE_SIZE;
        let frame = unsafe { paging::translate(v) };
        assert!(
            frame >= config::KERNEL_POOL_PHYS_START,
            "refusing to free boot-reserved frame 0x{:x}",
            frame
        );
        pool.free_bit(frame);
        unsafe {
            paging::unmap(v);
        }
    }

    vspace.vfree(base, n);
}

/// Free `n` contiguous virtual pages starting at `base`, acquiring `domain`'s
/// pool mutex and vspace lock for the whole operation. See `free_pages_locked`
/// for the body.
pub fn free_pages(domain: Domain, base: u32, n: usize) {
    let mut pool_guard = phys_pool::pool_for(domain).lock();
    let pool = pool_guard.as_mut().expect("pools not initialized");
    vspace_op(domain, |vs| free_pages_locked(pool, vs, base, n));
}

/// `free_pages` under its external-API name.
pub fn mfree_page(domain: Domain, vaddr: u32, n: usize) {
    free_pages(domain, vaddr, n);
}

/// Translate a mapped virtual address to its physical address.
pub fn addr_v2p(vaddr: u32) -> u32 {
    unsafe { paging::translate(vaddr) }
}
