//! Fixed addresses and sizes dictated by the hand-written boot loader and by the
//! hardware paging layout. Nothing in this module is discovered at runtime except
//! where noted.

/// Size of one page, in bytes. Fixed by the 32-bit paging hardware.
pub const PAGE_SIZE: u32 = 4096;

/// Physical address of the 32-bit little-endian word the boot loader populates with
/// the total amount of installed RAM, in bytes.
pub const TOTAL_MEM_ADDR: u32 = 0x0B00;

/// First byte of the low 1 MiB, reserved forever (BIOS data area, boot sector, video
/// memory, etc). Never handed out by any allocator.
pub const LOW_MEM_RESERVED: u32 = 0x0000_0000;

/// End of the low 1 MiB reserved region.
pub const LOW_MEM_END: u32 = 0x0010_0000;

/// The boot loader pre-builds one page directory plus 255 kernel page tables
/// immediately above the low 1 MiB, to map just enough of memory to get the kernel
/// proper running. This is `256 * PAGE_SIZE` bytes.
pub const BOOT_PAGE_TABLES: u32 = 256 * PAGE_SIZE;

/// First physical byte available to the kernel pool.
pub const KERNEL_POOL_PHYS_START: u32 = LOW_MEM_END + BOOT_PAGE_TABLES;

/// Base of the higher half, where the kernel lives.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Start of the kernel's virtual heap range (1 MiB above `KERNEL_BASE`, past the
/// identity-mapped low region).
pub const KERNEL_HEAP_START: u32 = 0xC010_0000;

/// Base virtual address of the four allocation bitmaps.
pub const BITMAP_BASE: u32 = 0xC009_A000;

/// Size of the fixed region reserved for the allocation bitmaps: 4 pages,
/// ending just below the kernel TCB/stack addresses the layout reserves
/// immediately above it. `mem_init` asserts its bitmaps fit inside this.
pub const BITMAP_REGION_SIZE: u32 = 4 * PAGE_SIZE;

/// Page-directory entry index the directory's own physical frame is installed at,
/// making every page table reachable through a deterministic virtual address.
pub const RECURSIVE_PDE_INDEX: u32 = 1023;

/// PTE/PDE flag: entry maps to a present page.
pub const PTE_PRESENT: u32 = 1 << 0;

/// PTE/PDE flag: page is writable.
pub const PTE_WRITABLE: u32 = 1 << 1;

/// PTE/PDE flag: page is accessible from ring 3.
pub const PTE_USER: u32 = 1 << 2;

/// Flags installed on every PTE and PDE this kernel writes.
pub const DEFAULT_FLAGS: u32 = PTE_PRESENT | PTE_WRITABLE | PTE_USER;

/// Largest request size the slab path will service; anything bigger goes through
/// the whole-page "large" path.
pub const MAX_SLAB_SIZE: usize = 1024;

/// Smallest slab size class.
pub const MIN_SLAB_SIZE: usize = 16;

/// Number of slab size classes (16, 32, 64, 128, 256, 512, 1024).
pub const DESC_COUNT: usize = 7;
