//! The basic memory map and paging policy constants the kernel assumes.
//!
//! The virtual address space is split in half:
//! * the lower half belongs to user address spaces, built out of regions
//!   of logical pages that are paged on demand,
//! * the upper half is the kernel's direct mapping of physical memory.

/// The lower 12 bits of a virtual address are the offset into its page.
pub const PAGE_SHIFT: usize = 12;
/// Page size is 4096 bytes, 4KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The number of slots in each CPU's translation lookaside buffer.
pub const NUM_TLB: usize = 64;

/// The base virtual address of the kernel's direct (linear) mapping of
/// physical memory. A physical address `p` is reachable by the kernel at
/// virtual address `KERNEL_DIRECT_OFFSET + p`.
pub const KERNEL_DIRECT_OFFSET: usize = 0xFFFF_8000_0000_0000;

/// The first virtual address that is *not* usable by user regions.
/// Everything below this belongs to user address spaces.
pub const USERSPACE_TOP: usize = 0x8000_0000;

/// Value: 16 pages. The fixed size of every user stack region.
pub const USERSTACK_SIZE: usize = 16 * PAGE_SIZE;
/// The top of the user stack; the stack pointer starts here and grows down.
pub const USERSTACK: usize = USERSPACE_TOP;
/// The base (lowest) virtual address of the user stack region.
pub const USERSTACK_BASE: usize = USERSTACK - USERSTACK_SIZE;

/// The default base virtual address of the user heap region,
/// used when the loader does not dictate one.
pub const USERHEAP_BASE: usize = 0x1000_0000;

/// The maximum number of pages a single address space's heap may cover.
/// Growth past this point fails rather than letting one process
/// monopolize swap.
pub const PROC_MAX_HEAP_PAGES: usize = 256;

/// The default minimum ratio of swap-device bytes to RAM bytes.
/// Booting with less swap than this refuses to start the paging system,
/// because swap is reserved ahead of every page materialization and an
/// undersized device would make ordinary workloads fail early.
pub const SWAP_MIN_FACTOR: usize = 40;
