//! This crate contains basic structs that represent the units of memory
//! the virtual-memory system manages: [`PhysicalAddress`], [`VirtualAddress`],
//! [`Frame`], and [`Page`].
//!
//! The wrapper types exist so that physical and virtual addresses can never
//! be confused for one another, and so that page-granularity arithmetic is
//! explicit rather than a soup of shifts and masks at every call site.

#![no_std]

use core::fmt;

use derive_more::{Add, AddAssign, Sub, SubAssign};
use kernel_config::memory::{KERNEL_DIRECT_OFFSET, PAGE_SHIFT, PAGE_SIZE};

/// A physical memory address, aligned to no particular boundary.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Add, AddAssign, Sub, SubAssign,
)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    /// Creates a new `PhysicalAddress` with the given raw value.
    pub const fn new(value: usize) -> PhysicalAddress {
        PhysicalAddress(value)
    }

    /// Creates a `PhysicalAddress` of value 0.
    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    /// Returns the underlying raw value of this address.
    pub const fn value(&self) -> usize {
        self.0
    }

    /// Returns the offset of this address from the start of its frame,
    /// i.e., its lowest `PAGE_SHIFT` bits.
    pub const fn frame_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns true if this address lies on a frame boundary.
    pub const fn is_frame_aligned(&self) -> bool {
        self.frame_offset() == 0
    }

    /// Returns a copy of this address rounded down to the start of its frame.
    pub const fn align_down_to_frame(&self) -> PhysicalAddress {
        PhysicalAddress(self.0 & !(PAGE_SIZE - 1))
    }

    /// Returns the kernel virtual address at which this physical address
    /// is reachable through the kernel's direct mapping.
    pub const fn to_kernel_vaddr(&self) -> VirtualAddress {
        VirtualAddress(self.0 + KERNEL_DIRECT_OFFSET)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}
impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A virtual memory address, aligned to no particular boundary.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Add, AddAssign, Sub, SubAssign,
)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// Creates a new `VirtualAddress` with the given raw value.
    pub const fn new(value: usize) -> VirtualAddress {
        VirtualAddress(value)
    }

    /// Creates a `VirtualAddress` of value 0.
    pub const fn zero() -> VirtualAddress {
        VirtualAddress(0)
    }

    /// Returns the underlying raw value of this address.
    pub const fn value(&self) -> usize {
        self.0
    }

    /// Returns the offset of this address from the start of its page,
    /// i.e., its lowest `PAGE_SHIFT` bits.
    pub const fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns true if this address lies on a page boundary.
    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// Returns a copy of this address rounded down to the start of its page.
    pub const fn align_down_to_page(&self) -> VirtualAddress {
        VirtualAddress(self.0 & !(PAGE_SIZE - 1))
    }

    /// Interprets this address as a kernel direct-mapping address and
    /// returns the physical address it maps to.
    ///
    /// Panics if this address is below the direct-mapping base.
    pub fn to_physical(&self) -> PhysicalAddress {
        assert!(
            self.0 >= KERNEL_DIRECT_OFFSET,
            "to_physical() on non-direct-mapped address {:?}",
            self
        );
        PhysicalAddress(self.0 - KERNEL_DIRECT_OFFSET)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{:#X}", self.0)
    }
}
impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A `Frame` is a physical page of memory, identified by its number:
/// frame `n` covers physical addresses `[n * PAGE_SIZE, (n+1) * PAGE_SIZE)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    number: usize,
}

impl Frame {
    /// Returns the `Frame` containing the given `PhysicalAddress`.
    pub const fn containing_address(addr: PhysicalAddress) -> Frame {
        Frame {
            number: addr.value() >> PAGE_SHIFT,
        }
    }

    /// Returns the frame number.
    pub const fn number(&self) -> usize {
        self.number
    }

    /// Returns the `PhysicalAddress` at the start of this frame.
    pub const fn start_address(&self) -> PhysicalAddress {
        PhysicalAddress(self.number << PAGE_SHIFT)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Frame(p{:#X})", self.start_address().value())
    }
}

/// A `Page` is a virtual page, identified by its number:
/// page `n` covers virtual addresses `[n * PAGE_SIZE, (n+1) * PAGE_SIZE)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page {
    number: usize,
}

impl Page {
    /// Returns the `Page` containing the given `VirtualAddress`.
    pub const fn containing_address(addr: VirtualAddress) -> Page {
        Page {
            number: addr.value() >> PAGE_SHIFT,
        }
    }

    /// Returns the page number.
    pub const fn number(&self) -> usize {
        self.number
    }

    /// Returns the `VirtualAddress` at the start of this page.
    pub const fn start_address(&self) -> VirtualAddress {
        VirtualAddress(self.number << PAGE_SHIFT)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Page(v{:#X})", self.start_address().value())
    }
}
