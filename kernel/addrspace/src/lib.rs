//! User address spaces.
//!
//! An [`AddressSpace`] is a set of non-overlapping regions of logical
//! pages plus a byte-granular heap break. It is the entry point for user
//! memory faults: [`AddressSpace::fault()`] routes a faulting address to
//! the responsible region and page, materializing untouched pages as
//! demand-zero, and the page does the rest (paging in, TLB install).
//!
//! The region list and heap bounds are guarded by a sleeping lock, taken
//! outermost: it may be held across page materialization (which can evict
//! and therefore sleep), but is always released before an existing page's
//! fault is serviced, so faults on distinct pages proceed in parallel.
//!
//! The loader's view: define regions for each segment, then the stack
//! ([`define_stack()`](AddressSpace::define_stack)) and the heap
//! ([`define_heap()`](AddressSpace::define_heap)); the `sbrk` syscall
//! maps straight onto [`sbrk()`](AddressSpace::sbrk).

#[macro_use]
extern crate log;

mod region;

pub use region::RegionFlags;

use std::sync::Arc;

use kernel_config::memory::{
    PAGE_SIZE, PROC_MAX_HEAP_PAGES, USERSTACK, USERSTACK_BASE, USERSTACK_SIZE,
};
use kernel_error::KernelError;
use memory_structs::{Page, VirtualAddress};
use vm::{FaultType, Vm};
use wait_channel::SleepMutex;

use region::VmRegion;

/// The fault entry point called from the trap handler: decodes the raw
/// fault code and dispatches into the current address space.
pub fn vm_fault(
    addrspace: &AddressSpace,
    fault_code: u32,
    fault_addr: VirtualAddress,
) -> Result<(), KernelError> {
    let fault_type = FaultType::try_from(fault_code)?;
    addrspace.fault(fault_type, fault_addr)
}

struct AsInner {
    regions: Vec<VmRegion>,
    /// The base of the heap region, once defined.
    heap_start: Option<VirtualAddress>,
    /// The current heap break. Tracked in bytes, separately from the heap
    /// region's page count, so the break can move without touching pages.
    heap_end: VirtualAddress,
}

/// One user context's memory: a set of regions and a heap break.
pub struct AddressSpace {
    vm: Arc<Vm>,
    inner: SleepMutex<AsInner>,
}

impl AddressSpace {
    /// Creates an empty address space on the given paging context.
    pub fn create(vm: Arc<Vm>) -> AddressSpace {
        AddressSpace {
            vm,
            inner: SleepMutex::new(AsInner {
                regions: Vec::new(),
                heap_start: None,
                heap_end: VirtualAddress::zero(),
            }),
        }
    }

    /// Returns the paging context this address space lives on.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Clones this address space: every region is deep-copied, page by
    /// page, and the heap bounds carry over. Used by the fork path.
    pub fn copy(&self) -> Result<AddressSpace, KernelError> {
        let inner = self.inner.lock();
        let mut new_regions = Vec::with_capacity(inner.regions.len());
        for region in &inner.regions {
            match region.clone_region(&self.vm) {
                Ok(clone) => new_regions.push(clone),
                Err(err) => {
                    for region in new_regions {
                        region.destroy(&self.vm);
                    }
                    return Err(err);
                }
            }
        }
        Ok(AddressSpace {
            vm: self.vm.clone(),
            inner: SleepMutex::new(AsInner {
                regions: new_regions,
                heap_start: inner.heap_start,
                heap_end: inner.heap_end,
            }),
        })
    }

    /// Makes this address space current on this CPU by flushing the TLB.
    /// Also called on context switch.
    pub fn activate(&self) {
        self.vm.tlb_clear();
    }

    /// Tears the address space down, returning every frame and swap slot
    /// it held.
    pub fn destroy(self) {
        let inner = self.inner.into_inner();
        for region in inner.regions {
            region.destroy(&self.vm);
        }
    }

    /// Defines a region of `size` bytes at `vaddr` (aligned outward to
    /// page granularity) with the given permissions. Fails with
    /// `BadArgument` if it would overlap an existing region.
    pub fn define_region(
        &self,
        vaddr: VirtualAddress,
        size: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<(), KernelError> {
        let base = vaddr.align_down_to_page();
        let size = (size + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1);

        let mut flags = RegionFlags::empty();
        flags.set(RegionFlags::READABLE, readable);
        flags.set(RegionFlags::WRITABLE, writable);
        flags.set(RegionFlags::EXECUTABLE, executable);

        let mut inner = self.inner.lock();
        if inner.regions.iter().any(|r| r.overlaps(base, size)) {
            warn!(
                "define_region: {:?}+{:#x} overlaps an existing region",
                base, size
            );
            return Err(KernelError::BadArgument);
        }

        let region = VmRegion::create(&self.vm, base, size / PAGE_SIZE, flags)?;
        inner.regions.push(region);
        Ok(())
    }

    /// Defines the fixed-size user stack region and returns the initial
    /// stack pointer (its top).
    pub fn define_stack(&self) -> Result<VirtualAddress, KernelError> {
        self.define_region(
            VirtualAddress::new(USERSTACK_BASE),
            USERSTACK_SIZE,
            true,
            true,
            false,
        )?;
        Ok(VirtualAddress::new(USERSTACK))
    }

    /// Defines the heap: an initially-empty region at `start` whose end
    /// is moved by [`sbrk()`](AddressSpace::sbrk).
    pub fn define_heap(&self, start: VirtualAddress) -> Result<(), KernelError> {
        let start = start.align_down_to_page();
        self.define_region(start, 0, true, true, false)?;
        let mut inner = self.inner.lock();
        assert!(inner.heap_start.is_none(), "heap defined twice");
        inner.heap_start = Some(start);
        inner.heap_end = start;
        Ok(())
    }

    /// Returns the heap's base and current break, once defined.
    pub fn heap_bounds(&self) -> Option<(VirtualAddress, VirtualAddress)> {
        let inner = self.inner.lock();
        inner.heap_start.map(|start| (start, inner.heap_end))
    }

    /// Moves the heap break by `delta` bytes (rounded up to 4-byte
    /// granularity) and returns the previous break.
    ///
    /// Growth materializes nothing: it only reserves swap for the pages
    /// newly covered, capped at `PROC_MAX_HEAP_PAGES`. Shrinking below a
    /// page boundary destroys the pages no longer covered. A break below
    /// the heap start is refused.
    pub fn sbrk(&self, delta: isize) -> Result<VirtualAddress, KernelError> {
        let mut inner = self.inner.lock();
        let heap_start = inner.heap_start.expect("sbrk before the heap is defined");
        let old_end = inner.heap_end;

        if delta == 0 {
            return Ok(old_end);
        }
        let delta = (delta + 3) & !3;

        let new_end = old_end.value() as isize + delta;
        if new_end < heap_start.value() as isize {
            return Err(KernelError::BadArgument);
        }
        let new_end = VirtualAddress::new(new_end as usize);

        let new_pages = (new_end.value() - heap_start.value() + PAGE_SIZE - 1) / PAGE_SIZE;
        if new_pages > PROC_MAX_HEAP_PAGES {
            return Err(KernelError::OutOfMemory);
        }

        let heap_ix = inner
            .regions
            .iter()
            .position(|r| r.base() == heap_start)
            .expect("heap region vanished");
        if new_pages != inner.regions[heap_ix].npages() {
            inner.regions[heap_ix].resize(&self.vm, new_pages)?;
        }

        inner.heap_end = new_end;
        Ok(old_end)
    }

    /// Serves a user fault at `fault_addr`: finds the responsible region
    /// (else `BadAddress`), materializes the page if this is its first
    /// touch, and lets the page service the fault.
    pub fn fault(
        &self,
        fault_type: FaultType,
        fault_addr: VirtualAddress,
    ) -> Result<(), KernelError> {
        let fault_page = fault_addr.align_down_to_page();

        let page = {
            let mut inner = self.inner.lock();
            let region = match inner.regions.iter_mut().find(|r| r.contains(fault_page)) {
                Some(region) => region,
                None => return Err(KernelError::BadAddress),
            };
            let index = Page::containing_address(fault_page).number()
                - Page::containing_address(region.base()).number();
            region.page_for_fault(&self.vm, index)?
        };

        page.fault(&self.vm, fault_type, fault_page)
    }
}
