//! A region: an indexed, resizable run of logical-page slots mapped at a
//! contiguous virtual base.
//!
//! A slot holding `None` is a page that has never been touched; the first
//! fault on it materializes a zero-filled page. Swap capacity for every
//! slot, materialized or not, is reserved when the slot comes into
//! existence, so that pages can always be created (and later evicted)
//! without the paging path running out of swap.

use std::sync::Arc;

use bitflags::bitflags;
use kernel_config::memory::PAGE_SIZE;
use kernel_error::KernelError;
use memory_structs::VirtualAddress;
use vm::{Vm, VmPage};

bitflags! {
    /// The r/w/x permissions recorded for a region. Recorded at
    /// definition time for the loader's benefit; enforcement is limited
    /// to the writable bit of installed TLB entries.
    pub struct RegionFlags: u8 {
        const READABLE   = 0x4;
        const WRITABLE   = 0x2;
        const EXECUTABLE = 0x1;
    }
}

/// A contiguous run of logical-page slots based at a virtual address.
pub(crate) struct VmRegion {
    base: VirtualAddress,
    pages: Vec<Option<Arc<VmPage>>>,
    flags: RegionFlags,
}

impl VmRegion {
    /// Creates a region of `npages` untouched slots, reserving swap
    /// capacity for all of them up front.
    pub fn create(
        vm: &Vm,
        base: VirtualAddress,
        npages: usize,
        flags: RegionFlags,
    ) -> Result<VmRegion, KernelError> {
        vm.swap().reserve(npages)?;
        Ok(VmRegion {
            base,
            pages: (0..npages).map(|_| None).collect(),
            flags,
        })
    }

    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// Returns true if `vaddr` falls inside this region.
    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.base && vaddr.value() < self.base.value() + self.size_bytes()
    }

    /// Returns true if the half-open interval `[vaddr, vaddr + size)`
    /// intersects this region's interval.
    pub fn overlaps(&self, vaddr: VirtualAddress, size: usize) -> bool {
        vaddr.value() + size > self.base.value()
            && vaddr.value() < self.base.value() + self.size_bytes()
    }

    /// Returns the page backing slot `index`, materializing a zero-filled
    /// page (consuming one of this region's reservations) on first touch.
    pub fn page_for_fault(&mut self, vm: &Vm, index: usize) -> Result<Arc<VmPage>, KernelError> {
        let slot = &mut self.pages[index];
        if slot.is_none() {
            *slot = Some(VmPage::new_blank(vm)?);
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    /// Grows or shrinks the region to `npages` slots.
    ///
    /// Shrinking unmaps and destroys every dropped page (untouched slots
    /// just give back their reservation) and cannot fail; growing
    /// reserves swap for the new slots first.
    pub fn resize(&mut self, vm: &Vm, npages: usize) -> Result<(), KernelError> {
        if npages < self.pages.len() {
            for index in npages..self.pages.len() {
                let vaddr = VirtualAddress::new(self.base.value() + index * PAGE_SIZE);
                vm.unmap(vaddr);
                match self.pages[index].take() {
                    Some(page) => VmPage::destroy(page, vm),
                    None => vm.swap().unreserve(1),
                }
            }
            self.pages.truncate(npages);
        } else {
            let delta = npages - self.pages.len();
            vm.swap().reserve(delta)?;
            self.pages.extend((0..delta).map(|_| None));
        }
        Ok(())
    }

    /// Clones this region into a new one with the same base, length and
    /// permissions; every materialized page is deep-copied. Midway
    /// failure releases everything the clone accumulated.
    pub fn clone_region(&self, vm: &Vm) -> Result<VmRegion, KernelError> {
        let mut new = VmRegion::create(vm, self.base, self.pages.len(), self.flags)?;
        for (index, slot) in self.pages.iter().enumerate() {
            if let Some(src) = slot {
                match VmPage::clone_from(src, vm) {
                    Ok(page) => new.pages[index] = Some(page),
                    Err(err) => {
                        new.destroy(vm);
                        return Err(err);
                    }
                }
            }
        }
        Ok(new)
    }

    /// Tears the region down, destroying every page and releasing every
    /// outstanding reservation.
    pub fn destroy(mut self, vm: &Vm) {
        self.resize(vm, 0)
            .expect("shrinking a region to zero cannot fail");
    }
}
