//! End-to-end scenarios for address spaces: demand-zero fault-in,
//! eviction under pressure, fork-style copying, and heap growth.

use std::sync::Arc;

use addrspace::{vm_fault, AddressSpace};
use kernel_config::memory::{
    PAGE_SIZE, PROC_MAX_HEAP_PAGES, SWAP_MIN_FACTOR, USERHEAP_BASE, USERSTACK,
};
use kernel_error::KernelError;
use machine::{Machine, MachineConfig};
use memory_structs::{PhysicalAddress, VirtualAddress};
use swap_store::block::RamDisk;
use vm::{FaultType, Vm};

fn boot(ram_pages: usize) -> (Arc<Machine>, Arc<Vm>) {
    let machine = Machine::new(MachineConfig {
        ram_pages,
        kernel_image_pages: 1,
        cpus: 1,
        rng_seed: 0xFACADE,
    });
    let slots = SWAP_MIN_FACTOR * ram_pages + 8;
    let device = RamDisk::new(512, slots * PAGE_SIZE / 512);
    let vm = Vm::bootstrap(machine.clone(), Box::new(device), SWAP_MIN_FACTOR).unwrap();
    (machine, vm)
}

const REGION_BASE: usize = 0x4000_0000;

fn region_addr(page: usize) -> VirtualAddress {
    VirtualAddress::new(REGION_BASE + page * PAGE_SIZE)
}

/// Reads one byte through the current TLB, faulting the page in first,
/// the way a user load would behave.
fn user_load(aspace: &AddressSpace, vaddr: VirtualAddress) -> Result<u8, KernelError> {
    let vm = aspace.vm();
    if vm.lookup_mapping(vaddr).is_none() {
        aspace.fault(FaultType::Read, vaddr)?;
    }
    let (paddr, _) = vm.lookup_mapping(vaddr).unwrap();
    Ok(vm
        .machine()
        .read_byte(PhysicalAddress::new(paddr.value() + vaddr.page_offset())))
}

/// Writes one byte through the current TLB, taking a write fault first.
fn user_store(aspace: &AddressSpace, vaddr: VirtualAddress, value: u8) -> Result<(), KernelError> {
    let vm = aspace.vm();
    let writable = vm.lookup_mapping(vaddr).map(|(_, w)| w);
    match writable {
        Some(true) => {}
        Some(false) => aspace.fault(FaultType::ReadOnly, vaddr)?,
        None => aspace.fault(FaultType::Write, vaddr)?,
    }
    let (paddr, writable) = vm.lookup_mapping(vaddr).unwrap();
    assert!(writable);
    vm.machine()
        .write_byte(PhysicalAddress::new(paddr.value() + vaddr.page_offset()), value);
    Ok(())
}

/// S1: a read fault on a fresh region materializes a zero page and
/// installs exactly one valid mapping.
#[test]
fn fault_in_demand_zero() {
    let (_machine, vm) = boot(6);
    // One page of kernel memory, as a booted system would hold.
    let kpage = vm.alloc_kpages(1).unwrap();

    let aspace = AddressSpace::create(vm.clone());
    aspace
        .define_region(region_addr(0), 3 * PAGE_SIZE, true, true, false)
        .unwrap();

    assert_eq!(vm_fault(&aspace, 0, region_addr(0)), Ok(()));
    let (_, writable) = vm.lookup_mapping(region_addr(0)).unwrap();
    assert!(!writable);
    assert_eq!(user_load(&aspace, region_addr(0)).unwrap(), 0);

    let stats = vm.coremap_stats();
    assert_eq!(stats.upages, 1);
    assert_eq!(stats.kpages, 1);
    assert_eq!(stats.free, 2);

    aspace.destroy();
    vm.free_kpages(kpage);
}

/// S2: with memory full, touching one more page evicts exactly one
/// victim and the counters never go inconsistent.
#[test]
fn fault_under_pressure_evicts_one_page() {
    let (_machine, vm) = boot(6);
    let kpage = vm.alloc_kpages(1).unwrap();

    let aspace = AddressSpace::create(vm.clone());
    aspace
        .define_region(region_addr(0), 4 * PAGE_SIZE, true, true, false)
        .unwrap();

    for i in 0..3 {
        user_store(&aspace, region_addr(i), 0x10 + i as u8).unwrap();
    }
    assert_eq!(vm.coremap_stats().upages, 3);
    assert_eq!(vm.coremap_stats().free, 0);

    // The fourth page has nowhere to go without an eviction.
    user_store(&aspace, region_addr(3), 0x13).unwrap();
    assert_eq!(vm.eviction_count(), 1);
    let stats = vm.coremap_stats();
    assert_eq!(stats.upages, 3);
    assert_eq!(stats.free, 0);

    // Every page still reads back its byte, including whichever page
    // was evicted (paged back in from its swap slot).
    for i in 0..4 {
        assert_eq!(user_load(&aspace, region_addr(i)).unwrap(), 0x10 + i as u8);
    }

    aspace.destroy();
    vm.free_kpages(kpage);
}

/// S3: copying an address space duplicates page contents into disjoint
/// storage; writes to the parent never show through to the child.
#[test]
fn copy_isolates_parent_and_child() {
    let (_machine, vm) = boot(8);

    let parent = AddressSpace::create(vm.clone());
    parent
        .define_region(region_addr(0), 2 * PAGE_SIZE, true, true, false)
        .unwrap();
    user_store(&parent, region_addr(0), 0xAA).unwrap();
    user_store(&parent, region_addr(1), 0xBB).unwrap();

    let child = parent.copy().unwrap();

    child.activate();
    assert_eq!(user_load(&child, region_addr(0)).unwrap(), 0xAA);
    assert_eq!(user_load(&child, region_addr(1)).unwrap(), 0xBB);

    parent.activate();
    user_store(&parent, region_addr(0), 0xCC).unwrap();

    child.activate();
    assert_eq!(user_load(&child, region_addr(0)).unwrap(), 0xAA);

    parent.activate();
    assert_eq!(user_load(&parent, region_addr(0)).unwrap(), 0xCC);

    child.destroy();
    parent.destroy();
    assert_eq!(vm.coremap_stats().upages, 0);
}

/// S5: the heap break moves in bytes, materializes nothing until
/// touched, and shrinking gives everything back.
#[test]
fn heap_grows_and_shrinks() {
    let (_machine, vm) = boot(8);
    let swap_baseline = vm.swap().stats();

    let aspace = AddressSpace::create(vm.clone());
    let heap_start = VirtualAddress::new(USERHEAP_BASE);
    aspace.define_heap(heap_start).unwrap();

    assert_eq!(aspace.sbrk(0x1000).unwrap(), heap_start);
    assert_eq!(
        aspace.sbrk(0x1000).unwrap(),
        VirtualAddress::new(USERHEAP_BASE + 0x1000)
    );
    // Nothing materialized yet.
    assert_eq!(vm.coremap_stats().upages, 0);

    let middle = VirtualAddress::new(USERHEAP_BASE + 0x800);
    assert_eq!(user_load(&aspace, middle).unwrap(), 0);
    assert_eq!(vm.coremap_stats().upages, 1);

    assert_eq!(
        aspace.sbrk(-0x2000).unwrap(),
        VirtualAddress::new(USERHEAP_BASE + 0x2000)
    );
    assert_eq!(vm.coremap_stats().upages, 0);
    assert_eq!(
        aspace.fault(FaultType::Read, heap_start),
        Err(KernelError::BadAddress)
    );

    // A break below the heap start is refused outright.
    assert_eq!(aspace.sbrk(-0x1000), Err(KernelError::BadArgument));
    // And the cap stops runaway growth.
    assert_eq!(
        aspace.sbrk(((PROC_MAX_HEAP_PAGES + 1) * PAGE_SIZE) as isize),
        Err(KernelError::OutOfMemory)
    );

    aspace.destroy();
    assert_eq!(vm.swap().stats(), swap_baseline);
}

/// Defining and destroying regions returns the swap accounting exactly
/// to its starting point, faulted or not.
#[test]
fn region_lifecycle_restores_swap_accounting() {
    let (_machine, vm) = boot(8);
    let baseline = vm.swap().stats();

    let aspace = AddressSpace::create(vm.clone());
    aspace
        .define_region(region_addr(0), 5 * PAGE_SIZE, true, true, false)
        .unwrap();
    assert_eq!(vm.swap().stats().reserved, baseline.reserved + 5);

    user_store(&aspace, region_addr(0), 1).unwrap();
    user_store(&aspace, region_addr(3), 2).unwrap();
    assert_eq!(vm.swap().stats().reserved, baseline.reserved + 3);
    assert_eq!(vm.swap().stats().used, baseline.used + 2);

    aspace.destroy();
    assert_eq!(vm.swap().stats(), baseline);
}

#[test]
fn overlapping_regions_are_rejected() {
    let (_machine, vm) = boot(8);
    let aspace = AddressSpace::create(vm.clone());
    aspace
        .define_region(region_addr(0), 3 * PAGE_SIZE, true, true, false)
        .unwrap();

    // Half-open interval intersection, from either side.
    assert_eq!(
        aspace.define_region(region_addr(2), 2 * PAGE_SIZE, true, true, false),
        Err(KernelError::BadArgument)
    );
    assert_eq!(
        aspace.define_region(
            VirtualAddress::new(REGION_BASE - PAGE_SIZE),
            2 * PAGE_SIZE,
            true,
            true,
            false
        ),
        Err(KernelError::BadArgument)
    );
    // Touching end-to-start is fine.
    aspace
        .define_region(region_addr(3), PAGE_SIZE, true, true, false)
        .unwrap();

    aspace.destroy();
}

#[test]
fn fault_outside_every_region_is_a_bad_address() {
    let (_machine, vm) = boot(8);
    let aspace = AddressSpace::create(vm.clone());
    aspace
        .define_region(region_addr(0), PAGE_SIZE, true, true, false)
        .unwrap();

    assert_eq!(
        aspace.fault(FaultType::Read, region_addr(1)),
        Err(KernelError::BadAddress)
    );
    // An unknown fault code from the trap path is a bad argument, not a
    // bad address.
    assert_eq!(
        vm_fault(&aspace, 7, region_addr(0)),
        Err(KernelError::BadArgument)
    );

    aspace.destroy();
}

/// A read-only mapping upgraded by a readonly fault stays on the same
/// frame and becomes writable.
#[test]
fn readonly_fault_upgrades_the_mapping() {
    let (_machine, vm) = boot(8);
    let aspace = AddressSpace::create(vm.clone());
    aspace
        .define_region(region_addr(0), PAGE_SIZE, true, true, false)
        .unwrap();

    aspace.fault(FaultType::Read, region_addr(0)).unwrap();
    let (paddr, writable) = vm.lookup_mapping(region_addr(0)).unwrap();
    assert!(!writable);

    aspace.fault(FaultType::ReadOnly, region_addr(0)).unwrap();
    let (upgraded, writable) = vm.lookup_mapping(region_addr(0)).unwrap();
    assert!(writable);
    assert_eq!(upgraded, paddr);

    aspace.destroy();
}

#[test]
fn stack_region_sits_below_the_stack_top() {
    let (_machine, vm) = boot(8);
    let aspace = AddressSpace::create(vm.clone());
    let sp = aspace.define_stack().unwrap();
    assert_eq!(sp, VirtualAddress::new(USERSTACK));

    // The first word below the top is faultable; the top itself is not
    // part of the region.
    let below = VirtualAddress::new(USERSTACK - PAGE_SIZE);
    assert_eq!(user_load(&aspace, below).unwrap(), 0);
    assert_eq!(
        aspace.fault(FaultType::Read, sp),
        Err(KernelError::BadAddress)
    );

    aspace.destroy();
}
