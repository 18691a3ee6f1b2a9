//! Paging stress: regions several times larger than RAM, swept
//! sequentially and hammered from multiple threads.

use std::sync::Arc;
use std::thread;

use addrspace::AddressSpace;
use kernel_config::memory::{PAGE_SIZE, SWAP_MIN_FACTOR};
use machine::{Machine, MachineConfig};
use memory_structs::{PhysicalAddress, VirtualAddress};
use swap_store::block::RamDisk;
use vm::{FaultType, Vm};

fn boot(ram_pages: usize) -> (Arc<Machine>, Arc<Vm>) {
    let machine = Machine::new(MachineConfig {
        ram_pages,
        kernel_image_pages: 1,
        cpus: 1,
        rng_seed: 0xBADCAB1E,
    });
    let slots = SWAP_MIN_FACTOR * ram_pages + 64;
    let device = RamDisk::new(512, slots * PAGE_SIZE / 512);
    let vm = Vm::bootstrap(machine.clone(), Box::new(device), SWAP_MIN_FACTOR).unwrap();
    (machine, vm)
}

const BASE: usize = 0x1000_0000;

fn page_addr(i: usize) -> VirtualAddress {
    VirtualAddress::new(BASE + i * PAGE_SIZE)
}

/// A user store: fault the page writable, write the byte, and confirm
/// the mapping survived. A concurrent eviction invalidates the TLB entry
/// before touching the frame, so an unchanged mapping proves the write
/// landed in our page; otherwise retry, as the hardware would re-fault.
fn store(aspace: &AddressSpace, vaddr: VirtualAddress, value: u8) {
    let vm = aspace.vm();
    loop {
        aspace.fault(FaultType::Write, vaddr).unwrap();
        let Some((paddr, _)) = vm.lookup_mapping(vaddr) else {
            continue;
        };
        vm.machine()
            .write_byte(PhysicalAddress::new(paddr.value() + vaddr.page_offset()), value);
        if vm.lookup_mapping(vaddr) == Some((paddr, true)) {
            return;
        }
    }
}

/// A user load, with the same mapping-survived check as [`store`].
fn load(aspace: &AddressSpace, vaddr: VirtualAddress) -> u8 {
    let vm = aspace.vm();
    loop {
        aspace.fault(FaultType::Read, vaddr).unwrap();
        let Some((paddr, _)) = vm.lookup_mapping(vaddr) else {
            continue;
        };
        let value = vm
            .machine()
            .read_byte(PhysicalAddress::new(paddr.value() + vaddr.page_offset()));
        if vm
            .lookup_mapping(vaddr)
            .is_some_and(|(current, _)| current == paddr)
        {
            return value;
        }
    }
}

/// Touch every page of a region five times the size of RAM, then sweep
/// again verifying the pattern; every page migrates through swap at
/// least once.
#[test]
fn sequential_sweep_many_times_ram() {
    let (_machine, vm) = boot(8);
    let total = vm.coremap_stats().total;
    let npages = total * 5;

    let aspace = AddressSpace::create(vm.clone());
    aspace
        .define_region(page_addr(0), npages * PAGE_SIZE, true, true, false)
        .unwrap();

    for i in 0..npages {
        store(&aspace, page_addr(i), (i % 251) as u8);
        // Pages also get dirtied at a second offset, to catch partial
        // page writes to swap.
        let tail = VirtualAddress::new(page_addr(i).value() + PAGE_SIZE - 1);
        store(&aspace, tail, (i % 13) as u8);
    }
    assert!(vm.eviction_count() > 0);

    for i in 0..npages {
        assert_eq!(load(&aspace, page_addr(i)), (i % 251) as u8);
        let tail = VirtualAddress::new(page_addr(i).value() + PAGE_SIZE - 1);
        assert_eq!(load(&aspace, tail), (i % 13) as u8);
    }

    aspace.destroy();
    assert_eq!(vm.coremap_stats().upages, 0);
}

/// Several threads each own a slice of one address space and fault their
/// pages in and out concurrently; nobody's pattern is disturbed.
#[test]
fn threaded_sweeps_share_one_address_space() {
    let (_machine, vm) = boot(8);
    let total = vm.coremap_stats().total;
    let per_thread = total; // each thread's slice alone overflows RAM x4
    let nthreads = 4;

    let aspace = Arc::new(AddressSpace::create(vm.clone()));
    aspace
        .define_region(
            page_addr(0),
            nthreads * per_thread * PAGE_SIZE,
            true,
            true,
            false,
        )
        .unwrap();

    let handles: Vec<_> = (0..nthreads)
        .map(|t| {
            let aspace = aspace.clone();
            thread::spawn(move || {
                let first = t * per_thread;
                for round in 0u8..3 {
                    for i in first..first + per_thread {
                        store(&aspace, page_addr(i), round ^ (i as u8));
                    }
                    for i in first..first + per_thread {
                        assert_eq!(load(&aspace, page_addr(i)), round ^ (i as u8));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let aspace = Arc::try_unwrap(aspace).unwrap_or_else(|_| panic!("address space still shared"));
    aspace.destroy();
    assert_eq!(vm.coremap_stats().upages, 0);
    assert_eq!(vm.swap().stats().reserved, 0);
}
