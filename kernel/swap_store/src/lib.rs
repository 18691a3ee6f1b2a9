//! The swap backing store: an array of page-sized slots on a raw block
//! device, with reservation-based accounting.
//!
//! The central policy is **reserve before materialize**: a swap slot's
//! capacity is reserved (via [`SwapStore::reserve()`]) before any logical
//! page is ever brought into core, and a reservation is converted into an
//! allocated slot ([`SwapStore::alloc()`]) when the page is created. This
//! guarantees that every in-core page always has a slot to be evicted to,
//! so the eviction path never allocates and never fails.
//!
//! Accounting invariant, which holds at every release of the store's lock:
//! `total = free + reserved + used`. Slot 0 is permanently marked used so
//! that offset 0 can serve as a sentinel and is never valid swap storage.
//!
//! Slot bookkeeping is guarded by a sleeping lock; page transfers
//! ([`SwapStore::read()`] / [`SwapStore::write()`]) take only the device
//! lock, because their callers are serialized by the paging-giant lock and
//! hold the target frame wired.

mod bitmap;
pub mod block;

use core::fmt;
use std::sync::Arc;

use kernel_config::memory::PAGE_SIZE;
use kernel_error::KernelError;
use machine::Machine;
use memory_structs::PhysicalAddress;
use static_assertions::const_assert;
use wait_channel::SleepMutex;

use bitmap::Bitmap;
use block::{BlockIo, BlockReader, BlockWriter, KnownLength};

const_assert!(PAGE_SIZE.is_power_of_two());

/// The full interface a device must offer to back the swap store.
pub trait SwapDevice: BlockReader + BlockWriter + KnownLength + Send {}
impl<T> SwapDevice for T where T: BlockReader + BlockWriter + KnownLength + Send {}

/// The byte offset of a slot on the swap device. Offset 0 is slot 0,
/// which is permanently reserved and never handed out; a page's swap
/// address is assigned once, at page creation, and never changes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapAddr(usize);

impl SwapAddr {
    fn new(offset: usize) -> SwapAddr {
        assert!(offset != 0 && offset % PAGE_SIZE == 0);
        SwapAddr(offset)
    }

    /// Returns the byte offset of this slot on the device.
    pub fn value(&self) -> usize {
        self.0
    }

    /// Returns the slot index.
    pub fn slot(&self) -> usize {
        self.0 / PAGE_SIZE
    }
}

impl fmt::Debug for SwapAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SwapAddr(slot {})", self.slot())
    }
}

/// A snapshot of the store's slot accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapStats {
    /// Slots on the device, including the permanently-used slot 0.
    pub total: usize,
    /// Slots neither reserved nor holding data.
    pub free: usize,
    /// Slots promised to not-yet-materialized pages.
    pub reserved: usize,
    /// Slots holding (or permanently denied to, for slot 0) page data.
    pub used: usize,
}

struct SwapMap {
    slots: Bitmap,
    stats: SwapStats,
}

impl SwapMap {
    fn check_integrity(&self) {
        assert_eq!(
            self.stats.total,
            self.stats.free + self.stats.reserved + self.stats.used,
            "swap accounting out of balance: {:?}",
            self.stats
        );
    }
}

/// The swap store over one backing device. See the crate documentation.
pub struct SwapStore {
    machine: Arc<Machine>,
    device: SleepMutex<Box<dyn SwapDevice>>,
    sectors_per_page: usize,
    map: SleepMutex<SwapMap>,
}

impl SwapStore {
    /// Opens the swap store over `device`, verifying that it is at least
    /// `min_factor` times the size of RAM. Marks slot 0 used.
    pub fn bootstrap(
        machine: Arc<Machine>,
        device: Box<dyn SwapDevice>,
        min_factor: usize,
    ) -> Result<SwapStore, KernelError> {
        let device_len = device.len();
        let ram_size = machine.ram_size();
        if device_len < min_factor * ram_size {
            log::error!(
                "swap: device holds {} bytes but {}x RAM = {} bytes are required",
                device_len,
                min_factor,
                min_factor * ram_size
            );
            return Err(KernelError::OutOfSwap);
        }
        let sector_size = device.block_size();
        assert!(
            sector_size <= PAGE_SIZE && PAGE_SIZE % sector_size == 0,
            "swap device sector size {} does not divide the page size",
            sector_size
        );

        let total = device_len / PAGE_SIZE;
        let mut slots = Bitmap::new(total);
        // Slot 0 stays out of circulation for good.
        slots.mark(0);
        let map = SwapMap {
            slots,
            stats: SwapStats {
                total,
                free: total - 1,
                reserved: 0,
                used: 1,
            },
        };
        map.check_integrity();
        log::debug!("swap: {} slots on a {}-byte device", total, device_len);

        Ok(SwapStore {
            machine,
            device: SleepMutex::new(device),
            sectors_per_page: PAGE_SIZE / sector_size,
            map: SleepMutex::new(map),
        })
    }

    /// Sets aside `n` slots for pages that will be materialized later.
    /// Fails, changing nothing, if fewer than `n` slots are unclaimed.
    pub fn reserve(&self, n: usize) -> Result<(), KernelError> {
        let mut map = self.map.lock();
        if map.stats.free < n {
            log::warn!(
                "swap: reservation of {} slots denied ({} free)",
                n,
                map.stats.free
            );
            return Err(KernelError::OutOfSwap);
        }
        map.stats.free -= n;
        map.stats.reserved += n;
        map.check_integrity();
        Ok(())
    }

    /// Returns `n` previously-reserved slots to the free pool.
    pub fn unreserve(&self, n: usize) {
        let mut map = self.map.lock();
        assert!(map.stats.reserved >= n, "unreserving more than is reserved");
        map.stats.reserved -= n;
        map.stats.free += n;
        map.check_integrity();
    }

    /// Converts one reservation into an allocated slot and returns its
    /// address. The caller must hold a reservation; panics if the bitmap
    /// has no clear slot, which the reservation discipline makes
    /// impossible.
    pub fn alloc(&self) -> SwapAddr {
        let mut map = self.map.lock();
        assert!(map.stats.reserved > 0, "swap_alloc without a reservation");
        let slot = map
            .slots
            .alloc()
            .unwrap_or_else(|| panic!("swap: no free slot despite {:?}", map.stats));
        map.stats.reserved -= 1;
        map.stats.used += 1;
        map.check_integrity();
        SwapAddr::new(slot * PAGE_SIZE)
    }

    /// Releases an allocated slot back to the free pool. The slot's
    /// contents become meaningless.
    pub fn free(&self, addr: SwapAddr) {
        let mut map = self.map.lock();
        map.slots.unmark(addr.slot());
        map.stats.used -= 1;
        map.stats.free += 1;
        map.check_integrity();
    }

    /// Releases an allocated slot but returns its capacity to the
    /// *reserved* pool, undoing an [`alloc()`](SwapStore::alloc) whose
    /// caller still holds the reservation it converted. Used on failure
    /// paths where the page that would have owned the slot was never
    /// created.
    pub fn free_reserved(&self, addr: SwapAddr) {
        let mut map = self.map.lock();
        map.slots.unmark(addr.slot());
        map.stats.used -= 1;
        map.stats.reserved += 1;
        map.check_integrity();
    }

    /// Returns a snapshot of the slot accounting.
    pub fn stats(&self) -> SwapStats {
        self.map.lock().stats
    }

    fn check_transfer_args(&self, paddr: PhysicalAddress, addr: SwapAddr) {
        assert!(paddr.is_frame_aligned() && paddr.value() != 0);
        let map = self.map.lock();
        assert!(addr.slot() < map.stats.total);
        assert!(
            map.slots.is_set(addr.slot()),
            "swap I/O against unallocated {:?}",
            addr
        );
    }

    /// Reads the slot at `addr` into the frame at `paddr`, blocking until
    /// the transfer completes.
    ///
    /// The caller must hold the frame wired, must hold the paging-giant
    /// lock, and must not hold the frame-table lock. A device failure is
    /// fatal to kernel integrity.
    pub fn read(&self, paddr: PhysicalAddress, addr: SwapAddr) {
        self.check_transfer_args(paddr, addr);
        let mut buf = [0u8; PAGE_SIZE];
        let block_offset = addr.slot() * self.sectors_per_page;
        self.device
            .lock()
            .read_blocks(&mut buf, block_offset)
            .unwrap_or_else(|e| panic!("swap: read of {:?} failed: {}", addr, e));
        self.machine.write_frame(paddr, &buf);
    }

    /// Writes the frame at `paddr` to the slot at `addr`, blocking until
    /// the transfer completes.
    ///
    /// The caller must hold the frame wired, must hold the paging-giant
    /// lock, and must not hold the frame-table lock. A device failure is
    /// fatal to kernel integrity.
    pub fn write(&self, paddr: PhysicalAddress, addr: SwapAddr) {
        self.check_transfer_args(paddr, addr);
        let mut buf = [0u8; PAGE_SIZE];
        self.machine.read_frame(paddr, &mut buf);
        let block_offset = addr.slot() * self.sectors_per_page;
        let mut device = self.device.lock();
        device
            .write_blocks(&buf, block_offset)
            .and_then(|_| device.flush())
            .unwrap_or_else(|e| panic!("swap: write of {:?} failed: {}", addr, e));
    }
}

#[cfg(test)]
mod test {
    use super::block::RamDisk;
    use super::*;
    use machine::MachineConfig;

    fn store(ram_pages: usize, swap_slots: usize) -> SwapStore {
        let machine = Machine::new(MachineConfig {
            ram_pages,
            ..Default::default()
        });
        let device = RamDisk::new(512, swap_slots * PAGE_SIZE / 512);
        SwapStore::bootstrap(machine, Box::new(device), 2).unwrap()
    }

    #[test]
    fn bootstrap_rejects_undersized_device() {
        let machine = Machine::new(MachineConfig {
            ram_pages: 8,
            ..Default::default()
        });
        let device = RamDisk::new(512, 15 * PAGE_SIZE / 512);
        let result = SwapStore::bootstrap(machine, Box::new(device), 2);
        assert!(matches!(result, Err(KernelError::OutOfSwap)));
    }

    #[test]
    fn slot_zero_is_permanently_used() {
        let store = store(4, 16);
        assert_eq!(
            store.stats(),
            SwapStats {
                total: 16,
                free: 15,
                reserved: 0,
                used: 1,
            }
        );
        store.reserve(15).unwrap();
        // All remaining slots reserved; every alloc must skip slot 0.
        for _ in 0..15 {
            assert_ne!(store.alloc().slot(), 0);
        }
    }

    #[test]
    fn reserve_is_denied_when_capacity_is_promised_away() {
        let store = store(4, 16);
        store.reserve(10).unwrap();
        assert_eq!(store.reserve(6), Err(KernelError::OutOfSwap));
        store.unreserve(1);
        store.reserve(6).unwrap();
    }

    #[test]
    fn alloc_and_free_balance_the_books() {
        let store = store(4, 16);
        let before = store.stats();
        store.reserve(2).unwrap();
        let a = store.alloc();
        let b = store.alloc();
        assert_ne!(a, b);
        assert_eq!(
            store.stats(),
            SwapStats {
                total: 16,
                free: 13,
                reserved: 0,
                used: 3,
            }
        );
        store.free(a);
        store.free(b);
        assert_eq!(store.stats(), before);
    }

    #[test]
    fn page_round_trips_through_its_slot() {
        let machine = Machine::new(MachineConfig {
            ram_pages: 8,
            ..Default::default()
        });
        let device = RamDisk::new(512, 16 * PAGE_SIZE / 512);
        let store = SwapStore::bootstrap(machine.clone(), Box::new(device), 2).unwrap();
        store.reserve(1).unwrap();
        let slot = store.alloc();

        let frame = PhysicalAddress::new(PAGE_SIZE);
        let other = PhysicalAddress::new(2 * PAGE_SIZE);
        for i in 0..PAGE_SIZE {
            machine.write_byte(PhysicalAddress::new(frame.value() + i), (i % 251) as u8);
        }
        store.write(frame, slot);
        store.read(other, slot);
        for i in 0..PAGE_SIZE {
            assert_eq!(
                machine.read_byte(PhysicalAddress::new(other.value() + i)),
                (i % 251) as u8
            );
        }
    }
}
