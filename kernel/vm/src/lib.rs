//! The virtual-memory core.
//!
//! This crate owns the three mutually-entangled pieces of the paging
//! system and the locks that keep them coherent:
//!
//! * the [`coremap`]: one entry per managed physical frame, tracking the
//!   owning logical page, the frame's live TLB slot and CPU, and its
//!   allocated/wired/kernel bits, all under a single spinlock;
//! * the TLB layer: installing, probing and invalidating hardware
//!   mappings, including cross-CPU shootdowns, always under the frame-table
//!   lock so the reverse mapping (frame -> TLB slot, CPU) stays exact;
//! * the logical page ([`VmPage`]): a page-sized unit of user memory whose
//!   contents alternate between a physical frame and its permanently-owned
//!   swap slot, guarded by a per-page sleeping lock.
//!
//! Everything hangs off a single [`Vm`] context created by
//! [`Vm::bootstrap()`]: the frame table, the swap store, the paging-giant
//! lock that serializes swap I/O, and the transit wait channel that readers
//! of an in-flight page sleep on. The context is passed explicitly instead
//! of living in globals, so several simulated boards can coexist (notably
//! in tests).
//!
//! Lock order, outermost first: paging-giant lock, then one page lock,
//! then the frame-table spinlock, then the swap-store lock. The spinlock
//! is always released before anything that can sleep; the wait channels
//! (`wire`, `shootdown`, `transit`) are used with the strict two-phase
//! sleep protocol of the `wait_channel` crate.

#[macro_use]
extern crate log;

mod coremap;
mod page;
mod tlb;

pub use coremap::CoremapStats;
pub use page::VmPage;

use std::sync::Arc;

use kernel_error::KernelError;
use machine::{Machine, TlbShootdown};
use memory_structs::{PhysicalAddress, VirtualAddress};
use swap_store::{SwapDevice, SwapStore};
use wait_channel::{SleepMutex, SleepMutexGuard, WaitChannel};

use coremap::Coremap;

/// The kind of a user memory fault, as reported by the trap path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultType {
    /// A load from an unmapped page.
    Read,
    /// A store to an unmapped page.
    Write,
    /// A store to a page whose TLB entry is installed read-only.
    /// The fault path re-installs the mapping writable.
    ReadOnly,
}

impl TryFrom<u32> for FaultType {
    type Error = KernelError;

    /// Decodes the raw fault code delivered by the trap handler.
    fn try_from(code: u32) -> Result<FaultType, KernelError> {
        match code {
            0 => Ok(FaultType::Read),
            1 => Ok(FaultType::Write),
            2 => Ok(FaultType::ReadOnly),
            _ => Err(KernelError::BadArgument),
        }
    }
}

/// The kernel-wide virtual-memory context. See the crate documentation.
pub struct Vm {
    machine: Arc<Machine>,
    pub(crate) coremap: Coremap,
    swap: SwapStore,
    /// Serializes swap I/O against eviction-triggered allocation at the
    /// coarsest level. Taken around every swap read and write, after all
    /// page locks are released (asserted) and before the frame-table lock.
    paging_giant: SleepMutex<()>,
    /// Slept on by threads that find a page mid-transfer (`in_transit`).
    pub(crate) wc_transit: WaitChannel,
}

impl Vm {
    /// Brings up the paging system on `machine`, backed by `swap_device`:
    /// takes over all unclaimed RAM as the frame table's managed frames
    /// (stealing the table's own storage first), opens the swap store
    /// (refusing to boot if the device is smaller than `swap_min_factor`
    /// times RAM), and registers the TLB-shootdown interrupt handler.
    pub fn bootstrap(
        machine: Arc<Machine>,
        swap_device: Box<dyn SwapDevice>,
        swap_min_factor: usize,
    ) -> Result<Arc<Vm>, KernelError> {
        let coremap = Coremap::bootstrap(machine.clone());
        let swap = SwapStore::bootstrap(machine.clone(), swap_device, swap_min_factor)?;
        let vm = Arc::new(Vm {
            machine: machine.clone(),
            coremap,
            swap,
            paging_giant: SleepMutex::new(()),
            wc_transit: WaitChannel::new("vm_transit"),
        });

        let weak = Arc::downgrade(&vm);
        machine.set_shootdown_handler(Box::new(move |ts| {
            if let Some(vm) = weak.upgrade() {
                vm.tlb_shootdown(ts);
            }
        }));

        debug!("vm: bootstrap complete, {:?}", vm.coremap_stats());
        Ok(vm)
    }

    /// Returns the board this context runs on.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Returns the swap store.
    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Returns a snapshot of the frame-table counters.
    pub fn coremap_stats(&self) -> CoremapStats {
        self.coremap.stats()
    }

    /// Returns the number of page evictions performed since boot.
    /// Diagnostic only.
    pub fn eviction_count(&self) -> usize {
        self.coremap.eviction_count()
    }

    /// Acquires the paging-giant lock. A thread may not already hold a
    /// page lock when it blocks here, except on the clone path, or the
    /// fault path could deadlock against itself.
    pub(crate) fn lock_paging_giant(&self) -> SleepMutexGuard<'_, ()> {
        page::assert_may_take_paging_giant();
        self.paging_giant.lock()
    }

    /// Allocates `npages` of kernel memory, contiguous in physical memory,
    /// and returns its kernel virtual address. Returns `None` when no
    /// frames can be produced (see [`CoremapStats`] for the policy).
    pub fn alloc_kpages(&self, npages: usize) -> Option<VirtualAddress> {
        let paddr = if npages > 1 {
            self.coremap.alloc_multipages(self, npages)
        } else {
            self.coremap.alloc(self, None, false)
        }?;
        Some(paddr.to_kernel_vaddr())
    }

    /// Frees a kernel allocation made by
    /// [`alloc_kpages()`](Vm::alloc_kpages), walking the whole
    /// multi-page run it starts.
    pub fn free_kpages(&self, vaddr: VirtualAddress) {
        self.coremap.free(vaddr.to_physical(), true);
    }

    /// Installs a TLB mapping from `vaddr` to `paddr` on the current CPU.
    /// The caller must hold the frame wired.
    pub fn map(&self, vaddr: VirtualAddress, paddr: PhysicalAddress, writable: bool) {
        self.coremap.tlb_install(vaddr, paddr, writable);
    }

    /// Removes the current CPU's TLB mapping for `vaddr`, if any.
    pub fn unmap(&self, vaddr: VirtualAddress) {
        self.coremap.tlb_unmap(vaddr);
    }

    /// Translates `vaddr` through the current CPU's TLB the way a user
    /// load would, returning the physical address and writability.
    pub fn lookup_mapping(&self, vaddr: VirtualAddress) -> Option<(PhysicalAddress, bool)> {
        self.coremap.tlb_lookup(vaddr)
    }

    /// Invalidates every entry of the current CPU's TLB.
    /// Called on address-space activation and context switch.
    pub fn tlb_clear(&self) {
        self.coremap.tlb_clear_current_cpu();
    }

    /// The TLB-shootdown interrupt handler: invalidates the slot named by
    /// `ts` if the frame still points at this CPU, and wakes any thread
    /// waiting for the shootdown to land.
    pub fn tlb_shootdown(&self, ts: &TlbShootdown) {
        self.coremap.handle_shootdown(ts);
    }

    /// Clears the local TLB entirely and wakes shootdown waiters.
    pub fn tlb_shootdown_all(&self) {
        self.coremap.shootdown_all();
    }
}
