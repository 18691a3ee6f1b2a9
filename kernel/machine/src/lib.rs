//! The simulated board the kernel runs on.
//!
//! This crate stands in for the architecture and platform layer that a real
//! port would supply. It provides, with the same contracts the rest of the
//! kernel would see on hardware:
//!
//! * a bank of RAM with [`ram_bounds()`](Machine::ram_bounds) and a
//!   boot-time [`steal_pages()`](Machine::steal_pages) bump allocator,
//! * one software-managed TLB per CPU, driven through
//!   [`tlb_read()`](Machine::tlb_read) / [`tlb_write()`](Machine::tlb_write) /
//!   [`tlb_probe()`](Machine::tlb_probe),
//! * inter-processor TLB-shootdown interrupts
//!   ([`ipi_tlbshootdown()`](Machine::ipi_tlbshootdown)), delivered to a
//!   per-CPU interrupt context that runs the handler registered at boot,
//! * a seeded pseudo-random source ([`random()`](Machine::random)),
//! * the per-thread interrupt state: the CPU a thread runs on, whether it
//!   is in interrupt context, and the interrupt priority level.
//!
//! Threads participating in the simulation stand in for kernel threads;
//! each one may bind itself to a CPU number with
//! [`bind_current_thread()`](Machine::bind_current_thread) (unbound threads
//! run as CPU 0). Interrupt handlers run on dedicated service threads bound
//! to the target CPU with the in-interrupt flag set, and must never sleep.

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use kernel_config::memory::{NUM_TLB, PAGE_SIZE};
use memory_structs::{PhysicalAddress, VirtualAddress};
use rand_core::{RngCore, SeedableRng};

/// Set in a TLB entry's low word when the entry is valid.
pub const TLBLO_VALID: usize = 1 << 9;
/// Set in a TLB entry's low word when the mapping is writable ("dirty").
pub const TLBLO_DIRTY: usize = 1 << 10;
/// Masks the page-number bits of either TLB word.
pub const TLB_PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// One slot of a CPU's TLB: the virtual page in `hi`, the physical page
/// plus the [`TLBLO_VALID`]/[`TLBLO_DIRTY`] bits in `lo`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbEntry {
    pub hi: usize,
    pub lo: usize,
}

impl TlbEntry {
    /// The invalid entry written to a slot to clear it.
    pub const INVALID: TlbEntry = TlbEntry { hi: 0, lo: 0 };

    /// Returns true if this entry holds a live mapping.
    pub fn is_valid(&self) -> bool {
        self.lo & TLBLO_VALID != 0
    }
}

impl fmt::Debug for TlbEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
            write!(
                f,
                "TlbEntry(v{:#X} -> p{:#X}{})",
                self.hi & TLB_PAGE_MASK,
                self.lo & TLB_PAGE_MASK,
                if self.lo & TLBLO_DIRTY != 0 { ", dirty" } else { "" },
            )
        } else {
            write!(f, "TlbEntry(invalid)")
        }
    }
}

/// The payload of a TLB-shootdown IPI: which TLB slot to invalidate,
/// and which frame-table entry the request is on behalf of.
#[derive(Clone, Copy, Debug)]
pub struct TlbShootdown {
    pub tlb_ix: usize,
    pub cme_ix: usize,
}

/// The handler invoked, in interrupt context on the target CPU, for each
/// TLB-shootdown IPI.
pub type ShootdownHandler = Box<dyn Fn(&TlbShootdown) + Send + Sync>;

/// Boot-time parameters of the simulated board.
#[derive(Clone, Copy, Debug)]
pub struct MachineConfig {
    /// Total RAM size, in pages.
    pub ram_pages: usize,
    /// Pages at the bottom of RAM occupied by the kernel image; the
    /// managed region starts above them. Must be at least 1, so that
    /// physical address 0 is never handed out.
    pub kernel_image_pages: usize,
    /// Number of CPUs.
    pub cpus: u32,
    /// Seed for the board's pseudo-random source.
    pub rng_seed: u64,
}

impl Default for MachineConfig {
    fn default() -> MachineConfig {
        MachineConfig {
            ram_pages: 32,
            kernel_image_pages: 1,
            cpus: 1,
            rng_seed: 0x5eed_1e55,
        }
    }
}

thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
    static IPL: Cell<u32> = const { Cell::new(0) };
}

/// Raises the current thread's interrupt priority level to the maximum,
/// returning a guard that restores it when dropped. TLB instruction
/// sequences must run at raised IPL.
pub fn splhigh() -> SplGuard {
    IPL.with(|ipl| ipl.set(ipl.get() + 1));
    SplGuard { _private: () }
}

/// Returns true if the current thread runs at raised interrupt priority.
pub fn ipl_is_raised() -> bool {
    IPL.with(|ipl| ipl.get() > 0)
}

/// Restores the previous interrupt priority level on drop.
pub struct SplGuard {
    _private: (),
}

impl Drop for SplGuard {
    fn drop(&mut self) {
        IPL.with(|ipl| {
            debug_assert!(ipl.get() > 0);
            ipl.set(ipl.get() - 1);
        });
    }
}

/// One CPU's architectural state: its TLB slots.
struct CpuCore {
    tlb: spin::Mutex<[TlbEntry; NUM_TLB]>,
}

/// A per-CPU interrupt mailbox for pending shootdown requests.
struct Mailbox {
    queue: Mutex<VecDeque<TlbShootdown>>,
    pending: Condvar,
}

/// The interrupt fabric shared between the board and its per-CPU interrupt
/// service threads. Lives in its own `Arc` so the service threads never
/// keep the board itself alive.
struct IrqFabric {
    mailboxes: Vec<Mailbox>,
    handler: spin::Once<ShootdownHandler>,
    shutdown: AtomicBool,
}

impl IrqFabric {
    /// The interrupt service loop for one CPU: drain the mailbox, running
    /// the registered handler in interrupt context, until shutdown.
    fn service(self: Arc<Self>, cpu: u32) {
        CURRENT_CPU.with(|c| c.set(cpu));
        let mailbox = &self.mailboxes[cpu as usize];
        loop {
            let ts = {
                let mut queue = mailbox.queue.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if let Some(ts) = queue.pop_front() {
                        break ts;
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    queue = mailbox
                        .pending
                        .wait(queue)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };
            if let Some(handler) = self.handler.get() {
                IN_INTERRUPT.with(|f| f.set(true));
                handler(&ts);
                IN_INTERRUPT.with(|f| f.set(false));
            } else {
                log::warn!(
                    "cpu{}: dropping shootdown IPI {:?}: no handler registered",
                    cpu,
                    ts
                );
            }
        }
    }
}

/// The simulated board. See the crate documentation for an overview.
pub struct Machine {
    /// All of RAM. Accessed through raw pointers: the frame-granular
    /// accessors require the caller to hold the frame wired (or to be the
    /// only thread that knows about it), exactly as on real hardware,
    /// where nothing polices physical memory access either.
    ram: UnsafeCell<Box<[u8]>>,
    /// The boot bump allocator's next physical address, guarded by its
    /// own little steal lock. Only meaningful until the frame table takes
    /// over the remaining RAM.
    first_free: spin::Mutex<PhysicalAddress>,
    /// One past the last managed physical address.
    last: PhysicalAddress,
    cores: Vec<CpuCore>,
    irq: Arc<IrqFabric>,
    rng: spin::Mutex<rand_chacha::ChaCha20Rng>,
    service_threads: Mutex<Vec<JoinHandle<()>>>,
}

// Safety: the only `!Sync` member is the RAM cell, whose accessors place
// the burden of frame-level exclusion on their callers (documented on each).
unsafe impl Send for Machine {}
unsafe impl Sync for Machine {}

impl Machine {
    /// Powers on a board with the given configuration, spawning one
    /// interrupt service thread per CPU.
    pub fn new(config: MachineConfig) -> Arc<Machine> {
        assert!(config.cpus >= 1, "a board needs at least one CPU");
        assert!(config.cpus <= 64, "at most 64 CPUs are supported");
        assert!(
            config.kernel_image_pages >= 1,
            "physical page 0 must stay unmanaged"
        );
        assert!(
            config.ram_pages > config.kernel_image_pages,
            "no RAM left above the kernel image"
        );

        let irq = Arc::new(IrqFabric {
            mailboxes: (0..config.cpus)
                .map(|_| Mailbox {
                    queue: Mutex::new(VecDeque::new()),
                    pending: Condvar::new(),
                })
                .collect(),
            handler: spin::Once::new(),
            shutdown: AtomicBool::new(false),
        });

        let machine = Arc::new(Machine {
            ram: UnsafeCell::new(vec![0u8; config.ram_pages * PAGE_SIZE].into_boxed_slice()),
            first_free: spin::Mutex::new(PhysicalAddress::new(
                config.kernel_image_pages * PAGE_SIZE,
            )),
            last: PhysicalAddress::new(config.ram_pages * PAGE_SIZE),
            cores: (0..config.cpus)
                .map(|_| CpuCore {
                    tlb: spin::Mutex::new([TlbEntry::INVALID; NUM_TLB]),
                })
                .collect(),
            irq: irq.clone(),
            rng: spin::Mutex::new(rand_chacha::ChaCha20Rng::seed_from_u64(config.rng_seed)),
            service_threads: Mutex::new(Vec::new()),
        });

        let mut threads = machine.service_threads.lock().unwrap();
        for cpu in 0..config.cpus {
            let irq = irq.clone();
            let handle = thread::Builder::new()
                .name(format!("cpu{}-irq", cpu))
                .spawn(move || irq.service(cpu))
                .expect("could not spawn interrupt service thread");
            threads.push(handle);
        }
        drop(threads);

        log::debug!(
            "machine: {} pages of RAM ({} reserved for the kernel image), {} cpu(s)",
            config.ram_pages,
            config.kernel_image_pages,
            config.cpus
        );
        machine
    }

    /// Returns the physical addresses delimiting the RAM not occupied by
    /// the kernel image or boot-time steal allocations: everything in
    /// `[first, last)` is up for grabs.
    pub fn ram_bounds(&self) -> (PhysicalAddress, PhysicalAddress) {
        (*self.first_free.lock(), self.last)
    }

    /// Returns the total RAM size in bytes.
    pub fn ram_size(&self) -> usize {
        self.last.value()
    }

    /// The boot bump allocator: permanently claims `npages` contiguous
    /// pages from the bottom of the unclaimed region. Memory obtained this
    /// way is never tracked and never freed; it must only be used before
    /// the frame table takes ownership of the remaining RAM.
    pub fn steal_pages(&self, npages: usize) -> PhysicalAddress {
        let mut first = self.first_free.lock();
        let stolen = *first;
        let new_first = PhysicalAddress::new(stolen.value() + npages * PAGE_SIZE);
        assert!(
            new_first.value() <= self.last.value(),
            "steal_pages({}): out of boot memory",
            npages
        );
        *first = new_first;
        stolen
    }

    /// Returns the number of CPUs on this board.
    pub fn num_cpus(&self) -> u32 {
        self.cores.len() as u32
    }

    /// Binds the calling thread to the given CPU number: subsequent TLB
    /// operations from this thread touch that CPU's TLB, and
    /// [`current_cpu()`](Machine::current_cpu) reports it.
    pub fn bind_current_thread(&self, cpu: u32) {
        assert!((cpu as usize) < self.cores.len(), "no such cpu: {}", cpu);
        CURRENT_CPU.with(|c| c.set(cpu));
    }

    /// Returns the CPU number the calling thread is bound to.
    pub fn current_cpu(&self) -> u32 {
        let cpu = CURRENT_CPU.with(|c| c.get());
        debug_assert!((cpu as usize) < self.cores.len());
        cpu
    }

    /// Returns true if the calling thread is in interrupt context.
    /// Code that may sleep must not run when this is set.
    pub fn in_interrupt() -> bool {
        IN_INTERRUPT.with(|f| f.get())
    }

    /// Returns the next value from the board's pseudo-random source.
    pub fn random(&self) -> u32 {
        self.rng.lock().next_u32()
    }

    fn current_core(&self) -> &CpuCore {
        &self.cores[self.current_cpu() as usize]
    }

    /// Reads the given TLB slot of the current CPU.
    pub fn tlb_read(&self, slot: usize) -> TlbEntry {
        debug_assert!(ipl_is_raised(), "TLB access below raised IPL");
        assert!(slot < NUM_TLB);
        self.current_core().tlb.lock()[slot]
    }

    /// Writes the given TLB slot of the current CPU.
    pub fn tlb_write(&self, slot: usize, entry: TlbEntry) {
        debug_assert!(ipl_is_raised(), "TLB access below raised IPL");
        assert!(slot < NUM_TLB);
        self.current_core().tlb.lock()[slot] = entry;
    }

    /// Probes the current CPU's TLB for a valid entry matching the page
    /// of `vaddr`, returning its slot index.
    pub fn tlb_probe(&self, vaddr: VirtualAddress) -> Option<usize> {
        debug_assert!(ipl_is_raised(), "TLB access below raised IPL");
        let vpage = vaddr.value() & TLB_PAGE_MASK;
        let tlb = self.current_core().tlb.lock();
        tlb.iter()
            .position(|entry| entry.is_valid() && entry.hi & TLB_PAGE_MASK == vpage)
    }

    /// Registers the handler run, in interrupt context on the target CPU,
    /// for each TLB-shootdown IPI. May only be called once, at boot.
    pub fn set_shootdown_handler(&self, handler: ShootdownHandler) {
        let mut installed = false;
        self.irq.handler.call_once(|| {
            installed = true;
            handler
        });
        assert!(installed, "shootdown handler registered twice");
    }

    /// Sends a TLB-shootdown IPI to the given CPU. Returns immediately;
    /// the target CPU services the request asynchronously.
    pub fn ipi_tlbshootdown(&self, cpu: u32, ts: TlbShootdown) {
        let mailbox = &self.irq.mailboxes[cpu as usize];
        mailbox
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(ts);
        mailbox.pending.notify_one();
        log::trace!("ipi: shootdown {:?} sent to cpu{}", ts, cpu);
    }

    fn frame_ptr(&self, paddr: PhysicalAddress) -> *mut u8 {
        assert!(paddr.is_frame_aligned(), "unaligned frame address {}", paddr);
        assert!(
            paddr.value() != 0 && paddr.value() + PAGE_SIZE <= self.last.value(),
            "frame address {} outside RAM",
            paddr
        );
        // Safety: in bounds per the assertion above.
        unsafe { (*self.ram.get()).as_mut_ptr().add(paddr.value()) }
    }

    /// Fills the frame at `paddr` with zero bytes.
    ///
    /// The caller must hold exclusive access to the frame (wired and owned).
    pub fn zero_frame(&self, paddr: PhysicalAddress) {
        unsafe { core::ptr::write_bytes(self.frame_ptr(paddr), 0, PAGE_SIZE) };
    }

    /// Copies one page of bytes from the frame at `src` to the frame at
    /// `dst`. The caller must hold exclusive access to both frames.
    pub fn copy_frame(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        assert!(src != dst);
        unsafe {
            core::ptr::copy_nonoverlapping(self.frame_ptr(src), self.frame_ptr(dst), PAGE_SIZE)
        };
    }

    /// Copies the frame at `paddr` into `buf` (one page long).
    /// The caller must hold the frame wired.
    pub fn read_frame(&self, paddr: PhysicalAddress, buf: &mut [u8]) {
        assert_eq!(buf.len(), PAGE_SIZE);
        unsafe { core::ptr::copy_nonoverlapping(self.frame_ptr(paddr), buf.as_mut_ptr(), PAGE_SIZE) };
    }

    /// Copies `buf` (one page long) into the frame at `paddr`.
    /// The caller must hold the frame wired.
    pub fn write_frame(&self, paddr: PhysicalAddress, buf: &[u8]) {
        assert_eq!(buf.len(), PAGE_SIZE);
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), self.frame_ptr(paddr), PAGE_SIZE) };
    }

    /// Loads one byte of physical memory, standing in for a user-mode load
    /// through an established mapping.
    pub fn read_byte(&self, paddr: PhysicalAddress) -> u8 {
        let page = paddr.align_down_to_frame();
        unsafe { *self.frame_ptr(page).add(paddr.frame_offset()) }
    }

    /// Stores one byte of physical memory, standing in for a user-mode
    /// store through an established mapping.
    pub fn write_byte(&self, paddr: PhysicalAddress, value: u8) {
        let page = paddr.align_down_to_frame();
        unsafe { *self.frame_ptr(page).add(paddr.frame_offset()) = value };
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.irq.shutdown.store(true, Ordering::Release);
        for mailbox in &self.irq.mailboxes {
            mailbox.pending.notify_all();
        }
        let threads = core::mem::take(&mut *self.service_threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_machine() -> Arc<Machine> {
        Machine::new(MachineConfig {
            ram_pages: 8,
            kernel_image_pages: 1,
            cpus: 2,
            rng_seed: 42,
        })
    }

    #[test]
    fn steal_advances_bounds() {
        let m = small_machine();
        let (first, last) = m.ram_bounds();
        assert_eq!(first.value(), PAGE_SIZE);
        assert_eq!(last.value(), 8 * PAGE_SIZE);
        let stolen = m.steal_pages(2);
        assert_eq!(stolen, first);
        assert_eq!(m.ram_bounds().0.value(), 3 * PAGE_SIZE);
    }

    #[test]
    fn frame_copy_and_zero() {
        let m = small_machine();
        let a = PhysicalAddress::new(PAGE_SIZE);
        let b = PhysicalAddress::new(2 * PAGE_SIZE);
        m.write_byte(PhysicalAddress::new(PAGE_SIZE + 7), 0xAB);
        m.copy_frame(a, b);
        assert_eq!(m.read_byte(PhysicalAddress::new(2 * PAGE_SIZE + 7)), 0xAB);
        m.zero_frame(b);
        assert_eq!(m.read_byte(PhysicalAddress::new(2 * PAGE_SIZE + 7)), 0);
    }

    #[test]
    fn tlb_probe_finds_valid_entries_only() {
        let m = small_machine();
        let _spl = splhigh();
        let vaddr = VirtualAddress::new(0x4000_0000);
        assert_eq!(m.tlb_probe(vaddr), None);
        m.tlb_write(
            3,
            TlbEntry {
                hi: vaddr.value(),
                lo: PAGE_SIZE | TLBLO_VALID,
            },
        );
        assert_eq!(m.tlb_probe(vaddr), Some(3));
        m.tlb_write(3, TlbEntry::INVALID);
        assert_eq!(m.tlb_probe(vaddr), None);
    }

    #[test]
    fn tlbs_are_per_cpu() {
        let m = small_machine();
        let _spl = splhigh();
        let vaddr = VirtualAddress::new(0x1000_0000);
        m.bind_current_thread(1);
        m.tlb_write(
            0,
            TlbEntry {
                hi: vaddr.value(),
                lo: 2 * PAGE_SIZE | TLBLO_VALID,
            },
        );
        assert_eq!(m.tlb_probe(vaddr), Some(0));
        m.bind_current_thread(0);
        assert_eq!(m.tlb_probe(vaddr), None);
    }

    #[test]
    fn shootdown_ipi_reaches_handler_on_target_cpu() {
        let m = small_machine();
        static HITS: AtomicUsize = AtomicUsize::new(0);
        m.set_shootdown_handler(Box::new(|ts| {
            assert!(Machine::in_interrupt());
            assert_eq!(ts.tlb_ix, 5);
            assert_eq!(ts.cme_ix, 9);
            HITS.fetch_add(1, Ordering::SeqCst);
        }));
        m.ipi_tlbshootdown(1, TlbShootdown { tlb_ix: 5, cme_ix: 9 });
        while HITS.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
    }

    #[test]
    fn random_is_deterministic_per_seed() {
        let a = small_machine();
        let b = small_machine();
        let seq_a: Vec<u32> = (0..4).map(|_| a.random()).collect();
        let seq_b: Vec<u32> = (0..4).map(|_| b.random()).collect();
        assert_eq!(seq_a, seq_b);
    }
}
