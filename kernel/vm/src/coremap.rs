//! The coremap: the table of all managed physical frames.
//!
//! One [`CoremapEntry`] exists per frame of RAM above the kernel image and
//! the table's own storage. A single non-sleeping spinlock guards the
//! table, every per-frame field, and the global counters; it is released
//! before anything that can sleep, and the eviction path releases and
//! reacquires it around the victim's swap-out.
//!
//! Allocation policy: prefer the highest-indexed free frame; when none is
//! free (and the caller is not an interrupt handler), page replacement
//! produces one by evicting a pageable frame, preferring frames with no
//! live TLB mapping and otherwise picking pseudo-randomly. Frames that are
//! wired or kernel-owned are never eviction victims.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use kernel_config::memory::PAGE_SIZE;
use machine::{Machine, TlbShootdown};
use memory_structs::{Frame, PhysicalAddress};
use static_assertions::const_assert;
use wait_channel::WaitChannel;

use crate::page::VmPage;
use crate::Vm;

bitflags! {
    /// The per-frame state bits of a [`CoremapEntry`].
    pub(crate) struct CmeFlags: u8 {
        /// The frame is allocated.
        const ALLOC      = 0x01;
        /// The frame belongs to the kernel and is never evicted.
        const KERNEL     = 0x02;
        /// The frame is pinned: exempt from eviction and from free-scans
        /// until unwired.
        const WIRED      = 0x04;
        /// The final frame of a contiguous multi-page allocation;
        /// free walks stop here.
        const LAST       = 0x08;
        /// Claimed by an in-progress multi-page allocation. Kept for
        /// compatibility with the on-frame layout; never set.
        const DESIRED    = 0x10;
        /// Touched since allocation. Maintained but not consulted by the
        /// replacement policy.
        const REFERENCED = 0x20;
    }
}

/// No live TLB mapping for this frame.
const NO_TLB_IX: i16 = -1;

/// One managed physical frame.
pub(crate) struct CoremapEntry {
    /// The logical page resident here, if any. A weak back-pointer:
    /// consulted only under the table lock and re-validated against the
    /// page's own `paddr` before use.
    page: Option<Weak<VmPage>>,
    /// The TLB slot holding a live mapping of this frame, or [`NO_TLB_IX`].
    tlb_ix: i16,
    /// The CPU whose TLB holds that mapping; 0 when there is none.
    cpu: u16,
    flags: CmeFlags,
}

const_assert!(core::mem::size_of::<CoremapEntry>() <= 32);

impl CoremapEntry {
    const fn new() -> CoremapEntry {
        CoremapEntry {
            page: None,
            tlb_ix: NO_TLB_IX,
            cpu: 0,
            flags: CmeFlags::empty(),
        }
    }

    pub(crate) fn tlb_slot(&self) -> Option<usize> {
        (self.tlb_ix != NO_TLB_IX).then_some(self.tlb_ix as usize)
    }

    pub(crate) fn set_tlb_slot(&mut self, slot: usize, cpu: u32) {
        self.tlb_ix = slot as i16;
        self.cpu = cpu as u16;
    }

    pub(crate) fn clear_tlb_slot(&mut self) {
        self.tlb_ix = NO_TLB_IX;
        self.cpu = 0;
    }

    pub(crate) fn mapped_cpu(&self) -> u32 {
        self.cpu as u32
    }

    pub(crate) fn is_wired(&self) -> bool {
        self.flags.contains(CmeFlags::WIRED)
    }

    fn is_free(&self) -> bool {
        !self.flags.contains(CmeFlags::ALLOC)
    }

    /// A frame may be chosen for eviction only if it is neither wired
    /// nor kernel-owned.
    fn is_pageable(&self) -> bool {
        !self.flags.intersects(CmeFlags::WIRED | CmeFlags::KERNEL)
    }
}

/// The global frame counters. `total = kpages + upages + free` holds at
/// every release of the table lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoremapStats {
    /// The frame number of the first managed frame.
    pub base: usize,
    /// The number of managed frames.
    pub total: usize,
    /// Frames allocated to the kernel.
    pub kpages: usize,
    /// Frames allocated to user logical pages.
    pub upages: usize,
    /// Unallocated frames.
    pub free: usize,
}

pub(crate) struct CoremapInner {
    pub(crate) entries: Box<[CoremapEntry]>,
    stats: CoremapStats,
}

pub(crate) type CoremapGuard<'a> = spin::MutexGuard<'a, CoremapInner>;

impl CoremapInner {
    pub(crate) fn paddr_to_index(&self, paddr: PhysicalAddress) -> usize {
        assert!(paddr.is_frame_aligned(), "misaligned frame {}", paddr);
        let frame = Frame::containing_address(paddr).number();
        assert!(
            frame >= self.stats.base && frame - self.stats.base < self.stats.total,
            "{} is not a managed frame",
            paddr
        );
        frame - self.stats.base
    }

    pub(crate) fn index_to_paddr(&self, ix: usize) -> PhysicalAddress {
        assert!(ix < self.stats.total);
        PhysicalAddress::new((self.stats.base + ix) * PAGE_SIZE)
    }

    fn check_integrity(&self) {
        assert_eq!(
            self.stats.total,
            self.stats.kpages + self.stats.upages + self.stats.free,
            "frame accounting out of balance: {:?}",
            self.stats
        );
    }

    /// Scores a candidate window for a multi-page allocation: the number
    /// of free frames in it, or `None` if any frame in it may not be
    /// evicted (wired or kernel).
    fn rank_window(&self, base: usize, npages: usize) -> Option<usize> {
        let mut free = 0;
        for entry in &self.entries[base..base + npages] {
            if !entry.is_pageable() {
                return None;
            }
            if entry.is_free() {
                free += 1;
            }
        }
        Some(free)
    }

    /// Finds the window of `npages` frames needing the fewest evictions,
    /// considering only windows made entirely of pageable frames.
    fn find_best_window(&self, npages: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for base in 0..=(self.stats.total - npages) {
            if let Some(score) = self.rank_window(base, npages) {
                if best.map_or(true, |(best_score, _)| score > best_score) {
                    best = Some((score, base));
                }
            }
        }
        best.map(|(_, base)| base)
    }

    /// The cheapest possible victim: a pageable frame with no live TLB
    /// mapping anywhere.
    fn find_pageable_unmapped(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.is_pageable() && e.tlb_slot().is_none())
    }

    /// Marks `[start, start+num)` allocated, tagging the final frame as
    /// the end of the run, and updates the counters.
    fn mark_allocated(&mut self, start: usize, num: usize, wired: bool, is_kernel: bool) {
        for entry in &mut self.entries[start..start + num] {
            assert!(entry.is_free());
            assert!(!entry.flags.contains(CmeFlags::WIRED));

            let mut flags = CmeFlags::ALLOC | CmeFlags::REFERENCED;
            flags.set(CmeFlags::WIRED, wired);
            flags.set(CmeFlags::KERNEL, is_kernel);
            entry.flags = flags;
        }
        self.entries[start + num - 1].flags.insert(CmeFlags::LAST);

        if is_kernel {
            self.stats.kpages += num;
        } else {
            self.stats.upages += num;
        }
        self.stats.free -= num;
        self.check_integrity();
    }
}

/// The frame table. See the module documentation.
pub(crate) struct Coremap {
    pub(crate) machine: Arc<Machine>,
    inner: spin::Mutex<CoremapInner>,
    /// Slept on by threads waiting for some frame's wired bit to clear.
    wc_wire: WaitChannel,
    /// Slept on by threads waiting for a remote CPU to acknowledge a
    /// TLB shootdown.
    pub(crate) wc_shootdown: WaitChannel,
    /// Counts evictions, for tests and diagnostics.
    evictions: AtomicUsize,
}

impl Coremap {
    /// Takes over all unclaimed RAM: steals the table's own storage from
    /// the bottom of the unclaimed region, then installs one entry per
    /// remaining frame.
    pub(crate) fn bootstrap(machine: Arc<Machine>) -> Coremap {
        let (first, last) = machine.ram_bounds();
        let provisional_frames = (last.value() - first.value()) / PAGE_SIZE;

        // The table itself would live in stolen physical memory on real
        // hardware; steal the pages it would occupy so they are never
        // managed, then size the table for what is left.
        let table_bytes = provisional_frames * core::mem::size_of::<CoremapEntry>();
        machine.steal_pages(table_bytes.div_ceil(PAGE_SIZE));

        let (first, last) = machine.ram_bounds();
        let base = first.value() / PAGE_SIZE;
        let total = last.value() / PAGE_SIZE - base;
        assert!(total > 0, "no managed frames left after bootstrap");

        let entries = (0..total).map(|_| CoremapEntry::new()).collect();
        let stats = CoremapStats {
            base,
            total,
            kpages: 0,
            upages: 0,
            free: total,
        };
        debug!("coremap: managing {} frames starting at frame {}", total, base);

        Coremap {
            machine,
            inner: spin::Mutex::new(CoremapInner { entries, stats }),
            wc_wire: WaitChannel::new("coremap_wire"),
            wc_shootdown: WaitChannel::new("coremap_shootdown"),
            evictions: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> CoremapGuard<'_> {
        self.inner.lock()
    }

    pub(crate) fn stats(&self) -> CoremapStats {
        let inner = self.inner.lock();
        inner.check_integrity();
        inner.stats
    }

    /// Returns the number of evictions performed since boot.
    pub(crate) fn eviction_count(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Allocates one frame, owned by `owner` (a kernel frame if `None`).
    ///
    /// Policy: take the highest-indexed free frame; with none free, evict
    /// (never from interrupt context). Returns `None` only when no frame
    /// can be produced.
    pub(crate) fn alloc(
        &self,
        vm: &Vm,
        owner: Option<&Arc<VmPage>>,
        wired: bool,
    ) -> Option<PhysicalAddress> {
        let mut inner = self.inner.lock();

        // Highest free frame first. A free frame can be transiently wired
        // by a thread re-validating a stale wire; such frames are exempt
        // from the scan, and if they were the only free frames we sleep
        // until a wire drops rather than evicting with memory to spare.
        let mut ix = None;
        while inner.stats.free > 0 {
            ix = (0..inner.stats.total)
                .rev()
                .find(|&i| inner.entries[i].is_free() && !inner.entries[i].is_wired());
            if ix.is_some() || Machine::in_interrupt() {
                break;
            }
            inner = self.wire_wait(inner);
        }

        if ix.is_none() {
            if Machine::in_interrupt() {
                warn!("coremap: allocation in interrupt context with no free frame");
                return None;
            }
            let (reacquired, victim) = self.page_replace(vm, inner);
            inner = reacquired;
            ix = victim;
        }

        let ix = match ix {
            Some(ix) => ix,
            None => {
                warn!("coremap: out of memory: no free and no pageable frame");
                return None;
            }
        };

        inner.mark_allocated(ix, 1, wired, owner.is_none());
        assert!(inner.entries[ix].page.is_none());
        inner.entries[ix].page = owner.map(Arc::downgrade);
        Some(inner.index_to_paddr(ix))
    }

    /// Allocates `npages` physically-contiguous kernel frames, evicting
    /// whatever pageable frames occupy the chosen window. Fails when no
    /// window consists solely of pageable frames, or when eviction would
    /// be needed in interrupt context.
    pub(crate) fn alloc_multipages(&self, vm: &Vm, npages: usize) -> Option<PhysicalAddress> {
        assert!(npages >= 1);
        let mut inner = self.inner.lock();
        if npages > inner.stats.total {
            return None;
        }

        let base = match inner.find_best_window(npages) {
            Some(base) => base,
            None => {
                warn!("coremap: no {}-frame window is entirely pageable", npages);
                return None;
            }
        };

        // Clear out the window. Each eviction drops and retakes the table
        // lock, so the window is re-inspected as we go.
        for ix in base..base + npages {
            if !inner.entries[ix].is_free() {
                if Machine::in_interrupt() {
                    return None;
                }
                inner = self.evict_frame(vm, inner, ix);
            }
        }

        inner.mark_allocated(base, npages, false, true);
        Some(inner.index_to_paddr(base))
    }

    /// Frees the allocation run starting at `paddr`: walks forward until
    /// (and including) the frame marked as the run's last, releasing each
    /// frame, dropping any live local TLB mapping, and waking wire-waiters.
    pub(crate) fn free(&self, paddr: PhysicalAddress, is_kernel: bool) {
        let mut inner = self.inner.lock();
        let start = inner.paddr_to_index(paddr);

        for ix in start..inner.stats.total {
            let (slot, mapped_cpu) = {
                let entry = &inner.entries[ix];
                assert!(entry.flags.contains(CmeFlags::ALLOC));
                assert!(
                    entry.flags.contains(CmeFlags::WIRED) || is_kernel,
                    "freeing an unwired user frame"
                );
                (entry.tlb_slot(), entry.mapped_cpu())
            };

            if let Some(slot) = slot {
                assert_eq!(
                    mapped_cpu,
                    self.machine.current_cpu(),
                    "freeing a frame still mapped on another cpu"
                );
                self.tlb_invalidate_locked(&mut inner, slot);
            }

            let entry = &mut inner.entries[ix];
            let was_kernel = entry.flags.contains(CmeFlags::KERNEL);
            let was_last = entry.flags.contains(CmeFlags::LAST);
            entry.page = None;
            entry.flags = CmeFlags::empty();

            if was_kernel {
                inner.stats.kpages -= 1;
            } else {
                inner.stats.upages -= 1;
            }
            inner.stats.free += 1;
            inner.check_integrity();

            // Anyone blocked trying to wire this frame can now retry.
            self.wc_wire.wake_all();

            if was_last {
                return;
            }
        }
        panic!("free({}) ran off the end of the coremap", paddr);
    }

    /// Blocks until the frame at `paddr` is unwired, then wires it.
    pub(crate) fn wire(&self, paddr: PhysicalAddress) {
        let mut inner = self.inner.lock();
        let ix = inner.paddr_to_index(paddr);
        while inner.entries[ix].flags.contains(CmeFlags::WIRED) {
            inner = self.wire_wait(inner);
        }
        inner.entries[ix].flags.insert(CmeFlags::WIRED);
    }

    /// Unwires the frame at `paddr` and wakes threads waiting to wire it.
    pub(crate) fn unwire(&self, paddr: PhysicalAddress) {
        let mut inner = self.inner.lock();
        let ix = inner.paddr_to_index(paddr);
        assert!(inner.entries[ix].flags.contains(CmeFlags::WIRED));
        inner.entries[ix].flags.remove(CmeFlags::WIRED);
        self.wc_wire.wake_all();
    }

    /// Returns true if the frame at `paddr` is currently wired.
    pub(crate) fn is_wired(&self, paddr: PhysicalAddress) -> bool {
        let inner = self.inner.lock();
        let ix = inner.paddr_to_index(paddr);
        inner.entries[ix].flags.contains(CmeFlags::WIRED)
    }

    /// Fills the frame at `paddr` with zeroes. The caller must hold it
    /// wired.
    pub(crate) fn zero(&self, paddr: PhysicalAddress) {
        assert!(self.is_wired(paddr));
        self.machine.zero_frame(paddr);
    }

    /// Copies one page of bytes between frames. The caller must hold both
    /// frames wired.
    pub(crate) fn clone_frame(&self, source: PhysicalAddress, target: PhysicalAddress) {
        assert!(self.is_wired(source));
        assert!(self.is_wired(target));
        self.machine.copy_frame(source, target);
    }

    /// The sleep half of [`wire()`](Coremap::wire): releases the table
    /// lock, sleeps on the wire channel, reacquires the lock.
    fn wire_wait<'a>(&'a self, guard: CoremapGuard<'a>) -> CoremapGuard<'a> {
        let sleeper = self.wc_wire.lock();
        drop(guard);
        sleeper.sleep();
        self.inner.lock()
    }

    /// Releases the table lock, sleeps until a shootdown acknowledgement
    /// arrives, reacquires the lock.
    pub(crate) fn shootdown_wait<'a>(&'a self, guard: CoremapGuard<'a>) -> CoremapGuard<'a> {
        let sleeper = self.wc_shootdown.lock();
        drop(guard);
        sleeper.sleep();
        self.inner.lock()
    }

    /// Picks a victim and evicts it, producing a free frame.
    /// Returns `None` (leaving the table untouched) when nothing is
    /// pageable, which the reservation policy should make unreachable.
    fn page_replace<'a>(
        &'a self,
        vm: &Vm,
        inner: CoremapGuard<'a>,
    ) -> (CoremapGuard<'a>, Option<usize>) {
        assert_eq!(inner.stats.free, 0);

        let victim = inner.find_pageable_unmapped().or_else(|| {
            let total = inner.stats.total;
            let start = self.machine.random() as usize % total;
            (start..total)
                .chain(0..start)
                .find(|&i| inner.entries[i].is_pageable())
        });
        let Some(ix) = victim else {
            return (inner, None);
        };

        assert!(inner.entries[ix].is_pageable());
        assert!(inner.entries[ix].flags.contains(CmeFlags::ALLOC));
        assert!(inner.entries[ix].page.is_some());

        let inner = self.evict_frame(vm, inner, ix);
        (inner, Some(ix))
    }

    /// Evicts the resident page of frame `ix`:
    /// wires the frame so nothing else touches it, clears any live TLB
    /// mapping (shooting down a remote CPU's entry and waiting for the
    /// acknowledgement if need be), then, with the table lock dropped and
    /// the paging-giant lock held, writes the page out through its owner.
    /// Finally reclaims the frame and wakes wire-waiters.
    fn evict_frame<'a>(
        &'a self,
        vm: &Vm,
        mut inner: CoremapGuard<'a>,
        ix: usize,
    ) -> CoremapGuard<'a> {
        assert!(inner.entries[ix].flags.contains(CmeFlags::ALLOC));
        assert!(inner.entries[ix].is_pageable());
        assert!(inner.entries[ix].page.is_some());

        // Pin the frame across the sleeps below.
        inner.entries[ix].flags.insert(CmeFlags::WIRED);

        if let Some(slot) = inner.entries[ix].tlb_slot() {
            let mapped_cpu = inner.entries[ix].mapped_cpu();
            if mapped_cpu != self.machine.current_cpu() {
                let ts = TlbShootdown {
                    tlb_ix: slot,
                    cme_ix: ix,
                };
                self.machine.ipi_tlbshootdown(mapped_cpu, ts);
                while inner.entries[ix].tlb_slot().is_some() {
                    inner = self.shootdown_wait(inner);
                }
            } else {
                self.tlb_invalidate_locked(&mut inner, slot);
            }
        }

        assert!(inner.entries[ix].flags.contains(CmeFlags::WIRED));
        assert!(inner.entries[ix].tlb_slot().is_none());
        assert_eq!(inner.entries[ix].mapped_cpu(), 0);

        let victim = inner.entries[ix]
            .page
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("evicting a frame whose owner is gone");
        let victim_paddr = inner.index_to_paddr(ix);

        drop(inner);
        {
            let _giant = vm.lock_paging_giant();
            victim.evict(vm, victim_paddr);
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        let entry = &mut inner.entries[ix];
        assert!(entry.flags.contains(CmeFlags::WIRED));
        assert!(entry.flags.contains(CmeFlags::ALLOC));
        assert!(
            entry
                .page
                .as_ref()
                .is_some_and(|w| w.ptr_eq(&Arc::downgrade(&victim))),
            "frame changed owner during eviction"
        );

        entry.page = None;
        entry.flags = CmeFlags::empty();
        inner.stats.upages -= 1;
        inner.stats.free += 1;
        inner.check_integrity();
        self.wc_wire.wake_all();

        inner
    }
}
