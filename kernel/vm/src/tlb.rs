//! The TLB layer: installing, probing, invalidating and shooting down
//! hardware mappings.
//!
//! Every operation here holds the frame-table lock, because the coremap
//! carries the reverse mapping (frame -> TLB slot, owning CPU) and the two
//! must change together. The interrupt priority level is raised for the
//! duration of each TLB instruction sequence.
//!
//! All operations act on the current CPU's TLB; the only way to drop a
//! mapping living in *another* CPU's TLB is the shootdown IPI, serviced by
//! [`Coremap::handle_shootdown()`] on the target CPU.

use kernel_config::memory::NUM_TLB;
use machine::{TlbEntry, TlbShootdown, TLBLO_DIRTY, TLBLO_VALID, TLB_PAGE_MASK};
use memory_structs::{PhysicalAddress, VirtualAddress};

use crate::coremap::{Coremap, CoremapInner};

impl Coremap {
    /// Installs a mapping from `vaddr` to `paddr` in the current CPU's
    /// TLB, choosing (and if necessary freeing) a slot, and records the
    /// slot in the frame's coremap entry. The caller must hold the frame
    /// wired, which is what makes it safe to sleep later with the mapping
    /// in place.
    pub(crate) fn tlb_install(&self, vaddr: VirtualAddress, paddr: PhysicalAddress, writable: bool) {
        let mut inner = self.lock();
        let _spl = machine::splhigh();

        let ix = inner.paddr_to_index(paddr);
        assert!(
            inner.entries[ix].is_wired(),
            "installing a mapping for an unwired frame {}",
            paddr
        );

        // A stale entry for this virtual page (e.g. a read-only mapping
        // being upgraded after a readonly fault) is replaced in place.
        let slot = match self.machine.tlb_probe(vaddr) {
            Some(slot) => {
                self.tlb_invalidate_locked(&mut inner, slot);
                slot
            }
            None => self.tlb_get_free_slot_locked(&mut inner),
        };

        let mut lo = paddr.value() | TLBLO_VALID;
        if writable {
            lo |= TLBLO_DIRTY;
        }
        self.machine.tlb_write(
            slot,
            TlbEntry {
                hi: vaddr.value() & TLB_PAGE_MASK,
                lo,
            },
        );
        inner.entries[ix].set_tlb_slot(slot, self.machine.current_cpu());
        trace!(
            "tlb: cpu{} slot {} <- {:?} -> {:?} ({})",
            self.machine.current_cpu(),
            slot,
            vaddr.align_down_to_page(),
            paddr,
            if writable { "rw" } else { "ro" }
        );
    }

    /// Drops the current CPU's mapping of `vaddr`, if it has one.
    pub(crate) fn tlb_unmap(&self, vaddr: VirtualAddress) {
        let mut inner = self.lock();
        let _spl = machine::splhigh();

        if let Some(slot) = self.machine.tlb_probe(vaddr) {
            assert!(self.machine.tlb_read(slot).is_valid());
            self.tlb_invalidate_locked(&mut inner, slot);
        }
    }

    /// Translates `vaddr` through the current CPU's TLB the way the
    /// hardware would on a user access.
    pub(crate) fn tlb_lookup(&self, vaddr: VirtualAddress) -> Option<(PhysicalAddress, bool)> {
        let _inner = self.lock();
        let _spl = machine::splhigh();

        let slot = self.machine.tlb_probe(vaddr)?;
        let entry = self.machine.tlb_read(slot);
        assert!(entry.is_valid());
        Some((
            PhysicalAddress::new(entry.lo & TLB_PAGE_MASK),
            entry.lo & TLBLO_DIRTY != 0,
        ))
    }

    /// Invalidates every slot of the current CPU's TLB.
    pub(crate) fn tlb_clear_current_cpu(&self) {
        let mut inner = self.lock();
        self.tlb_clear_locked(&mut inner);
    }

    /// The shootdown interrupt handler, run on the CPU named by the
    /// requester. If the frame at `ts.cme_ix` still points at this CPU
    /// and slot, the mapping is dropped; either way every waiter is woken
    /// and re-checks its own frame.
    pub(crate) fn handle_shootdown(&self, ts: &TlbShootdown) {
        let mut inner = self.lock();

        let entry = &inner.entries[ts.cme_ix];
        if entry.mapped_cpu() == self.machine.current_cpu()
            && entry.tlb_slot() == Some(ts.tlb_ix)
        {
            self.tlb_invalidate_locked(&mut inner, ts.tlb_ix);
        }

        self.wc_shootdown.wake_all();
    }

    /// Clears the local TLB entirely and wakes shootdown waiters.
    pub(crate) fn shootdown_all(&self) {
        let mut inner = self.lock();
        self.tlb_clear_locked(&mut inner);
        self.wc_shootdown.wake_all();
    }

    /// Writes an invalid entry over `slot` and, if the slot held a live
    /// mapping, clears the mapped frame's reverse pointer.
    pub(crate) fn tlb_invalidate_locked(&self, inner: &mut CoremapInner, slot: usize) {
        assert!(slot < NUM_TLB);
        let _spl = machine::splhigh();

        let entry = self.machine.tlb_read(slot);
        self.machine.tlb_write(slot, TlbEntry::INVALID);

        if entry.is_valid() {
            let paddr = PhysicalAddress::new(entry.lo & TLB_PAGE_MASK);
            let ix = inner.paddr_to_index(paddr);
            assert_eq!(inner.entries[ix].tlb_slot(), Some(slot));
            assert_eq!(inner.entries[ix].mapped_cpu(), self.machine.current_cpu());
            inner.entries[ix].clear_tlb_slot();
        }
    }

    fn tlb_clear_locked(&self, inner: &mut CoremapInner) {
        let _spl = machine::splhigh();
        for slot in 0..NUM_TLB {
            self.tlb_invalidate_locked(inner, slot);
        }
    }

    /// Finds an invalid slot in the current CPU's TLB, evicting a random
    /// victim if every slot is in use.
    fn tlb_get_free_slot_locked(&self, inner: &mut CoremapInner) -> usize {
        let _spl = machine::splhigh();
        for slot in 0..NUM_TLB {
            if !self.machine.tlb_read(slot).is_valid() {
                return slot;
            }
        }
        self.tlb_evict_locked(inner)
    }

    /// Victim selection within the TLB itself (distinct from frame
    /// eviction): picks a random slot and invalidates it.
    fn tlb_evict_locked(&self, inner: &mut CoremapInner) -> usize {
        let victim = self.machine.random() as usize % NUM_TLB;
        self.tlb_invalidate_locked(inner, victim);
        victim
    }
}
