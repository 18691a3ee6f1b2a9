//! The logical page: a page-sized unit of user memory whose contents live
//! in a physical frame, in the page's swap slot, or (briefly) in flight
//! between the two.
//!
//! A page's swap slot is assigned at creation and never changes; its
//! `paddr` and `in_transit` fields are guarded by a per-page sleeping
//! lock. The residence states:
//!
//! | state      | `paddr` | `in_transit` |
//! |------------|---------|--------------|
//! | resident   | `Some`  | false        |
//! | swapped    | `None`  | false        |
//! | paging in  | `None`  | true         |
//! | paging out | `Some`  | true         |
//!
//! Readers that find a page in transit sleep on the transit channel and
//! re-examine it afterwards. Whoever needs a page's frame to stay put
//! across a sleep wires the frame first; the [`acquire`](VmPage::acquire)
//! loop below is how a thread ends up holding the page lock *and* a wire
//! on the page's current frame, despite wiring being a blocking operation
//! that cannot happen with the page lock held.
//!
//! A thread may hold at most one page lock at a time; the sole exception
//! is cloning, which briefly holds the source and the (still private)
//! destination together. Both rules are enforced with a per-thread count.

use core::cell::Cell;
use core::fmt;
use std::sync::Arc;

use kernel_error::KernelError;
use memory_structs::{PhysicalAddress, VirtualAddress};
use swap_store::SwapAddr;
use wait_channel::{SleepMutex, SleepMutexGuard};

use crate::{FaultType, Vm};

thread_local! {
    /// How many page locks the current thread holds.
    static PAGE_LOCKS_HELD: Cell<usize> = const { Cell::new(0) };
    /// True while the current thread is inside a page clone.
    static IN_CLONE: Cell<bool> = const { Cell::new(false) };
}

/// Asserts the caller is allowed to block on the paging-giant lock:
/// holding a page lock there would deadlock against the fault path,
/// except on the clone path, whose second lock is on a page nobody else
/// can reach yet.
pub(crate) fn assert_may_take_paging_giant() {
    PAGE_LOCKS_HELD.with(|count| {
        IN_CLONE.with(|in_clone| {
            assert!(
                count.get() == 0 || in_clone.get(),
                "taking the paging-giant lock while holding a page lock"
            );
        });
    });
}

/// RAII marker for the clone exception to the one-page-lock rule.
struct CloneScope;

impl CloneScope {
    fn enter() -> CloneScope {
        IN_CLONE.with(|flag| {
            assert!(!flag.get(), "nested page clone");
            flag.set(true);
        });
        CloneScope
    }
}

impl Drop for CloneScope {
    fn drop(&mut self) {
        IN_CLONE.with(|flag| flag.set(false));
    }
}

struct VmPageInner {
    /// The frame holding this page's contents, when resident.
    paddr: Option<PhysicalAddress>,
    /// True while the contents are moving to or from the swap slot.
    in_transit: bool,
}

/// A logical page. See the module documentation.
pub struct VmPage {
    /// The page's permanent home on the swap device.
    swapaddr: SwapAddr,
    inner: SleepMutex<VmPageInner>,
}

/// The held page lock. Dropping it releases the lock and the thread's
/// page-lock accounting.
struct PageGuard<'a> {
    guard: SleepMutexGuard<'a, VmPageInner>,
}

impl<'a> core::ops::Deref for PageGuard<'a> {
    type Target = VmPageInner;
    fn deref(&self) -> &VmPageInner {
        &self.guard
    }
}
impl<'a> core::ops::DerefMut for PageGuard<'a> {
    fn deref_mut(&mut self) -> &mut VmPageInner {
        &mut self.guard
    }
}
impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        PAGE_LOCKS_HELD.with(|count| count.set(count.get() - 1));
    }
}

impl fmt::Debug for VmPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VmPage({:?})", self.swapaddr)
    }
}

impl VmPage {
    fn with_slot(swapaddr: SwapAddr) -> Arc<VmPage> {
        Arc::new(VmPage {
            swapaddr,
            inner: SleepMutex::new(VmPageInner {
                paddr: None,
                in_transit: false,
            }),
        })
    }

    /// Returns the page's swap slot.
    pub fn swapaddr(&self) -> SwapAddr {
        self.swapaddr
    }

    /// Returns the frame this page currently occupies, if resident.
    /// Advisory: the answer can be stale the moment it is returned.
    pub fn resident_frame(&self) -> Option<PhysicalAddress> {
        self.lock().paddr
    }

    /// Takes the page lock, enforcing the per-thread lock accounting.
    fn lock(&self) -> PageGuard<'_> {
        PAGE_LOCKS_HELD.with(|count| {
            IN_CLONE.with(|in_clone| {
                assert!(
                    count.get() == 0 || (in_clone.get() && count.get() == 1),
                    "a thread may hold at most one page lock"
                );
            });
            count.set(count.get() + 1);
        });
        PageGuard {
            guard: self.inner.lock(),
        }
    }

    /// Releases the page lock, sleeps on the transit channel, retakes the
    /// lock. Used whenever the page is found mid-transfer.
    fn transit_sleep<'a>(&'a self, vm: &Vm, guard: PageGuard<'a>) -> PageGuard<'a> {
        let sleeper = vm.wc_transit.lock();
        drop(guard);
        sleeper.sleep();
        self.lock()
    }

    /// The wire loop: returns with the page locked and, if the page is
    /// resident, with its frame wired by this call. Wiring can block and
    /// must happen without the page lock, so the loop wires a candidate
    /// frame, retakes the lock, and checks that the page did not move in
    /// the meantime; a frame wired by us cannot be evicted from under us,
    /// which is what makes the loop terminate.
    ///
    /// Returns the guard and the frame wired by this call, if any.
    fn acquire<'a>(&'a self, vm: &Vm) -> (PageGuard<'a>, Option<PhysicalAddress>) {
        let mut wired: Option<PhysicalAddress> = None;
        let mut guard = self.lock();
        loop {
            let paddr = guard.paddr;
            if paddr == wired {
                return (guard, wired);
            }

            drop(guard);
            if let Some(stale) = wired.take() {
                vm.coremap.unwire(stale);
            }
            if let Some(target) = paddr {
                vm.coremap.wire(target);
                wired = Some(target);
            }
            guard = self.lock();
        }
    }

    /// [`acquire`](VmPage::acquire), but also waits out any in-flight
    /// transfer, retrying until the page is settled.
    fn acquire_settled<'a>(
        self: &'a Arc<Self>,
        vm: &Vm,
    ) -> (PageGuard<'a>, Option<PhysicalAddress>) {
        loop {
            let mut guard = self.lock();
            while guard.in_transit {
                guard = self.transit_sleep(vm, guard);
            }
            drop(guard);

            let (guard, wired) = self.acquire(vm);
            if !guard.in_transit {
                return (guard, wired);
            }
            // The page went back into transit between the checks; unwind
            // and wait again.
            drop(guard);
            if let Some(stale) = wired {
                vm.coremap.unwire(stale);
            }
        }
    }

    /// Brings a swapped-out page back into core. On entry the page is
    /// locked, settled, and not resident; on success it is locked again,
    /// resident, and its new frame is wired.
    fn page_in<'a>(
        self: &'a Arc<Self>,
        vm: &Vm,
        mut guard: PageGuard<'a>,
    ) -> Result<PageGuard<'a>, KernelError> {
        assert!(guard.paddr.is_none());
        assert!(!guard.in_transit);

        // Mark the transfer before dropping the lock so concurrent
        // faulters wait instead of double-allocating a frame.
        guard.in_transit = true;
        drop(guard);

        let frame = match vm.coremap.alloc(vm, Some(self), true) {
            Some(frame) => frame,
            None => {
                let mut guard = self.lock();
                guard.in_transit = false;
                drop(guard);
                vm.wc_transit.wake_all();
                return Err(KernelError::OutOfMemory);
            }
        };

        let giant = vm.lock_paging_giant();
        vm.swap().read(frame, self.swapaddr);

        let mut guard = self.lock();
        assert!(guard.in_transit);
        assert!(guard.paddr.is_none());
        assert!(vm.coremap.is_wired(frame));
        guard.paddr = Some(frame);
        guard.in_transit = false;
        drop(giant);

        vm.wc_transit.wake_all();
        Ok(guard)
    }

    /// Serves a fault on this page: makes it resident (paging it in if
    /// needed), installs a TLB mapping for `fault_vaddr` on the current
    /// CPU, and leaves the frame unwired again.
    pub fn fault(
        self: &Arc<Self>,
        vm: &Vm,
        fault_type: FaultType,
        fault_vaddr: VirtualAddress,
    ) -> Result<(), KernelError> {
        let writable = match fault_type {
            FaultType::Read => false,
            // A store to a read-only mapping re-installs it writable.
            FaultType::Write | FaultType::ReadOnly => true,
        };

        let (guard, _wired) = self.acquire_settled(vm);

        let guard = match guard.paddr {
            Some(_) => guard,
            None => self.page_in(vm, guard)?,
        };
        let paddr = guard.paddr.expect("faulted page has no frame");

        vm.coremap.tlb_install(fault_vaddr, paddr, writable);
        drop(guard);
        vm.coremap.unwire(paddr);
        Ok(())
    }

    /// Writes this page out to its swap slot and releases its frame
    /// claim. Called from the frame-table eviction path, which holds the
    /// paging-giant lock, has wired the frame, and has already dropped
    /// the table lock. `expected_paddr` re-validates the frame's weak
    /// owner pointer against the page's own idea of where it lives.
    pub(crate) fn evict(self: &Arc<Self>, vm: &Vm, expected_paddr: PhysicalAddress) {
        let mut guard = self.lock();
        let paddr = guard.paddr.expect("evicting a non-resident page");
        assert_eq!(paddr, expected_paddr, "coremap owner pointer went stale");
        assert!(vm.coremap.is_wired(paddr));
        assert!(!guard.in_transit);

        guard.in_transit = true;
        drop(guard);

        vm.swap().write(paddr, self.swapaddr);

        let mut guard = self.lock();
        assert!(guard.in_transit);
        assert_eq!(guard.paddr, Some(paddr));
        guard.paddr = None;
        guard.in_transit = false;
        drop(guard);
        vm.wc_transit.wake_all();
    }

    /// Creates a new page, resident and zero-filled.
    ///
    /// Consumes one of the caller's swap reservations for the page's
    /// permanent slot. The slot itself is not written until the page is
    /// first evicted.
    pub fn new_blank(vm: &Vm) -> Result<Arc<VmPage>, KernelError> {
        let page = VmPage::with_slot(vm.swap().alloc());

        let frame = match vm.coremap.alloc(vm, Some(&page), true) {
            Some(frame) => frame,
            None => {
                // The caller keeps its reservation; only the slot goes back.
                vm.swap().free_reserved(page.swapaddr);
                return Err(KernelError::OutOfMemory);
            }
        };
        vm.coremap.zero(frame);

        let mut guard = page.lock();
        guard.paddr = Some(frame);
        drop(guard);
        vm.coremap.unwire(frame);
        Ok(page)
    }

    /// Clones `src` into a brand-new page with identical contents.
    ///
    /// Consumes one of the caller's swap reservations for the new page's
    /// slot. If `src` is swapped out it is paged back in first. On any
    /// failure the new page and everything allocated for it are released.
    pub fn clone_from(src: &Arc<VmPage>, vm: &Vm) -> Result<Arc<VmPage>, KernelError> {
        let clone_scope = CloneScope::enter();

        let page = VmPage::with_slot(vm.swap().alloc());
        let new_frame = match vm.coremap.alloc(vm, Some(&page), true) {
            Some(frame) => frame,
            None => {
                vm.swap().free_reserved(page.swapaddr);
                return Err(KernelError::OutOfMemory);
            }
        };
        let mut new_guard = page.lock();
        new_guard.paddr = Some(new_frame);

        // Pin the source in core. This is the one place a thread holds
        // two page locks: the second is on a page nobody else can see.
        let (src_guard, src_wired) = src.acquire_settled(vm);
        let src_guard = match src_guard.paddr {
            Some(_) => src_guard,
            None => match src.page_in(vm, src_guard) {
                Ok(guard) => guard,
                Err(err) => {
                    debug_assert!(src_wired.is_none());
                    new_guard.paddr = None;
                    drop(new_guard);
                    vm.coremap.free(new_frame, false);
                    vm.swap().free_reserved(page.swapaddr);
                    return Err(err);
                }
            },
        };
        let src_paddr = src_guard.paddr.expect("acquired source has no frame");

        vm.coremap.clone_frame(src_paddr, new_frame);

        drop(src_guard);
        drop(new_guard);
        drop(clone_scope);
        vm.coremap.unwire(src_paddr);
        vm.coremap.unwire(new_frame);
        Ok(page)
    }

    /// Destroys a page: releases its frame (if resident) and its swap
    /// slot. The page must no longer be reachable by faults; the region
    /// slot that owned it has already been emptied.
    pub fn destroy(page: Arc<VmPage>, vm: &Vm) {
        let (mut guard, wired) = page.acquire_settled(vm);
        match guard.paddr.take() {
            Some(paddr) => {
                debug_assert_eq!(wired, Some(paddr));
                drop(guard);
                // The frame is wired (by acquire) and allocated; free
                // clears both and wakes wire-waiters.
                vm.coremap.free(paddr, false);
            }
            None => drop(guard),
        }
        vm.swap().free(page.swapaddr);
    }
}
