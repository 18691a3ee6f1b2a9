//! Broadcast wait channels and sleeping mutexes.
//!
//! A [`WaitChannel`] lets a thread give up the CPU until some condition it is
//! polling under a guarding lock may have changed. The sleep protocol is
//! strictly two-phase to close the lost-wakeup window:
//!
//! 1. call [`WaitChannel::lock()`] *while still holding* the guarding lock,
//! 2. release the guarding lock,
//! 3. call [`WaitGuard::sleep()`],
//! 4. reacquire the guarding lock and re-check the condition.
//!
//! Every wakeup is a broadcast ([`WaitChannel::wake_all()`]): wakers never
//! know how many sleepers their state change satisfies, so they wake
//! everyone and let each sleeper re-check its own condition.
//!
//! A [`SleepMutex`] is an ordinary sleeping lock for data that is held
//! across blocking operations, where a spinlock would be wrong.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use static_assertions::assert_not_impl_any;

/// Strips lock poisoning: a panic while holding one of these locks is
/// already fatal to kernel integrity, so later accessors proceed.
fn unpoisoned<T>(result: Result<T, std::sync::PoisonError<T>>) -> T {
    result.unwrap_or_else(|e| e.into_inner())
}

/// A channel that threads sleep on while waiting for a condition guarded
/// by some other lock, and that wakers wake with broadcast semantics.
pub struct WaitChannel {
    name: &'static str,
    /// Bumped by every wakeup; a sleeper sleeps only while the generation
    /// it captured at [`WaitChannel::lock()`] time is still current.
    generation: Mutex<u64>,
    cond: Condvar,
    sleepers: AtomicUsize,
}

impl WaitChannel {
    /// Creates a new wait channel. The name appears in trace logs only.
    pub fn new(name: &'static str) -> WaitChannel {
        WaitChannel {
            name,
            generation: Mutex::new(0),
            cond: Condvar::new(),
            sleepers: AtomicUsize::new(0),
        }
    }

    /// Pins this channel in preparation for sleeping on it.
    ///
    /// Must be called *before* releasing the lock that guards the awaited
    /// condition; any wakeup that happens after this call (and before the
    /// eventual [`WaitGuard::sleep()`]) is not lost, it simply makes the
    /// sleep return immediately.
    pub fn lock(&self) -> WaitGuard<'_> {
        let guard = unpoisoned(self.generation.lock());
        let generation = *guard;
        WaitGuard {
            chan: self,
            guard,
            generation,
        }
    }

    /// Wakes every thread currently sleeping (or committed to sleeping)
    /// on this channel.
    pub fn wake_all(&self) {
        let mut generation = unpoisoned(self.generation.lock());
        *generation = generation.wrapping_add(1);
        if self.sleepers.load(Ordering::Relaxed) > 0 {
            log::trace!("wait_channel: waking all sleepers on {:?}", self.name);
        }
        self.cond.notify_all();
    }

    /// Returns the channel's name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The token returned by [`WaitChannel::lock()`]; consuming it with
/// [`sleep()`](WaitGuard::sleep) blocks the calling thread until the next
/// broadcast wakeup.
#[must_use = "a WaitGuard that is dropped without sleeping leaves a wakeup window open"]
pub struct WaitGuard<'a> {
    chan: &'a WaitChannel,
    guard: MutexGuard<'a, u64>,
    generation: u64,
}

assert_not_impl_any!(WaitGuard<'static>: Send, Clone);

impl WaitGuard<'_> {
    /// Blocks until the channel is woken. The caller must have released
    /// the lock guarding its condition before calling this, and must
    /// reacquire it and re-check the condition afterwards.
    pub fn sleep(self) {
        let WaitGuard {
            chan,
            mut guard,
            generation,
        } = self;
        chan.sleepers.fetch_add(1, Ordering::Relaxed);
        while *guard == generation {
            guard = unpoisoned(chan.cond.wait(guard));
        }
        chan.sleepers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A sleeping mutual-exclusion lock.
///
/// Unlike a spinlock, the holder may block (on I/O, on a [`WaitChannel`],
/// or on another `SleepMutex`) while holding it, and contending threads
/// give up the CPU rather than spinning.
pub struct SleepMutex<T: ?Sized> {
    inner: Mutex<T>,
}

impl<T> SleepMutex<T> {
    /// Creates a new sleeping mutex holding the given data.
    pub const fn new(data: T) -> SleepMutex<T> {
        SleepMutex {
            inner: Mutex::new(data),
        }
    }

    /// Consumes the mutex and returns the data it protected.
    pub fn into_inner(self) -> T {
        unpoisoned(self.inner.into_inner())
    }
}

impl<T: ?Sized> SleepMutex<T> {
    /// Acquires the lock, blocking (sleeping) until it is available.
    pub fn lock(&self) -> SleepMutexGuard<'_, T> {
        SleepMutexGuard {
            guard: unpoisoned(self.inner.lock()),
        }
    }
}

impl<T: Default> Default for SleepMutex<T> {
    fn default() -> SleepMutex<T> {
        SleepMutex::new(T::default())
    }
}

/// The guard for a held [`SleepMutex`]; releases the lock on drop.
pub struct SleepMutexGuard<'a, T: ?Sized> {
    guard: MutexGuard<'a, T>,
}

assert_not_impl_any!(SleepMutexGuard<'static, ()>: Send, Clone);

impl<T: ?Sized> core::ops::Deref for SleepMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}
impl<T: ?Sized> core::ops::DerefMut for SleepMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wakeup_between_lock_and_sleep_is_not_lost() {
        let chan = WaitChannel::new("test");
        let guard = chan.lock();
        chan.wake_all();
        // Must return immediately instead of sleeping forever.
        guard.sleep();
    }

    #[test]
    fn wake_all_wakes_every_sleeper() {
        let chan = Arc::new(WaitChannel::new("test"));
        let woken = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let chan = chan.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    chan.lock().sleep();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        // Give the sleepers a moment to block, then broadcast.
        while chan.sleepers.load(Ordering::Relaxed) < 4 {
            thread::yield_now();
        }
        chan.wake_all();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn sleep_mutex_provides_mutual_exclusion() {
        let lock = Arc::new(SleepMutex::new(0u64));
        let busy = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let busy = busy.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut g = lock.lock();
                        assert!(!busy.swap(true, Ordering::SeqCst));
                        *g += 1;
                        thread::sleep(Duration::from_micros(10));
                        busy.store(false, Ordering::SeqCst);
                        drop(g);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 400);
    }
}
