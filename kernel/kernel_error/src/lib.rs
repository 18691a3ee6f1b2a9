//! The error kinds surfaced by kernel operations that can fail.
//!
//! Recoverable conditions (out of memory, out of swap, a bad user address)
//! travel up the fault path as a [`KernelError`]; invariant violations are
//! not represented here and are asserted fatally at the point of detection.

#![no_std]

use core::fmt;

/// Errors that can be returned from kernel virtual-memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No physical frame could be produced: the frame table is exhausted
    /// and no evictable frame exists (or the caller ran in interrupt
    /// context, where eviction is forbidden).
    OutOfMemory,
    /// A swap reservation could not be granted.
    OutOfSwap,
    /// A user fault landed on an address outside every region.
    BadAddress,
    /// An argument was invalid: an unknown fault type, an overlapping
    /// region definition, or a heap break below its start.
    BadArgument,
    /// The swap device failed an I/O request. Callers treat this as fatal
    /// to kernel integrity.
    Io,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str((*self).into())
    }
}

impl From<KernelError> for &'static str {
    fn from(err: KernelError) -> &'static str {
        match err {
            KernelError::OutOfMemory => "out of memory",
            KernelError::OutOfSwap => "out of swap space",
            KernelError::BadAddress => "bad user address",
            KernelError::BadArgument => "invalid argument",
            KernelError::Io => "swap device I/O failure",
        }
    }
}
