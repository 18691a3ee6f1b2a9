//! Traits and types for block-granular I/O against a raw storage device,
//! plus a RAM-backed device for use where no real disk exists.
//!
//! * [`BlockIo`]: specifies the size in bytes of each block.
//! * [`KnownLength`]: an I/O stream with a known total length.
//! * [`BlockReader`], [`BlockWriter`]: streams that transfer whole blocks.
//!
//! These traits represent "stateless" access: transfers name their block
//! offset explicitly, and no cursor is advanced.

use core::fmt;

/// Errors that can be returned from block I/O operations.
#[derive(Debug, Clone, Copy)]
pub enum IoError {
    /// An input parameter or argument was incorrect or invalid.
    InvalidInput,
    /// The I/O operation attempted to access data beyond the bounds
    /// of this I/O stream.
    OutOfBounds,
    /// The device failed the transfer.
    DeviceError,
}

impl From<IoError> for &'static str {
    fn from(io_error: IoError) -> Self {
        match io_error {
            IoError::InvalidInput => "IoError: invalid input",
            IoError::OutOfBounds => "IoError: out of bounds",
            IoError::DeviceError => "IoError: device error",
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str((*self).into())
    }
}

impl From<IoError> for kernel_error::KernelError {
    fn from(_io_error: IoError) -> Self {
        kernel_error::KernelError::Io
    }
}

/// A parent trait used to specify the block size (in bytes) of I/O
/// transfers. See its use in [`BlockReader`] and [`BlockWriter`].
pub trait BlockIo {
    /// Returns the size in bytes of a single block, the minimum
    /// granularity of I/O transfers.
    fn block_size(&self) -> usize;
}

/// A trait that represents an I/O stream that has a known length,
/// e.g., a disk drive.
pub trait KnownLength {
    /// Returns the length (size in bytes) of this I/O stream.
    fn len(&self) -> usize;

    /// Returns true if the stream holds no bytes at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A trait that represents an I/O stream that can be read from at the
/// granularity of whole blocks.
pub trait BlockReader: BlockIo {
    /// Reads blocks of data from this reader into the given `buffer`.
    ///
    /// The number of blocks read is dictated by the length of the given
    /// `buffer`, which must be a multiple of the block size.
    /// Returns the number of blocks read.
    fn read_blocks(&mut self, buffer: &mut [u8], block_offset: usize) -> Result<usize, IoError>;
}

/// A trait that represents an I/O stream that can be written to at the
/// granularity of whole blocks.
pub trait BlockWriter: BlockIo {
    /// Writes blocks of data from the given `buffer` to this writer.
    ///
    /// The number of blocks written is dictated by the length of the given
    /// `buffer`, which must be a multiple of the block size.
    /// Returns the number of blocks written.
    fn write_blocks(&mut self, buffer: &[u8], block_offset: usize) -> Result<usize, IoError>;

    /// Flushes this writer's output buffers, if any, to the backing medium.
    fn flush(&mut self) -> Result<(), IoError>;
}

/// A block device kept entirely in memory, standing in for the raw disk
/// partition a real system would dedicate to swap.
pub struct RamDisk {
    sector_size: usize,
    data: Vec<u8>,
}

impl RamDisk {
    /// Creates a zero-filled RAM disk of `num_sectors` sectors of
    /// `sector_size` bytes each.
    pub fn new(sector_size: usize, num_sectors: usize) -> RamDisk {
        assert!(sector_size.is_power_of_two());
        RamDisk {
            sector_size,
            data: vec![0u8; sector_size * num_sectors],
        }
    }

    fn byte_range(&self, buffer_len: usize, block_offset: usize) -> Result<(usize, usize), IoError> {
        if buffer_len % self.sector_size != 0 {
            return Err(IoError::InvalidInput);
        }
        let start = block_offset
            .checked_mul(self.sector_size)
            .ok_or(IoError::OutOfBounds)?;
        let end = start.checked_add(buffer_len).ok_or(IoError::OutOfBounds)?;
        if end > self.data.len() {
            return Err(IoError::OutOfBounds);
        }
        Ok((start, end))
    }
}

impl BlockIo for RamDisk {
    fn block_size(&self) -> usize {
        self.sector_size
    }
}

impl KnownLength for RamDisk {
    fn len(&self) -> usize {
        self.data.len()
    }
}

impl BlockReader for RamDisk {
    fn read_blocks(&mut self, buffer: &mut [u8], block_offset: usize) -> Result<usize, IoError> {
        let (start, end) = self.byte_range(buffer.len(), block_offset)?;
        buffer.copy_from_slice(&self.data[start..end]);
        Ok(buffer.len() / self.sector_size)
    }
}

impl BlockWriter for RamDisk {
    fn write_blocks(&mut self, buffer: &[u8], block_offset: usize) -> Result<usize, IoError> {
        let (start, end) = self.byte_range(buffer.len(), block_offset)?;
        self.data[start..end].copy_from_slice(buffer);
        Ok(buffer.len() / self.sector_size)
    }

    fn flush(&mut self) -> Result<(), IoError> {
        Ok(())
    }
}
