//! USB Mass Storage Class: Bulk-Only Transport carrying SCSI commands.
//!
//! [`MassStorage`] exposes an active device as an [`embedded_sdmmc::BlockDevice`] so the
//! FAT layer can sit directly on top of the USB host.

pub mod bot;
pub mod scsi;

use core::cell::RefCell;

use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx};

use self::bot::{BotDevice, BulkOnly};
use self::scsi::{Capacity, Sense};
use super::driver::{HostDriver, TransferError};

/// The only logical block size supported
pub const BLOCK_SIZE: usize = 512;

/// Mass storage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum MscError {
    /// USB transfer failed
    Transfer(TransferError),
    /// The CSW was malformed or did not match the command
    InvalidStatus,
    /// The device reported a failed command (before sense data was fetched)
    CommandFailed,
    /// The device reported a failed command, with its sense data
    CheckCondition(Sense),
    /// The device lost track of the command sequence
    PhaseError,
    /// Fewer bytes moved than requested
    ShortTransfer(u32),
    /// The medium never became ready
    NotReady,
    /// Logical blocks other than 512 bytes
    UnsupportedBlockSize(u32),
    /// More blocks than a 32-bit LBA can address
    TooLarge,
    /// Block index past the end of the medium
    OutOfRange,
}

impl From<TransferError> for MscError {
    fn from(error: TransferError) -> Self {
        MscError::Transfer(error)
    }
}

/// Class state of an initialized mass-storage device
#[derive(Debug, Clone, Copy)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct MscDevice {
    pub transport: BotDevice,
    pub capacity: Capacity,
}

/// Block device view of the active mass-storage device.
///
/// Borrowing the host for the lifetime of this value keeps the device from being
/// re-enumerated underneath the filesystem.
pub struct MassStorage<'a, D> {
    transport: RefCell<BulkOnly<'a, D>>,
    capacity: Capacity,
}

impl<'a, D: HostDriver> MassStorage<'a, D> {
    /// Wrap an active mass-storage device as a block device
    ///
    /// # Arguments
    /// * `driver` - Controller driver the device is attached to
    /// * `device` - Bulk pipes and capacity from class start-up; the data toggles are updated in place
    pub fn new(driver: &'a mut D, device: &'a mut MscDevice) -> Self {
        let capacity = device.capacity;
        Self {
            transport: RefCell::new(BulkOnly::new(driver, &mut device.transport)),
            capacity,
        }
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn check_range(&self, start: BlockIdx, count: usize) -> Result<(), MscError> {
        let end = u64::from(start.0) + count as u64;
        if end > u64::from(self.capacity.block_count) {
            return Err(MscError::OutOfRange);
        }
        Ok(())
    }
}

impl<D: HostDriver> BlockDevice for MassStorage<'_, D> {
    type Error = MscError;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.check_range(start_block_idx, blocks.len())?;
        let mut transport = self.transport.borrow_mut();
        for (lba, block) in (start_block_idx.0..).zip(blocks.iter_mut()) {
            transport.read_block(lba, &mut block.contents)?;
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.check_range(start_block_idx, blocks.len())?;
        let mut transport = self.transport.borrow_mut();
        for (lba, block) in (start_block_idx.0..).zip(blocks.iter()) {
            transport.write_block(lba, &block.contents)?;
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.capacity.block_count))
    }
}
