//! The handful of SCSI commands a FAT filesystem on a flash drive needs.

use super::bot::{BulkOnly, DataStage};
use super::{MscError, BLOCK_SIZE};
use crate::usb_host::driver::HostDriver;

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;

const SENSE_LEN: usize = 18;
const INQUIRY_LEN: usize = 36;
const CAPACITY_LEN: usize = 8;

/// Sense keys worth telling apart
pub const SENSE_NOT_READY: u8 = 0x02;
pub const SENSE_UNIT_ATTENTION: u8 = 0x06;

/// Fixed-format sense data, reduced to the codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub fn parse(bytes: &[u8]) -> Self {
        let byte = |i: usize| bytes.get(i).copied().unwrap_or(0);
        Self {
            key: byte(2) & 0x0F,
            asc: byte(12),
            ascq: byte(13),
        }
    }

    /// Conditions a flash drive reports while it spins up or after a media change.
    pub fn is_transient(&self) -> bool {
        matches!(self.key, SENSE_NOT_READY | SENSE_UNIT_ATTENTION)
    }
}

/// Standard INQUIRY data, the identifying parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inquiry {
    pub peripheral_type: u8,
    pub removable: bool,
    vendor: [u8; 8],
    product: [u8; 16],
}

impl Inquiry {
    pub fn parse(bytes: &[u8]) -> Self {
        let mut vendor = [b' '; 8];
        let mut product = [b' '; 16];
        if let Some(v) = bytes.get(8..16) {
            vendor.copy_from_slice(v);
        }
        if let Some(p) = bytes.get(16..32) {
            product.copy_from_slice(p);
        }
        Self {
            peripheral_type: bytes.first().copied().unwrap_or(0) & 0x1F,
            removable: bytes.get(1).copied().unwrap_or(0) & 0x80 != 0,
            vendor,
            product,
        }
    }

    pub fn vendor(&self) -> &str {
        ascii_field(&self.vendor)
    }

    pub fn product(&self) -> &str {
        ascii_field(&self.product)
    }
}

fn ascii_field(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes).map(str::trim_end).unwrap_or("?")
}

/// READ CAPACITY(10) result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct Capacity {
    pub block_count: u32,
    pub block_size: u32,
}

impl Capacity {
    /// READ CAPACITY(10) data. A last LBA of `0xFFFF_FFFF` means the medium needs
    /// READ CAPACITY(16), which is not supported.
    pub fn parse(bytes: &[u8; CAPACITY_LEN]) -> Result<Self, MscError> {
        let last_lba = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Self {
            block_count: last_lba.checked_add(1).ok_or(MscError::TooLarge)?,
            block_size: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    pub fn bytes(&self) -> u64 {
        u64::from(self.block_count) * u64::from(self.block_size)
    }
}

/// 10-byte READ/WRITE command descriptor block
fn rw10(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
    let lba = lba.to_be_bytes();
    let blocks = blocks.to_be_bytes();
    [opcode, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0]
}

impl<D: HostDriver> BulkOnly<'_, D> {
    /// Run a command and, if the device reports a check condition, fetch the sense data.
    fn checked(&mut self, command: &[u8], data: DataStage<'_>) -> Result<u32, MscError> {
        match self.execute(command, data) {
            Err(MscError::CommandFailed) => {
                let sense = self.request_sense()?;
                debug!(
                    "SCSI: opcode 0x{:02X} failed, sense {:02X}/{:02X}/{:02X}",
                    command[0], sense.key, sense.asc, sense.ascq
                );
                Err(MscError::CheckCondition(sense))
            }
            other => other,
        }
    }

    pub fn test_unit_ready(&mut self) -> Result<(), MscError> {
        self.checked(&[TEST_UNIT_READY, 0, 0, 0, 0, 0], DataStage::None)
            .map(|_| ())
    }

    pub fn request_sense(&mut self) -> Result<Sense, MscError> {
        let mut buf = [0u8; SENSE_LEN];
        self.execute(&[REQUEST_SENSE, 0, 0, 0, SENSE_LEN as u8, 0], DataStage::In(&mut buf))?;
        Ok(Sense::parse(&buf))
    }

    pub fn inquiry(&mut self) -> Result<Inquiry, MscError> {
        let mut buf = [0u8; INQUIRY_LEN];
        self.checked(&[INQUIRY, 0, 0, 0, INQUIRY_LEN as u8, 0], DataStage::In(&mut buf))?;
        Ok(Inquiry::parse(&buf))
    }

    pub fn read_capacity(&mut self) -> Result<Capacity, MscError> {
        let mut buf = [0u8; CAPACITY_LEN];
        self.checked(&[READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0], DataStage::In(&mut buf))?;
        Capacity::parse(&buf)
    }

    /// Read one block at `lba`.
    pub fn read_block(&mut self, lba: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), MscError> {
        let residue = self.checked(&rw10(READ_10, lba, 1), DataStage::In(buf))?;
        if residue != 0 {
            return Err(MscError::ShortTransfer(residue));
        }
        Ok(())
    }

    /// Write one block at `lba`.
    pub fn write_block(&mut self, lba: u32, data: &[u8; BLOCK_SIZE]) -> Result<(), MscError> {
        let residue = self.checked(&rw10(WRITE_10, lba, 1), DataStage::Out(data))?;
        if residue != 0 {
            return Err(MscError::ShortTransfer(residue));
        }
        Ok(())
    }
}
