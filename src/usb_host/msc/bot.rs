//! Bulk-Only Transport: every command is a CBW on bulk OUT, an optional data stage,
//! and a CSW on bulk IN.

use super::MscError;
use crate::usb_host::descriptor::{SetupPacket, RECIPIENT_INTERFACE, TYPE_CLASS};
use crate::usb_host::driver::{BulkPipe, ControlTarget, DataToggle, HostDriver, TransferError};

/// "USBC", little-endian
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// "USBS", little-endian
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// Class-specific requests
pub const REQUEST_GET_MAX_LUN: u8 = 0xFE;
pub const REQUEST_BULK_ONLY_RESET: u8 = 0xFF;

/// bmCBWFlags direction bit
const CBW_FLAG_IN: u8 = 0x80;

/// Command Block Wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub direction_in: bool,
    pub lun: u8,
    pub command: [u8; 16],
    pub command_len: u8,
}

impl CommandBlockWrapper {
    pub fn new(tag: u32, lun: u8, command: &[u8], data_transfer_length: u32, direction_in: bool) -> Self {
        let mut block = [0u8; 16];
        let len = command.len().min(block.len());
        block[..len].copy_from_slice(&command[..len]);
        Self {
            tag,
            data_transfer_length,
            direction_in,
            lun,
            command: block,
            command_len: len as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut bytes = [0u8; CBW_LEN];
        bytes[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        bytes[12] = if self.direction_in { CBW_FLAG_IN } else { 0 };
        bytes[13] = self.lun & 0x0F;
        bytes[14] = self.command_len & 0x1F;
        bytes[15..31].copy_from_slice(&self.command);
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CBW_LEN || u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) != CBW_SIGNATURE {
            return None;
        }
        let mut command = [0u8; 16];
        command.copy_from_slice(&bytes[15..31]);
        Some(Self {
            tag: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            data_transfer_length: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            direction_in: bytes[12] & CBW_FLAG_IN != 0,
            lun: bytes[13] & 0x0F,
            command,
            command_len: bytes[14] & 0x1F,
        })
    }
}

/// bCSWStatus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum CommandStatus {
    Passed,
    Failed,
    PhaseError,
}

/// Command Status Wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub residue: u32,
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut bytes = [0u8; CSW_LEN];
        bytes[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.residue.to_le_bytes());
        bytes[12] = match self.status {
            CommandStatus::Passed => 0,
            CommandStatus::Failed => 1,
            CommandStatus::PhaseError => 2,
        };
        bytes
    }

    /// Parse a CSW. Anything that is not 13 bytes with the right signature and a
    /// known status is invalid and calls for reset recovery.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CSW_LEN || u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) != CSW_SIGNATURE {
            return None;
        }
        let status = match bytes[12] {
            0 => CommandStatus::Passed,
            1 => CommandStatus::Failed,
            2 => CommandStatus::PhaseError,
            _ => return None,
        };
        Some(Self {
            tag: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            residue: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            status,
        })
    }
}

/// Data stage of a command
pub enum DataStage<'b> {
    None,
    In(&'b mut [u8]),
    Out(&'b [u8]),
}

impl DataStage<'_> {
    fn len(&self) -> usize {
        match self {
            DataStage::None => 0,
            DataStage::In(buf) => buf.len(),
            DataStage::Out(data) => data.len(),
        }
    }
}

/// Per-device transport state that outlives a single borrow of the driver
#[derive(Debug, Clone, Copy)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct BotDevice {
    pub control: ControlTarget,
    pub interface: u8,
    pub bulk_in: BulkPipe,
    pub bulk_out: BulkPipe,
    pub lun: u8,
    pub tag: u32,
}

/// A Bulk-Only transport bound to a driver for the duration of a borrow.
pub struct BulkOnly<'a, D> {
    driver: &'a mut D,
    device: &'a mut BotDevice,
}

impl<'a, D: HostDriver> BulkOnly<'a, D> {
    pub fn new(driver: &'a mut D, device: &'a mut BotDevice) -> Self {
        Self { driver, device }
    }

    /// Let the driver wait, e.g. between unit-ready polls.
    pub fn wait_ms(&mut self, ms: u32) {
        self.driver.wait_ms(ms);
    }

    /// Run one command through CBW, data stage and CSW.
    ///
    /// Returns the residue reported by the device on success. A stalled data stage
    /// is cleared and the status still collected; a phase error or an invalid CSW
    /// triggers reset recovery.
    pub fn execute(&mut self, command: &[u8], mut data: DataStage<'_>) -> Result<u32, MscError> {
        self.device.tag = self.device.tag.wrapping_add(1);
        let tag = self.device.tag;
        let cbw = CommandBlockWrapper::new(
            tag,
            self.device.lun,
            command,
            data.len() as u32,
            matches!(data, DataStage::In(_)),
        );
        trace!("BOT: CBW tag {} opcode 0x{:02X} length {}", tag, command[0], data.len());

        let mut out = self.device.bulk_out;
        let sent = self.driver.bulk_out(&mut out, &cbw.to_bytes());
        self.device.bulk_out = out;
        if let Err(e) = sent {
            if e == TransferError::Stall {
                self.reset_recovery()?;
            }
            return Err(MscError::Transfer(e));
        }

        match &mut data {
            DataStage::None => {}
            DataStage::In(buf) => {
                let mut pipe = self.device.bulk_in;
                let received = self.driver.bulk_in(&mut pipe, buf);
                self.device.bulk_in = pipe;
                match received {
                    Ok(_) => {}
                    Err(TransferError::Stall) => self.clear_halt_in()?,
                    Err(e) => return Err(MscError::Transfer(e)),
                }
            }
            DataStage::Out(bytes) => {
                let mut pipe = self.device.bulk_out;
                let sent = self.driver.bulk_out(&mut pipe, bytes);
                self.device.bulk_out = pipe;
                match sent {
                    Ok(()) => {}
                    Err(TransferError::Stall) => self.clear_halt_out()?,
                    Err(e) => return Err(MscError::Transfer(e)),
                }
            }
        }

        let csw = self.read_status()?;
        if csw.tag != tag {
            warn!("BOT: CSW tag {} does not match CBW tag {}", csw.tag, tag);
            self.reset_recovery()?;
            return Err(MscError::InvalidStatus);
        }

        match csw.status {
            CommandStatus::Passed => Ok(csw.residue),
            CommandStatus::Failed => Err(MscError::CommandFailed),
            CommandStatus::PhaseError => {
                warn!("BOT: phase error, resetting");
                self.reset_recovery()?;
                Err(MscError::PhaseError)
            }
        }
    }

    /// Read the CSW, retrying once after clearing a stalled bulk IN endpoint.
    fn read_status(&mut self) -> Result<CommandStatusWrapper, MscError> {
        let mut raw = [0u8; CSW_LEN];
        for attempt in 0..2 {
            let mut pipe = self.device.bulk_in;
            let received = self.driver.bulk_in(&mut pipe, &mut raw);
            self.device.bulk_in = pipe;
            match received {
                Ok(len) => {
                    return match CommandStatusWrapper::parse(&raw[..len]) {
                        Some(csw) => Ok(csw),
                        None => {
                            warn!("BOT: invalid CSW ({} bytes)", len);
                            self.reset_recovery()?;
                            Err(MscError::InvalidStatus)
                        }
                    };
                }
                Err(TransferError::Stall) if attempt == 0 => self.clear_halt_in()?,
                Err(e) => return Err(MscError::Transfer(e)),
            }
        }
        Err(MscError::InvalidStatus)
    }

    /// Bulk-Only Mass Storage Reset followed by clearing both bulk endpoints.
    pub fn reset_recovery(&mut self) -> Result<(), MscError> {
        let reset = SetupPacket {
            request_type: TYPE_CLASS | RECIPIENT_INTERFACE,
            request: REQUEST_BULK_ONLY_RESET,
            value: 0,
            index: u16::from(self.device.interface),
            length: 0,
        };
        self.driver.control_out(self.device.control, &reset, &[])?;
        self.clear_halt_in()?;
        self.clear_halt_out()
    }

    fn clear_halt_in(&mut self) -> Result<(), MscError> {
        let endpoint = self.device.bulk_in.endpoint | 0x80;
        self.driver
            .control_out(self.device.control, &SetupPacket::clear_halt(endpoint), &[])?;
        self.device.bulk_in.toggle = DataToggle::Data0;
        Ok(())
    }

    fn clear_halt_out(&mut self) -> Result<(), MscError> {
        let endpoint = self.device.bulk_out.endpoint;
        self.driver
            .control_out(self.device.control, &SetupPacket::clear_halt(endpoint), &[])?;
        self.device.bulk_out.toggle = DataToggle::Data0;
        Ok(())
    }
}
