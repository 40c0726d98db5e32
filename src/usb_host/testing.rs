//! A USB flash drive that lives in memory: descriptors, Bulk-Only Transport and SCSI
//! over a small FAT16 image. Lets the host stack and the logger run end to end in tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx, Mode, VolumeIdx, VolumeManager};

use super::descriptor::{
    SetupPacket, CLEAR_FEATURE, DESCRIPTOR_CONFIGURATION, DESCRIPTOR_DEVICE, DIR_IN, GET_DESCRIPTOR,
    RECIPIENT_ENDPOINT, RECIPIENT_INTERFACE, SET_ADDRESS, SET_CONFIGURATION, TYPE_CLASS,
};
use super::driver::{BulkPipe, ControlTarget, DeviceSpeed, HostDriver, PortEvent, TransferError};
use super::msc::bot::{
    CommandBlockWrapper, CommandStatus, CommandStatusWrapper, CSW_LEN, REQUEST_BULK_ONLY_RESET, REQUEST_GET_MAX_LUN,
};
use super::msc::scsi::{
    Sense, INQUIRY, READ_10, READ_CAPACITY_10, REQUEST_SENSE, SENSE_NOT_READY, TEST_UNIT_READY, WRITE_10,
};
use super::msc::BLOCK_SIZE;
use crate::apps::FixedTimeSource;

const DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, // USB 2.0, ep0 64 bytes
    0x81, 0x07, 0x67, 0x55, 0x00, 0x01, // 0781:5567
    0x01, 0x02, 0x03, 0x01,
];

const CONFIGURATION: [u8; 32] = [
    0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // configuration 1
    0x09, 0x04, 0x00, 0x00, 0x02, 0x08, 0x06, 0x50, 0x00, // interface 0, SCSI over BOT
    0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, // bulk IN 1
    0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00, // bulk OUT 2
];

const BULK_IN_ENDPOINT: u8 = 1;
const BULK_OUT_ENDPOINT: u8 = 2;

const NO_SENSE: Sense = Sense { key: 0, asc: 0, ascq: 0 };
const BECOMING_READY: Sense = Sense {
    key: SENSE_NOT_READY,
    asc: 0x04,
    ascq: 0x01,
};
const INVALID_OPCODE: Sense = Sense { key: 0x05, asc: 0x20, ascq: 0 };
const LBA_OUT_OF_RANGE: Sense = Sense { key: 0x05, asc: 0x21, ascq: 0 };
const WRITE_FAULT: Sense = Sense { key: 0x03, asc: 0x03, ascq: 0 };

/// A sparse in-memory disk. Unwritten blocks read as zero.
pub(crate) struct RamDisk {
    blocks: RefCell<BTreeMap<u32, [u8; BLOCK_SIZE]>>,
}

impl RamDisk {
    pub const BLOCKS: u32 = 8192;

    const PARTITION_START: u32 = 1;
    const RESERVED_SECTORS: u16 = 1;
    const SECTORS_PER_FAT: u16 = 32;
    const ROOT_ENTRIES: u16 = 512;

    pub fn blank() -> Self {
        Self {
            blocks: RefCell::new(BTreeMap::new()),
        }
    }

    /// A disk with an MBR and one FAT16 partition filling the rest of it.
    pub fn formatted() -> Self {
        let disk = Self::blank();
        let sectors = Self::BLOCKS - Self::PARTITION_START;

        let mut mbr = [0u8; BLOCK_SIZE];
        mbr[446 + 4] = 0x06; // FAT16
        mbr[446 + 8..446 + 12].copy_from_slice(&Self::PARTITION_START.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&sectors.to_le_bytes());
        mbr[510..].copy_from_slice(&[0x55, 0xAA]);
        disk.set_block(0, &mbr);

        let mut boot = [0u8; BLOCK_SIZE];
        boot[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        boot[3..11].copy_from_slice(b"MSWIN4.1");
        boot[11..13].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
        boot[13] = 1; // sectors per cluster
        boot[14..16].copy_from_slice(&Self::RESERVED_SECTORS.to_le_bytes());
        boot[16] = 2; // FAT copies
        boot[17..19].copy_from_slice(&Self::ROOT_ENTRIES.to_le_bytes());
        boot[19..21].copy_from_slice(&(sectors as u16).to_le_bytes());
        boot[21] = 0xF8;
        boot[22..24].copy_from_slice(&Self::SECTORS_PER_FAT.to_le_bytes());
        boot[24..26].copy_from_slice(&32u16.to_le_bytes());
        boot[26..28].copy_from_slice(&64u16.to_le_bytes());
        boot[28..32].copy_from_slice(&Self::PARTITION_START.to_le_bytes());
        boot[36] = 0x80;
        boot[38] = 0x29;
        boot[39..43].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        boot[43..54].copy_from_slice(b"ACCLOGGER  ");
        boot[54..62].copy_from_slice(b"FAT16   ");
        boot[510..].copy_from_slice(&[0x55, 0xAA]);
        disk.set_block(Self::PARTITION_START, &boot);

        let mut fat = [0u8; BLOCK_SIZE];
        fat[..4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
        let first_fat = Self::PARTITION_START + u32::from(Self::RESERVED_SECTORS);
        disk.set_block(first_fat, &fat);
        disk.set_block(first_fat + u32::from(Self::SECTORS_PER_FAT), &fat);

        disk
    }

    pub fn block(&self, lba: u32) -> [u8; BLOCK_SIZE] {
        self.blocks.borrow().get(&lba).copied().unwrap_or([0; BLOCK_SIZE])
    }

    pub fn set_block(&self, lba: u32, data: &[u8; BLOCK_SIZE]) {
        self.blocks.borrow_mut().insert(lba, *data);
    }

    /// Contents of a file in the root directory, if it exists.
    pub fn read_file(&self, name: &str) -> Option<String> {
        let manager = VolumeManager::new(self, FixedTimeSource);
        let volume = manager.open_volume(VolumeIdx(0)).ok()?;
        let root = volume.open_root_dir().ok()?;
        let file = root.open_file_in_dir(name, Mode::ReadOnly).ok()?;
        let mut contents = Vec::new();
        let mut buf = [0u8; 256];
        while !file.is_eof() {
            let n = file.read(&mut buf).ok()?;
            if n == 0 {
                break;
            }
            contents.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(contents).ok()
    }

    /// Create or overwrite a file in the root directory.
    pub fn write_file(&self, name: &str, contents: &str) {
        let manager = VolumeManager::new(self, FixedTimeSource);
        let volume = manager.open_volume(VolumeIdx(0)).unwrap();
        let root = volume.open_root_dir().unwrap();
        let file = root.open_file_in_dir(name, Mode::ReadWriteCreateOrTruncate).unwrap();
        file.write(contents.as_bytes()).unwrap();
        file.close().unwrap();
    }

    /// Names of the files in the root directory.
    pub fn file_names(&self) -> Vec<String> {
        let manager = VolumeManager::new(self, FixedTimeSource);
        let volume = manager.open_volume(VolumeIdx(0)).unwrap();
        let root = volume.open_root_dir().unwrap();
        let mut names = Vec::new();
        root.iterate_dir(|entry| {
            if !entry.attributes.is_volume() && !entry.attributes.is_directory() {
                names.push(entry.name.to_string());
            }
        })
        .unwrap();
        names
    }
}

impl BlockDevice for &RamDisk {
    type Error = core::convert::Infallible;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (lba, block) in (start_block_idx.0..).zip(blocks.iter_mut()) {
            block.contents = self.block(lba);
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (lba, block) in (start_block_idx.0..).zip(blocks.iter()) {
            self.set_block(lba, &block.contents);
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(RamDisk::BLOCKS))
    }
}

/// Where the device is in the current Bulk-Only command
enum Phase {
    Command,
    DataIn {
        data: Vec<u8>,
        csw: CommandStatusWrapper,
    },
    DataOut {
        cbw: CommandBlockWrapper,
        received: Vec<u8>,
    },
    Status(CommandStatusWrapper),
}

/// A flash drive on the other end of a [`HostDriver`].
pub(crate) struct SimulatedFlashDrive {
    disk: Rc<RamDisk>,
    plugged: bool,
    reported: bool,
    address: u8,
    configured: bool,
    phase: Phase,
    sense: Sense,
    /// TEST UNIT READY answers "becoming ready" this many more times
    pub not_ready_polls: u32,
    /// Answer GET_MAX_LUN with a stall, like many single-LUN drives
    pub stall_max_lun: bool,
    /// WRITE(10) commands accepted before the medium starts failing
    pub write_budget: Option<u32>,
    /// Last LBA reported by READ CAPACITY(10)
    pub last_lba: u32,
    pub waited_ms: u32,
    /// Opcodes received, in order
    pub commands: Vec<u8>,
}

impl SimulatedFlashDrive {
    pub fn new(disk: Rc<RamDisk>) -> Self {
        Self {
            disk,
            plugged: false,
            reported: false,
            address: 0,
            configured: false,
            phase: Phase::Command,
            sense: NO_SENSE,
            not_ready_polls: 0,
            stall_max_lun: false,
            write_budget: None,
            last_lba: RamDisk::BLOCKS - 1,
            waited_ms: 0,
            commands: Vec::new(),
        }
    }

    pub fn plug(&mut self) {
        self.plugged = true;
        self.address = 0;
        self.configured = false;
        self.phase = Phase::Command;
    }

    pub fn unplug(&mut self) {
        self.plugged = false;
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    fn check(&self, address: u8) -> Result<(), TransferError> {
        if !self.plugged {
            Err(TransferError::Disconnected)
        } else if address != self.address {
            Err(TransferError::Timeout)
        } else {
            Ok(())
        }
    }

    fn check_bulk(&self, pipe: &BulkPipe, endpoint: u8) -> Result<(), TransferError> {
        self.check(pipe.address)?;
        if !self.configured || pipe.endpoint != endpoint {
            return Err(TransferError::Stall);
        }
        Ok(())
    }

    fn command(&mut self, cbw: CommandBlockWrapper) -> Phase {
        let opcode = cbw.command[0];
        self.commands.push(opcode);
        match opcode {
            TEST_UNIT_READY if self.not_ready_polls > 0 => {
                self.not_ready_polls -= 1;
                self.fail(&cbw, BECOMING_READY)
            }
            TEST_UNIT_READY => Phase::Status(passed(&cbw, 0)),
            REQUEST_SENSE => {
                let mut data = vec![0u8; 18];
                data[0] = 0x70;
                data[2] = self.sense.key;
                data[7] = 10;
                data[12] = self.sense.asc;
                data[13] = self.sense.ascq;
                self.sense = NO_SENSE;
                data_in(&cbw, data)
            }
            INQUIRY => {
                let mut data = vec![0x00, 0x80, 0x04, 0x02, 31, 0, 0, 0];
                data.extend_from_slice(b"ACME    Flash Drive     1.00");
                data_in(&cbw, data)
            }
            READ_CAPACITY_10 => {
                let mut data = self.last_lba.to_be_bytes().to_vec();
                data.extend_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
                data_in(&cbw, data)
            }
            READ_10 => {
                let (lba, count) = rw10_fields(&cbw);
                if lba + count > RamDisk::BLOCKS {
                    return self.fail(&cbw, LBA_OUT_OF_RANGE);
                }
                let data = (lba..lba + count).flat_map(|lba| self.disk.block(lba)).collect();
                data_in(&cbw, data)
            }
            WRITE_10 => Phase::DataOut {
                cbw,
                received: Vec::new(),
            },
            _ => self.fail(&cbw, INVALID_OPCODE),
        }
    }

    fn finish_write(&mut self, cbw: CommandBlockWrapper, received: &[u8]) -> Phase {
        let (lba, count) = rw10_fields(&cbw);
        if lba + count > RamDisk::BLOCKS {
            return self.fail(&cbw, LBA_OUT_OF_RANGE);
        }
        if let Some(budget) = self.write_budget.as_mut() {
            if *budget == 0 {
                return self.fail(&cbw, WRITE_FAULT);
            }
            *budget -= 1;
        }
        for (lba, chunk) in (lba..).zip(received.chunks_exact(BLOCK_SIZE)) {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            self.disk.set_block(lba, &block);
        }
        Phase::Status(passed(&cbw, 0))
    }

    /// Report CHECK CONDITION; an IN data stage is answered with a zero-length packet.
    fn fail(&mut self, cbw: &CommandBlockWrapper, sense: Sense) -> Phase {
        self.sense = sense;
        let csw = CommandStatusWrapper {
            tag: cbw.tag,
            residue: cbw.data_transfer_length,
            status: CommandStatus::Failed,
        };
        if cbw.direction_in && cbw.data_transfer_length > 0 {
            Phase::DataIn { data: Vec::new(), csw }
        } else {
            Phase::Status(csw)
        }
    }
}

fn passed(cbw: &CommandBlockWrapper, residue: u32) -> CommandStatusWrapper {
    CommandStatusWrapper {
        tag: cbw.tag,
        residue,
        status: CommandStatus::Passed,
    }
}

fn data_in(cbw: &CommandBlockWrapper, mut data: Vec<u8>) -> Phase {
    data.truncate(cbw.data_transfer_length as usize);
    let residue = cbw.data_transfer_length - data.len() as u32;
    Phase::DataIn {
        data,
        csw: passed(cbw, residue),
    }
}

fn rw10_fields(cbw: &CommandBlockWrapper) -> (u32, u32) {
    let c = &cbw.command;
    let lba = u32::from_be_bytes([c[2], c[3], c[4], c[5]]);
    let count = u32::from(u16::from_be_bytes([c[7], c[8]]));
    (lba, count)
}

fn advance_toggle(pipe: &mut BulkPipe, len: usize) {
    for _ in 0..pipe.packet_count(len) {
        pipe.toggle.flip();
    }
}

impl HostDriver for SimulatedFlashDrive {
    fn poll_port(&mut self) -> PortEvent {
        if self.plugged == self.reported {
            return PortEvent::None;
        }
        self.reported = self.plugged;
        if self.plugged {
            PortEvent::Connected
        } else {
            PortEvent::Disconnected
        }
    }

    fn reset_port(&mut self) -> Result<DeviceSpeed, TransferError> {
        if !self.plugged {
            return Err(TransferError::Disconnected);
        }
        self.address = 0;
        self.configured = false;
        self.phase = Phase::Command;
        Ok(DeviceSpeed::Full)
    }

    fn control_in(
        &mut self,
        target: ControlTarget,
        setup: &SetupPacket,
        buf: &mut [u8],
    ) -> Result<usize, TransferError> {
        self.check(target.address)?;
        let response: &[u8] = match (setup.request_type, setup.request) {
            (DIR_IN, GET_DESCRIPTOR) => match (setup.value >> 8) as u8 {
                DESCRIPTOR_DEVICE => &DEVICE_DESCRIPTOR,
                DESCRIPTOR_CONFIGURATION => &CONFIGURATION,
                _ => return Err(TransferError::Stall),
            },
            (request_type, REQUEST_GET_MAX_LUN)
                if request_type == DIR_IN | TYPE_CLASS | RECIPIENT_INTERFACE && !self.stall_max_lun =>
            {
                &[0]
            }
            _ => return Err(TransferError::Stall),
        };
        let len = response.len().min(usize::from(setup.length)).min(buf.len());
        buf[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }

    fn control_out(&mut self, target: ControlTarget, setup: &SetupPacket, _data: &[u8]) -> Result<(), TransferError> {
        self.check(target.address)?;
        match (setup.request_type, setup.request) {
            (0, SET_ADDRESS) => self.address = setup.value as u8,
            (0, SET_CONFIGURATION) => self.configured = setup.value == u16::from(CONFIGURATION[5]),
            (RECIPIENT_ENDPOINT, CLEAR_FEATURE) => {}
            (request_type, REQUEST_BULK_ONLY_RESET) if request_type == TYPE_CLASS | RECIPIENT_INTERFACE => {
                self.phase = Phase::Command;
            }
            _ => return Err(TransferError::Stall),
        }
        Ok(())
    }

    fn bulk_in(&mut self, pipe: &mut BulkPipe, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.check_bulk(pipe, BULK_IN_ENDPOINT)?;
        match core::mem::replace(&mut self.phase, Phase::Command) {
            Phase::DataIn { data, csw } => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                advance_toggle(pipe, len);
                self.phase = Phase::Status(csw);
                Ok(len)
            }
            Phase::Status(csw) => {
                let len = CSW_LEN.min(buf.len());
                buf[..len].copy_from_slice(&csw.to_bytes()[..len]);
                advance_toggle(pipe, len);
                Ok(len)
            }
            other => {
                self.phase = other;
                Err(TransferError::Stall)
            }
        }
    }

    fn bulk_out(&mut self, pipe: &mut BulkPipe, data: &[u8]) -> Result<(), TransferError> {
        self.check_bulk(pipe, BULK_OUT_ENDPOINT)?;
        self.phase = match core::mem::replace(&mut self.phase, Phase::Command) {
            Phase::Command => {
                let cbw = CommandBlockWrapper::parse(data).ok_or(TransferError::Stall)?;
                self.command(cbw)
            }
            Phase::DataOut { cbw, mut received } => {
                received.extend_from_slice(data);
                if received.len() < cbw.data_transfer_length as usize {
                    Phase::DataOut { cbw, received }
                } else {
                    self.finish_write(cbw, &received)
                }
            }
            other => {
                self.phase = other;
                return Err(TransferError::Stall);
            }
        };
        advance_toggle(pipe, data.len());
        Ok(())
    }

    fn wait_ms(&mut self, ms: u32) {
        self.waited_ms = self.waited_ms.saturating_add(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_disk_mounts_empty() {
        let disk = RamDisk::formatted();
        assert!(disk.file_names().is_empty());
        disk.write_file("HELLO.TXT", "hi\n");
        assert_eq!(disk.file_names(), ["HELLO.TXT"]);
        assert_eq!(disk.read_file("HELLO.TXT").as_deref(), Some("hi\n"));
        assert_eq!(disk.read_file("NOPE.TXT"), None);
    }
}
