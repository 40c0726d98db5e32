//! Root-port state machine: attach, enumerate, bring up the mass-storage class.

use super::descriptor::{
    default_max_packet_size0, find_mass_storage, BulkEndpoint, ConfigurationHeader, DescriptorError, DeviceDescriptor,
    MassStorageInterface, SetupPacket, DESCRIPTOR_CONFIGURATION, DESCRIPTOR_DEVICE, DIR_IN, RECIPIENT_INTERFACE,
    TYPE_CLASS,
};
use super::driver::{BulkPipe, ControlTarget, DataToggle, DeviceSpeed, HostDriver, PortEvent, TransferError};
use super::msc::bot::{BotDevice, BulkOnly, REQUEST_GET_MAX_LUN};
use super::msc::{MassStorage, MscDevice, MscError, BLOCK_SIZE};

/// The one device on the port always gets this address
pub const DEVICE_ADDRESS: u8 = 1;

/// Attach debounce before the first reset (USB 2.0, TATTDB)
const ATTACH_SETTLE_MS: u32 = 100;
/// Recovery after SET_ADDRESS (TRSTRCY)
const SET_ADDRESS_RECOVERY_MS: u32 = 2;
/// Room for the configuration descriptor of any sensible flash drive
const CONFIG_BUFFER_LEN: usize = 256;

/// TEST UNIT READY polls before giving up on a drive that keeps reporting not-ready
const UNIT_READY_ATTEMPTS: u32 = 50;
const UNIT_READY_POLL_MS: u32 = 100;

/// Where the port is in bringing up a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum HostState {
    /// Nothing on the port
    Detached,
    /// A device is connected but not yet enumerated
    Attached,
    /// Addressed and configured, class not yet started
    Enumerated,
    /// The mass-storage class is ready for block I/O
    ClassActive,
    /// Bring-up failed; stays here until the device is unplugged
    Failed,
}

/// Why bring-up failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum HostError {
    Transfer(TransferError),
    Descriptor(DescriptorError),
    Msc(MscError),
}

impl From<TransferError> for HostError {
    fn from(error: TransferError) -> Self {
        HostError::Transfer(error)
    }
}

impl From<DescriptorError> for HostError {
    fn from(error: DescriptorError) -> Self {
        HostError::Descriptor(error)
    }
}

impl From<MscError> for HostError {
    fn from(error: MscError) -> Self {
        HostError::Msc(error)
    }
}

/// What a call to [`UsbHost::process`] changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum HostEvent {
    Connected,
    ConfigurationSelected,
    ClassActive,
    Disconnected,
    EnumerationFailed(HostError),
}

/// A single-port USB host that only knows how to talk to flash drives.
pub struct UsbHost<D> {
    driver: D,
    state: HostState,
    control: ControlTarget,
    interface: Option<MassStorageInterface>,
    device: Option<MscDevice>,
}

impl<D: HostDriver> UsbHost<D> {
    /// Create a host on an idle root port
    ///
    /// # Arguments
    /// * `driver` - Controller driver for the root port
    ///
    /// # Returns
    /// A host in the `Detached` state. Nothing happens until [`UsbHost::process`] is polled.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            state: HostState::Detached,
            control: ControlTarget {
                address: 0,
                max_packet_size: default_max_packet_size0(DeviceSpeed::Full),
                speed: DeviceSpeed::Full,
            },
            interface: None,
            device: None,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// The active mass-storage device as a block device, if the class is up.
    pub fn mass_storage(&mut self) -> Option<MassStorage<'_, D>> {
        match (self.state, self.device.as_mut()) {
            (HostState::ClassActive, Some(device)) => Some(MassStorage::new(&mut self.driver, device)),
            _ => None,
        }
    }

    /// Advance bring-up by one step. Port changes take priority over enumeration work.
    pub fn process(&mut self) -> Option<HostEvent> {
        match self.driver.poll_port() {
            PortEvent::Disconnected => {
                self.forget_device();
                if self.state == HostState::Detached {
                    return None;
                }
                info!("USB: device disconnected");
                self.state = HostState::Detached;
                return Some(HostEvent::Disconnected);
            }
            PortEvent::Connected => {
                info!("USB: device connected");
                self.forget_device();
                self.state = HostState::Attached;
                return Some(HostEvent::Connected);
            }
            PortEvent::None => {}
        }

        match self.state {
            HostState::Attached => match self.enumerate() {
                Ok(interface) => {
                    self.interface = Some(interface);
                    self.state = HostState::Enumerated;
                    Some(HostEvent::ConfigurationSelected)
                }
                Err(e) => Some(self.fail(e)),
            },
            HostState::Enumerated => {
                let started = match self.interface {
                    Some(interface) => self.start_class(interface),
                    None => Err(HostError::Descriptor(DescriptorError::NoMassStorageInterface)),
                };
                match started {
                    Ok(device) => {
                        info!(
                            "USB: mass storage ready, {} blocks of {} bytes",
                            device.capacity.block_count, device.capacity.block_size
                        );
                        self.device = Some(device);
                        self.state = HostState::ClassActive;
                        Some(HostEvent::ClassActive)
                    }
                    Err(e) => Some(self.fail(e)),
                }
            }
            HostState::Detached | HostState::ClassActive | HostState::Failed => None,
        }
    }

    fn fail(&mut self, error: HostError) -> HostEvent {
        warn!("USB: bring-up failed: {:?}", error);
        self.forget_device();
        self.state = HostState::Failed;
        HostEvent::EnumerationFailed(error)
    }

    fn forget_device(&mut self) {
        self.interface = None;
        self.device = None;
    }

    /// Reset, address and configure the device, returning its mass-storage interface.
    fn enumerate(&mut self) -> Result<MassStorageInterface, HostError> {
        self.driver.wait_ms(ATTACH_SETTLE_MS);
        let speed = self.driver.reset_port()?;
        let mut control = ControlTarget {
            address: 0,
            max_packet_size: default_max_packet_size0(speed),
            speed,
        };
        debug!("USB: port reset, {:?} speed", speed);

        // The first 8 bytes carry bMaxPacketSize0
        let mut buf = [0u8; DeviceDescriptor::LEN];
        let len = self.driver.control_in(
            control,
            &SetupPacket::get_descriptor(DESCRIPTOR_DEVICE, 0, 8),
            &mut buf[..8],
        )?;
        let prefix = DeviceDescriptor::parse(&buf[..len])?;
        control.max_packet_size = u16::from(prefix.max_packet_size0).max(8);

        self.driver
            .control_out(control, &SetupPacket::set_address(DEVICE_ADDRESS), &[])?;
        self.driver.wait_ms(SET_ADDRESS_RECOVERY_MS);
        control.address = DEVICE_ADDRESS;

        let len = self.driver.control_in(
            control,
            &SetupPacket::get_descriptor(DESCRIPTOR_DEVICE, 0, DeviceDescriptor::LEN as u16),
            &mut buf,
        )?;
        let device = DeviceDescriptor::parse(&buf[..len])?;
        info!(
            "USB: device {:04X}:{:04X}, USB {:04X}, ep0 {} bytes",
            device.vendor_id, device.product_id, device.usb_version, control.max_packet_size
        );

        let mut config = [0u8; CONFIG_BUFFER_LEN];
        let len = self.driver.control_in(
            control,
            &SetupPacket::get_descriptor(DESCRIPTOR_CONFIGURATION, 0, ConfigurationHeader::LEN as u16),
            &mut config[..ConfigurationHeader::LEN],
        )?;
        let header = ConfigurationHeader::parse(&config[..len])?;
        let total = usize::from(header.total_length).clamp(ConfigurationHeader::LEN, CONFIG_BUFFER_LEN);
        let len = self.driver.control_in(
            control,
            &SetupPacket::get_descriptor(DESCRIPTOR_CONFIGURATION, 0, total as u16),
            &mut config[..total],
        )?;
        let interface = find_mass_storage(&config[..len])?;
        debug!(
            "USB: MSC interface {}, bulk IN 0x{:02X}, bulk OUT 0x{:02X}",
            interface.interface_number, interface.bulk_in.address, interface.bulk_out.address
        );

        self.driver
            .control_out(control, &SetupPacket::set_configuration(header.configuration_value), &[])?;
        self.control = control;
        Ok(interface)
    }

    /// Bring up the Bulk-Only transport and wait for the medium.
    fn start_class(&mut self, interface: MassStorageInterface) -> Result<MscDevice, HostError> {
        let max_lun = self.max_lun(interface.interface_number)?;
        if max_lun > 0 {
            debug!("USB: {} LUNs, using LUN 0", max_lun + 1);
        }

        let control = self.control;
        let pipe = |endpoint: BulkEndpoint| BulkPipe {
            address: control.address,
            endpoint: endpoint.number(),
            max_packet_size: endpoint.max_packet_size,
            speed: control.speed,
            toggle: DataToggle::Data0,
        };
        let mut transport = BotDevice {
            control,
            interface: interface.interface_number,
            bulk_in: pipe(interface.bulk_in),
            bulk_out: pipe(interface.bulk_out),
            lun: 0,
            tag: 0,
        };

        let mut bot = BulkOnly::new(&mut self.driver, &mut transport);
        let inquiry = bot.inquiry()?;
        info!("USB: {} {}", inquiry.vendor(), inquiry.product());
        wait_until_ready(&mut bot)?;
        let capacity = bot.read_capacity()?;
        if capacity.block_size as usize != BLOCK_SIZE {
            return Err(MscError::UnsupportedBlockSize(capacity.block_size).into());
        }

        Ok(MscDevice { transport, capacity })
    }

    /// GET_MAX_LUN; devices with a single LUN may stall it.
    fn max_lun(&mut self, interface: u8) -> Result<u8, HostError> {
        let setup = SetupPacket {
            request_type: DIR_IN | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: REQUEST_GET_MAX_LUN,
            value: 0,
            index: u16::from(interface),
            length: 1,
        };
        let mut lun = [0u8; 1];
        match self.driver.control_in(self.control, &setup, &mut lun) {
            Ok(1) => Ok(lun[0] & 0x0F),
            Ok(_) | Err(TransferError::Stall) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

fn wait_until_ready<D: HostDriver>(bot: &mut BulkOnly<'_, D>) -> Result<(), MscError> {
    for _ in 0..UNIT_READY_ATTEMPTS {
        match bot.test_unit_ready() {
            Ok(()) => return Ok(()),
            Err(MscError::CheckCondition(sense)) if sense.is_transient() => bot.wait_ms(UNIT_READY_POLL_MS),
            Err(e) => return Err(e),
        }
    }
    Err(MscError::NotReady)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb_host::testing::{RamDisk, SimulatedFlashDrive};
    use embedded_sdmmc::BlockDevice;
    use std::rc::Rc;

    fn host() -> UsbHost<SimulatedFlashDrive> {
        UsbHost::new(SimulatedFlashDrive::new(Rc::new(RamDisk::formatted())))
    }

    /// Run `process` until it goes quiet, collecting the events.
    fn settle(host: &mut UsbHost<SimulatedFlashDrive>) -> Vec<HostEvent> {
        std::iter::from_fn(|| host.process()).take(10).collect()
    }

    #[test]
    fn stays_detached_without_device() {
        let mut host = host();
        assert_eq!(host.process(), None);
        assert_eq!(host.state(), HostState::Detached);
        assert!(host.mass_storage().is_none());
    }

    #[test]
    fn brings_up_flash_drive() {
        let mut host = host();
        host.driver_mut().plug();
        assert_eq!(
            settle(&mut host),
            [HostEvent::Connected, HostEvent::ConfigurationSelected, HostEvent::ClassActive]
        );
        assert_eq!(host.state(), HostState::ClassActive);
        assert_eq!(host.driver().address(), DEVICE_ADDRESS);
        assert!(host.driver().is_configured());

        let storage = host.mass_storage().unwrap();
        assert_eq!(storage.num_blocks().unwrap().0, RamDisk::BLOCKS);
    }

    #[test]
    fn waits_for_medium_and_tolerates_stalled_max_lun() {
        let mut host = host();
        host.driver_mut().not_ready_polls = 3;
        host.driver_mut().stall_max_lun = true;
        host.driver_mut().plug();
        assert_eq!(settle(&mut host).last(), Some(&HostEvent::ClassActive));
        assert_eq!(host.driver().not_ready_polls, 0);
        assert!(host.driver().waited_ms >= 3 * UNIT_READY_POLL_MS);
    }

    #[test]
    fn gives_up_on_medium_that_never_gets_ready() {
        let mut host = host();
        host.driver_mut().not_ready_polls = u32::MAX;
        host.driver_mut().plug();
        assert_eq!(
            settle(&mut host).last(),
            Some(&HostEvent::EnumerationFailed(HostError::Msc(MscError::NotReady)))
        );
        assert_eq!(host.state(), HostState::Failed);
        assert!(host.mass_storage().is_none());
    }

    #[test]
    fn rejects_medium_past_32_bit_lba() {
        let mut host = host();
        host.driver_mut().last_lba = u32::MAX;
        host.driver_mut().plug();
        assert_eq!(
            settle(&mut host).last(),
            Some(&HostEvent::EnumerationFailed(HostError::Msc(MscError::TooLarge)))
        );
        assert_eq!(host.state(), HostState::Failed);
    }

    #[test]
    fn disconnect_returns_to_detached() {
        let mut host = host();
        host.driver_mut().plug();
        settle(&mut host);
        host.driver_mut().unplug();
        assert_eq!(host.process(), Some(HostEvent::Disconnected));
        assert_eq!(host.state(), HostState::Detached);
        assert!(host.mass_storage().is_none());
        assert_eq!(host.process(), None);

        // Re-plugging runs bring-up again
        host.driver_mut().plug();
        assert_eq!(settle(&mut host).last(), Some(&HostEvent::ClassActive));
    }

    #[test]
    fn block_io_reaches_the_medium() {
        let disk = Rc::new(RamDisk::formatted());
        let mut host = UsbHost::new(SimulatedFlashDrive::new(disk.clone()));
        host.driver_mut().plug();
        settle(&mut host);

        let storage = host.mass_storage().unwrap();
        let mut blocks = [embedded_sdmmc::Block::new(), embedded_sdmmc::Block::new()];
        blocks[0].contents.fill(0xA5);
        blocks[1].contents.fill(0x5A);
        storage.write(&blocks, embedded_sdmmc::BlockIdx(100)).unwrap();
        assert_eq!(disk.block(101)[0], 0x5A);

        let mut back = [embedded_sdmmc::Block::new()];
        storage.read(&mut back, embedded_sdmmc::BlockIdx(100)).unwrap();
        assert_eq!(back[0].contents, [0xA5; BLOCK_SIZE]);

        let past_end = embedded_sdmmc::BlockIdx(RamDisk::BLOCKS - 1);
        assert_eq!(storage.read(&mut blocks, past_end), Err(MscError::OutOfRange));
    }
}
