//! Standard requests and descriptor parsing needed to find a mass-storage interface.

use super::driver::DeviceSpeed;

/// bmRequestType direction bit
pub const DIR_IN: u8 = 0x80;
/// bmRequestType type: class request
pub const TYPE_CLASS: u8 = 0x20;
/// bmRequestType recipients
pub const RECIPIENT_INTERFACE: u8 = 0x01;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;

/// Standard request codes
pub const CLEAR_FEATURE: u8 = 0x01;
pub const SET_ADDRESS: u8 = 0x05;
pub const GET_DESCRIPTOR: u8 = 0x06;
pub const SET_CONFIGURATION: u8 = 0x09;

/// Feature selector for CLEAR_FEATURE on an endpoint
pub const ENDPOINT_HALT: u16 = 0x0000;

/// Descriptor types
pub const DESCRIPTOR_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_ENDPOINT: u8 = 0x05;

/// Mass Storage class, SCSI transparent command set, Bulk-Only Transport
pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const SUBCLASS_SCSI: u8 = 0x06;
pub const PROTOCOL_BULK_ONLY: u8 = 0x50;

const ENDPOINT_TYPE_MASK: u8 = 0x03;
const ENDPOINT_TYPE_BULK: u8 = 0x02;

/// The 8-byte SETUP packet of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn get_descriptor(descriptor_type: u8, index: u8, length: u16) -> Self {
        Self {
            request_type: DIR_IN,
            request: GET_DESCRIPTOR,
            value: u16::from(descriptor_type) << 8 | u16::from(index),
            index: 0,
            length,
        }
    }

    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: 0,
            request: SET_ADDRESS,
            value: u16::from(address),
            index: 0,
            length: 0,
        }
    }

    pub fn set_configuration(value: u8) -> Self {
        Self {
            request_type: 0,
            request: SET_CONFIGURATION,
            value: u16::from(value),
            index: 0,
            length: 0,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) on `endpoint_address` (direction bit included)
    pub fn clear_halt(endpoint_address: u8) -> Self {
        Self {
            request_type: RECIPIENT_ENDPOINT,
            request: CLEAR_FEATURE,
            value: ENDPOINT_HALT,
            index: u16::from(endpoint_address),
            length: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn is_in(&self) -> bool {
        self.request_type & DIR_IN != 0
    }
}

/// Malformed or unsupported descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum DescriptorError {
    /// Shorter than its header claims, or than the fixed part of the type
    Truncated,
    /// bDescriptorType is not what was requested
    WrongType,
    /// No interface with a bulk IN and a bulk OUT endpoint speaking SCSI over BOT
    NoMassStorageInterface,
}

/// The fields of the device descriptor the host uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LEN: usize = 18;

    /// Parse a device descriptor. The first 8 bytes are enough to learn the
    /// control endpoint's packet size; the rest is read as zero until available.
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() < 8 {
            return Err(DescriptorError::Truncated);
        }
        if bytes[1] != DESCRIPTOR_DEVICE {
            return Err(DescriptorError::WrongType);
        }
        let byte = |i: usize| bytes.get(i).copied().unwrap_or(0);
        Ok(Self {
            usb_version: u16::from_le_bytes([bytes[2], bytes[3]]),
            max_packet_size0: bytes[7],
            vendor_id: u16::from_le_bytes([byte(8), byte(9)]),
            product_id: u16::from_le_bytes([byte(10), byte(11)]),
            num_configurations: byte(17),
        })
    }
}

/// Header of a configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct ConfigurationHeader {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
}

impl ConfigurationHeader {
    pub const LEN: usize = 9;

    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() < Self::LEN {
            return Err(DescriptorError::Truncated);
        }
        if bytes[1] != DESCRIPTOR_CONFIGURATION {
            return Err(DescriptorError::WrongType);
        }
        Ok(Self {
            total_length: u16::from_le_bytes([bytes[2], bytes[3]]),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
        })
    }
}

/// A bulk endpoint as described by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct BulkEndpoint {
    /// bEndpointAddress, direction bit included
    pub address: u8,
    pub max_packet_size: u16,
}

impl BulkEndpoint {
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.address & DIR_IN != 0
    }
}

/// A Bulk-Only mass storage interface found in a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct MassStorageInterface {
    pub interface_number: u8,
    pub bulk_in: BulkEndpoint,
    pub bulk_out: BulkEndpoint,
}

/// Walk a full configuration descriptor and return the first SCSI/BOT interface
/// with both bulk endpoints.
pub fn find_mass_storage(config: &[u8]) -> Result<MassStorageInterface, DescriptorError> {
    ConfigurationHeader::parse(config)?;

    let mut offset = 0;
    let mut current: Option<u8> = None;
    let mut bulk_in = None;
    let mut bulk_out = None;

    while offset + 2 <= config.len() {
        let len = usize::from(config[offset]);
        if len < 2 || offset + len > config.len() {
            return Err(DescriptorError::Truncated);
        }
        let descriptor = &config[offset..offset + len];

        match descriptor[1] {
            DESCRIPTOR_INTERFACE if len >= 9 => {
                // A new interface starts, so the previous one is complete
                if let (Some(interface_number), Some(bulk_in), Some(bulk_out)) = (current, bulk_in, bulk_out) {
                    return Ok(MassStorageInterface {
                        interface_number,
                        bulk_in,
                        bulk_out,
                    });
                }
                bulk_in = None;
                bulk_out = None;
                let is_msc = descriptor[5] == CLASS_MASS_STORAGE
                    && descriptor[6] == SUBCLASS_SCSI
                    && descriptor[7] == PROTOCOL_BULK_ONLY;
                current = is_msc.then_some(descriptor[2]);
            }
            DESCRIPTOR_ENDPOINT if len >= 7 && current.is_some() => {
                if descriptor[3] & ENDPOINT_TYPE_MASK == ENDPOINT_TYPE_BULK {
                    let endpoint = BulkEndpoint {
                        address: descriptor[2],
                        max_packet_size: u16::from_le_bytes([descriptor[4], descriptor[5]]) & 0x07FF,
                    };
                    if endpoint.is_in() {
                        bulk_in.get_or_insert(endpoint);
                    } else {
                        bulk_out.get_or_insert(endpoint);
                    }
                }
            }
            _ => {}
        }

        offset += len;
    }

    match (current, bulk_in, bulk_out) {
        (Some(interface_number), Some(bulk_in), Some(bulk_out)) => Ok(MassStorageInterface {
            interface_number,
            bulk_in,
            bulk_out,
        }),
        _ => Err(DescriptorError::NoMassStorageInterface),
    }
}

/// Default control pipe packet size before the device descriptor is known
pub fn default_max_packet_size0(speed: DeviceSpeed) -> u16 {
    match speed {
        DeviceSpeed::Full => 64,
        DeviceSpeed::Low => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Configuration of a typical flash drive: one MSC interface, bulk IN 0x81, bulk OUT 0x02
    const FLASH_DRIVE_CONFIG: [u8; 32] = [
        0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // configuration
        0x09, 0x04, 0x00, 0x00, 0x02, 0x08, 0x06, 0x50, 0x00, // interface 0, MSC
        0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, // bulk IN, 64
        0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00, // bulk OUT, 64
    ];

    #[test]
    fn setup_packet_layout() {
        let setup = SetupPacket::get_descriptor(DESCRIPTOR_CONFIGURATION, 0, 0x0109);
        assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x01]);
        assert_eq!(SetupPacket::from_bytes(&setup.to_bytes()), setup);
        assert!(setup.is_in());
        assert_eq!(
            SetupPacket::clear_halt(0x81).to_bytes(),
            [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn parses_device_descriptor_prefix() {
        let prefix = [0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40];
        let descriptor = DeviceDescriptor::parse(&prefix).unwrap();
        assert_eq!(descriptor.max_packet_size0, 64);
        assert_eq!(descriptor.usb_version, 0x0200);
        assert_eq!(descriptor.vendor_id, 0);

        assert_eq!(DeviceDescriptor::parse(&prefix[..4]), Err(DescriptorError::Truncated));
        let mut wrong = prefix;
        wrong[1] = DESCRIPTOR_CONFIGURATION;
        assert_eq!(DeviceDescriptor::parse(&wrong), Err(DescriptorError::WrongType));
    }

    #[test]
    fn finds_flash_drive_interface() {
        let msc = find_mass_storage(&FLASH_DRIVE_CONFIG).unwrap();
        assert_eq!(msc.interface_number, 0);
        assert_eq!(msc.bulk_in.address, 0x81);
        assert_eq!(msc.bulk_in.number(), 1);
        assert_eq!(msc.bulk_out.address, 0x02);
        assert_eq!(msc.bulk_out.max_packet_size, 64);
    }

    #[test]
    fn skips_non_storage_interfaces() {
        // HID interface with an interrupt endpoint ahead of the MSC interface
        let mut config = vec![0x09, 0x02, 0x00, 0x00, 0x02, 0x01, 0x00, 0x80, 0x32];
        config.extend_from_slice(&[0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00]);
        config.extend_from_slice(&[0x07, 0x05, 0x83, 0x03, 0x08, 0x00, 0x0A]);
        config.extend_from_slice(&FLASH_DRIVE_CONFIG[9..]);
        config[27] = 0x01; // bInterfaceNumber of the MSC interface
        let total = config.len() as u16;
        config[2..4].copy_from_slice(&total.to_le_bytes());

        let msc = find_mass_storage(&config).unwrap();
        assert_eq!(msc.interface_number, 1);
        assert_eq!(msc.bulk_in.address, 0x81);
    }

    #[test]
    fn rejects_configuration_without_storage() {
        let mut config = FLASH_DRIVE_CONFIG;
        config[9 + 5] = 0x03; // HID
        assert_eq!(find_mass_storage(&config), Err(DescriptorError::NoMassStorageInterface));

        assert_eq!(find_mass_storage(&FLASH_DRIVE_CONFIG[..20]), Err(DescriptorError::Truncated));
    }
}
