//! The contract between the host stack and a USB host controller.

use super::descriptor::SetupPacket;

/// Device speed reported after a port reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum DeviceSpeed {
    Full,
    Low,
}

/// Root port change detected by [`HostDriver::poll_port`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum PortEvent {
    /// Nothing changed since the last poll
    None,
    /// A device was plugged in (after debounce)
    Connected,
    /// The device went away
    Disconnected,
}

/// Why a transfer did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum TransferError {
    /// The endpoint answered STALL
    Stall,
    /// The device kept answering NAK, or never answered
    Timeout,
    /// CRC, bit-stuff, babble or toggle error on the bus
    Transaction,
    /// The device sent more data than the buffer holds
    DataOverrun,
    /// The port lost the device during the transfer
    Disconnected,
}

/// DATA0/DATA1 toggle of a bulk pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum DataToggle {
    Data0,
    Data1,
}

impl DataToggle {
    pub fn flip(&mut self) {
        *self = match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        };
    }
}

/// Address and packet size of a device's default control pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct ControlTarget {
    pub address: u8,
    pub max_packet_size: u16,
    pub speed: DeviceSpeed,
}

/// A bulk endpoint on an addressed device. The driver advances `toggle` for every
/// data packet acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct BulkPipe {
    pub address: u8,
    /// Endpoint number without the direction bit
    pub endpoint: u8,
    pub max_packet_size: u16,
    pub speed: DeviceSpeed,
    pub toggle: DataToggle,
}

impl BulkPipe {
    /// Packets needed to move `len` bytes; a zero-length transfer still takes one.
    pub fn packet_count(&self, len: usize) -> usize {
        len.div_ceil(usize::from(self.max_packet_size)).max(1)
    }
}

/// A root port of a USB host controller, driven by polling.
///
/// All transfers are blocking. NAK retries, packet splitting and data toggles
/// are the driver's business; the stack only sees whole transfers.
pub trait HostDriver {
    /// Report connect/disconnect since the last call.
    fn poll_port(&mut self) -> PortEvent;

    /// Drive a bus reset and report the speed of the attached device.
    fn reset_port(&mut self) -> Result<DeviceSpeed, TransferError>;

    /// Control transfer with an IN data stage (or none when `buf` is empty).
    /// Returns the number of bytes received.
    fn control_in(
        &mut self,
        target: ControlTarget,
        setup: &SetupPacket,
        buf: &mut [u8],
    ) -> Result<usize, TransferError>;

    /// Control transfer with an OUT data stage (or none when `data` is empty).
    fn control_out(&mut self, target: ControlTarget, setup: &SetupPacket, data: &[u8]) -> Result<(), TransferError>;

    /// Read from a bulk IN endpoint until `buf` is full or a short packet ends the transfer.
    fn bulk_in(&mut self, pipe: &mut BulkPipe, buf: &mut [u8]) -> Result<usize, TransferError>;

    /// Write `data` to a bulk OUT endpoint.
    fn bulk_out(&mut self, pipe: &mut BulkPipe, data: &[u8]) -> Result<(), TransferError>;

    /// Busy-wait for a USB recovery interval (reset, set-address, attach settle).
    fn wait_ms(&mut self, ms: u32);
}
