//! Register access for ST MEMS sensors over a 4-wire SPI device.
//!
//! Both accelerometers use the same framing: the first byte carries the register
//! address with the MSB set for reads, followed by the data bytes.

use embedded_hal::spi::{Operation, SpiDevice};

/// Having the MSB of the register address set to 1 is the convention for reading from a register
const SPI_READ_BIT: u8 = 0x80;
/// Having the MSB of the register address set to 0 is the convention for writing to a register
const SPI_WRITE_MASK: u8 = 0x7F;

/// Register-level view of an SPI device. Chip select is owned by the `SpiDevice`.
pub struct RegisterBus<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> RegisterBus<SPI> {
    pub const fn new(spi: SPI) -> Self {
        Self { spi }
    }

    /// Give the SPI device back.
    pub fn release(self) -> SPI {
        self.spi
    }

    /// Read a single register.
    pub fn read_register(&mut self, reg: u8) -> Result<u8, SPI::Error> {
        let mut value = [0u8; 1];
        self.read_register_burst(reg, &mut value)?;
        Ok(value[0])
    }

    /// Write a single register.
    pub fn write_register(&mut self, reg: u8, value: u8) -> Result<(), SPI::Error> {
        self.spi.write(&[reg & SPI_WRITE_MASK, value])
    }

    /// Read consecutive registers starting at `reg` in one chip-select window.
    ///
    /// The device must be configured to auto-increment the address, or `reg` must
    /// already carry the device's multi-byte flag.
    pub fn read_register_burst(&mut self, reg: u8, buffer: &mut [u8]) -> Result<(), SPI::Error> {
        self.spi
            .transaction(&mut [Operation::Write(&[reg | SPI_READ_BIT]), Operation::Read(buffer)])
    }
}
