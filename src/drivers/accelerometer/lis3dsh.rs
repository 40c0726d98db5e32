//! LIS3DSH 3-axis accelerometer driver
//!
//! The chip is run the way the Discovery board support package configures it:
//! - 100 Hz output data rate, X/Y/Z enabled
//! - +/-2 g full scale (0.06 mg/digit)
//! - 800 Hz anti-aliasing filter, self test off
//! - Register address auto-increment for burst reads of the output registers

use super::{AccelError, Accelerometer, RegisterBus, WHO_AM_I};
use embedded_hal::spi::SpiDevice;

/// Value of WHO_AM_I on a LIS3DSH
pub const WHO_AM_I_VALUE: u8 = 0x3F;

/// Register addresses for the LIS3DSH
#[repr(u8)]
#[derive(Copy, Clone)]
enum Register {
    CtrlReg4 = 0x20,
    CtrlReg5 = 0x24,
    CtrlReg6 = 0x25,
    OutXL = 0x28,
}

/// Output data rate, CTRL_REG4 bits 7:4
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
#[allow(dead_code)]
pub enum DataRate {
    Hz3_125 = 0b0001 << 4,
    Hz6_25 = 0b0010 << 4,
    Hz12_5 = 0b0011 << 4,
    Hz25 = 0b0100 << 4,
    Hz50 = 0b0101 << 4,
    Hz100 = 0b0110 << 4,
    Hz400 = 0b0111 << 4,
    Hz800 = 0b1000 << 4,
    Hz1600 = 0b1001 << 4,
}

/// Full-scale selection, CTRL_REG5 bits 5:3
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
#[allow(dead_code)]
pub enum FullScale {
    G2 = 0b000 << 3,
    G4 = 0b001 << 3,
    G6 = 0b010 << 3,
    G8 = 0b011 << 3,
    G16 = 0b100 << 3,
}

impl FullScale {
    /// Sensitivity in micro-g per LSB, from the datasheet
    const fn ug_per_digit(self) -> i32 {
        match self {
            FullScale::G2 => 60,
            FullScale::G4 => 120,
            FullScale::G6 => 180,
            FullScale::G8 => 240,
            FullScale::G16 => 730,
        }
    }
}

/// LIS3DSH configuration
#[derive(Debug, Clone, Copy)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct Lis3dshConfig {
    pub data_rate: DataRate,
    pub full_scale: FullScale,
}

impl Default for Lis3dshConfig {
    fn default() -> Self {
        Self {
            data_rate: DataRate::Hz100,
            full_scale: FullScale::G2,
        }
    }
}

/// LIS3DSH driver
pub struct Lis3dsh<SPI> {
    bus: RegisterBus<SPI>,
    config: Lis3dshConfig,
}

impl<SPI: SpiDevice> Lis3dsh<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self::from_bus(RegisterBus::new(spi))
    }

    pub(crate) fn from_bus(bus: RegisterBus<SPI>) -> Self {
        Self {
            bus,
            config: Lis3dshConfig::default(),
        }
    }

    /// Convert a raw little-endian output triple to milli-g.
    fn scale(&self, raw: &[u8; 6]) -> [i16; 3] {
        let ug = self.config.full_scale.ug_per_digit();
        core::array::from_fn(|axis| {
            let counts = i16::from_le_bytes([raw[2 * axis], raw[2 * axis + 1]]);
            // Truncates toward zero
            (i32::from(counts) * ug / 1000) as i16
        })
    }
}

impl<SPI: SpiDevice> Accelerometer for Lis3dsh<SPI> {
    type Error = AccelError<SPI::Error>;

    fn init(&mut self) -> Result<(), Self::Error> {
        debug!("LIS3DSH config: {:?}", self.config);

        let id = self.bus.read_register(WHO_AM_I).map_err(AccelError::Spi)?;
        if id != WHO_AM_I_VALUE {
            error!("Wrong chip ID: expected 0x{:02X}, got 0x{:02X}", WHO_AM_I_VALUE, id);
            return Err(AccelError::DeviceNotFound(id));
        }

        // ODR plus X, Y and Z enable (bits 2:0)
        const AXES_ENABLE: u8 = 0b0000_0111;
        self.bus
            .write_register(Register::CtrlReg4 as u8, self.config.data_rate as u8 | AXES_ENABLE)
            .map_err(AccelError::Spi)?;

        // Anti-aliasing bandwidth 800 Hz (bits 7:6 = 00), self test off, 4-wire SPI
        self.bus
            .write_register(Register::CtrlReg5 as u8, self.config.full_scale as u8)
            .map_err(AccelError::Spi)?;

        // Auto-increment register address on multi-byte access
        const ADD_INC: u8 = 0b0001_0000;
        self.bus
            .write_register(Register::CtrlReg6 as u8, ADD_INC)
            .map_err(AccelError::Spi)?;

        info!("LIS3DSH initialized");
        Ok(())
    }

    fn read_xyz(&mut self) -> Result<[i16; 3], Self::Error> {
        let mut raw = [0u8; 6];
        self.bus
            .read_register_burst(Register::OutXL as u8, &mut raw)
            .map_err(AccelError::Spi)?;
        Ok(self.scale(&raw))
    }
}
