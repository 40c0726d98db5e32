//! LIS302DL 3-axis accelerometer driver (early Discovery board revisions).
//!
//! 8-bit outputs, run at 100 Hz with the +/-2.3 g range (18 mg/digit).

use super::{AccelError, Accelerometer, RegisterBus, WHO_AM_I};
use embedded_hal::spi::SpiDevice;

/// Value of WHO_AM_I on a LIS302DL
pub const WHO_AM_I_VALUE: u8 = 0x3B;

/// Sensitivity at +/-2.3 g
const MG_PER_DIGIT: i16 = 18;

#[repr(u8)]
#[derive(Copy, Clone)]
enum Register {
    CtrlReg1 = 0x20,
    OutX = 0x29,
    OutY = 0x2B,
    OutZ = 0x2D,
}

/// LIS302DL driver
pub struct Lis302dl<SPI> {
    bus: RegisterBus<SPI>,
}

impl<SPI: SpiDevice> Lis302dl<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self::from_bus(RegisterBus::new(spi))
    }

    pub(crate) fn from_bus(bus: RegisterBus<SPI>) -> Self {
        Self { bus }
    }

    fn read_axis(&mut self, reg: Register) -> Result<i16, AccelError<SPI::Error>> {
        let raw = self.bus.read_register(reg as u8).map_err(AccelError::Spi)?;
        Ok(i16::from(raw as i8) * MG_PER_DIGIT)
    }
}

impl<SPI: SpiDevice> Accelerometer for Lis302dl<SPI> {
    type Error = AccelError<SPI::Error>;

    fn init(&mut self) -> Result<(), Self::Error> {
        let id = self.bus.read_register(WHO_AM_I).map_err(AccelError::Spi)?;
        if id != WHO_AM_I_VALUE {
            error!("Wrong chip ID: expected 0x{:02X}, got 0x{:02X}", WHO_AM_I_VALUE, id);
            return Err(AccelError::DeviceNotFound(id));
        }

        // DR = 0 (100 Hz), PD = 1 (active), FS = 0 (2.3 g), self test off, X/Y/Z enabled
        const CTRL_REG1_ACTIVE_XYZ: u8 = 0b0100_0111;
        self.bus
            .write_register(Register::CtrlReg1 as u8, CTRL_REG1_ACTIVE_XYZ)
            .map_err(AccelError::Spi)?;

        info!("LIS302DL initialized");
        Ok(())
    }

    fn read_xyz(&mut self) -> Result<[i16; 3], Self::Error> {
        Ok([
            self.read_axis(Register::OutX)?,
            self.read_axis(Register::OutY)?,
            self.read_axis(Register::OutZ)?,
        ])
    }
}
