//! Accelerometers fitted to the STM32F4-Discovery.
//!
//! Board revisions up to MB997B carry the LIS302DL, later ones the LIS3DSH. Both sit
//! on SPI1 with the same chip select, so [`DiscoveryAccelerometer`] probes the
//! WHO_AM_I register and drives whichever chip answers. All readings are reported
//! in milli-g in the LIS3DSH axis frame.

mod bus;
pub mod lis302dl;
pub mod lis3dsh;

pub use bus::RegisterBus;
#[cfg(test)]
pub(crate) use bus::fake::FakeSensor;
pub use lis302dl::Lis302dl;
pub use lis3dsh::Lis3dsh;

use embedded_hal::spi::SpiDevice;

/// WHO_AM_I is at the same address on both chips
pub(crate) const WHO_AM_I: u8 = 0x0F;

/// A 3-axis accelerometer reporting milli-g.
pub trait Accelerometer {
    type Error;

    /// Configure the sensor for continuous measurement. Safe to call again.
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Read the latest X, Y, Z acceleration in milli-g.
    fn read_xyz(&mut self) -> Result<[i16; 3], Self::Error>;
}

/// Accelerometer driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum AccelError<E> {
    /// SPI communication error
    Spi(E),
    /// Nothing known answered, carries the WHO_AM_I value read
    DeviceNotFound(u8),
}

/// Which accelerometer was found on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum AccelModel {
    Lis3dsh,
    Lis302dl,
}

enum Chip<SPI> {
    Unprobed(RegisterBus<SPI>),
    Lis3dsh(Lis3dsh<SPI>),
    Lis302dl(Lis302dl<SPI>),
    /// Only observable if a previous probe panicked mid-swap
    Poisoned,
}

/// The Discovery board accelerometer, whichever chip is fitted.
pub struct DiscoveryAccelerometer<SPI> {
    chip: Chip<SPI>,
}

impl<SPI: SpiDevice> DiscoveryAccelerometer<SPI> {
    /// Create the driver without touching the bus
    ///
    /// # Arguments
    /// * `spi` - SPI device with the accelerometer's chip select
    ///
    /// # Returns
    /// An unprobed accelerometer. The first successful `init` detects the chip.
    pub const fn new(spi: SPI) -> Self {
        Self {
            chip: Chip::Unprobed(RegisterBus::new(spi)),
        }
    }

    /// The detected chip, once `init` has succeeded.
    pub fn model(&self) -> Option<AccelModel> {
        match self.chip {
            Chip::Lis3dsh(_) => Some(AccelModel::Lis3dsh),
            Chip::Lis302dl(_) => Some(AccelModel::Lis302dl),
            _ => None,
        }
    }

    fn probe(&mut self) -> Result<(), AccelError<SPI::Error>> {
        if !matches!(self.chip, Chip::Unprobed(_)) {
            return Ok(());
        }
        let Chip::Unprobed(mut bus) = core::mem::replace(&mut self.chip, Chip::Poisoned) else {
            return Ok(());
        };
        let id = match bus.read_register(WHO_AM_I) {
            Ok(id) => id,
            Err(e) => {
                self.chip = Chip::Unprobed(bus);
                return Err(AccelError::Spi(e));
            }
        };
        self.chip = match id {
            lis3dsh::WHO_AM_I_VALUE => {
                info!("Accelerometer: LIS3DSH detected");
                Chip::Lis3dsh(Lis3dsh::from_bus(bus))
            }
            lis302dl::WHO_AM_I_VALUE => {
                info!("Accelerometer: LIS302DL detected");
                Chip::Lis302dl(Lis302dl::from_bus(bus))
            }
            other => {
                error!("Accelerometer: unknown WHO_AM_I 0x{:02X}", other);
                self.chip = Chip::Unprobed(bus);
                return Err(AccelError::DeviceNotFound(other));
            }
        };
        Ok(())
    }
}

impl<SPI: SpiDevice> Accelerometer for DiscoveryAccelerometer<SPI> {
    type Error = AccelError<SPI::Error>;

    fn init(&mut self) -> Result<(), Self::Error> {
        self.probe()?;
        match &mut self.chip {
            Chip::Lis3dsh(chip) => chip.init(),
            Chip::Lis302dl(chip) => chip.init(),
            _ => Err(AccelError::DeviceNotFound(0)),
        }
    }

    fn read_xyz(&mut self) -> Result<[i16; 3], Self::Error> {
        match &mut self.chip {
            Chip::Lis3dsh(chip) => chip.read_xyz(),
            Chip::Lis302dl(chip) => {
                // Swap X and Y, then invert Y, to match the LIS3DSH orientation on the board
                let [x, y, z] = chip.read_xyz()?;
                Ok([y, x.saturating_neg(), z])
            }
            _ => Err(AccelError::DeviceNotFound(0)),
        }
    }
}
