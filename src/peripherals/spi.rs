//! SPI1 wiring of the on-board accelerometer.
//!
//! Both accelerometer variants of the Discovery board share this bus and chip select.
//! The register protocol (read bit, address auto-increment) lives in the drivers;
//! this module only provides an [`SpiDevice`] with software chip select.

use embassy_stm32::{
    gpio::{Level, Output, Speed},
    mode::Blocking,
    peripherals::{PA5, PA6, PA7, PE3, SPI1},
    spi::{Config as SpiConfig, Error as SpiError, Mode, Phase, Polarity, Spi},
    time::Hertz,
    Peri,
};
use embassy_time::{block_for, Duration};
use embedded_hal::spi::{ErrorType, Operation, SpiDevice};

/// Peripheral collection for the accelerometer SPI interface
pub struct SpiPeripherals<'d> {
    pub spi1: Peri<'d, SPI1>,
    pub cs: Peri<'d, PE3>,   // CS
    pub sck: Peri<'d, PA5>,  // SCK
    pub miso: Peri<'d, PA6>, // MISO
    pub mosi: Peri<'d, PA7>, // MOSI
}

/// Macro to claim peripherals for AccelSpi
#[macro_export]
macro_rules! claim_accel_spi {
    ($peripherals:expr) => {{
        $crate::peripherals::spi::SpiPeripherals {
            spi1: $peripherals.SPI1,
            cs: $peripherals.PE3,   // CS
            sck: $peripherals.PA5,  // SCK
            miso: $peripherals.PA6, // MISO
            mosi: $peripherals.PA7, // MOSI
        }
    }};
}

/// SPI device for the LIS3DSH / LIS302DL
///
/// Both chips accept SPI mode 3 (CPOL=1, CPHA=1). The bus runs at 5 MHz, under the
/// 10 MHz limit of either part. Transfers are short register accesses, so the bus
/// is driven in blocking mode without DMA.
pub struct AccelSpi<'d> {
    spi: Spi<'d, Blocking>,
    /// Chip select pin (software controlled)
    cs: Output<'d>,
}

impl<'d> AccelSpi<'d> {
    /// Create the accelerometer SPI device with software chip select
    ///
    /// # Arguments
    /// * `peripherals` - SpiPeripherals struct containing all required peripherals
    ///
    /// # Returns
    /// SPI1 in mode 3 at 5 MHz with chip select released
    pub fn new(peripherals: SpiPeripherals<'d>) -> Self {
        let mut config = SpiConfig::default();
        config.mode = Mode {
            polarity: Polarity::IdleHigh,
            phase: Phase::CaptureOnSecondTransition,
        };
        config.frequency = Hertz(5_000_000);

        let cs = Output::new(peripherals.cs, Level::High, Speed::VeryHigh);
        let spi = Spi::new_blocking(peripherals.spi1, peripherals.sck, peripherals.mosi, peripherals.miso, config);

        Self { spi, cs }
    }
}

impl ErrorType for AccelSpi<'_> {
    type Error = SpiError;
}

impl SpiDevice for AccelSpi<'_> {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        self.cs.set_low();

        let spi = &mut self.spi;
        let result = operations.iter_mut().try_for_each(|operation| match operation {
            Operation::Read(words) => spi.blocking_read::<u8>(words),
            Operation::Write(words) => spi.blocking_write::<u8>(words),
            Operation::Transfer(read, write) => spi.blocking_transfer::<u8>(read, write),
            Operation::TransferInPlace(words) => spi.blocking_transfer_in_place::<u8>(words),
            Operation::DelayNs(ns) => {
                block_for(Duration::from_nanos(u64::from(*ns)));
                Ok(())
            }
        });

        // Deselect even if a transfer failed
        self.cs.set_high();

        result
    }
}
