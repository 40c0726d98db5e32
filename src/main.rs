//! Firmware entry point for the STM32F4-Discovery accelerometer logger.
//!
//! Plug a FAT-formatted USB flash drive into the micro-AB port, press the user
//! button to start a recording and press it again to close the file.

#![no_std]
#![no_main]

#[macro_use]
#[path = "fmt.rs"]
mod fmt;
mod peripherals;

use acc_logger::apps::AccelLogger;
use acc_logger::drivers::accelerometer::DiscoveryAccelerometer;
use acc_logger::usb_host::UsbHost;
use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Timer};
use peripherals::{
    board::BoardPeripherals, init_system, otg_host::OtgPeripherals, spi::SpiPeripherals, AccelSpi, Board, OtgFsHost,
};

// Import panic handler and defmt RTT for debugging
#[cfg(not(feature = "debug"))]
use panic_halt as _;
#[cfg(feature = "debug")]
use {defmt_rtt as _, panic_probe as _};

/// Own the USB host port, the accelerometer and the board I/O, and run the logger
#[embassy_executor::task]
async fn logger_task(otg: OtgPeripherals<'static>, spi: SpiPeripherals<'static>, board: BoardPeripherals<'static>) {
    let host = UsbHost::new(OtgFsHost::new(otg));
    let accel = DiscoveryAccelerometer::new(AccelSpi::new(spi));
    let Board { button, leds } = Board::new(board);

    let mut logger = AccelLogger::new(host, accel, button, leds, Delay);
    logger.run().await
}

/// Main application entry point
///
/// Initializes the clocks and spawns the logger task. The main task only keeps a heartbeat.
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Starting accelerometer logger v{}", env!("CARGO_PKG_VERSION"));

    let peripherals = init_system();

    info!("System initialized, spawning logger task...");

    spawner
        .spawn(logger_task(
            claim_otg!(peripherals),
            claim_accel_spi!(peripherals),
            claim_board!(peripherals),
        ))
        .unwrap();

    loop {
        Timer::after(Duration::from_secs(60)).await;
        info!("System heartbeat");
    }
}
