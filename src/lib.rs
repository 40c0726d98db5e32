//! Accelerometer logger for the STM32F4-Discovery.
//!
//! This crate holds everything that does not touch STM32 registers directly:
//! - The logging application and its USB connection state machine
//! - Accelerometer drivers for the LIS3DSH and LIS302DL
//! - A polling USB host stack with a mass-storage (bulk-only, SCSI) class
//!
//! The firmware binary in `main.rs` binds these to the board peripherals.

#![cfg_attr(not(test), no_std)]

// This must go first so the logging macros are visible to every other module.
#[macro_use]
mod fmt;

pub mod apps;
pub mod drivers;
pub mod usb_host;
