//! Device drivers for the sensors fitted to the Discovery board.

/// LIS3DSH / LIS302DL accelerometer drivers
pub mod accelerometer;
