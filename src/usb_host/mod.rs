//! Minimal USB host stack for a single full-speed root port.
//!
//! The stack is split the same way as the rest of the crate: everything here is
//! hardware independent and talks to the controller through [`driver::HostDriver`].
//!
//! - [`descriptor`]: standard requests and descriptor parsing
//! - [`host`]: attach/enumerate/class bring-up state machine
//! - [`msc`]: Bulk-Only Transport, SCSI, and a block device for `embedded-sdmmc`
//!
//! Only mass-storage devices with 512-byte blocks are supported. There are no hubs.

pub mod descriptor;
pub mod driver;
pub mod host;
pub mod msc;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{DeviceSpeed, HostDriver, PortEvent, TransferError};
pub use host::{HostError, HostEvent, HostState, UsbHost};
pub use msc::{MassStorage, MscError};
