pub mod board;
pub mod otg_host;
pub mod spi;
pub mod system;

pub use board::Board;
pub use otg_host::OtgFsHost;
pub use spi::AccelSpi;
pub use system::init_system;
