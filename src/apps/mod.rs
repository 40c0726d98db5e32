//! Application layer of the accelerometer logger.
//!
//! - [`logger`]: the main loop state machine and recording sessions
//! - [`record`]: file names and the text layout of the log files

pub mod logger;
pub mod record;

pub use logger::{AccelLogger, AppState, FixedTimeSource, LoggerError, SessionSummary, StatusLeds, StorageError};
