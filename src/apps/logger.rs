//! The logging application.
//!
//! The main loop runs the USB host and tracks the flash drive in a three-state machine.
//! When the mass-storage class becomes active a session is due. A session waits for
//! the user button, records accelerometer samples into a new file until the button
//! is pressed again, and closes the file.
//!
//! LEDs:
//! - orange: armed, waiting for the first button press
//! - blue: blinking while armed, steady while recording
//! - green: the last session was saved
//! - red: fatal error, the logger has stopped

use embedded_hal::digital::{InputPin, OutputPin, StatefulOutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_sdmmc::{Mode, TimeSource, Timestamp, VolumeIdx, VolumeManager};

use super::record::{file_name, format_record, next_file_number, HEADER};
use crate::drivers::accelerometer::Accelerometer;
use crate::usb_host::{HostDriver, HostEvent, MscError, UsbHost};

/// Time between two samples
pub const SAMPLE_INTERVAL_US: u32 = 700;
/// Blue LED toggle period while waiting for the start press
pub const BLINK_PERIOD_MS: u32 = 100;
/// Button poll period while waiting for a release
pub const BUTTON_POLL_MS: u32 = 1;
/// Pause between main loop iterations
pub const IDLE_POLL_MS: u32 = 1;

/// Connection state of the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum AppState {
    /// No usable drive, or this drive's session is done
    Idle,
    /// The drive is ready and a session is due
    Start,
    /// A session is recording
    Running,
}

/// The four user LEDs of the Discovery board
pub struct StatusLeds<O> {
    /// LED3
    pub orange: O,
    /// LED4
    pub green: O,
    /// LED5
    pub red: O,
    /// LED6
    pub blue: O,
}

/// Outcome of a completed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub struct SessionSummary {
    pub file_number: u8,
    pub records: u32,
}

/// Filesystem failures, reduced from [`embedded_sdmmc::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum StorageError {
    /// The block device failed
    Device(MscError),
    /// No FAT volume on the drive
    NoFilesystem,
    NotFound,
    /// No free clusters left
    Full,
    /// Anything else the FAT layer reports
    Filesystem,
}

impl From<embedded_sdmmc::Error<MscError>> for StorageError {
    fn from(error: embedded_sdmmc::Error<MscError>) -> Self {
        use embedded_sdmmc::Error;
        match error {
            Error::DeviceError(e) => StorageError::Device(e),
            Error::FormatError(_) | Error::NoSuchVolume => StorageError::NoFilesystem,
            Error::NotFound => StorageError::NotFound,
            Error::DiskFull | Error::NotEnoughSpace => StorageError::Full,
            _ => StorageError::Filesystem,
        }
    }
}

/// Everything that stops the logger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", not(test)), derive(defmt::Format))]
pub enum LoggerError {
    /// The accelerometer did not initialize or could not be read
    Accelerometer,
    Storage(StorageError),
    /// A session was due but the drive is not available
    NotReady,
    /// A button or LED pin failed
    Gpio,
    /// A file name or record did not fit its buffer
    Format,
}

impl From<StorageError> for LoggerError {
    fn from(error: StorageError) -> Self {
        LoggerError::Storage(error)
    }
}

impl From<embedded_sdmmc::Error<MscError>> for LoggerError {
    fn from(error: embedded_sdmmc::Error<MscError>) -> Self {
        LoggerError::Storage(error.into())
    }
}

impl From<core::fmt::Error> for LoggerError {
    fn from(_: core::fmt::Error) -> Self {
        LoggerError::Format
    }
}

/// FAT timestamp for every file. The board has no battery-backed clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedTimeSource;

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 56, // 2026
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

fn set<O: StatefulOutputPin>(led: &mut O, on: bool) -> Result<(), LoggerError> {
    if on {
        led.set_high().map_err(|_| LoggerError::Gpio)
    } else {
        led.set_low().map_err(|_| LoggerError::Gpio)
    }
}

fn pressed<B: InputPin>(button: &mut B) -> Result<bool, LoggerError> {
    button.is_high().map_err(|_| LoggerError::Gpio)
}

async fn wait_for_release<B: InputPin, D: DelayNs>(button: &mut B, delay: &mut D) -> Result<(), LoggerError> {
    while pressed(button)? {
        delay.delay_ms(BUTTON_POLL_MS).await;
    }
    Ok(())
}

/// Button-gated accelerometer logger writing to a USB flash drive.
pub struct AccelLogger<H, A, B, O, D> {
    host: UsbHost<H>,
    accel: A,
    button: B,
    leds: StatusLeds<O>,
    delay: D,
    state: AppState,
}

impl<H, A, B, O, D> AccelLogger<H, A, B, O, D>
where
    H: HostDriver,
    A: Accelerometer,
    B: InputPin,
    O: StatefulOutputPin,
    D: DelayNs,
{
    /// Create the logger in the `Idle` state
    ///
    /// # Arguments
    /// * `host` - USB host on the port the flash drive is plugged into
    /// * `accel` - Accelerometer, initialized at the start of every session
    /// * `button` - User button, high while pressed
    /// * `leds` - Status LEDs, expected to start off
    /// * `delay` - Time source for sample pacing, blinking and button polling
    pub fn new(host: UsbHost<H>, accel: A, button: B, leds: StatusLeds<O>, delay: D) -> Self {
        Self {
            host,
            accel,
            button,
            leds,
            delay,
            state: AppState::Idle,
        }
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn host(&self) -> &UsbHost<H> {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut UsbHost<H> {
        &mut self.host
    }

    pub fn leds(&self) -> &StatusLeds<O> {
        &self.leds
    }

    fn set_state(&mut self, state: AppState) {
        if self.state != state {
            debug!("Logger: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// One main loop iteration: run the host, follow its events, and record a
    /// session when one is due. Returns the summary of a session recorded in this step.
    pub async fn step(&mut self) -> Result<Option<SessionSummary>, LoggerError> {
        if let Some(event) = self.host.process() {
            self.handle_event(event)?;
        }

        if self.state != AppState::Start {
            return Ok(None);
        }
        self.set_state(AppState::Running);
        let summary = self.record_session().await?;
        info!(
            "Logger: session saved to file {}, {} records",
            summary.file_number, summary.records
        );
        // The drive has to be plugged in again for another session
        self.set_state(AppState::Idle);
        Ok(Some(summary))
    }

    fn handle_event(&mut self, event: HostEvent) -> Result<(), LoggerError> {
        match event {
            HostEvent::ClassActive => self.set_state(AppState::Start),
            HostEvent::Disconnected => {
                self.set_state(AppState::Idle);
                set(&mut self.leds.green, false)?;
                set(&mut self.leds.red, false)?;
            }
            HostEvent::Connected => info!("Logger: drive connected"),
            HostEvent::ConfigurationSelected => debug!("Logger: drive configured"),
            HostEvent::EnumerationFailed(e) => warn!("Logger: drive not usable: {:?}", e),
        }
        Ok(())
    }

    /// Run the main loop forever. The first error halts the logger.
    pub async fn run(&mut self) -> ! {
        info!("Logger: waiting for a USB flash drive");
        loop {
            match self.step().await {
                Ok(_) => self.delay.delay_ms(IDLE_POLL_MS).await,
                Err(e) => {
                    error!("Logger: {:?}", e);
                    self.halt().await
                }
            }
        }
    }

    /// Record one session into a new file on the active drive.
    pub async fn record_session(&mut self) -> Result<SessionSummary, LoggerError> {
        self.accel.init().map_err(|_| {
            error!("Logger: accelerometer init failed");
            LoggerError::Accelerometer
        })?;

        set(&mut self.leds.orange, true)?;
        info!("Logger: press the button to start recording");
        while !pressed(&mut self.button)? {
            self.leds.blue.toggle().map_err(|_| LoggerError::Gpio)?;
            self.delay.delay_ms(BLINK_PERIOD_MS).await;
        }
        wait_for_release(&mut self.button, &mut self.delay).await?;
        set(&mut self.leds.orange, false)?;

        // The drive stays borrowed until the volume is closed, so only disjoint fields below
        let storage = self.host.mass_storage().ok_or(LoggerError::NotReady)?;
        let manager = VolumeManager::new(storage, FixedTimeSource);
        let volume = manager.open_volume(VolumeIdx(0))?;
        let root = volume.open_root_dir()?;

        let file_number = next_file_number(|number| {
            match root.find_directory_entry(file_name(number)?.as_str()) {
                Ok(_) => Ok(true),
                Err(embedded_sdmmc::Error::NotFound) => Ok(false),
                Err(e) => Err(LoggerError::from(e)),
            }
        })?;
        let name = file_name(file_number)?;
        info!("Logger: recording to {}", name.as_str());
        let file = root.open_file_in_dir(name.as_str(), Mode::ReadWriteCreateOrTruncate)?;

        set(&mut self.leds.blue, true)?;
        // embedded-sdmmc writes the whole buffer or fails, a full disk is `DiskFull`
        let mut last_write = file.write(HEADER.as_bytes());
        let mut records = 0u32;

        while !pressed(&mut self.button)? {
            let sample = self.accel.read_xyz().map_err(|_| {
                error!("Logger: accelerometer read failed");
                LoggerError::Accelerometer
            })?;
            let line = format_record(sample)?;
            // Only the outcome of the last write is checked, after the session
            last_write = file.write(line.as_bytes());
            records += 1;
            self.delay.delay_us(SAMPLE_INTERVAL_US).await;
        }
        wait_for_release(&mut self.button, &mut self.delay).await?;

        last_write?;
        file.close()?;
        set(&mut self.leds.green, true)?;
        set(&mut self.leds.blue, false)?;

        root.close()?;
        volume.close()?;
        Ok(SessionSummary { file_number, records })
    }

    /// Light the red LED and stop.
    pub async fn halt(&mut self) -> ! {
        error!("Logger: halted");
        let _ = self.leds.red.set_high();
        loop {
            self.delay.delay_ms(1000).await;
        }
    }
}
