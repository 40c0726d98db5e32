//! Text layout of the log files.

use core::fmt::{self, Write};

use heapless::String;

/// Highest file number. Once every lower number is taken this file is overwritten.
pub const MAX_FILE_NUMBER: u8 = 21;

/// First line of every log file
pub const HEADER: &str = "x_acc;y_acc;z_acc;\n";

/// "ACCEL255.CSV"
pub const FILE_NAME_LEN: usize = 12;
/// Three "-32768.0;" fields and the newline
pub const RECORD_LEN: usize = 28;

/// Short (8.3) name of log file `number`.
pub fn file_name(number: u8) -> Result<String<FILE_NAME_LEN>, fmt::Error> {
    let mut name = String::new();
    write!(name, "ACCEL{}.CSV", number)?;
    Ok(name)
}

/// One line of the log: each axis right-aligned to six characters with one decimal.
pub fn format_record(sample: [i16; 3]) -> Result<String<RECORD_LEN>, fmt::Error> {
    let mut line = String::new();
    for axis in sample {
        // Whole milli-g, so the decimal is always zero
        write!(line, "{:4}.0;", axis)?;
    }
    line.push('\n').map_err(|_| fmt::Error)?;
    Ok(line)
}

/// Pick the number of the next log file: the lowest free number below
/// [`MAX_FILE_NUMBER`], or [`MAX_FILE_NUMBER`] itself when all of those exist.
pub fn next_file_number<E>(mut exists: impl FnMut(u8) -> Result<bool, E>) -> Result<u8, E> {
    for number in 1..MAX_FILE_NUMBER {
        if !exists(number)? {
            return Ok(number);
        }
    }
    Ok(MAX_FILE_NUMBER)
}
