//! Baud-rate string/number table, mirroring the teacher's table-driven
//! `BaudRate::find_setting` rather than the source's alternate inline-conditional
//! sender (spec.md §9 specifies only the table-driven form).

use nix::sys::termios::BaudRate;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("baud rate must be 9600, 19200 or 115200")]
pub struct UnsupportedBaud;

/// The table of baud rates this daemon accepts (spec.md §6).
const TABLE: &[(u32, BaudRate)] = &[
    (9600, BaudRate::B9600),
    (19200, BaudRate::B19200),
    (115200, BaudRate::B115200),
];

/// Resolve a numeric baud rate to the `termios` flag, if supported.
pub fn flag_for(rate: u32) -> Result<BaudRate, UnsupportedBaud> {
    TABLE
        .iter()
        .find(|(r, _)| *r == rate)
        .map(|(_, flag)| *flag)
        .ok_or(UnsupportedBaud)
}

/// Parse a baud rate given as a command-line string.
pub fn parse(s: &str) -> Result<u32, UnsupportedBaud> {
    let rate: u32 = s.parse().map_err(|_| UnsupportedBaud)?;
    flag_for(rate)?;
    Ok(rate)
}
