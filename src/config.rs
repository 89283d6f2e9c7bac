//! Command-line parsing for both binaries, via `clap`'s derive API (the
//! teacher's console used clap 2.9's string-builder form; the derive macros
//! are the idiomatic replacement for a fixed, small argument set like this one).

use std::path::PathBuf;

use clap::Parser;

use crate::logging;

/// Build-time default for the per-channel socket directory.
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/elmlinkd";

#[derive(Debug, Parser)]
#[command(name = "elmlinkd", about = "Multiplex a serial link into per-channel local sockets")]
pub struct DaemonArgs {
    /// Path to the UART device, e.g. /dev/ttyUL1.
    pub uart_path: PathBuf,

    /// Baud rate: 9600, 19200, or 115200.
    #[arg(value_parser = crate::serial::baud::parse)]
    pub baud: u32,

    /// Directory the per-channel sockets and `.index` are created in.
    #[arg(long, default_value = DEFAULT_SOCKET_DIR)]
    pub socket_dir: PathBuf,

    /// Log level: off, error, warn, info, debug, or trace.
    #[arg(short = 'd', long, default_value = "info", value_parser = logging::parse_level)]
    pub debug: log::LevelFilter,
}

#[derive(Debug, Parser)]
#[command(name = "elmlink-send", about = "Send a single raw packet on a serial link")]
pub struct SendArgs {
    /// Path to the UART device, e.g. /dev/ttyUL1.
    pub uart_path: PathBuf,

    /// Baud rate: 9600, 19200, or 115200.
    #[arg(value_parser = crate::serial::baud::parse)]
    pub baud: u32,

    /// Destination channel number, decimal, or hex/octal with a `0x`/`0` prefix.
    #[arg(value_parser = parse_byte)]
    pub channel: u8,

    /// Payload bytes, each decimal, or hex/octal with a `0x`/`0` prefix.
    #[arg(value_parser = parse_byte, required = true)]
    pub bytes: Vec<u8>,
}

/// Parses one byte value the way `strtoul(..., 0)` would: `0x`/`0X` selects
/// hex, a bare leading `0` selects octal, anything else is decimal. Rejects
/// values over `0xff`.
pub fn parse_byte(s: &str) -> Result<u8, String> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };

    let value = u32::from_str_radix(digits, radix).map_err(|_| format!("invalid number: {s}"))?;
    u8::try_from(value).map_err(|_| format!("value out of range (must be <= 0xff): {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal() {
        assert_eq!(parse_byte("42"), Ok(42));
    }

    #[test]
    fn parses_hex_with_prefix() {
        assert_eq!(parse_byte("0xFF"), Ok(255));
        assert_eq!(parse_byte("0x0a"), Ok(10));
    }

    #[test]
    fn parses_octal_with_leading_zero() {
        assert_eq!(parse_byte("010"), Ok(8));
    }

    #[test]
    fn rejects_values_over_0xff() {
        assert!(parse_byte("0x100").is_err());
        assert!(parse_byte("256").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_byte("not-a-number").is_err());
    }

    #[test]
    fn zero_is_decimal_not_octal_prefix() {
        assert_eq!(parse_byte("0"), Ok(0));
    }
}
