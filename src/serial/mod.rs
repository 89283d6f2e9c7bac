//! Serial-port setup: baud table and raw-mode `termios` configuration.

pub mod baud;
pub mod tty;

pub use tty::{open_uart, TtyError};
