//! Top-level error taxonomy. Only `StartupError` and `EngineError` ever
//! reach `main`; everything else is absorbed and logged closer to its
//! origin (see `engine` and `directory`).

use std::path::PathBuf;

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::net::NetError;
use crate::serial::TtyError;

/// Errors that can abort the daemon before its main loop starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaud(#[from] crate::serial::baud::UnsupportedBaud),
    #[error("failed to open serial device: {0}")]
    Tty(#[from] TtyError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("failed to bind socket for channel directory {0:?}: {1}")]
    FirstBind(PathBuf, #[source] NetError),
}
