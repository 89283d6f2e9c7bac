//! Raw, non-canonical, non-blocking terminal setup (spec.md §4.5), translated
//! from the teacher-adjacent `tty_noncanonical.cpp` reference into `nix`'s
//! safe `termios` wrapper.

use std::fs::File;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TtyError {
    #[error("failed to open serial device: {0}")]
    Open(#[source] nix::Error),
    #[error("failed to read terminal attributes: {0}")]
    GetAttr(#[source] nix::Error),
    #[error("failed to set terminal attributes: {0}")]
    SetAttr(#[source] nix::Error),
    #[error("failed to flush terminal input queue: {0}")]
    Flush(#[source] nix::Error),
}

/// Open `path` as an exclusive-control, non-blocking UART and put it into
/// raw, non-canonical mode at `baud`. Mirrors `tty_set_noncannonical`: 8N1,
/// local-read enabled, CR ignored on input, no output post-processing,
/// non-canonical, `VMIN=0 VTIME=0`, input queue flushed before the new
/// settings land.
pub fn open_uart(path: &Path, baud: BaudRate) -> Result<File, TtyError> {
    let raw_fd = open(
        path,
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
        Mode::empty(),
    )
    .map_err(TtyError::Open)?;
    // SAFETY: `open` just returned this fd; we own it exclusively from here.
    let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

    let mut tio = termios::tcgetattr(&fd).map_err(TtyError::GetAttr)?;

    tio.input_flags = InputFlags::IGNCR;
    tio.output_flags = OutputFlags::empty();
    tio.control_flags = ControlFlags::CS8 | ControlFlags::CLOCAL | ControlFlags::CREAD;
    tio.local_flags = LocalFlags::empty();
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios::cfsetspeed(&mut tio, baud).map_err(TtyError::SetAttr)?;

    termios::tcflush(&fd, FlushArg::TCIFLUSH).map_err(TtyError::Flush)?;
    termios::tcsetattr(&fd, SetArg::TCSANOW, &tio).map_err(TtyError::SetAttr)?;

    Ok(File::from(fd))
}
