//! `AF_UNIX`/`SOCK_SEQPACKET` listener and connection wrappers.
//!
//! `SOCK_SEQPACKET` is the "stream-preserving datagram" socket type spec.md
//! §3/§6 calls for: connection-oriented like a stream socket, but each `send`
//! is delivered as exactly one `recv` on the other end, like a datagram.
//! `std::os::unix::net` only exposes `SOCK_STREAM`, so this wraps `nix`'s
//! lower-level socket calls directly.

use std::fs::Permissions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, listen, recv, send, socket, AddressFamily, Backlog, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use nix::unistd::unlink;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("socket() failed: {0}")]
    Create(#[source] Errno),
    #[error("bind({0:?}) failed: {1}")]
    Bind(PathBuf, #[source] Errno),
    #[error("listen() failed: {0}")]
    Listen(#[source] Errno),
    #[error("failed to set socket permissions: {0}")]
    Chmod(#[source] std::io::Error),
    #[error("accept() failed: {0}")]
    Accept(#[source] Errno),
    #[error("recv() failed: {0}")]
    Recv(#[source] Errno),
    #[error("send() failed: {0}")]
    Send(#[source] Errno),
}

/// Default permissions for freshly created channel sockets (spec.md §6).
pub const DEFAULT_SOCKET_MODE: u32 = 0o777;

pub struct SeqpacketListener {
    fd: OwnedFd,
    path: PathBuf,
}

impl SeqpacketListener {
    /// Bind and listen at `path` with `mode` permissions and a backlog of 1
    /// (spec.md §9: an arbitrary admission throttle; `MAX_CLIENTS_PER_CHANNEL`
    /// is the real bound, enforced by the engine before it read-arms this fd).
    pub fn bind(path: &Path, mode: u32) -> Result<Self, NetError> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(NetError::Create)?;

        // Insurance against a stale socket file from a previous run.
        let _ = unlink(path);

        let addr = UnixAddr::new(path).map_err(|e| NetError::Bind(path.to_path_buf(), e))?;
        bind(fd.as_raw_fd(), &addr).map_err(|e| NetError::Bind(path.to_path_buf(), e))?;
        std::fs::set_permissions(path, Permissions::from_mode(mode)).map_err(NetError::Chmod)?;
        listen(&fd, Backlog::new(1).expect("1 is a valid backlog")).map_err(NetError::Listen)?;

        Ok(SeqpacketListener {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Accept one pending connection, non-blocking. `Ok(None)` means nothing
    /// was pending (`EAGAIN`/`EWOULDBLOCK`).
    pub fn accept(&self) -> Result<Option<SeqpacketConn>, NetError> {
        match accept4(self.fd.as_raw_fd(), SockFlag::SOCK_NONBLOCK) {
            Ok(raw) => Ok(Some(SeqpacketConn::from_raw(raw))),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(NetError::Accept(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for SeqpacketListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SeqpacketListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for SeqpacketListener {
    fn drop(&mut self) {
        let _ = unlink(&self.path);
    }
}

/// One accepted client connection.
pub struct SeqpacketConn {
    fd: OwnedFd,
}

impl SeqpacketConn {
    fn from_raw(raw: RawFd) -> Self {
        // SAFETY: `raw` was just returned by `accept4`; we take exclusive ownership.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        SeqpacketConn { fd }
    }

    /// Wraps an already-owned, already-connected fd (e.g. one half of a
    /// `socketpair()`). Used by other modules' tests to exercise client
    /// handling without a real listener/connect round trip.
    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        SeqpacketConn { fd }
    }

    /// Non-blocking receive of up to `buf.len()` bytes. `Ok(0)` means the
    /// peer closed the connection (spec.md §4.4's "zero-length read").
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        recv(&self.fd, buf, MsgFlags::MSG_DONTWAIT).map_err(NetError::Recv)
    }

    /// Non-blocking send of a single datagram. Translates a broken pipe into
    /// `Ok(SendOutcome::BrokenPipe)` rather than an error, since that's a
    /// routine client-disconnect event (spec.md §7), not a daemon fault.
    pub fn send(&self, buf: &[u8]) -> Result<SendOutcome, NetError> {
        match send(
            &self.fd,
            buf,
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
        ) {
            Ok(n) => Ok(SendOutcome::Sent(n)),
            Err(Errno::EPIPE) => Ok(SendOutcome::BrokenPipe),
            Err(Errno::EAGAIN) => Ok(SendOutcome::WouldBlock),
            Err(e) => Err(NetError::Send(e)),
        }
    }
}

impl AsFd for SeqpacketConn {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SeqpacketConn {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    BrokenPipe,
    WouldBlock,
}
