//! The multiplex engine: a single-threaded `poll(2)` loop arbitrating
//! between the UART and every connected client socket.
//!
//! Structurally this is the original daemon's `main` loop translated fd by
//! fd: setup phase (resync, periodic index refresh request), readiness
//! phase (build the poll set), service phase (UART read, UART write,
//! per-channel accept/recv/send). The service phase is factored into
//! `Engine::service` so it can be driven by a real `poll(2)` wait or, in
//! tests, by readiness flags computed without a kernel round trip.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

use crate::codec::{self, index::ChannelIndex, packet};
use crate::directory::{self, Channel, DirectoryError};
use crate::net::{NetError, SendOutcome};

/// After this many clients, a channel stops accepting new connections.
pub const MAX_CLIENTS_PER_CHANNEL: usize = 16;

/// After this much data is queued for one client, further inbound packets
/// for that client are dropped.
pub const MAX_CLIENT_SENDBUF: usize = 32 * packet::MAX_DECODED_PACKET_LENGTH;

/// How often to request a fresh channel index from the peer.
pub const CHANNEL_INDEX_REFRESH_PERIOD: Duration = Duration::from_secs(30);

/// One full frame's worth of wire bytes, plus slack, read per UART-ready iteration.
const UART_READ_CHUNK: usize = 16 + packet::MAX_ENCODED_PAYLOAD_LENGTH;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("poll() failed: {0}")]
    PollFailed(#[source] Errno),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// One connected client of a channel.
pub struct Client {
    conn: crate::net::SeqpacketConn,
    outbound: VecDeque<Arc<[u8]>>,
    send_buffer_size: usize,
}

impl Client {
    fn new(conn: crate::net::SeqpacketConn) -> Self {
        Client {
            conn,
            outbound: VecDeque::new(),
            send_buffer_size: 0,
        }
    }

    /// Enqueue `payload` unless it would push this client's outbound queue
    /// past `MAX_CLIENT_SENDBUF`. Returns whether it was enqueued.
    fn try_enqueue(&mut self, payload: Arc<[u8]>) -> bool {
        if self.send_buffer_size + payload.len() > MAX_CLIENT_SENDBUF {
            return false;
        }
        self.send_buffer_size += payload.len();
        self.outbound.push_back(payload);
        true
    }
}

/// Readiness flags the service phase needs for one fd, decoupled from
/// whatever produced them (a real `poll(2)` wait, or a test harness).
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

pub struct Engine {
    uart: File,
    uart_path: String,
    baud: u32,
    socket_dir: PathBuf,
    channels: BTreeMap<u8, Channel>,
    channel_index: ChannelIndex,
    uart_recv_buf: Vec<u8>,
    uart_send_buf: VecDeque<u8>,
    need_channel_sync: bool,
    last_index_refresh: Option<Instant>,
}

impl Engine {
    pub fn new(uart: File, uart_path: String, baud: u32, socket_dir: PathBuf) -> Self {
        Engine {
            uart,
            uart_path,
            baud,
            socket_dir,
            channels: BTreeMap::new(),
            channel_index: ChannelIndex::default(),
            uart_recv_buf: Vec::new(),
            uart_send_buf: VecDeque::new(),
            need_channel_sync: true,
            last_index_refresh: None,
        }
    }

    /// The coarse per-iteration backpressure gate: stop reading from clients
    /// once this many bytes are already queued for the UART.
    fn accepting_client_packets(&self) -> bool {
        self.uart_send_buf.len() < self.baud as usize
    }

    fn request_index_refresh(&mut self) {
        self.uart_send_buf
            .extend(codec::packet::serialize(codec::index::INDEX_CHANNEL, codec::index::INDEX_REQUEST)
                .expect("INDEX_REQUEST fits well under MAX_DECODED_PACKET_LENGTH"));
        self.last_index_refresh = Some(Instant::now());
    }

    /// Runs the setup phase: resync if requested, and request a fresh index
    /// if the refresh period has elapsed.
    fn setup_phase(&mut self) -> Result<(), DirectoryError> {
        if self.need_channel_sync {
            directory::ensure_socket_dir(&self.socket_dir)?;
            self.need_channel_sync = false;
            directory::sync_available_channels(
                &self.socket_dir,
                &self.uart_path,
                self.baud,
                &mut self.channels,
                &self.channel_index,
            );
        }

        let due = match self.last_index_refresh {
            None => true,
            Some(t) => t.elapsed() >= CHANNEL_INDEX_REFRESH_PERIOD,
        };
        if due {
            self.request_index_refresh();
        }

        Ok(())
    }

    /// Seconds remaining before the next periodic index-refresh request is
    /// due; bounds the `poll(2)` wait so the loop wakes up for it even with
    /// no I/O activity.
    fn time_to_next_refresh(&self) -> Duration {
        match self.last_index_refresh {
            None => Duration::ZERO,
            Some(t) => CHANNEL_INDEX_REFRESH_PERIOD.saturating_sub(t.elapsed()),
        }
    }

    /// Runs one full iteration of the loop: setup, build the poll set,
    /// block for readiness, then service whichever fds are ready.
    pub fn run_once(&mut self) -> Result<(), EngineError> {
        self.setup_phase()?;

        let accepting = self.accepting_client_packets();
        let uart_raw = self.uart.as_raw_fd();

        let mut raw_fds: Vec<RawFd> = Vec::new();
        let mut poll_fds: Vec<PollFd> = Vec::new();

        let mut uart_events = PollFlags::POLLIN;
        if !self.uart_send_buf.is_empty() {
            uart_events |= PollFlags::POLLOUT;
        }
        raw_fds.push(uart_raw);
        poll_fds.push(PollFd::new(self.uart.as_fd(), uart_events));

        for channel in self.channels.values() {
            if channel.clients.len() < MAX_CLIENTS_PER_CHANNEL {
                raw_fds.push(channel.listener.as_raw_fd());
                poll_fds.push(PollFd::new(channel.listener.as_fd(), PollFlags::POLLIN));
            }
            for client in &channel.clients {
                let mut events = PollFlags::empty();
                if accepting {
                    events |= PollFlags::POLLIN;
                }
                if !client.outbound.is_empty() {
                    events |= PollFlags::POLLOUT;
                }
                raw_fds.push(client.conn.as_raw_fd());
                poll_fds.push(PollFd::new(client.conn.as_fd(), events));
            }
        }

        let timeout_ms = self.time_to_next_refresh().as_millis().min(u16::MAX as u128) as u16;
        poll(&mut poll_fds, PollTimeout::from(timeout_ms)).map_err(EngineError::PollFailed)?;

        let mut ready: HashMap<RawFd, Readiness> = HashMap::with_capacity(raw_fds.len());
        for (fd, pfd) in raw_fds.iter().zip(poll_fds.iter()) {
            if let Some(revents) = pfd.revents() {
                ready.insert(
                    *fd,
                    Readiness {
                        readable: revents.contains(PollFlags::POLLIN),
                        writable: revents.contains(PollFlags::POLLOUT),
                    },
                );
            }
        }
        drop(poll_fds);

        self.service(&ready, accepting);

        Ok(())
    }

    /// Runs the loop forever. Returns only on an unrecoverable error.
    pub fn run(&mut self) -> Result<(), EngineError> {
        loop {
            self.run_once()?;
        }
    }

    /// The service phase: UART read, UART write, then per-channel
    /// accept/recv/send. Takes pre-computed readiness so it can be driven
    /// either by `run_once`'s real `poll(2)` wait or by a test harness.
    fn service(&mut self, ready: &HashMap<RawFd, Readiness>, accepting: bool) {
        let uart_ready = ready.get(&self.uart.as_raw_fd()).copied().unwrap_or_default();

        if uart_ready.readable {
            self.service_uart_read();
        }
        if uart_ready.writable && !self.uart_send_buf.is_empty() {
            self.service_uart_write();
        }

        for channel in self.channels.values_mut() {
            let listener_ready = ready
                .get(&channel.listener.as_raw_fd())
                .copied()
                .unwrap_or_default();
            if listener_ready.readable && channel.clients.len() < MAX_CLIENTS_PER_CHANNEL {
                match channel.listener.accept() {
                    Ok(Some(conn)) => channel.clients.push(Client::new(conn)),
                    Ok(None) => {}
                    Err(e) => log::warn!("accept() failed on channel {}: {}", channel.channel_number, e),
                }
            }
        }

        let mut outbound_uart: Vec<Vec<u8>> = Vec::new();

        for channel in self.channels.values_mut() {
            let mut i = 0;
            while i < channel.clients.len() {
                let raw = channel.clients[i].conn.as_raw_fd();
                let r = ready.get(&raw).copied().unwrap_or_default();
                let mut remove = false;

                if r.readable && accepting {
                    let mut buf = [0u8; packet::MAX_DECODED_PACKET_LENGTH];
                    match channel.clients[i].conn.recv(&mut buf) {
                        Ok(0) => remove = true,
                        Ok(n) => match packet::serialize(channel.channel_number, &buf[..n]) {
                            Ok(bytes) => outbound_uart.push(bytes),
                            Err(e) => log::debug!("dropping oversized client payload: {}", e),
                        },
                        Err(NetError::Recv(Errno::EAGAIN)) => {}
                        Err(e) => {
                            log::debug!("recv() failed on channel {}: {}", channel.channel_number, e);
                            remove = true;
                        }
                    }
                }

                if !remove && r.writable {
                    if let Some(head) = channel.clients[i].outbound.front().cloned() {
                        match channel.clients[i].conn.send(&head) {
                            Ok(SendOutcome::Sent(_)) => {
                                channel.clients[i].outbound.pop_front();
                                channel.clients[i].send_buffer_size -= head.len();
                            }
                            Ok(SendOutcome::WouldBlock) => {}
                            Ok(SendOutcome::BrokenPipe) => remove = true,
                            Err(e) => {
                                log::debug!("send() failed on channel {}: {}", channel.channel_number, e);
                                remove = true;
                            }
                        }
                    }
                }

                if remove {
                    channel.clients.remove(i);
                } else {
                    i += 1;
                }
            }
        }

        for bytes in outbound_uart {
            self.uart_send_buf.extend(bytes);
        }
    }

    fn service_uart_read(&mut self) {
        let mut buf = [0u8; UART_READ_CHUNK];
        match self.uart.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                self.uart_recv_buf.extend_from_slice(&buf[..n]);
                while let Some(pkt) = packet::digest(&mut self.uart_recv_buf) {
                    self.handle_decoded_packet(pkt);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("UART read failed: {}", e),
        }
    }

    fn handle_decoded_packet(&mut self, pkt: packet::Packet) {
        if pkt.channel == codec::index::INDEX_CHANNEL {
            self.channel_index = codec::index::parse(&pkt.payload);
            self.need_channel_sync = true;
            return;
        }

        self.fan_out_to_clients(pkt.channel, pkt.payload);
    }

    fn fan_out_to_clients(&mut self, channel: u8, payload: Arc<[u8]>) {
        if let Some(ch) = self.channels.get_mut(&channel) {
            for client in &mut ch.clients {
                if !client.try_enqueue(payload.clone()) {
                    log::debug!("dropping packet for overflowed client on channel {}", channel);
                }
            }
        } else {
            log::debug!("dropping packet for unknown channel {}", channel);
        }
    }

    fn service_uart_write(&mut self) {
        let write_size = self.uart_send_buf.len().min((self.baud / 100).max(1) as usize);
        let (front, _) = self.uart_send_buf.as_slices();
        let chunk: Vec<u8> = if front.len() >= write_size {
            front[..write_size].to_vec()
        } else {
            self.uart_send_buf.iter().take(write_size).copied().collect()
        };

        match self.uart.write(&chunk) {
            Ok(n) if n > 0 => {
                self.uart_send_buf.drain(0..n);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("UART write failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    fn client_pair() -> (Client, crate::net::SeqpacketConn) {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::SOCK_NONBLOCK)
            .expect("socketpair");
        (
            Client::new(crate::net::SeqpacketConn::from_owned(a)),
            crate::net::SeqpacketConn::from_owned(b),
        )
    }

    #[test]
    fn try_enqueue_respects_client_sendbuf_cap() {
        let (mut client, _peer) = client_pair();

        let at_cap: Arc<[u8]> = Arc::from(vec![0u8; MAX_CLIENT_SENDBUF]);
        assert!(client.try_enqueue(at_cap));

        let one_more: Arc<[u8]> = Arc::from(vec![0u8; 1]);
        assert!(!client.try_enqueue(one_more));
    }

    #[test]
    fn accepting_client_packets_gates_on_uart_sendbuf() {
        let dir = tempfile::tempdir().unwrap();
        let uart_path = dir.path().join("fake-uart");
        std::fs::write(&uart_path, b"").unwrap();
        let uart = File::options().read(true).write(true).open(&uart_path).unwrap();
        let mut engine = Engine::new(uart, uart_path.to_string_lossy().into_owned(), 9600, dir.path().join("sockets"));

        assert!(engine.accepting_client_packets());
        engine.uart_send_buf.extend(std::iter::repeat(0u8).take(9600));
        assert!(!engine.accepting_client_packets());
    }

    #[test]
    fn handle_index_packet_marks_resync_and_updates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let uart_path = dir.path().join("fake-uart");
        std::fs::write(&uart_path, b"").unwrap();
        let uart = File::options().read(true).write(true).open(&uart_path).unwrap();
        let mut engine = Engine::new(uart, uart_path.to_string_lossy().into_owned(), 9600, dir.path().join("sockets"));
        engine.need_channel_sync = false;

        let pkt = packet::Packet {
            channel: codec::index::INDEX_CHANNEL,
            payload: Arc::from(&b"3 telemetry\n"[..]),
        };
        engine.handle_decoded_packet(pkt);

        assert!(engine.need_channel_sync);
        assert_eq!(engine.channel_index.get(3), Some("telemetry"));
    }

    #[test]
    fn fan_out_delivers_to_connected_client() {
        let dir = tempfile::tempdir().unwrap();
        let uart_path = dir.path().join("fake-uart");
        std::fs::write(&uart_path, b"").unwrap();
        let uart = File::options().read(true).write(true).open(&uart_path).unwrap();
        let mut engine = Engine::new(uart, uart_path.to_string_lossy().into_owned(), 9600, dir.path().join("sockets"));

        std::fs::create_dir_all(dir.path().join("sockets")).unwrap();
        let listener =
            crate::net::SeqpacketListener::bind(&dir.path().join("sockets").join("telemetry"), 0o777).unwrap();

        let (client, peer) = client_pair();
        engine.channels.insert(
            1,
            Channel {
                name: "telemetry".to_string(),
                channel_number: 1,
                listener,
                clients: vec![client],
            },
        );

        engine.fan_out_to_clients(1, Arc::from(&b"hello"[..]));

        // fan_out_to_clients only enqueues; the write happens in the
        // service phase's write-ready branch. Drive that directly here.
        let ch = engine.channels.get_mut(&1).unwrap();
        let head = ch.clients[0].outbound.front().cloned().unwrap();
        ch.clients[0].conn.send(&head).unwrap();

        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn fan_out_drops_packets_for_unknown_channel() {
        let dir = tempfile::tempdir().unwrap();
        let uart_path = dir.path().join("fake-uart");
        std::fs::write(&uart_path, b"").unwrap();
        let uart = File::options().read(true).write(true).open(&uart_path).unwrap();
        let mut engine = Engine::new(uart, uart_path.to_string_lossy().into_owned(), 9600, dir.path().join("sockets"));

        // No channels configured; this must not panic and must simply drop.
        engine.fan_out_to_clients(5, Arc::from(&b"hello"[..]));
        assert!(engine.channels.is_empty());
    }
}
