//! Local `SOCK_SEQPACKET` listener/connection wrappers used for per-channel sockets.

pub mod seqpacket;

pub use seqpacket::{NetError, SeqpacketConn, SeqpacketListener, SendOutcome, DEFAULT_SOCKET_MODE};
