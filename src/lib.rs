//! `elmlinkd`: multiplexes a single serial link into many named local
//! socket endpoints, using a framed, checksummed wire protocol and an
//! in-band channel index the peer announces dynamically.

pub mod codec;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod logging;
pub mod net;
pub mod serial;
