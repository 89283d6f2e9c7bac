//! Wire-level codecs: CRC, packet framing, and the channel-index subchannel.

pub mod crc32;
pub mod index;
pub mod packet;

pub use packet::{CodecError, Packet, MAX_DECODED_PACKET_LENGTH, MAX_ENCODED_PAYLOAD_LENGTH};
