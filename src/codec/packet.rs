//! Framing, escaping, and CRC-checked packet codec.
//!
//! Wire form: `FRAME_DELIM | escaped(channel | length:u16 BE | payload | crc32 BE) | FRAME_DELIM`.
//! The escape pass is the teacher's KISS transposition (`FESC`/`TFEND`/`TFESC` in
//! `kiss.rs`) generalized from a port nibble to a `(channel, length)` header with
//! a trailing CRC-32, and a closing delimiter in place of KISS's unchecksummed
//! single-delimiter frame — the closing delimiter gives `digest` an unambiguous
//! candidate boundary to discard through when a frame fails validation.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::codec::crc32::crc32;

/// Start-of-frame / end-of-frame delimiter.
pub const FRAME_DELIM: u8 = 0xC0;
/// Escape marker.
pub const FRAME_ESC: u8 = 0xDB;
/// Escaped form of a literal delimiter byte.
const ESC_DELIM: u8 = 0xDC;
/// Escaped form of a literal escape byte.
const ESC_ESC: u8 = 0xDD;

/// Ceiling on decoded payload size.
pub const MAX_DECODED_PACKET_LENGTH: usize = 2048;

const HEADER_LEN: usize = 1 + 2; // channel + u16 length
const CRC_LEN: usize = 4;
const LOGICAL_OVERHEAD: usize = HEADER_LEN + CRC_LEN;

/// Worst-case escaped body size (every logical byte needs escaping).
pub const MAX_ENCODED_PAYLOAD_LENGTH: usize = 2 * (LOGICAL_OVERHEAD + MAX_DECODED_PACKET_LENGTH);

/// A decoded (channel, payload) pair. `payload` is reference-counted so a
/// single UART-side decode can be shared across every client queue it fans
/// out to without copying, freed once the last queue holding it drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: u8,
    pub payload: Arc<[u8]>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload of {0} bytes exceeds MAX_DECODED_PACKET_LENGTH ({MAX_DECODED_PACKET_LENGTH})")]
    PayloadTooLarge(usize),
}

/// Serialize `(channel, payload)` into its wire form.
pub fn serialize(channel: u8, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_DECODED_PACKET_LENGTH {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let mut logical = Vec::with_capacity(LOGICAL_OVERHEAD + payload.len());
    logical.push(channel);
    let mut len_buf = [0u8; 2];
    BigEndian::write_u16(&mut len_buf, payload.len() as u16);
    logical.extend_from_slice(&len_buf);
    logical.extend_from_slice(payload);

    let crc = crc32(&logical);
    let mut crc_buf = [0u8; 4];
    BigEndian::write_u32(&mut crc_buf, crc);
    logical.extend_from_slice(&crc_buf);

    let mut out = Vec::with_capacity(2 + logical.len() * 2);
    out.push(FRAME_DELIM);
    escape_into(&logical, &mut out);
    out.push(FRAME_DELIM);
    Ok(out)
}

fn escape_into(logical: &[u8], out: &mut Vec<u8>) {
    for &byte in logical {
        match byte {
            FRAME_DELIM => {
                out.push(FRAME_ESC);
                out.push(ESC_DELIM);
            }
            FRAME_ESC => {
                out.push(FRAME_ESC);
                out.push(ESC_ESC);
            }
            _ => out.push(byte),
        }
    }
}

/// Unescape a candidate body. Returns `None` on a dangling escape byte or an
/// unrecognized escaped value (both treated as a malformed candidate).
fn unescape(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(byte) = iter.next() {
        if byte == FRAME_ESC {
            match iter.next() {
                Some(ESC_DELIM) => out.push(FRAME_DELIM),
                Some(ESC_ESC) => out.push(FRAME_ESC),
                _ => return None,
            }
        } else {
            out.push(byte);
        }
    }
    Some(out)
}

/// Try to pull one packet from the front of `buf`.
///
/// Contract (spec): never blocks, never reads more than it's given. Garbage
/// before the first delimiter is dropped silently. A fully-framed candidate
/// that fails length/CRC validation is discarded through its terminating
/// delimiter and the scan resumes from there — so a single call will walk
/// through any amount of intervening corruption and return the next packet
/// that actually validates.
pub fn digest(buf: &mut Vec<u8>) -> Option<Packet> {
    loop {
        let start = buf.iter().position(|&b| b == FRAME_DELIM)?;
        if start > 0 {
            buf.drain(0..start);
        }

        // Find the closing delimiter, re-anchoring past any delimiter that
        // immediately follows the start (an empty candidate), exactly as the
        // teacher's KISS decoder treats back-to-back FEND bytes.
        let mut anchor = 0usize;
        let mut end = None;
        let mut pos = 1usize;
        while pos < buf.len() {
            if buf[pos] == FRAME_DELIM {
                if pos == anchor + 1 {
                    anchor = pos;
                    pos += 1;
                    continue;
                }
                end = Some(pos);
                break;
            }
            pos += 1;
        }

        if anchor > 0 {
            buf.drain(0..anchor);
        }

        let end = match end {
            Some(end) => end - anchor,
            None => {
                // No closing delimiter yet. If the candidate has already grown
                // past the worst-case encoded size it can never be completed
                // as a valid frame; drop the stale start and keep scanning so
                // a single dropped/garbled delimiter can't wedge the parser.
                if buf.len() > MAX_ENCODED_PAYLOAD_LENGTH + 2 {
                    buf.drain(0..1);
                    continue;
                }
                return None;
            }
        };

        let body = &buf[1..end];
        let consumed = end + 1;

        let logical = match unescape(body) {
            Some(logical) if logical.len() >= LOGICAL_OVERHEAD => logical,
            _ => {
                buf.drain(0..consumed);
                continue;
            }
        };

        let channel = logical[0];
        let declared_len = BigEndian::read_u16(&logical[1..3]) as usize;
        if logical.len() != LOGICAL_OVERHEAD + declared_len {
            buf.drain(0..consumed);
            continue;
        }

        let payload = &logical[HEADER_LEN..HEADER_LEN + declared_len];
        let expected_crc = BigEndian::read_u32(&logical[HEADER_LEN + declared_len..]);
        let actual_crc = crc32(&logical[..HEADER_LEN + declared_len]);
        if expected_crc != actual_crc {
            buf.drain(0..consumed);
            continue;
        }

        let packet = Packet {
            channel,
            payload: Arc::from(payload),
        };
        buf.drain(0..consumed);
        return Some(packet);
    }
}
