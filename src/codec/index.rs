//! Channel-0 subchannel: the in-band channel index and its request token.

use std::collections::BTreeMap;

/// Channel 0 is reserved for this subchannel and never materialized as a socket.
pub const INDEX_CHANNEL: u8 = 0;

/// Outbound payload requesting a fresh index from the peer.
pub const INDEX_REQUEST: &[u8] = b"INDEX_REQUEST";

const MAX_NAME_LEN: usize = 255;

/// Mapping from channel number to channel name, as last learned from the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelIndex(BTreeMap<u8, String>);

impl ChannelIndex {
    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.0.iter().map(|(&n, name)| (n, name.as_str()))
    }

    pub fn get(&self, number: u8) -> Option<&str> {
        self.0.get(&number).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u8, String)> for ChannelIndex {
    fn from_iter<T: IntoIterator<Item = (u8, String)>>(iter: T) -> Self {
        ChannelIndex(iter.into_iter().collect())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| !c.is_whitespace() && c != '/')
}

/// Parse a channel-0 payload into a `ChannelIndex`. Total: malformed,
/// out-of-range, or empty-name records are skipped rather than failing the
/// whole parse.
pub fn parse(payload: &[u8]) -> ChannelIndex {
    let text = String::from_utf8_lossy(payload);
    let mut map = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.splitn(2, char::is_whitespace);
        let Some(number_str) = fields.next() else { continue };
        let Some(name) = fields.next().map(str::trim) else { continue };

        let Ok(number) = number_str.parse::<u16>() else { continue };
        if number > 0xFF || !valid_name(name) {
            continue;
        }

        map.insert(number as u8, name.to_string());
    }

    ChannelIndex(map)
}
