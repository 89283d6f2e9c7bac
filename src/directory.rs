//! Channel directory manager: keeps the set of per-channel `SOCK_SEQPACKET`
//! listeners in sync with the most recently received channel index, and
//! mirrors that index to disk as `.index` in the socket directory.
//!
//! Translated from `sync_available_channels` in the original daemon, kept
//! deliberately close to its structure (spec.md §4.3 steps 1-4).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::codec::index::ChannelIndex;
use crate::net::{NetError, SeqpacketListener, DEFAULT_SOCKET_MODE};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to create socket directory {0:?}: {1}")]
    CreateSocketDir(PathBuf, #[source] std::io::Error),
}

/// A single multiplexed channel: its listener socket and connected clients.
pub struct Channel {
    pub name: String,
    pub channel_number: u8,
    pub listener: SeqpacketListener,
    pub clients: Vec<crate::engine::Client>,
}

/// Rebuilds `channels` to match `index`, writes `.index` atomically, and
/// sweeps stray files out of `socket_dir`. Mirrors the four numbered steps
/// of the original `sync_available_channels`:
///
/// 1. Write the pending `.index~` as we walk the new index.
/// 2. Destroy any existing channel whose name no longer matches its number
///    (a reused channel ID), then instantiate any missing channel.
/// 3. Commit `.index~` over `.index`, or remove a stale `.index` if the
///    temp file couldn't be created.
/// 4. Drop channels no longer present in the index, then unlink unknown
///    files left behind in `socket_dir`.
///
/// Channels are destroyed (step 2) before being recreated under the same
/// number, matching the original's unlink-then-bind ordering rather than
/// trying to rebind the existing socket in place.
pub fn sync_available_channels(
    socket_dir: &Path,
    uart_path: &str,
    baud: u32,
    channels: &mut BTreeMap<u8, Channel>,
    index: &ChannelIndex,
) {
    let mut known_numbers = std::collections::BTreeSet::new();
    let mut known_names = std::collections::BTreeSet::new();

    let tmp_path = socket_dir.join(".index~");
    let index_path = socket_dir.join(".index");
    let mut index_file = match File::create(&tmp_path) {
        Ok(f) => Some(f),
        Err(e) => {
            log::warn!("failed to create {:?}: {}", tmp_path, e);
            None
        }
    };

    if let Some(f) = index_file.as_mut() {
        if let Err(e) = writeln!(f, "UART {} {}", uart_path, baud) {
            log::warn!("failed to write {:?}: {}", tmp_path, e);
        }
    }

    for (number, name) in index.iter() {
        if number == crate::codec::index::INDEX_CHANNEL {
            continue; // Never instantiated as a socket.
        }

        known_numbers.insert(number);
        known_names.insert(name.to_owned());

        if let Some(f) = index_file.as_mut() {
            if let Err(e) = writeln!(f, "CHANNEL {} {}", number, name) {
                log::warn!("failed to write {:?}: {}", tmp_path, e);
            }
        }

        if let Some(existing) = channels.get(&number) {
            if existing.name != name {
                // Reused channel number with a different name. Drop the old
                // one; its `Drop` impl unlinks the socket.
                channels.remove(&number);
            }
        }

        if !channels.contains_key(&number) {
            if number >= 0x80 {
                log::error!("channel number out of range in sync: {}", number);
            } else {
                match open_channel(socket_dir, number, name) {
                    Ok(channel) => {
                        channels.insert(number, channel);
                    }
                    Err(e) => {
                        log::error!("failed to open channel {} ({:?}): {}", number, name, e);
                    }
                }
            }
        }
    }

    match index_file {
        Some(f) => {
            if let Err(e) = f.sync_all() {
                log::warn!("failed to fsync {:?}: {}", tmp_path, e);
            }
            drop(f);
            if let Err(e) = fs::rename(&tmp_path, &index_path) {
                log::warn!("failed to rename {:?} to {:?}: {}", tmp_path, index_path, e);
            }
        }
        None => {
            let _ = fs::remove_file(&index_path);
        }
    }

    channels.retain(|number, _| known_numbers.contains(number));

    sweep_stray_files(socket_dir, &known_names);
}

fn open_channel(
    socket_dir: &Path,
    number: u8,
    name: &str,
) -> Result<Channel, NetError> {
    let path = socket_dir.join(name);
    let listener = SeqpacketListener::bind(&path, DEFAULT_SOCKET_MODE)?;
    Ok(Channel {
        name: name.to_owned(),
        channel_number: number,
        listener,
        clients: Vec::new(),
    })
}

fn sweep_stray_files(socket_dir: &Path, known_names: &std::collections::BTreeSet<String>) {
    let entries = match fs::read_dir(socket_dir) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("failed to read socket dir {:?}: {}", socket_dir, e);
            return;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = match file_name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if name == ".index" || name == ".index~" {
            continue;
        }
        if !known_names.contains(name) {
            let _ = fs::remove_file(entry.path());
        }
    }
}

/// Ensures the socket directory exists with permissive (0777) access, as
/// the daemon's own `mkdir` bootstrap does.
pub fn ensure_socket_dir(socket_dir: &Path) -> Result<(), DirectoryError> {
    fs::create_dir_all(socket_dir)
        .map_err(|e| DirectoryError::CreateSocketDir(socket_dir.to_path_buf(), e))?;
    let _ = fs::set_permissions(socket_dir, fs::Permissions::from_mode(0o777));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::index::ChannelIndex;

    fn index_from(pairs: &[(u8, &str)]) -> ChannelIndex {
        pairs
            .iter()
            .map(|(n, s)| (*n, s.to_string()))
            .collect::<ChannelIndex>()
    }

    #[test]
    fn creates_channels_and_writes_index() {
        let dir = tempfile::tempdir().unwrap();
        ensure_socket_dir(dir.path()).unwrap();

        let mut channels = BTreeMap::new();
        let index = index_from(&[(1, "telemetry"), (2, "commands")]);

        sync_available_channels(dir.path(), "/dev/ttyUL1", 115200, &mut channels, &index);

        assert_eq!(channels.len(), 2);
        assert!(dir.path().join("telemetry").exists());
        assert!(dir.path().join("commands").exists());
        assert!(dir.path().join(".index").exists());
        assert!(!dir.path().join(".index~").exists());

        let contents = fs::read_to_string(dir.path().join(".index")).unwrap();
        assert!(contents.contains("UART /dev/ttyUL1 115200"));
        assert!(contents.contains("CHANNEL 1 telemetry"));
        assert!(contents.contains("CHANNEL 2 commands"));
    }

    #[test]
    fn removes_channels_dropped_from_index() {
        let dir = tempfile::tempdir().unwrap();
        ensure_socket_dir(dir.path()).unwrap();
        let mut channels = BTreeMap::new();

        let first = index_from(&[(1, "telemetry"), (2, "commands")]);
        sync_available_channels(dir.path(), "/dev/ttyUL1", 115200, &mut channels, &first);
        assert_eq!(channels.len(), 2);

        let second = index_from(&[(1, "telemetry")]);
        sync_available_channels(dir.path(), "/dev/ttyUL1", 115200, &mut channels, &second);

        assert_eq!(channels.len(), 1);
        assert!(channels.contains_key(&1));
        assert!(!dir.path().join("commands").exists());
    }

    #[test]
    fn reused_channel_number_with_new_name_replaces_socket() {
        let dir = tempfile::tempdir().unwrap();
        ensure_socket_dir(dir.path()).unwrap();
        let mut channels = BTreeMap::new();

        let first = index_from(&[(1, "telemetry")]);
        sync_available_channels(dir.path(), "/dev/ttyUL1", 115200, &mut channels, &first);
        assert!(dir.path().join("telemetry").exists());

        let second = index_from(&[(1, "diagnostics")]);
        sync_available_channels(dir.path(), "/dev/ttyUL1", 115200, &mut channels, &second);

        assert_eq!(channels.len(), 1);
        assert_eq!(channels.get(&1).unwrap().name, "diagnostics");
        assert!(!dir.path().join("telemetry").exists());
        assert!(dir.path().join("diagnostics").exists());
    }

    #[test]
    fn channel_numbers_at_or_above_0x80_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        ensure_socket_dir(dir.path()).unwrap();
        let mut channels = BTreeMap::new();

        let index = index_from(&[(0x90, "out-of-range"), (1, "telemetry")]);
        sync_available_channels(dir.path(), "/dev/ttyUL1", 115200, &mut channels, &index);

        assert_eq!(channels.len(), 1);
        assert!(!channels.contains_key(&0x90));
        assert!(!dir.path().join("out-of-range").exists());
    }

    #[test]
    fn index_channel_number_is_never_instantiated() {
        let dir = tempfile::tempdir().unwrap();
        ensure_socket_dir(dir.path()).unwrap();
        let mut channels = BTreeMap::new();

        let index = index_from(&[(0, "index"), (1, "telemetry")]);
        sync_available_channels(dir.path(), "/dev/ttyUL1", 115200, &mut channels, &index);

        assert_eq!(channels.len(), 1);
        assert!(!channels.contains_key(&0));
    }

    #[test]
    fn stray_socket_files_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        ensure_socket_dir(dir.path()).unwrap();
        fs::write(dir.path().join("leftover"), b"").unwrap();

        let mut channels = BTreeMap::new();
        let index = index_from(&[(1, "telemetry")]);
        sync_available_channels(dir.path(), "/dev/ttyUL1", 115200, &mut channels, &index);

        assert!(!dir.path().join("leftover").exists());
        assert!(dir.path().join("telemetry").exists());
    }
}
