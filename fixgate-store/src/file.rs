/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! File-backed sequence store.
//!
//! One file per session key under the configured directory, named by the
//! key's stable hash. The record body is the length-prefixed composite key
//! encoding followed by the sequence fields, all little-endian. Writes go
//! to a temporary file which is then renamed over the record, so a crash
//! mid-write leaves the previous record intact.

use crate::traits::SequenceStore;
use fixgate_core::{CompositeKey, SequenceState, StoreError, Uuid};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Record magic, guards against foreign files in the log directory.
const MAGIC: u32 = 0x4647_5351;

/// Fixed size of the sequence fields after the key record.
const STATE_LEN: usize = 8 + 8 + 4 + 8 + 8 + 8;

/// File extension for sequence records.
const EXTENSION: &str = "seq";

/// File-backed [`SequenceStore`].
#[derive(Debug)]
pub struct FileSequenceStore {
    dir: PathBuf,
}

impl FileSequenceStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error)?;
        Ok(Self { dir })
    }

    /// Returns the record path for `key`.
    #[must_use]
    pub fn path_for(&self, key: &CompositeKey) -> PathBuf {
        self.dir
            .join(format!("{:016x}.{EXTENSION}", key.stable_hash()))
    }

    fn encode_record(key: &CompositeKey, state: &SequenceState) -> Vec<u8> {
        let key_len = key.encoded_length();
        let mut buffer = vec![0u8; 4 + key_len + STATE_LEN];

        buffer[..4].copy_from_slice(&MAGIC.to_le_bytes());
        // Sized exactly above, so the key encode cannot fail.
        let written = key.save(&mut buffer, 4);
        debug_assert_eq!(written, key_len as isize);

        let mut at = 4 + key_len;
        let put_u64 = |buffer: &mut [u8], at: &mut usize, value: u64| {
            buffer[*at..*at + 8].copy_from_slice(&value.to_le_bytes());
            *at += 8;
        };
        put_u64(&mut buffer, &mut at, state.next_sent_seq_no);
        put_u64(&mut buffer, &mut at, state.next_recv_seq_no);
        buffer[at..at + 4].copy_from_slice(&state.sequence_index.to_le_bytes());
        at += 4;
        put_u64(&mut buffer, &mut at, state.uuid.value());
        put_u64(&mut buffer, &mut at, state.last_uuid.value());
        put_u64(&mut buffer, &mut at, state.last_recv_seq_no);
        debug_assert_eq!(at, buffer.len());

        buffer
    }

    fn decode_record(buffer: &[u8]) -> Result<(CompositeKey, SequenceState), StoreError> {
        if buffer.len() < 4 || buffer[..4] != MAGIC.to_le_bytes() {
            return Err(StoreError::Corrupted {
                reason: "bad record magic".to_string(),
            });
        }

        let (key, key_len) =
            CompositeKey::load(buffer, 4).map_err(|e| StoreError::Corrupted {
                reason: format!("bad key record: {e}"),
            })?;

        let mut at = 4 + key_len;
        if buffer.len() != at + STATE_LEN {
            return Err(StoreError::Corrupted {
                reason: format!(
                    "bad record length: expected {}, found {}",
                    at + STATE_LEN,
                    buffer.len()
                ),
            });
        }

        let get_u64 = |at: &mut usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buffer[*at..*at + 8]);
            *at += 8;
            u64::from_le_bytes(bytes)
        };
        let next_sent_seq_no = get_u64(&mut at);
        let next_recv_seq_no = get_u64(&mut at);
        let mut index_bytes = [0u8; 4];
        index_bytes.copy_from_slice(&buffer[at..at + 4]);
        at += 4;
        let uuid = Uuid::new(get_u64(&mut at));
        let last_uuid = Uuid::new(get_u64(&mut at));
        let last_recv_seq_no = get_u64(&mut at);

        Ok((
            key,
            SequenceState {
                next_sent_seq_no,
                next_recv_seq_no,
                sequence_index: u32::from_le_bytes(index_bytes),
                uuid,
                last_uuid,
                last_recv_seq_no,
            },
        ))
    }

    fn read_record(path: &Path) -> Result<(CompositeKey, SequenceState), StoreError> {
        let buffer = fs::read(path).map_err(io_error)?;
        Self::decode_record(&buffer)
    }
}

impl SequenceStore for FileSequenceStore {
    fn load(&self, key: &CompositeKey) -> Result<Option<SequenceState>, StoreError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let (stored_key, state) = Self::read_record(&path)?;
        if stored_key != *key {
            warn!(
                path = %path.display(),
                expected = %key,
                found = %stored_key,
                "sequence record key mismatch, treating as absent"
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    fn save(&self, key: &CompositeKey, state: &SequenceState) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let record = Self::encode_record(key, state);

        let mut file = File::create(&tmp).map_err(io_error)?;
        file.write_all(&record).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);

        fs::rename(&tmp, &path).map_err(io_error)
    }

    fn reset(&self, key: &CompositeKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }

    fn load_all(&self) -> Result<Vec<(CompositeKey, SequenceState)>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            records.push(Self::read_record(&path)?);
        }
        Ok(records)
    }
}

fn io_error(err: std::io::Error) -> StoreError {
    StoreError::Io(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixgate_core::CompId;

    fn key(sender: &str) -> CompositeKey {
        CompositeKey::new(CompId::new(sender).unwrap(), CompId::new("CME").unwrap())
            .with_sender_sub_id(CompId::new("DESK").unwrap())
    }

    fn state() -> SequenceState {
        SequenceState {
            next_sent_seq_no: 12,
            next_recv_seq_no: 7,
            sequence_index: 2,
            uuid: Uuid::new(0xDEAD_BEEF),
            last_uuid: Uuid::new(0xCAFE),
            last_recv_seq_no: 4,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSequenceStore::open(dir.path()).unwrap();
        let key = key("TRADER1");

        assert!(store.load(&key).unwrap().is_none());

        store.save(&key, &state()).unwrap();
        assert_eq!(store.load(&key).unwrap(), Some(state()));
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSequenceStore::open(dir.path()).unwrap();
        let key = key("TRADER1");

        store.save(&key, &state()).unwrap();

        let mut updated = state();
        updated.next_sent_seq_no = 99;
        store.save(&key, &updated).unwrap();

        assert_eq!(store.load(&key).unwrap(), Some(updated));
        // No temp file left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_reset_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSequenceStore::open(dir.path()).unwrap();
        let key = key("TRADER1");

        store.save(&key, &state()).unwrap();
        store.reset(&key).unwrap();
        assert!(store.load(&key).unwrap().is_none());

        // Idempotent.
        store.reset(&key).unwrap();
    }

    #[test]
    fn test_corrupt_record_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSequenceStore::open(dir.path()).unwrap();
        let key = key("TRADER1");

        store.save(&key, &state()).unwrap();

        let path = store.path_for(&key);
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            store.load(&key),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_load_all_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileSequenceStore::open(dir.path()).unwrap();
            store.save(&key("A"), &state()).unwrap();
            store.save(&key("B"), &state()).unwrap();
        }

        // A fresh store over the same directory sees both records.
        let reopened = FileSequenceStore::open(dir.path()).unwrap();
        let all = reopened.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(reopened.load(&key("A")).unwrap(), Some(state()));
    }
}
