/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! In-memory store implementations.
//!
//! Suitable for tests and engines that accept losing recovery state on
//! restart. All data is lost when the process exits.

use crate::traits::{MessageArchive, SequenceStore};
use bytes::Bytes;
use fixgate_core::{CompositeKey, SequenceState, StoreError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// In-memory sequence store.
#[derive(Debug, Default)]
pub struct MemorySequenceStore {
    records: RwLock<HashMap<CompositeKey, SequenceState>>,
}

impl MemorySequenceStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of persisted records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

impl SequenceStore for MemorySequenceStore {
    fn load(&self, key: &CompositeKey) -> Result<Option<SequenceState>, StoreError> {
        Ok(self.records.read().get(key).copied())
    }

    fn save(&self, key: &CompositeKey, state: &SequenceState) -> Result<(), StoreError> {
        self.records.write().insert(key.clone(), *state);
        Ok(())
    }

    fn reset(&self, key: &CompositeKey) -> Result<(), StoreError> {
        self.records.write().remove(key);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(CompositeKey, SequenceState)>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }
}

/// In-memory message archive.
///
/// Messages are indexed by sequence number in a `BTreeMap` for efficient
/// range queries during replay.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    messages: RwLock<BTreeMap<u64, Bytes>>,
}

impl MemoryArchive {
    /// Creates a new empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of retained messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    /// Checks whether a message with the given sequence number is retained.
    #[must_use]
    pub fn contains(&self, seq_num: u64) -> bool {
        self.messages.read().contains_key(&seq_num)
    }
}

impl MessageArchive for MemoryArchive {
    fn store(&self, seq_num: u64, message: &[u8]) -> Result<(), StoreError> {
        self.messages
            .write()
            .insert(seq_num, Bytes::copy_from_slice(message));
        Ok(())
    }

    fn get_range(&self, begin: u64, end: u64) -> Result<Vec<(u64, Bytes)>, StoreError> {
        let messages = self.messages.read();
        let end = if end == 0 { u64::MAX } else { end };

        let result: Vec<(u64, Bytes)> = messages
            .range(begin..=end)
            .map(|(&seq, bytes)| (seq, bytes.clone()))
            .collect();

        if result.is_empty() {
            return Err(StoreError::RangeNotAvailable {
                range: begin..end.saturating_add(1),
            });
        }

        Ok(result)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.messages.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixgate_core::CompId;

    fn key(sender: &str) -> CompositeKey {
        CompositeKey::new(CompId::new(sender).unwrap(), CompId::new("TARGET").unwrap())
    }

    #[test]
    fn test_sequence_store_roundtrip() {
        let store = MemorySequenceStore::new();
        let key = key("SENDER");

        assert!(store.load(&key).unwrap().is_none());

        let mut state = SequenceState::initial();
        state.next_sent_seq_no = 42;
        store.save(&key, &state).unwrap();

        assert_eq!(store.load(&key).unwrap(), Some(state));
        assert_eq!(store.record_count(), 1);

        store.reset(&key).unwrap();
        assert!(store.load(&key).unwrap().is_none());
    }

    #[test]
    fn test_sequence_store_load_all() {
        let store = MemorySequenceStore::new();
        store.save(&key("A"), &SequenceState::initial()).unwrap();
        store.save(&key("B"), &SequenceState::initial()).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_archive_store_and_range() {
        let archive = MemoryArchive::new();

        archive.store(1, b"msg1").unwrap();
        archive.store(2, b"msg2").unwrap();
        archive.store(3, b"msg3").unwrap();
        archive.store(5, b"msg5").unwrap();

        let range = archive.get_range(1, 3).unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0], (1, Bytes::from_static(b"msg1")));

        let open_ended = archive.get_range(2, 0).unwrap();
        assert_eq!(open_ended.len(), 3);
        assert_eq!(open_ended.last().unwrap().0, 5);
    }

    #[test]
    fn test_archive_missing_range() {
        let archive = MemoryArchive::new();
        archive.store(1, b"msg1").unwrap();

        let err = archive.get_range(10, 20).unwrap_err();
        assert!(matches!(err, StoreError::RangeNotAvailable { .. }));
    }

    #[test]
    fn test_archive_clear() {
        let archive = MemoryArchive::new();
        archive.store(1, b"msg1").unwrap();
        archive.clear().unwrap();
        assert_eq!(archive.message_count(), 0);
        assert!(!archive.contains(1));
    }
}
