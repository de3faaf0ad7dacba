use crate::commitlog::key::{self, EntryKey, MetadataKey};
use crate::commitlog::{PersistedLog, PersistedLogIterator, PersistedStateInfo, SequenceNumber, StorageError, WriteOptions};
use crate::replica::{EntrySerialization, LogId, LogIndex, PersistingLogEntry};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::{Arc, Mutex, MutexGuard};

// Keeps the data the way a key-value engine with two column families would: one column with
// every log's entries, one with every log's metadata. We don't *need* the bytes, but we want to
// exercise the key and record encoding.
#[derive(Clone, Default)]
pub struct InMemoryStorageEngine {
    state: Arc<Mutex<EngineState>>,
}

#[derive(Default)]
struct EngineState {
    log_column: BTreeMap<EntryKey, Vec<u8>>,
    metadata_column: BTreeMap<MetadataKey, Vec<u8>>,
    sequence_number: SequenceNumber,
}

impl EngineState {
    fn next_sequence_number(&mut self) -> SequenceNumber {
        self.sequence_number += 1;
        self.sequence_number
    }
}

impl InMemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the log stored under `log_id`, creating it if it doesn't exist yet. Reopening a log
    /// sees everything written through earlier handles.
    pub fn open_log(&self, log_id: LogId) -> InMemoryPersistedLog {
        InMemoryPersistedLog {
            log_id,
            object_id: log_id.as_u64(),
            engine: self.clone(),
        }
    }

    /// Total number of entry records across all logs.
    pub fn entry_count(&self) -> usize {
        self.lock().log_column.len()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("InMemoryStorageEngine mutex guard poison")
    }
}

pub struct InMemoryPersistedLog {
    log_id: LogId,
    object_id: u64,
    engine: InMemoryStorageEngine,
}

impl InMemoryPersistedLog {
    fn first_key(&self) -> EntryKey {
        key::entry_key(self.object_id, LogIndex::new(0))
    }

    fn last_key(&self) -> EntryKey {
        key::entry_key(self.object_id, LogIndex::new(u64::MAX))
    }

    fn remove_range<R: RangeBounds<EntryKey>>(state: &mut EngineState, range: R) {
        let doomed: Vec<EntryKey> = state.log_column.range(range).map(|(k, _)| *k).collect();
        for k in doomed {
            state.log_column.remove(&k);
        }
    }
}

#[async_trait]
impl PersistedLog for InMemoryPersistedLog {
    fn log_id(&self) -> LogId {
        self.log_id
    }

    fn object_id(&self) -> u64 {
        self.object_id
    }

    fn read_metadata(&self) -> Result<PersistedStateInfo, StorageError> {
        match self.engine.lock().metadata_column.get(&key::metadata_key(self.object_id)) {
            Some(record) => PersistedStateInfo::from_record(record),
            None => Ok(PersistedStateInfo::new(self.log_id)),
        }
    }

    fn update_metadata(&mut self, info: PersistedStateInfo) -> Result<(), StorageError> {
        let mut state = self.engine.lock();
        state
            .metadata_column
            .insert(key::metadata_key(self.object_id), info.to_record());
        state.next_sequence_number();
        Ok(())
    }

    fn read(&self, first: LogIndex) -> Result<PersistedLogIterator, StorageError> {
        let state = self.engine.lock();
        let entries = state
            .log_column
            .range(key::entry_key(self.object_id, first)..=self.last_key())
            .map(|(k, record)| PersistingLogEntry::from_record(record, Some(key::index_of_key(k))))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Box::new(entries.into_iter()))
    }

    async fn insert(
        &mut self,
        entries: Vec<PersistingLogEntry>,
        _options: WriteOptions,
    ) -> Result<SequenceNumber, StorageError> {
        let mut state = self.engine.lock();

        let mut expected = state
            .log_column
            .range(self.first_key()..=self.last_key())
            .next_back()
            .map(|(k, _)| key::index_of_key(k).plus(1));
        for entry in entries.iter() {
            if let Some(expected) = expected {
                if entry.log_index() != expected {
                    return Err(StorageError::NonContiguousInsert {
                        expected,
                        actual: entry.log_index(),
                    });
                }
            }
            expected = Some(entry.log_index().plus(1));
        }

        for entry in entries {
            let k = key::entry_key(self.object_id, entry.log_index());
            state
                .log_column
                .insert(k, entry.to_record(EntrySerialization::OmitLogIndex));
        }

        Ok(state.next_sequence_number())
    }

    async fn remove_front(&mut self, stop: LogIndex, _options: WriteOptions) -> Result<SequenceNumber, StorageError> {
        let mut state = self.engine.lock();
        Self::remove_range(&mut state, self.first_key()..key::entry_key(self.object_id, stop));
        Ok(state.next_sequence_number())
    }

    async fn remove_back(&mut self, start: LogIndex, _options: WriteOptions) -> Result<SequenceNumber, StorageError> {
        let mut state = self.engine.lock();
        Self::remove_range(&mut state, key::entry_key(self.object_id, start)..=self.last_key());
        Ok(state.next_sequence_number())
    }

    fn synced_sequence_number(&self) -> SequenceNumber {
        self.engine.lock().sequence_number
    }
}
