use crate::commitlog::PersistedStateInfo;
use crate::replica::{EntryDecodeError, LogId, LogIndex, PersistingLogEntry};
use async_trait::async_trait;
use std::fmt;

/// SequenceNumber is the storage engine's position in its own write stream. A write is durable
/// once the engine's synced sequence number has reached the number returned for that write.
pub type SequenceNumber = u64;

pub type PersistedLogIterator = Box<dyn Iterator<Item = PersistingLogEntry> + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub wait_for_sync: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("Corrupt log record: {0}")]
    CorruptRecord(#[from] EntryDecodeError),
    #[error("Corrupt metadata record: {0}")]
    CorruptMetadata(String),
    #[error("Inserted entries must continue the log at {expected:?}, got {actual:?}")]
    NonContiguousInsert { expected: LogIndex, actual: LogIndex },
    #[error("Storage engine failure: {0}")]
    Engine(String),
}

/// PersistedLog is the durable storage of a single replicated log.
///
/// Log indexes start from 1. Entries are kept in index order and without gaps; the log may begin
/// at any index, since its front is removed once no longer needed.
///
/// Mutating calls are never issued concurrently. The storage manager holds the log exclusively
/// and has at most one write outstanding at a time.
#[async_trait]
pub trait PersistedLog: Send + Sync + 'static {
    fn log_id(&self) -> LogId;

    /// Key prefix of this log inside the storage engine.
    fn object_id(&self) -> u64;

    /// Returns default metadata if none was written yet.
    fn read_metadata(&self) -> Result<PersistedStateInfo, StorageError>;

    fn update_metadata(&mut self, info: PersistedStateInfo) -> Result<(), StorageError>;

    /// Reads all entries with index `>= first`, in index order.
    fn read(&self, first: LogIndex) -> Result<PersistedLogIterator, StorageError>;

    /// Appends entries. The first entry must continue the log.
    async fn insert(&mut self, entries: Vec<PersistingLogEntry>, options: WriteOptions)
        -> Result<SequenceNumber, StorageError>;

    /// Removes every entry with index `< stop`.
    async fn remove_front(&mut self, stop: LogIndex, options: WriteOptions) -> Result<SequenceNumber, StorageError>;

    /// Removes every entry with index `>= start`.
    async fn remove_back(&mut self, start: LogIndex, options: WriteOptions) -> Result<SequenceNumber, StorageError>;

    fn synced_sequence_number(&self) -> SequenceNumber;

    /// Resolves once everything up to `sequence_number` is durable.
    async fn wait_for_sync(&self, sequence_number: SequenceNumber) -> Result<(), StorageError> {
        let _ = sequence_number;
        Ok(())
    }
}

/// LogCore is the single owner of a persisted log. It can't be cloned: it moves from the
/// supervising layer into a participant, and back out again when the participant resigns.
pub struct LogCore {
    persisted: Box<dyn PersistedLog>,
}

impl LogCore {
    pub fn new<P: PersistedLog>(persisted: P) -> Self {
        LogCore {
            persisted: Box::new(persisted),
        }
    }

    pub fn log_id(&self) -> LogId {
        self.persisted.log_id()
    }

    pub(crate) fn from_boxed(persisted: Box<dyn PersistedLog>) -> Self {
        LogCore { persisted }
    }

    pub(crate) fn into_persisted(self) -> Box<dyn PersistedLog> {
        self.persisted
    }

    pub(crate) fn persisted(&self) -> &dyn PersistedLog {
        self.persisted.as_ref()
    }
}

impl fmt::Debug for LogCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogCore({:?})", self.persisted.log_id())
    }
}
