use crate::api::ReplicatedLogError;
use crate::commitlog::SequenceNumber;
use crate::replica::storage_manager::manager::{Operation, StorageManager};
use crate::replica::wait_for::LogFuture;
use crate::replica::{InMemoryLog, LogIndex, LogRange};

/// StorageTransaction is a handle for mutating the log, bound to the log as it was when the
/// transaction was started. Each operation returns a future that resolves to the storage
/// sequence number once the write is done.
pub(crate) struct StorageTransaction {
    manager: StorageManager,
    log: InMemoryLog,
}

impl StorageTransaction {
    pub(super) fn new(manager: StorageManager, log: InMemoryLog) -> Self {
        StorageTransaction { manager, log }
    }

    pub(crate) fn get_in_memory_log(&self) -> InMemoryLog {
        self.log.clone()
    }

    pub(crate) fn get_log_bounds(&self) -> LogRange {
        self.log.range()
    }

    /// Removes every entry with index `< stop`.
    pub(crate) fn remove_front(&self, stop: LogIndex) -> LogFuture<SequenceNumber> {
        self.manager
            .submit(Operation::RemoveFront(stop), |log| Ok(log.remove_front(stop)))
    }

    /// Removes every entry with index `>= start`.
    pub(crate) fn remove_back(&self, start: LogIndex) -> LogFuture<SequenceNumber> {
        self.manager
            .submit(Operation::RemoveBack(start), |log| Ok(log.remove_back(start)))
    }

    /// Appends `entries`, which must start right where the log (including everything queued
    /// before) ends. An empty log continues wherever `entries` start.
    pub(crate) fn append_entries(&self, entries: InMemoryLog) -> LogFuture<SequenceNumber> {
        let first = entries.first_index();
        self.manager.submit(Operation::Append(entries.clone()), move |log| {
            if !entries.is_empty() && !log.is_empty() && first != log.next_index() {
                return Err(ReplicatedLogError::Conflict);
            }
            Ok(log.append_log(&entries))
        })
    }
}
