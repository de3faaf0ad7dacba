mod in_memory;
mod key;
mod log;
mod state_info;
#[cfg(test)]
mod test_utils;

pub use in_memory::InMemoryPersistedLog;
pub use in_memory::InMemoryStorageEngine;
pub use log::LogCore;
pub use log::PersistedLog;
pub use log::PersistedLogIterator;
pub use log::SequenceNumber;
pub use log::StorageError;
pub use log::WriteOptions;
pub use state_info::PersistedStateInfo;
pub use state_info::SnapshotStatus;

#[cfg(test)]
pub(crate) use test_utils::DelayedPersistedLog;
