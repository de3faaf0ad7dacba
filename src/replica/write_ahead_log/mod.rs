//! The log as the replication layer sees it: entries, their wire and storage encodings, and the
//! persistent in-memory copy of the log every participant keeps.

mod in_memory_log;
mod log_entry;

pub use in_memory_log::InMemoryLog;
pub use log_entry::EntryDecodeError;
pub use log_entry::EntrySerialization;
pub use log_entry::InMemoryLogEntry;
pub use log_entry::LogPayload;
pub use log_entry::PersistingLogEntry;

pub(crate) use log_entry::ProtoLogEntry;
