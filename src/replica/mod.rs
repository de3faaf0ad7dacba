mod algorithms;
mod follower;
mod leader;
mod raft_rpcs;
mod replica_api;
mod status;
mod storage_manager;
mod types;
mod wait_for;
mod write_ahead_log;

#[cfg(test)]
mod test_utils;

pub use algorithms::CommitFailReason;
pub use algorithms::WriteConcern;
pub use replica_api::AbstractFollower;
pub use replica_api::AppendEntriesErrorReason;
pub use replica_api::AppendEntriesRequest;
pub use replica_api::AppendEntriesResult;
pub use replica_api::FollowerFactory;
pub use replica_api::FollowerRpcError;
pub use status::FollowerStatistics;
pub use status::FollowerStatus;
pub use status::LeaderStatus;
pub use status::LogStatistics;
pub use status::LogStatus;
pub use status::RequestError;
pub use types::LogId;
pub use types::LogIndex;
pub use types::LogRange;
pub use types::LogTerm;
pub use types::MessageId;
pub use types::ParticipantId;
pub use types::TermIndexPair;
pub use wait_for::LogFuture;
pub use write_ahead_log::EntryDecodeError;
pub use write_ahead_log::EntrySerialization;
pub use write_ahead_log::InMemoryLog;
pub use write_ahead_log::InMemoryLogEntry;
pub use write_ahead_log::LogPayload;
pub use write_ahead_log::PersistingLogEntry;

pub(crate) use follower::LogFollower;
pub(crate) use leader::LogLeader;
pub(crate) use storage_manager::StorageManager;
pub(crate) use wait_for::WaitForQueue;

#[cfg(test)]
pub(crate) use test_utils::{
    entries, eventually, storage_with, test_logger, LocalFollowerFactory, RecordingStateHandle, StateHandleEvent,
};
