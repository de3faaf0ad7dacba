mod api;
mod commitlog;
mod replica;
mod state;

pub use api::Connection;
pub use api::FollowerMethods;
pub use api::LeaderMethods;
pub use api::LogPlanConfig;
pub use api::LogPlanTermSpecification;
pub use api::ParticipantFlags;
pub use api::ParticipantMethods;
pub use api::ParticipantsConfig;
pub use api::ReplicatedLog;
pub use api::ReplicatedLogConfig;
pub use api::ReplicatedLogError;
pub use api::ReplicatedLogOptions;
pub use api::ReplicatedStateHandle;
pub use api::WaitForResult;
pub use commitlog::InMemoryPersistedLog;
pub use commitlog::InMemoryStorageEngine;
pub use commitlog::LogCore;
pub use commitlog::PersistedLog;
pub use commitlog::PersistedLogIterator;
pub use commitlog::PersistedStateInfo;
pub use commitlog::SequenceNumber;
pub use commitlog::SnapshotStatus;
pub use commitlog::StorageError;
pub use commitlog::WriteOptions;
pub use replica::AbstractFollower;
pub use replica::AppendEntriesErrorReason;
pub use replica::AppendEntriesRequest;
pub use replica::AppendEntriesResult;
pub use replica::CommitFailReason;
pub use replica::EntryDecodeError;
pub use replica::EntrySerialization;
pub use replica::FollowerFactory;
pub use replica::FollowerRpcError;
pub use replica::FollowerStatistics;
pub use replica::FollowerStatus;
pub use replica::InMemoryLog;
pub use replica::InMemoryLogEntry;
pub use replica::LeaderStatus;
pub use replica::LogFuture;
pub use replica::LogId;
pub use replica::LogIndex;
pub use replica::LogPayload;
pub use replica::LogRange;
pub use replica::LogStatistics;
pub use replica::LogStatus;
pub use replica::LogTerm;
pub use replica::MessageId;
pub use replica::ParticipantId;
pub use replica::PersistingLogEntry;
pub use replica::RequestError;
pub use replica::TermIndexPair;
pub use replica::WriteConcern;
pub use state::ReplicatedState;
pub use state::SnapshotError;
pub use state::StateMachine;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
