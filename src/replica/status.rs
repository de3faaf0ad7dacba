use crate::replica::{
    AppendEntriesErrorReason, CommitFailReason, FollowerRpcError, LogIndex, LogTerm, MessageId, ParticipantId,
    TermIndexPair, WriteConcern,
};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum LogStatus {
    Unconfigured,
    Leader(LeaderStatus),
    Follower(FollowerStatus),
}

/// Local view of the log, the same for every role.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogStatistics {
    pub spearhead: TermIndexPair,
    pub commit_index: LogIndex,
    pub first_index: LogIndex,
    pub release_index: LogIndex,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeaderStatus {
    pub term: LogTerm,
    pub local: LogStatistics,
    pub leadership_established: bool,
    pub commit_fail_reason: CommitFailReason,
    pub write_concern: WriteConcern,
    pub generation: u64,
    pub followers: HashMap<ParticipantId, FollowerStatistics>,
}

/// The leader's bookkeeping for one follower.
#[derive(Clone, Debug, PartialEq)]
pub struct FollowerStatistics {
    pub last_ack: LogIndex,
    pub last_error: Option<RequestError>,
    pub last_request_latency: Option<Duration>,
    pub errors_since_last_success: u32,
    pub request_in_flight: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RequestError {
    Rejected(AppendEntriesErrorReason),
    Rpc(FollowerRpcError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FollowerStatus {
    pub term: LogTerm,
    pub leader: Option<ParticipantId>,
    pub local: LogStatistics,
    // False while the local state still waits for a snapshot.
    pub snapshot_available: bool,
    pub last_message_id: MessageId,
}
