use crate::replica::{LogIndex, LogTerm, MessageId, ParticipantId, PersistingLogEntry, TermIndexPair};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, PartialEq)]
pub struct AppendEntriesRequest {
    pub leader_term: LogTerm,
    pub leader_id: ParticipantId,
    // "Previous log entry" is the entry immediately preceding `entries`. Term 0 asks the follower
    // to throw away its log and continue right after the given index, where the leader's log
    // starts.
    pub prev_log_entry: TermIndexPair,
    pub leader_commit: LogIndex,
    pub lowest_index_to_keep: LogIndex,
    pub message_id: MessageId,
    pub wait_for_sync: bool,
    pub entries: Vec<PersistingLogEntry>,
}

impl AppendEntriesRequest {
    pub fn is_rewrite(&self) -> bool {
        self.prev_log_entry.term == LogTerm::default()
    }

    /// First index of the leader's log for a rewrite.
    pub fn rewrite_start(&self) -> LogIndex {
        self.prev_log_entry.index.plus(1)
    }

    /// Last index the follower holds in the leader's version after accepting this request.
    pub fn last_index_covered(&self) -> LogIndex {
        self.entries
            .last()
            .map(PersistingLogEntry::log_index)
            .unwrap_or(self.prev_log_entry.index)
    }
}

impl fmt::Debug for AppendEntriesRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = match (self.entries.first(), self.entries.last()) {
            (Some(first), Some(last)) => format!("[{}, {}]", first.log_index(), last.log_index()),
            _ => "[]".to_string(),
        };
        f.debug_struct("AppendEntriesRequest")
            .field("leader_term", &self.leader_term)
            .field("leader_id", &self.leader_id)
            .field("prev_log_entry", &self.prev_log_entry)
            .field("leader_commit", &self.leader_commit)
            .field("lowest_index_to_keep", &self.lowest_index_to_keep)
            .field("message_id", &self.message_id)
            .field("wait_for_sync", &self.wait_for_sync)
            .field("entries", &range)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesResult {
    pub log_term: LogTerm,
    pub message_id: MessageId,
    pub reason: AppendEntriesErrorReason,
    pub last_acked: LogIndex,
    // Only set for NoPrevLogMatch. The leader continues from here.
    pub conflict: Option<TermIndexPair>,
}

impl AppendEntriesResult {
    pub(crate) fn success(log_term: LogTerm, message_id: MessageId, last_acked: LogIndex) -> Self {
        AppendEntriesResult {
            log_term,
            message_id,
            reason: AppendEntriesErrorReason::None,
            last_acked,
            conflict: None,
        }
    }

    pub(crate) fn rejected(log_term: LogTerm, message_id: MessageId, reason: AppendEntriesErrorReason) -> Self {
        AppendEntriesResult {
            log_term,
            message_id,
            reason,
            last_acked: LogIndex::default(),
            conflict: None,
        }
    }

    pub(crate) fn with_conflict(
        log_term: LogTerm,
        message_id: MessageId,
        last_acked: LogIndex,
        conflict: TermIndexPair,
    ) -> Self {
        AppendEntriesResult {
            log_term,
            message_id,
            reason: AppendEntriesErrorReason::NoPrevLogMatch,
            last_acked,
            conflict: Some(conflict),
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason == AppendEntriesErrorReason::None
    }
}

/// Why a follower didn't accept an append-entries request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AppendEntriesErrorReason {
    None,
    InvalidLeaderId,
    LostLogCore,
    MessageOutdated,
    WrongTerm,
    NoPrevLogMatch,
    PrevAppendEntriesInFlight,
    PersistenceFailure,
}

impl AppendEntriesErrorReason {
    pub(crate) fn as_i32(self) -> i32 {
        match self {
            AppendEntriesErrorReason::None => 0,
            AppendEntriesErrorReason::InvalidLeaderId => 1,
            AppendEntriesErrorReason::LostLogCore => 2,
            AppendEntriesErrorReason::MessageOutdated => 3,
            AppendEntriesErrorReason::WrongTerm => 4,
            AppendEntriesErrorReason::NoPrevLogMatch => 5,
            AppendEntriesErrorReason::PrevAppendEntriesInFlight => 6,
            AppendEntriesErrorReason::PersistenceFailure => 7,
        }
    }

    pub(crate) fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(AppendEntriesErrorReason::None),
            1 => Some(AppendEntriesErrorReason::InvalidLeaderId),
            2 => Some(AppendEntriesErrorReason::LostLogCore),
            3 => Some(AppendEntriesErrorReason::MessageOutdated),
            4 => Some(AppendEntriesErrorReason::WrongTerm),
            5 => Some(AppendEntriesErrorReason::NoPrevLogMatch),
            6 => Some(AppendEntriesErrorReason::PrevAppendEntriesInFlight),
            7 => Some(AppendEntriesErrorReason::PersistenceFailure),
            _ => None,
        }
    }
}

impl fmt::Display for AppendEntriesErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            AppendEntriesErrorReason::None => "No error",
            AppendEntriesErrorReason::InvalidLeaderId => "Leader id mismatch",
            AppendEntriesErrorReason::LostLogCore => "Follower lost its log core",
            AppendEntriesErrorReason::MessageOutdated => "Message is outdated",
            AppendEntriesErrorReason::WrongTerm => "Term mismatch",
            AppendEntriesErrorReason::NoPrevLogMatch => "Previous log entry doesn't match",
            AppendEntriesErrorReason::PrevAppendEntriesInFlight => "Previous append entries still in flight",
            AppendEntriesErrorReason::PersistenceFailure => "Persisting the log failed",
        };
        f.write_str(message)
    }
}

/// Transport failure talking to a follower. The leader treats it as a missing acknowledgement.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FollowerRpcError {
    #[error("Follower unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out")]
    Timeout,
}

/// AbstractFollower is the leader's view of one follower: something that takes append-entries.
#[async_trait]
pub trait AbstractFollower: Send + Sync {
    fn participant_id(&self) -> &ParticipantId;

    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResult, FollowerRpcError>;
}

/// FollowerFactory hands the leader a connection to each follower it replicates to.
pub trait FollowerFactory: Send + Sync {
    fn construct_follower(&self, participant: &ParticipantId) -> Arc<dyn AbstractFollower>;
}
