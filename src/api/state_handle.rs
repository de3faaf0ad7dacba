//! The seam between a replicated log and whatever is built on top of it.

use crate::api::ReplicatedLogError;
use crate::replica::LogFuture;
use crate::replica::{InMemoryLog, LogIndex, LogPayload, ParticipantId};
use std::sync::Arc;

/// ReplicatedStateHandle is the user of a replicated log. The log calls it when the local
/// participant's role changes, when the commit index moves, and when the user's state has to be
/// rebuilt from a snapshot.
///
/// Calls are made without any lock of the log held, but they are made from the log's tasks, so
/// they must not block.
pub trait ReplicatedStateHandle: Send + Sync {
    /// The current role ended. Returns the methods handed out for it, if any.
    fn resign_current_state(&self) -> Option<ParticipantMethods>;

    /// The local participant leads and its term's first entry is committed.
    fn leadership_established(&self, methods: Arc<dyn LeaderMethods>);

    fn become_follower(&self, methods: Arc<dyn FollowerMethods>);

    /// Fetch a snapshot from `leader` that covers at least `index`, then call
    /// [`FollowerMethods::snapshot_completed`].
    fn acquire_snapshot(&self, leader: &ParticipantId, index: LogIndex);

    fn update_commit_index(&self, index: LogIndex);

    /// Entries that were handed out but not committed are gone. Don't apply them.
    fn drop_entries(&self);
}

#[derive(Clone)]
pub enum ParticipantMethods {
    Leader(Arc<dyn LeaderMethods>),
    Follower(Arc<dyn FollowerMethods>),
}

impl ParticipantMethods {
    pub(crate) fn get_log_snapshot(&self) -> Result<InMemoryLog, ReplicatedLogError> {
        match self {
            ParticipantMethods::Leader(methods) => methods.get_log_snapshot(),
            ParticipantMethods::Follower(methods) => methods.get_log_snapshot(),
        }
    }

    pub(crate) fn release_index(&self, index: LogIndex) -> Result<(), ReplicatedLogError> {
        match self {
            ParticipantMethods::Leader(methods) => methods.release_index(index),
            ParticipantMethods::Follower(methods) => methods.release_index(index),
        }
    }
}

/// What a leading participant lets its state do with the log. Every method fails with
/// [`ReplicatedLogError::NotLeader`] once the leader resigned.
pub trait LeaderMethods: Send + Sync {
    /// Appends `payload` to the log and returns the index it got. The entry isn't committed yet,
    /// use [`LeaderMethods::wait_for`] for that.
    fn insert(&self, payload: LogPayload, wait_for_sync: bool) -> Result<LogIndex, ReplicatedLogError>;

    fn wait_for(&self, index: LogIndex) -> LogFuture<WaitForResult>;

    /// Entries up to and including `index` are not needed by the state anymore.
    fn release_index(&self, index: LogIndex) -> Result<(), ReplicatedLogError>;

    /// The log as persisted locally.
    fn get_log_snapshot(&self) -> Result<InMemoryLog, ReplicatedLogError>;
}

/// What a following participant lets its state do with the log. Every method fails with
/// [`ReplicatedLogError::NotFollower`] once the follower resigned.
pub trait FollowerMethods: Send + Sync {
    fn release_index(&self, index: LogIndex) -> Result<(), ReplicatedLogError>;

    fn get_log_snapshot(&self) -> Result<InMemoryLog, ReplicatedLogError>;

    /// The snapshot requested through [`ReplicatedStateHandle::acquire_snapshot`] is in place.
    /// The follower starts forwarding commit index updates again.
    fn snapshot_completed(&self) -> LogFuture<()>;

    fn leader(&self) -> Option<ParticipantId>;
}

/// Resolution of a [`LeaderMethods::wait_for`].
#[derive(Clone, Debug, PartialEq)]
pub struct WaitForResult {
    pub commit_index: LogIndex,
    // Participants that had the entry when it was committed.
    pub quorum: Vec<ParticipantId>,
}
