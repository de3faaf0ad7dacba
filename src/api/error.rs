use crate::commitlog::StorageError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicatedLogError {
    #[error("Participant is not the leader")]
    NotLeader,

    #[error("Participant is not a follower")]
    NotFollower,

    // An earlier storage operation failed, and this one was queued behind it.
    #[error("Storage operation aborted because the log changed underneath it")]
    Conflict,

    #[error("Persisted log failure: {0}")]
    StorageFailure(#[from] StorageError),

    #[error("Participant resigned before the operation completed")]
    Cancelled,

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    // Use after resign. The caller holds a handle it should have let go of.
    #[error("Already resigned")]
    Resigned,
}
