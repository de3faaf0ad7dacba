use crate::replica::{LogIndex, LogPayload, ParticipantId};
use async_trait::async_trait;

/// StateMachine is the application specific view of applying the replicated log in sequential
/// consistent order.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// apply_committed_entry is called only when it's guaranteed that the provided entry has been
    /// committed (i.e. acknowledged by a write concern worth of participants). Because of this
    /// guarantee, you will never need to reverse an entry once you've been asked to apply it, so
    /// your impl of applying an entry need not be reversible.
    ///
    /// Entries are applied strictly in index order. Meta entries never show up here.
    fn apply_committed_entry(&self, index: LogIndex, entry: LogPayload);

    /// Replaces the local state with `leader`'s, as of some index `>= index`. Returns the index the
    /// snapshot covers: entries up to and including it must not be applied again.
    ///
    /// Failures are retried with backoff, as long as this participant keeps following `leader`.
    async fn acquire_snapshot(&self, leader: &ParticipantId, index: LogIndex) -> Result<LogIndex, SnapshotError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot source unavailable: {0}")]
    Unavailable(String),

    #[error("Snapshot transfer failed: {0}")]
    Transfer(String),
}
