use crate::api::{FollowerMethods, ReplicatedLogError, ReplicatedStateHandle};
use crate::commitlog::{LogCore, SequenceNumber, SnapshotStatus};
use crate::replica::storage_manager::StorageManager;
use crate::replica::wait_for::LogFuture;
use crate::replica::{
    AbstractFollower, AppendEntriesErrorReason, AppendEntriesRequest, AppendEntriesResult, FollowerRpcError,
    FollowerStatus, InMemoryLog, InMemoryLogEntry, LogIndex, LogStatistics, LogTerm, MessageId, ParticipantId,
    TermIndexPair,
};
use async_trait::async_trait;
use std::cmp;
use std::sync::{Arc, Mutex, MutexGuard};

/// LogFollower takes append-entries from the leader of its term, persists them, and forwards the
/// leader's commit index to the state handle.
#[derive(Clone)]
pub(crate) struct LogFollower {
    inner: Arc<FollowerInner>,
}

struct FollowerInner {
    id: ParticipantId,
    term: LogTerm,
    leader: Option<ParticipantId>,
    storage: StorageManager,
    state_handle: Arc<dyn ReplicatedStateHandle>,
    guarded: Mutex<GuardedFollowerData>,
    logger: slog::Logger,
}

struct GuardedFollowerData {
    commit_index: LogIndex,
    last_message_id: MessageId,
    append_in_flight: bool,
    snapshot: SnapshotProgress,
    release_index: LogIndex,
    lowest_index_to_keep: LogIndex,
    resigned: bool,
}

/// Whether the local state is in a shape where committed entries can be applied to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SnapshotProgress {
    SnapshotRequired,
    SnapshotInProgress,
    CaughtUp,
}

// Work decided under the lock, carried out after releasing it.
struct PreparedAppend {
    writes: Vec<LogFuture<SequenceNumber>>,
    drop_entries: bool,
    acquire_snapshot_at: Option<LogIndex>,
}

impl LogFollower {
    pub(crate) fn construct(
        id: ParticipantId,
        term: LogTerm,
        leader: Option<ParticipantId>,
        storage: StorageManager,
        state_handle: Arc<dyn ReplicatedStateHandle>,
        logger: slog::Logger,
    ) -> LogFollower {
        let logger = logger.new(slog::o!("Term" => term.as_u64(), "Role" => "Follower"));

        let snapshot = match storage.persisted_state_info().snapshot_status {
            SnapshotStatus::Completed => SnapshotProgress::CaughtUp,
            _ => SnapshotProgress::SnapshotRequired,
        };
        slog::info!(logger, "Following {:?}, local state {:?}", leader, snapshot);

        let follower = LogFollower {
            inner: Arc::new(FollowerInner {
                id,
                term,
                leader,
                storage,
                state_handle: state_handle.clone(),
                guarded: Mutex::new(GuardedFollowerData {
                    commit_index: LogIndex::default(),
                    last_message_id: MessageId::default(),
                    append_in_flight: false,
                    snapshot,
                    release_index: LogIndex::default(),
                    lowest_index_to_keep: LogIndex::default(),
                    resigned: false,
                }),
                logger,
            }),
        };

        state_handle.become_follower(Arc::new(follower.clone()));
        follower
    }

    #[cfg(test)]
    pub(crate) fn commit_index(&self) -> LogIndex {
        self.lock().commit_index
    }

    pub(crate) async fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResult {
        slog::debug!(self.inner.logger, "Received {:?}", request);

        let prepared = match self.prepare_append(&request) {
            Ok(prepared) => prepared,
            Err(rejection) => {
                slog::warn!(
                    self.inner.logger,
                    "Rejecting {:?} from {}: {}",
                    request.message_id,
                    request.leader_id,
                    rejection.reason
                );
                return rejection;
            }
        };

        if prepared.drop_entries {
            self.inner.state_handle.drop_entries();
        }
        if let Some(index) = prepared.acquire_snapshot_at {
            slog::info!(self.inner.logger, "Requesting snapshot from {} at {:?}", request.leader_id, index);
            self.inner.state_handle.acquire_snapshot(&request.leader_id, index);
        }

        let mut write_error = None;
        for write in prepared.writes {
            if let Err(e) = write.await {
                if write_error.is_none() {
                    write_error = Some(e);
                }
            }
        }

        let mut guard = self.lock();
        guard.append_in_flight = false;
        if let Some(e) = write_error {
            slog::warn!(self.inner.logger, "Failed to persist {:?}: {}", request, e);
            return self.reject(&request, AppendEntriesErrorReason::PersistenceFailure);
        }
        if guard.resigned {
            return self.reject(&request, AppendEntriesErrorReason::LostLogCore);
        }

        let covered = request.last_index_covered();
        let new_commit = cmp::max(guard.commit_index, cmp::min(request.leader_commit, covered));
        let notify_commit = if new_commit > guard.commit_index && guard.snapshot == SnapshotProgress::CaughtUp {
            Some(new_commit)
        } else {
            None
        };
        guard.commit_index = new_commit;
        guard.lowest_index_to_keep = cmp::max(guard.lowest_index_to_keep, request.lowest_index_to_keep);
        let compaction_stop = Self::compaction_stop(&guard);
        drop(guard);

        if let Some(index) = notify_commit {
            slog::debug!(self.inner.logger, "Commit index now {:?}", index);
            self.inner.state_handle.update_commit_index(index);
        }
        self.compact(compaction_stop);

        AppendEntriesResult::success(self.inner.term, request.message_id, covered)
    }

    // Checks the request and, if it's acceptable, queues the writes that make the local log
    // match the leader's.
    fn prepare_append(&self, request: &AppendEntriesRequest) -> Result<PreparedAppend, AppendEntriesResult> {
        let mut guard = self.lock();

        if guard.resigned {
            return Err(self.reject(request, AppendEntriesErrorReason::LostLogCore));
        }
        if self.inner.leader.as_ref() != Some(&request.leader_id) {
            return Err(self.reject(request, AppendEntriesErrorReason::InvalidLeaderId));
        }
        if request.leader_term != self.inner.term {
            return Err(self.reject(request, AppendEntriesErrorReason::WrongTerm));
        }
        if request.message_id <= guard.last_message_id {
            return Err(self.reject(request, AppendEntriesErrorReason::MessageOutdated));
        }
        if guard.append_in_flight {
            return Err(self.reject(request, AppendEntriesErrorReason::PrevAppendEntriesInFlight));
        }
        guard.last_message_id = request.message_id;

        let trx = match self.inner.storage.transaction() {
            Ok(trx) => trx,
            Err(_) => return Err(self.reject(request, AppendEntriesErrorReason::LostLogCore)),
        };
        let log = trx.get_in_memory_log();

        let mut writes = vec![];
        let mut drop_entries = false;
        let misplaced_rewrite = request.is_rewrite()
            && request
                .entries
                .first()
                .map_or(false, |e| e.log_index() != request.rewrite_start());
        if misplaced_rewrite {
            slog::warn!(self.inner.logger, "Rewrite {:?} doesn't start at {:?}", request, request.rewrite_start());
            return Err(AppendEntriesResult::with_conflict(
                self.inner.term,
                request.message_id,
                log.last_index(),
                TermIndexPair::default(),
            ));
        }

        let append_from = if request.is_rewrite() && request.rewrite_start() > guard.commit_index.plus(1) {
            // Local entries past the commit index may not be the leader's, and the leader no longer
            // has the ones before its log start.
            let start = request.rewrite_start();
            if guard.snapshot == SnapshotProgress::CaughtUp {
                slog::info!(
                    self.inner.logger,
                    "Leader rewrites the log from {:?}, local {:?} committed up to {:?}",
                    start,
                    log.range(),
                    guard.commit_index
                );
                guard.snapshot = SnapshotProgress::SnapshotRequired;
            }
            writes.push(trx.remove_back(log.first_index()));
            writes.push(trx.remove_front(start));
            drop_entries = !log.is_empty();
            start
        } else {
            // A rewrite starting within the committed log continues it like any other append.
            if !request.is_rewrite() {
                if let Err(conflict) = check_prev_entry(&log, request.prev_log_entry, guard.commit_index) {
                    return Err(AppendEntriesResult::with_conflict(
                        self.inner.term,
                        request.message_id,
                        log.last_index(),
                        conflict,
                    ));
                }
            }

            match first_mismatch(&log, request) {
                Some(index) if index <= guard.commit_index => {
                    slog::error!(
                        self.inner.logger,
                        "Leader sent an entry at {:?} that conflicts with the committed log (commit {:?})",
                        index,
                        guard.commit_index
                    );
                    let conflict = TermIndexPair::new(LogTerm::default(), guard.commit_index.plus(1));
                    return Err(AppendEntriesResult::with_conflict(
                        self.inner.term,
                        request.message_id,
                        log.last_index(),
                        conflict,
                    ));
                }
                Some(index) => {
                    slog::info!(self.inner.logger, "Log diverges from the leader's at {:?}", index);
                    writes.push(trx.remove_back(index));
                    drop_entries = true;
                    index
                }
                None => log.next_index(),
            }
        };

        let to_append = InMemoryLog::from_entries(
            request
                .entries
                .iter()
                .filter(|e| e.log_index() >= append_from)
                .map(|e| InMemoryLogEntry::new(e.clone(), request.wait_for_sync)),
        );
        let to_append = match to_append {
            Some(log) => log,
            None => {
                slog::warn!(self.inner.logger, "Entries in {:?} are not contiguous", request);
                let conflict = TermIndexPair::new(LogTerm::default(), log.next_index());
                return Err(AppendEntriesResult::with_conflict(
                    self.inner.term,
                    request.message_id,
                    log.last_index(),
                    conflict,
                ));
            }
        };
        if !to_append.is_empty() {
            writes.push(trx.append_entries(to_append));
        }

        let acquire_snapshot_at = self.start_snapshot_if_required(&mut guard, request, &mut writes);

        guard.append_in_flight = true;
        Ok(PreparedAppend {
            writes,
            drop_entries,
            acquire_snapshot_at,
        })
    }

    fn start_snapshot_if_required(
        &self,
        guard: &mut GuardedFollowerData,
        request: &AppendEntriesRequest,
        writes: &mut Vec<LogFuture<SequenceNumber>>,
    ) -> Option<LogIndex> {
        if guard.snapshot != SnapshotProgress::SnapshotRequired {
            return None;
        }
        guard.snapshot = SnapshotProgress::SnapshotInProgress;
        let info = self
            .inner
            .storage
            .persisted_state_info()
            .with_snapshot_status(SnapshotStatus::InProgress);
        writes.push(self.inner.storage.update_persisted_state_info(info));
        // The local state may have seen more than the leader vouches for in this request.
        Some(cmp::max(request.leader_commit, guard.commit_index))
    }

    fn reject(&self, request: &AppendEntriesRequest, reason: AppendEntriesErrorReason) -> AppendEntriesResult {
        AppendEntriesResult::rejected(self.inner.term, request.message_id, reason)
    }

    fn compaction_stop(guard: &GuardedFollowerData) -> LogIndex {
        let releasable = cmp::min(guard.release_index, guard.commit_index);
        cmp::min(releasable.plus(1), guard.lowest_index_to_keep)
    }

    fn compact(&self, stop: LogIndex) {
        let trx = match self.inner.storage.transaction() {
            Ok(trx) => trx,
            Err(_) => return,
        };
        if stop <= trx.get_log_bounds().from {
            return;
        }
        slog::debug!(self.inner.logger, "Compacting log up to {:?}", stop);
        let removal = trx.remove_front(stop);
        let logger = self.inner.logger.clone();
        tokio::spawn(async move {
            if let Err(e) = removal.await {
                slog::warn!(logger, "Log compaction failed: {}", e);
            }
        });
    }

    pub(crate) fn status(&self) -> FollowerStatus {
        let guard = self.lock();
        let log = self.inner.storage.spearhead_log();
        FollowerStatus {
            term: self.inner.term,
            leader: self.inner.leader.clone(),
            local: LogStatistics {
                spearhead: log.last_term_index_pair(),
                commit_index: guard.commit_index,
                first_index: log.first_index(),
                release_index: guard.release_index,
            },
            snapshot_available: guard.snapshot == SnapshotProgress::CaughtUp,
            last_message_id: guard.last_message_id,
        }
    }

    /// Stops following and hands back the core once pending writes are through.
    pub(crate) fn resign(&self) -> LogFuture<LogCore> {
        {
            let mut guard = self.lock();
            if guard.resigned {
                return LogFuture::ready(Err(ReplicatedLogError::Resigned));
            }
            guard.resigned = true;
        }
        slog::info!(self.inner.logger, "Follower resigning");
        self.inner.storage.resign()
    }

    fn lock(&self) -> MutexGuard<'_, GuardedFollowerData> {
        self.inner.guarded.lock().expect("LogFollower mutex guard poison")
    }
}

// Ok if the entry before the request's entries is in the local log with the same term.
// Otherwise returns where the leader should continue from.
fn check_prev_entry(log: &InMemoryLog, prev: TermIndexPair, commit_index: LogIndex) -> Result<(), TermIndexPair> {
    if prev.index < log.first_index() {
        // Compacted entries were committed, so they match. Anything else needs a rewrite.
        if prev.index <= commit_index {
            return Ok(());
        }
        return Err(TermIndexPair::default());
    }

    match log.term_of(prev.index) {
        Some(term) if term == prev.term => Ok(()),
        Some(term) => {
            let first_of_term = log.first_index_of_term_at(prev.index).unwrap_or(prev.index);
            Err(TermIndexPair::new(term, first_of_term))
        }
        None => Err(TermIndexPair::new(LogTerm::default(), log.next_index())),
    }
}

// First shipped entry that is in the local log with a different term. Entries already present
// with the same term are re-deliveries.
fn first_mismatch(log: &InMemoryLog, request: &AppendEntriesRequest) -> Option<LogIndex> {
    for entry in request.entries.iter() {
        if entry.log_index() < log.first_index() {
            continue;
        }
        match log.term_of(entry.log_index()) {
            Some(term) if term == entry.log_term() => continue,
            Some(_) => return Some(entry.log_index()),
            None => return None,
        }
    }
    None
}

#[async_trait]
impl AbstractFollower for LogFollower {
    fn participant_id(&self) -> &ParticipantId {
        &self.inner.id
    }

    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResult, FollowerRpcError> {
        Ok(self.handle_append_entries(request).await)
    }
}

impl FollowerMethods for LogFollower {
    fn release_index(&self, index: LogIndex) -> Result<(), ReplicatedLogError> {
        let stop = {
            let mut guard = self.lock();
            if guard.resigned {
                return Err(ReplicatedLogError::NotFollower);
            }
            guard.release_index = cmp::max(guard.release_index, index);
            Self::compaction_stop(&guard)
        };
        self.compact(stop);
        Ok(())
    }

    fn get_log_snapshot(&self) -> Result<InMemoryLog, ReplicatedLogError> {
        if self.lock().resigned {
            return Err(ReplicatedLogError::NotFollower);
        }
        Ok(self.inner.storage.committed_log())
    }

    fn snapshot_completed(&self) -> LogFuture<()> {
        {
            let guard = self.lock();
            if guard.resigned {
                return LogFuture::ready(Err(ReplicatedLogError::NotFollower));
            }
            if guard.snapshot == SnapshotProgress::CaughtUp {
                return LogFuture::ready(Ok(()));
            }
        }

        let info = self
            .inner
            .storage
            .persisted_state_info()
            .with_snapshot_status(SnapshotStatus::Completed);
        let write = self.inner.storage.update_persisted_state_info(info);

        let (callback, future) = LogFuture::new();
        let follower = self.clone();
        tokio::spawn(async move {
            if let Err(e) = write.await {
                slog::error!(follower.inner.logger, "Failed to persist snapshot status: {}", e);
                callback.send(Err(e));
                return;
            }

            let commit_index = {
                let mut guard = follower.lock();
                if guard.resigned {
                    callback.send(Err(ReplicatedLogError::NotFollower));
                    return;
                }
                guard.snapshot = SnapshotProgress::CaughtUp;
                guard.commit_index
            };
            slog::info!(follower.inner.logger, "Snapshot completed, caught up at {:?}", commit_index);
            follower.inner.state_handle.update_commit_index(commit_index);
            callback.send(Ok(()));
        });
        future
    }

    fn leader(&self) -> Option<ParticipantId> {
        self.inner.leader.clone()
    }
}
