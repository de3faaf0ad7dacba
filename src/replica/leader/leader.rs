use crate::api::{
    LeaderMethods, LeaderOptions, ParticipantsConfig, ReplicatedLogError, ReplicatedStateHandle, WaitForResult,
};
use crate::commitlog::{LogCore, SequenceNumber, SnapshotStatus};
use crate::replica::algorithms::{calculate_commit_index, ParticipantState};
use crate::replica::leader::follower_info::{FollowerInfo, RequestHeader, SentRequest};
use crate::replica::storage_manager::StorageManager;
use crate::replica::wait_for::{LogFuture, WaitForQueue};
use crate::replica::{
    AbstractFollower, AppendEntriesRequest, AppendEntriesResult, CommitFailReason, FollowerFactory, FollowerRpcError,
    InMemoryLog, InMemoryLogEntry, LeaderStatus, LogIndex, LogPayload, LogStatistics, LogTerm, ParticipantId,
    PersistingLogEntry,
};
use std::cmp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// LogLeader appends entries to the local log, ships them to every follower, and moves the commit
/// index forward once enough participants acknowledged them.
///
/// The first entry of every term is a meta entry written by the leader itself. Leadership is
/// established once it is committed; before that, nothing of the previous terms counts as
/// committed on this leader's watch.
#[derive(Clone)]
pub(crate) struct LogLeader {
    inner: Arc<LeaderInner>,
}

struct LeaderInner {
    id: ParticipantId,
    term: LogTerm,
    term_start_index: LogIndex,
    options: LeaderOptions,
    storage: StorageManager,
    state_handle: Arc<dyn ReplicatedStateHandle>,
    follower_factory: Arc<dyn FollowerFactory>,
    guarded: Mutex<GuardedLeaderData>,
    logger: slog::Logger,
}

struct GuardedLeaderData {
    config: ParticipantsConfig,
    // Everyone but us.
    followers: HashMap<ParticipantId, FollowerInfo>,
    // The leader's own acknowledgement: the last index it persisted.
    local_persisted: LogIndex,
    commit_index: LogIndex,
    commit_fail_reason: CommitFailReason,
    quorum: Vec<ParticipantId>,
    release_index: LogIndex,
    leadership_established: bool,
    waiters: WaitForQueue<WaitForResult>,
    // Set by the first failed local write. The local log can't be trusted to match what was
    // shipped after that, so the leader stops.
    storage_failure: Option<ReplicatedLogError>,
    resigned: bool,
}

// What to tell the state handle after the lock was released.
#[derive(Default)]
struct CommitUpdate {
    establish_leadership: bool,
    commit_index: Option<LogIndex>,
}

struct OutgoingRequest {
    follower: ParticipantId,
    connection: Arc<dyn AbstractFollower>,
    request: AppendEntriesRequest,
    sent: SentRequest,
    delay: Option<Duration>,
}

impl LogLeader {
    /// Starts leading `term`: writes the term's meta entry and starts replicating to every
    /// participant in `config`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn construct(
        id: ParticipantId,
        term: LogTerm,
        config: ParticipantsConfig,
        storage: StorageManager,
        state_handle: Arc<dyn ReplicatedStateHandle>,
        follower_factory: Arc<dyn FollowerFactory>,
        options: LeaderOptions,
        logger: slog::Logger,
    ) -> Result<LogLeader, ReplicatedLogError> {
        let logger = logger.new(slog::o!("Term" => term.as_u64(), "Role" => "Leader"));

        let trx = storage.transaction()?;
        let log = trx.get_in_memory_log();
        let term_start_index = log.next_index();
        let local_persisted = storage.committed_log().last_index();

        let followers: HashMap<_, _> = config
            .participants
            .keys()
            .filter(|participant| **participant != id)
            .map(|participant| {
                let connection = follower_factory.construct_follower(participant);
                (participant.clone(), FollowerInfo::new(connection, log.last_index()))
            })
            .collect();
        slog::info!(
            logger,
            "Leading {} followers, term starts at {:?}",
            followers.len(),
            term_start_index
        );

        let meta = InMemoryLogEntry::new(
            PersistingLogEntry::meta(term, term_start_index),
            config.config.wait_for_sync,
        );
        let write = trx.append_entries(InMemoryLog::empty_at(term_start_index).append(meta));

        let leader = LogLeader {
            inner: Arc::new(LeaderInner {
                id,
                term,
                term_start_index,
                options,
                storage,
                state_handle,
                follower_factory,
                guarded: Mutex::new(GuardedLeaderData {
                    config,
                    followers,
                    local_persisted,
                    commit_index: LogIndex::default(),
                    commit_fail_reason: CommitFailReason::NothingToCommit,
                    quorum: vec![],
                    release_index: LogIndex::default(),
                    leadership_established: false,
                    waiters: WaitForQueue::new(),
                    storage_failure: None,
                    resigned: false,
                }),
                logger,
            }),
        };

        leader.track_local_write(term_start_index, write);
        leader.trigger_replication();
        Ok(leader)
    }

    #[cfg(test)]
    pub(crate) fn commit_index(&self) -> LogIndex {
        self.lock().commit_index
    }

    /// Switches to a newer participant configuration. Followers that left stop getting requests,
    /// new ones start at the end of the log.
    pub(crate) fn update_participants_config(&self, config: ParticipantsConfig) -> Result<(), ReplicatedLogError> {
        let update = {
            let mut guard = self.lock();
            if guard.resigned {
                return Err(ReplicatedLogError::NotLeader);
            }
            if config.generation <= guard.config.generation {
                return Err(ReplicatedLogError::PreconditionFailed(format!(
                    "Generation {} is not newer than {}",
                    config.generation, guard.config.generation
                )));
            }
            slog::info!(
                self.inner.logger,
                "Participants config generation {} -> {}",
                guard.config.generation,
                config.generation
            );

            let last_index = self.inner.storage.spearhead_log().last_index();
            let mut followers = std::mem::take(&mut guard.followers);
            followers.retain(|participant, _| config.participants.contains_key(participant));
            for participant in config.participants.keys() {
                if *participant == self.inner.id || followers.contains_key(participant) {
                    continue;
                }
                slog::info!(self.inner.logger, "New follower {}", participant);
                let connection = self.inner.follower_factory.construct_follower(participant);
                followers.insert(participant.clone(), FollowerInfo::new(connection, last_index));
            }
            guard.followers = followers;
            guard.config = config;
            self.update_commit_index(&mut guard)
        };
        self.apply(update);
        self.trigger_replication();
        Ok(())
    }

    pub(crate) fn status(&self) -> LeaderStatus {
        let guard = self.lock();
        let log = self.inner.storage.spearhead_log();
        LeaderStatus {
            term: self.inner.term,
            local: LogStatistics {
                spearhead: log.last_term_index_pair(),
                commit_index: guard.commit_index,
                first_index: log.first_index(),
                release_index: guard.release_index,
            },
            leadership_established: guard.leadership_established,
            commit_fail_reason: guard.commit_fail_reason.clone(),
            write_concern: guard.config.write_concern(),
            generation: guard.config.generation,
            followers: guard
                .followers
                .iter()
                .map(|(participant, follower)| (participant.clone(), follower.statistics()))
                .collect(),
        }
    }

    /// Stops leading. Waiters fail with NotLeader, and the core is handed back once pending
    /// writes are through.
    pub(crate) fn resign(&self) -> LogFuture<LogCore> {
        {
            let mut guard = self.lock();
            if guard.resigned {
                return LogFuture::ready(Err(ReplicatedLogError::Resigned));
            }
            guard.resigned = true;
            guard.waiters.fail_all(ReplicatedLogError::NotLeader);
        }
        slog::info!(self.inner.logger, "Leader resigning");
        self.inner.storage.resign()
    }

    fn track_local_write(&self, index: LogIndex, write: LogFuture<SequenceNumber>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let result = write.await;
            if let Some(leader) = LogLeader::upgrade(&weak) {
                leader.on_local_write(index, result);
            }
        });
    }

    fn on_local_write(&self, index: LogIndex, result: Result<SequenceNumber, ReplicatedLogError>) {
        let update = {
            let mut guard = self.lock();
            if guard.resigned {
                return;
            }
            match result {
                Ok(_) => {
                    guard.local_persisted = cmp::max(guard.local_persisted, index);
                    self.update_commit_index(&mut guard)
                }
                Err(e) => {
                    if guard.storage_failure.is_none() {
                        slog::error!(self.inner.logger, "Failed to persist {:?}, leader stops: {}", index, e);
                        guard.waiters.fail_all(e.clone());
                        guard.storage_failure = Some(e);
                    }
                    return;
                }
            }
        };
        self.apply(update);
        self.trigger_replication();
    }

    // Recomputes the commit index from everyone's acknowledgements.
    fn update_commit_index(&self, guard: &mut GuardedLeaderData) -> CommitUpdate {
        let mut participants: Vec<ParticipantState> = guard
            .followers
            .iter()
            .map(|(participant, follower)| {
                ParticipantState::new(
                    participant.clone(),
                    follower.last_acked_index(),
                    guard.config.flags_of(participant),
                )
            })
            .collect();
        participants.push(ParticipantState::new(
            self.inner.id.clone(),
            guard.local_persisted,
            guard.config.flags_of(&self.inner.id),
        ));

        let result = calculate_commit_index(
            &participants,
            guard.config.write_concern(),
            guard.commit_index,
            guard.local_persisted,
        );
        guard.commit_fail_reason = result.reason;

        // > a leader never commits entries from previous terms by counting replicas
        if result.commit_index <= guard.commit_index || result.commit_index < self.inner.term_start_index {
            return CommitUpdate::default();
        }

        slog::debug!(
            self.inner.logger,
            "Commit index {:?} -> {:?}, quorum {:?}",
            guard.commit_index,
            result.commit_index,
            result.quorum
        );
        guard.commit_index = result.commit_index;
        guard.quorum = result.quorum;
        let resolution = WaitForResult {
            commit_index: result.commit_index,
            quorum: guard.quorum.clone(),
        };
        guard.waiters.resolve_up_to(result.commit_index, resolution);

        let establish_leadership = !guard.leadership_established;
        guard.leadership_established = true;
        CommitUpdate {
            establish_leadership,
            commit_index: Some(result.commit_index),
        }
    }

    fn apply(&self, update: CommitUpdate) {
        if update.establish_leadership {
            slog::info!(self.inner.logger, "Leadership established");
            self.mark_state_complete();
            self.inner.state_handle.leadership_established(Arc::new(self.clone()));
        }
        if let Some(index) = update.commit_index {
            self.inner.state_handle.update_commit_index(index);
            self.compact();
        }
    }

    /// Sends a request to every follower that is missing something and has nothing in flight.
    fn trigger_replication(&self) {
        let log = self.inner.storage.spearhead_log();
        let outgoing: Vec<OutgoingRequest> = {
            let mut guard = self.lock();
            if guard.resigned || guard.storage_failure.is_some() {
                return;
            }

            let header = RequestHeader {
                term: self.inner.term,
                id: self.inner.id.clone(),
                commit_index: guard.commit_index,
                lowest_index_to_keep: Self::compaction_stop(&guard),
                wait_for_sync: guard.config.config.wait_for_sync,
            };
            let options = self.inner.options;
            guard
                .followers
                .iter_mut()
                .filter(|(_, follower)| {
                    follower.needs_request(log.last_index(), header.commit_index, header.lowest_index_to_keep)
                })
                .map(|(participant, follower)| {
                    let delay = follower.retry_delay(&options);
                    let (request, sent) =
                        follower.prepare_request(&log, header.clone(), options.max_entries_per_request);
                    OutgoingRequest {
                        follower: participant.clone(),
                        connection: follower.connection(),
                        request,
                        sent,
                        delay,
                    }
                })
                .collect()
        };

        for request in outgoing {
            self.send(request);
        }
    }

    fn send(&self, outgoing: OutgoingRequest) {
        let OutgoingRequest {
            follower,
            connection,
            request,
            sent,
            delay,
        } = outgoing;
        let weak = Arc::downgrade(&self.inner);
        let logger = self.inner.logger.new(slog::o!("Follower" => follower.to_string()));

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match LogLeader::upgrade(&weak) {
                Some(leader) if !leader.lock().resigned => {}
                _ => return,
            }

            slog::trace!(logger, "Sending {:?}", request);
            let started = Instant::now();
            let response = connection.append_entries(request).await;
            let latency = started.elapsed();

            if let Some(leader) = LogLeader::upgrade(&weak) {
                leader.handle_response(&follower, &sent, response, latency, &logger);
            }
        });
    }

    fn handle_response(
        &self,
        follower: &ParticipantId,
        sent: &SentRequest,
        response: Result<AppendEntriesResult, FollowerRpcError>,
        latency: Duration,
        logger: &slog::Logger,
    ) {
        let update = {
            let mut guard = self.lock();
            if guard.resigned {
                return;
            }
            let handled = match guard.followers.get_mut(follower) {
                Some(info) => info.handle_response(logger, sent, response, latency),
                None => false,
            };
            if !handled {
                return;
            }
            self.update_commit_index(&mut guard)
        };
        self.apply(update);
        self.trigger_replication();
    }

    // First index that must stay in the log: everything below was released by the state,
    // committed, and acknowledged by every follower.
    fn compaction_stop(guard: &GuardedLeaderData) -> LogIndex {
        let releasable = cmp::min(guard.release_index, guard.commit_index);
        let slowest = guard
            .followers
            .values()
            .map(FollowerInfo::last_acked_index)
            .min()
            .unwrap_or(releasable);
        cmp::min(releasable, slowest).plus(1)
    }

    fn compact(&self) {
        let stop = {
            let guard = self.lock();
            if guard.resigned || guard.storage_failure.is_some() {
                return;
            }
            Self::compaction_stop(&guard)
        };
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

    // The leader's state is the reference. Should this participant follow later, it doesn't
    // need a snapshot to continue from what it applied.
    fn mark_state_complete(&self) {
        let info = self.inner.storage.persisted_state_info();
        if info.snapshot_status == SnapshotStatus::Completed {
            return;
        }
        let write = self
            .inner
            .storage
            .update_persisted_state_info(info.with_snapshot_status(SnapshotStatus::Completed));
        let logger = self.inner.logger.clone();
        tokio::spawn(async move {
            if let Err(e) = write.await {
                slog::warn!(logger, "Failed to persist snapshot status: {}", e);
            }
        });
    }

    fn upgrade(weak: &Weak<LeaderInner>) -> Option<LogLeader> {
        weak.upgrade().map(|inner| LogLeader { inner })
    }

    fn lock(&self) -> MutexGuard<'_, GuardedLeaderData> {
        self.inner.guarded.lock().expect("LogLeader mutex guard poison")
    }
}

impl LeaderMethods for LogLeader {
    fn insert(&self, payload: LogPayload, wait_for_sync: bool) -> Result<LogIndex, ReplicatedLogError> {
        let (index, write) = {
            let guard = self.lock();
            if guard.resigned {
                return Err(ReplicatedLogError::NotLeader);
            }
            if let Some(e) = &guard.storage_failure {
                return Err(e.clone());
            }
            let trx = self
                .inner
                .storage
                .transaction()
                .map_err(|_| ReplicatedLogError::NotLeader)?;

            let index = trx.get_log_bounds().to;
            let entry = InMemoryLogEntry::new(
                PersistingLogEntry::with_payload(self.inner.term, index, payload),
                wait_for_sync || guard.config.config.wait_for_sync,
            );
            (index, trx.append_entries(InMemoryLog::empty_at(index).append(entry)))
        };
        slog::trace!(self.inner.logger, "Inserted {:?}", index);

        self.track_local_write(index, write);
        self.trigger_replication();
        Ok(index)
    }

    fn wait_for(&self, index: LogIndex) -> LogFuture<WaitForResult> {
        let mut guard = self.lock();
        if guard.resigned {
            return LogFuture::ready(Err(ReplicatedLogError::NotLeader));
        }
        if let Some(e) = &guard.storage_failure {
            return LogFuture::ready(Err(e.clone()));
        }
        if index <= guard.commit_index {
            return LogFuture::ready(Ok(WaitForResult {
                commit_index: guard.commit_index,
                quorum: guard.quorum.clone(),
            }));
        }
        guard.waiters.wait_for(index)
    }

    fn release_index(&self, index: LogIndex) -> Result<(), ReplicatedLogError> {
        {
            let mut guard = self.lock();
            if guard.resigned {
                return Err(ReplicatedLogError::NotLeader);
            }
            guard.release_index = cmp::max(guard.release_index, index);
        }
        self.compact();
        Ok(())
    }

    fn get_log_snapshot(&self) -> Result<InMemoryLog, ReplicatedLogError> {
        if self.lock().resigned {
            return Err(ReplicatedLogError::NotLeader);
        }
        Ok(self.inner.storage.committed_log())
    }
}
