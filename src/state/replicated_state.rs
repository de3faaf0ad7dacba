use crate::api::{
    FollowerMethods, LeaderMethods, ParticipantMethods, ReplicatedLogError, ReplicatedStateHandle,
};
use crate::replica::{LogFuture, LogIndex, LogPayload, LogRange, ParticipantId, WaitForQueue};
use crate::state::{SnapshotError, StateMachine};
use rand::Rng;
use std::cmp;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SNAPSHOT_INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const SNAPSHOT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// ReplicatedState feeds the committed entries of a replicated log into a [`StateMachine`], one
/// at a time and in index order, and keeps the state machine's snapshots in sync with the log.
///
/// Connect a clone of it to a [`ReplicatedLog`](crate::ReplicatedLog). While the local
/// participant leads, entries can be inserted through it.
pub struct ReplicatedState<M: StateMachine> {
    inner: Arc<StateInner<M>>,
}

impl<M: StateMachine> Clone for ReplicatedState<M> {
    fn clone(&self) -> Self {
        ReplicatedState {
            inner: self.inner.clone(),
        }
    }
}

struct StateInner<M> {
    machine: M,
    guarded: Mutex<GuardedStateData>,
    logger: slog::Logger,
}

struct GuardedStateData {
    role: Option<ParticipantMethods>,
    // Bumped on every role change. Background work started under an older epoch stops.
    epoch: u64,
    commit_index: LogIndex,
    applied_index: LogIndex,
    snapshot_in_progress: bool,
    applying: bool,
    waiters: WaitForQueue<LogIndex>,
}

impl<M: StateMachine> ReplicatedState<M> {
    pub fn new(machine: M, logger: slog::Logger) -> Self {
        ReplicatedState {
            inner: Arc::new(StateInner {
                machine,
                guarded: Mutex::new(GuardedStateData {
                    role: None,
                    epoch: 0,
                    commit_index: LogIndex::default(),
                    applied_index: LogIndex::default(),
                    snapshot_in_progress: false,
                    applying: false,
                    waiters: WaitForQueue::new(),
                }),
                logger,
            }),
        }
    }

    pub fn machine(&self) -> &M {
        &self.inner.machine
    }

    pub fn applied_index(&self) -> LogIndex {
        self.lock().applied_index
    }

    /// Resolves to the applied index once it reached `index`. Fails if the current role ends
    /// before that.
    pub fn wait_for_applied(&self, index: LogIndex) -> LogFuture<LogIndex> {
        let mut guard = self.lock();
        if guard.applied_index >= index {
            return LogFuture::ready(Ok(guard.applied_index));
        }
        guard.waiters.wait_for(index)
    }

    /// Appends `payload` to the log. Only possible while leading.
    pub fn insert(&self, payload: LogPayload) -> Result<LogIndex, ReplicatedLogError> {
        self.leader()?.insert(payload, false)
    }

    /// Appends `payload` and waits until it is committed and applied locally.
    pub async fn insert_and_wait(&self, payload: LogPayload) -> Result<LogIndex, ReplicatedLogError> {
        let leader = self.leader()?;
        let index = leader.insert(payload, false)?;
        leader.wait_for(index).await?;
        self.wait_for_applied(index).await?;
        Ok(index)
    }

    fn leader(&self) -> Result<Arc<dyn LeaderMethods>, ReplicatedLogError> {
        match &self.lock().role {
            Some(ParticipantMethods::Leader(methods)) => Ok(methods.clone()),
            _ => Err(ReplicatedLogError::NotLeader),
        }
    }

    fn assume_role(&self, role: ParticipantMethods) {
        {
            let mut guard = self.lock();
            guard.role = Some(role);
            guard.epoch += 1;
            guard.snapshot_in_progress = false;
        }
        self.kick_apply();
    }

    // Starts applying committed entries, unless that's already going on or not possible now.
    fn kick_apply(&self) {
        let epoch = {
            let mut guard = self.lock();
            if guard.applying
                || guard.snapshot_in_progress
                || guard.role.is_none()
                || guard.applied_index >= guard.commit_index
            {
                return;
            }
            guard.applying = true;
            guard.epoch
        };
        let state = self.clone();
        tokio::spawn(async move { state.apply_committed(epoch) });
    }

    fn apply_committed(&self, epoch: u64) {
        loop {
            let (methods, from, to) = {
                let mut guard = self.lock();
                let runnable =
                    guard.epoch == epoch && !guard.snapshot_in_progress && guard.applied_index < guard.commit_index;
                match guard.role.clone() {
                    Some(methods) if runnable => (methods, guard.applied_index, guard.commit_index),
                    _ => {
                        // Decided under the same lock a commit update would take, so none is missed.
                        guard.applying = false;
                        let role_changed = guard.epoch != epoch;
                        drop(guard);
                        if role_changed {
                            self.kick_apply();
                        }
                        return;
                    }
                }
            };

            let log = match methods.get_log_snapshot() {
                Ok(log) => log,
                Err(e) => {
                    slog::debug!(self.inner.logger, "Stopped applying: {}", e);
                    return self.stop_applying(epoch);
                }
            };

            let mut applied = from;
            for entry in log.slice(LogRange::new(from.plus(1), to.plus(1))).iter() {
                if entry.log_index() != applied.plus(1) {
                    break;
                }
                if let Some(payload) = entry.entry().payload() {
                    self.inner.machine.apply_committed_entry(entry.log_index(), payload.clone());
                }
                applied = entry.log_index();
            }
            if applied == from {
                slog::error!(
                    self.inner.logger,
                    "Committed entries after {:?} are missing from the local log {:?}",
                    from,
                    log.range()
                );
                return self.stop_applying(epoch);
            }
            slog::trace!(self.inner.logger, "Applied up to {:?}", applied);

            {
                // Entries applied under an older role were committed all the same.
                let mut guard = self.lock();
                guard.applied_index = cmp::max(guard.applied_index, applied);
                let applied_index = guard.applied_index;
                guard.waiters.resolve_up_to(applied_index, applied_index);
            }
            if let Err(e) = methods.release_index(applied) {
                slog::debug!(self.inner.logger, "Couldn't release {:?}: {}", applied, e);
            }
        }
    }

    fn stop_applying(&self, epoch: u64) {
        let role_changed = {
            let mut guard = self.lock();
            guard.applying = false;
            guard.epoch != epoch
        };
        if role_changed {
            self.kick_apply();
        }
    }

    async fn transfer_snapshot(self, leader: ParticipantId, index: LogIndex, epoch: u64) {
        let mut attempt = 0;
        let covered = loop {
            let applied = {
                let guard = self.lock();
                if guard.epoch != epoch {
                    return;
                }
                guard.applied_index
            };
            if applied >= index {
                slog::info!(
                    self.inner.logger,
                    "Applied {:?} already, no snapshot needed from {} at {:?}",
                    applied,
                    leader,
                    index
                );
                break applied;
            }

            let error = match self.inner.machine.acquire_snapshot(&leader, index).await {
                Ok(covered) if covered >= applied => break covered,
                Ok(covered) => SnapshotError::Transfer(format!(
                    "Snapshot covers {:?}, but {:?} was applied locally",
                    covered, applied
                )),
                Err(e) => e,
            };
            attempt += 1;
            let delay = snapshot_retry_delay(attempt);
            slog::warn!(
                self.inner.logger,
                "Snapshot from {} failed, retrying in {:?}: {}",
                leader,
                delay,
                error
            );
            tokio::time::sleep(delay).await;
        };

        let follower: Arc<dyn FollowerMethods> = {
            let mut guard = self.lock();
            if guard.epoch != epoch {
                return;
            }
            guard.applied_index = cmp::max(guard.applied_index, covered);
            guard.commit_index = cmp::max(guard.commit_index, covered);
            let applied_index = guard.applied_index;
            guard.waiters.resolve_up_to(applied_index, applied_index);
            match &guard.role {
                Some(ParticipantMethods::Follower(methods)) => methods.clone(),
                _ => return,
            }
        };
        slog::info!(self.inner.logger, "Snapshot from {} covers {:?}", leader, covered);

        if let Err(e) = follower.snapshot_completed().await {
            slog::warn!(self.inner.logger, "Log didn't take the snapshot: {}", e);
            return;
        }
        {
            let mut guard = self.lock();
            if guard.epoch == epoch {
                guard.snapshot_in_progress = false;
            }
        }
        self.kick_apply();
    }

    fn lock(&self) -> MutexGuard<'_, GuardedStateData> {
        self.inner.guarded.lock().expect("ReplicatedState mutex guard poison")
    }
}

fn snapshot_retry_delay(attempt: u32) -> Duration {
    let exponent = cmp::min(attempt.saturating_sub(1), 16);
    let backoff = cmp::min(SNAPSHOT_INITIAL_RETRY_BACKOFF * 2u32.pow(exponent), SNAPSHOT_MAX_RETRY_BACKOFF);
    backoff.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
}

impl<M: StateMachine> ReplicatedStateHandle for ReplicatedState<M> {
    fn resign_current_state(&self) -> Option<ParticipantMethods> {
        let mut guard = self.lock();
        let role = guard.role.take();
        guard.epoch += 1;
        guard.snapshot_in_progress = false;
        let error = match role {
            Some(ParticipantMethods::Leader(_)) => ReplicatedLogError::NotLeader,
            _ => ReplicatedLogError::NotFollower,
        };
        guard.waiters.fail_all(error);
        slog::info!(self.inner.logger, "State resigned at applied index {:?}", guard.applied_index);
        role
    }

    fn leadership_established(&self, methods: Arc<dyn LeaderMethods>) {
        slog::info!(self.inner.logger, "State is leading");
        self.assume_role(ParticipantMethods::Leader(methods));
    }

    fn become_follower(&self, methods: Arc<dyn FollowerMethods>) {
        slog::info!(self.inner.logger, "State is following {:?}", methods.leader());
        self.assume_role(ParticipantMethods::Follower(methods));
    }

    fn acquire_snapshot(&self, leader: &ParticipantId, index: LogIndex) {
        let epoch = {
            let mut guard = self.lock();
            guard.snapshot_in_progress = true;
            guard.epoch
        };
        slog::info!(self.inner.logger, "Acquiring snapshot from {} at {:?}", leader, index);
        tokio::spawn(self.clone().transfer_snapshot(leader.clone(), index, epoch));
    }

    fn update_commit_index(&self, index: LogIndex) {
        {
            let mut guard = self.lock();
            guard.commit_index = cmp::max(guard.commit_index, index);
        }
        self.kick_apply();
    }

    fn drop_entries(&self) {
        // Only committed entries are ever applied, so there's nothing to undo.
        slog::debug!(self.inner.logger, "Log dropped uncommitted entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LeaderOptions, LogPlanConfig, ParticipantFlags, ParticipantsConfig};
    use crate::commitlog::{InMemoryStorageEngine, SnapshotStatus};
    use crate::replica::{
        entries, eventually, storage_with, test_logger, AppendEntriesRequest, LocalFollowerFactory, LogFollower,
        LogLeader, LogTerm, MessageId, PersistingLogEntry, StorageManager, TermIndexPair,
    };
    use async_trait::async_trait;

    #[derive(Clone, Debug, PartialEq)]
    enum MachineEvent {
        Snapshot(ParticipantId, LogIndex),
        Apply(LogIndex, LogPayload),
    }

    #[derive(Default)]
    struct RecordingMachine {
        events: Mutex<Vec<MachineEvent>>,
        failing_snapshots: Mutex<u32>,
    }

    impl RecordingMachine {
        fn failing_snapshots(count: u32) -> Self {
            RecordingMachine {
                failing_snapshots: Mutex::new(count),
                ..RecordingMachine::default()
            }
        }

        fn events(&self) -> Vec<MachineEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StateMachine for RecordingMachine {
        fn apply_committed_entry(&self, index: LogIndex, entry: LogPayload) {
            self.events.lock().unwrap().push(MachineEvent::Apply(index, entry));
        }

        async fn acquire_snapshot(&self, leader: &ParticipantId, index: LogIndex) -> Result<LogIndex, SnapshotError> {
            {
                let mut failing = self.failing_snapshots.lock().unwrap();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(SnapshotError::Unavailable(leader.to_string()));
                }
            }
            self.events.lock().unwrap().push(MachineEvent::Snapshot(leader.clone(), index));
            // The leader's state is empty.
            Ok(LogIndex::default())
        }
    }

    fn leader_id() -> ParticipantId {
        ParticipantId::from("A")
    }

    fn append_request(entries: Vec<PersistingLogEntry>, leader_commit: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            leader_term: LogTerm::new(2),
            leader_id: leader_id(),
            prev_log_entry: TermIndexPair::default(),
            leader_commit: LogIndex::new(leader_commit),
            lowest_index_to_keep: LogIndex::default(),
            message_id: MessageId::new(1),
            wait_for_sync: false,
            entries,
        }
    }

    async fn follower_of(state: &ReplicatedState<RecordingMachine>) -> LogFollower {
        let storage = storage_with(&InMemoryStorageEngine::new(), vec![]).await;
        LogFollower::construct(
            ParticipantId::from("B"),
            LogTerm::new(2),
            Some(leader_id()),
            storage,
            Arc::new(state.clone()),
            test_logger(),
        )
    }

    fn applied(range: std::ops::Range<u64>) -> Vec<MachineEvent> {
        range
            .map(|i| MachineEvent::Apply(LogIndex::new(i), LogPayload::create_from_string(&format!("{}", i))))
            .collect()
    }

    #[tokio::test]
    async fn follower_acquires_snapshot_then_applies() {
        let state = ReplicatedState::new(RecordingMachine::default(), test_logger());
        let follower = follower_of(&state).await;

        let result = follower.handle_append_entries(append_request(entries(2, 1..6), 5)).await;
        assert!(result.is_success(), "{:?}", result);

        let applied_index = state.wait_for_applied(LogIndex::new(4)).await.unwrap();
        assert!(applied_index >= LogIndex::new(4));
        eventually("everything applied", || state.applied_index() == LogIndex::new(5)).await;

        let mut expected = vec![MachineEvent::Snapshot(leader_id(), LogIndex::new(5))];
        expected.extend(applied(1..6));
        assert_eq!(state.machine().events(), expected);
    }

    #[tokio::test]
    async fn snapshot_failures_are_retried() {
        let state = ReplicatedState::new(RecordingMachine::failing_snapshots(2), test_logger());
        let follower = follower_of(&state).await;

        assert!(follower
            .handle_append_entries(append_request(entries(2, 1..4), 3))
            .await
            .is_success());

        state.wait_for_applied(LogIndex::new(3)).await.unwrap();
        let mut expected = vec![MachineEvent::Snapshot(leader_id(), LogIndex::new(3))];
        expected.extend(applied(1..4));
        assert_eq!(state.machine().events(), expected);
    }

    #[tokio::test]
    async fn leader_inserts_and_applies() {
        let state = ReplicatedState::new(RecordingMachine::default(), test_logger());
        let storage = storage_with(&InMemoryStorageEngine::new(), vec![]).await;
        let config = ParticipantsConfig {
            generation: 1,
            participants: vec![(leader_id(), ParticipantFlags::default())].into_iter().collect(),
            config: LogPlanConfig {
                effective_write_concern: 1,
                ..LogPlanConfig::default()
            },
        };
        let _leader = LogLeader::construct(
            leader_id(),
            LogTerm::new(2),
            config,
            storage.clone(),
            Arc::new(state.clone()),
            LocalFollowerFactory::new(),
            LeaderOptions::default(),
            test_logger(),
        )
        .unwrap();

        eventually("leadership", || state.leader().is_ok()).await;
        let index = state.insert_and_wait(LogPayload::create_from_string("x")).await.unwrap();

        assert_eq!(state.applied_index(), index);
        let events = state.machine().events();
        assert_eq!(
            events.last(),
            Some(&MachineEvent::Apply(index, LogPayload::create_from_string("x")))
        );
        // The term's meta entry is never applied.
        assert!(!events.contains(&MachineEvent::Apply(LogIndex::new(1), LogPayload::default())));

        // Applied entries are released, and the leader compacts them.
        eventually("compaction", || storage.committed_log().first_index() == index.plus(1)).await;
    }

    #[tokio::test]
    async fn applied_state_survives_stepping_down() {
        let state = ReplicatedState::new(RecordingMachine::default(), test_logger());
        let storage = storage_with(&InMemoryStorageEngine::new(), vec![]).await;
        let config = ParticipantsConfig {
            generation: 1,
            participants: vec![(leader_id(), ParticipantFlags::default())].into_iter().collect(),
            config: LogPlanConfig {
                effective_write_concern: 1,
                ..LogPlanConfig::default()
            },
        };
        let leader = LogLeader::construct(
            leader_id(),
            LogTerm::new(2),
            config,
            storage.clone(),
            Arc::new(state.clone()),
            LocalFollowerFactory::new(),
            LeaderOptions::default(),
            test_logger(),
        )
        .unwrap();

        eventually("leadership", || state.leader().is_ok()).await;
        let index = state.insert_and_wait(LogPayload::create_from_string("x")).await.unwrap();
        assert_eq!(index, LogIndex::new(2));
        eventually("compaction", || storage.committed_log().is_empty()).await;
        eventually("state marked complete", || {
            storage.persisted_state_info().snapshot_status == SnapshotStatus::Completed
        })
        .await;

        // Next term, B leads and A follows on the same core.
        state.resign_current_state();
        let core = leader.resign().await.unwrap();
        let storage = StorageManager::new(core, test_logger()).unwrap();
        let follower = LogFollower::construct(
            leader_id(),
            LogTerm::new(3),
            Some(ParticipantId::from("B")),
            storage.clone(),
            Arc::new(state.clone()),
            test_logger(),
        );

        let mut shipped = vec![
            PersistingLogEntry::meta(LogTerm::new(2), LogIndex::new(1)),
            PersistingLogEntry::with_payload(LogTerm::new(2), index, LogPayload::create_from_string("x")),
            PersistingLogEntry::meta(LogTerm::new(3), LogIndex::new(3)),
        ];
        shipped.extend(entries(3, 4..5));
        let result = follower
            .handle_append_entries(AppendEntriesRequest {
                leader_term: LogTerm::new(3),
                leader_id: ParticipantId::from("B"),
                prev_log_entry: TermIndexPair::default(),
                leader_commit: LogIndex::new(4),
                lowest_index_to_keep: LogIndex::default(),
                message_id: MessageId::new(1),
                wait_for_sync: false,
                entries: shipped,
            })
            .await;
        assert!(result.is_success(), "{:?}", result);

        state.wait_for_applied(LogIndex::new(4)).await.unwrap();
        assert_eq!(
            state.machine().events(),
            vec![
                MachineEvent::Apply(index, LogPayload::create_from_string("x")),
                MachineEvent::Apply(LogIndex::new(4), LogPayload::create_from_string("4")),
            ]
        );
        assert!(follower.status().snapshot_available);
    }

    #[tokio::test]
    async fn skips_snapshot_already_covered_by_applied_state() {
        let state = ReplicatedState::new(RecordingMachine::default(), test_logger());
        let follower = follower_of(&state).await;
        {
            let mut guard = state.lock();
            guard.applied_index = LogIndex::new(7);
            guard.commit_index = LogIndex::new(7);
        }

        state.acquire_snapshot(&leader_id(), LogIndex::new(5));

        eventually("snapshot completed", || follower.status().snapshot_available).await;
        assert_eq!(state.applied_index(), LogIndex::new(7));
        assert!(state.machine().events().is_empty());
    }

    #[tokio::test]
    async fn resign_fails_waiters() {
        let state = ReplicatedState::new(RecordingMachine::default(), test_logger());
        let _follower = follower_of(&state).await;

        let waiter = state.wait_for_applied(LogIndex::new(10));
        assert!(matches!(state.resign_current_state(), Some(ParticipantMethods::Follower(_))));
        assert_eq!(waiter.await, Err(ReplicatedLogError::NotFollower));
        assert_eq!(
            state.insert(LogPayload::create_from_string("x")),
            Err(ReplicatedLogError::NotLeader)
        );
        assert!(state.resign_current_state().is_none());
    }
}
