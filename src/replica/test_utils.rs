use crate::api::{FollowerMethods, LeaderMethods, ParticipantMethods, ReplicatedStateHandle};
use crate::commitlog::{InMemoryStorageEngine, LogCore, PersistedLog, WriteOptions};
use crate::replica::storage_manager::StorageManager;
use crate::replica::{
    AbstractFollower, AppendEntriesRequest, AppendEntriesResult, FollowerFactory, FollowerRpcError, LogId, LogIndex,
    LogPayload, LogTerm, ParticipantId, PersistingLogEntry,
};
use async_trait::async_trait;
use slog::Drain;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Entries of `term` with a payload naming their index.
pub(crate) fn entries(term: u64, range: std::ops::Range<u64>) -> Vec<PersistingLogEntry> {
    range
        .map(|i| {
            PersistingLogEntry::with_payload(
                LogTerm::new(term),
                LogIndex::new(i),
                LogPayload::create_from_string(&format!("{}", i)),
            )
        })
        .collect()
}

pub(crate) async fn storage_with(engine: &InMemoryStorageEngine, initial: Vec<PersistingLogEntry>) -> StorageManager {
    let mut log = engine.open_log(LogId::new(1));
    if !initial.is_empty() {
        log.insert(initial, WriteOptions::default()).await.unwrap();
    }
    StorageManager::new(LogCore::new(log), test_logger()).unwrap()
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StateHandleEvent {
    Resigned,
    LeadershipEstablished,
    BecameFollower,
    AcquireSnapshot(ParticipantId, LogIndex),
    CommitIndex(LogIndex),
    DropEntries,
}

/// RecordingStateHandle remembers every call the log makes, in order.
#[derive(Default)]
pub(crate) struct RecordingStateHandle {
    events: Mutex<Vec<StateHandleEvent>>,
    methods: Mutex<Option<ParticipantMethods>>,
}

impl RecordingStateHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingStateHandle::default())
    }

    pub(crate) fn events(&self) -> Vec<StateHandleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn last_commit_index(&self) -> Option<LogIndex> {
        self.events().into_iter().rev().find_map(|e| match e {
            StateHandleEvent::CommitIndex(index) => Some(index),
            _ => None,
        })
    }

    pub(crate) fn follower_methods(&self) -> Arc<dyn FollowerMethods> {
        match self.methods.lock().unwrap().clone() {
            Some(ParticipantMethods::Follower(methods)) => methods,
            _ => panic!("Not a follower"),
        }
    }

    pub(crate) fn leader_methods(&self) -> Option<Arc<dyn LeaderMethods>> {
        match self.methods.lock().unwrap().clone() {
            Some(ParticipantMethods::Leader(methods)) => Some(methods),
            _ => None,
        }
    }

    fn record(&self, event: StateHandleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ReplicatedStateHandle for RecordingStateHandle {
    fn resign_current_state(&self) -> Option<ParticipantMethods> {
        self.record(StateHandleEvent::Resigned);
        self.methods.lock().unwrap().take()
    }

    fn leadership_established(&self, methods: Arc<dyn LeaderMethods>) {
        self.record(StateHandleEvent::LeadershipEstablished);
        *self.methods.lock().unwrap() = Some(ParticipantMethods::Leader(methods));
    }

    fn become_follower(&self, methods: Arc<dyn FollowerMethods>) {
        self.record(StateHandleEvent::BecameFollower);
        *self.methods.lock().unwrap() = Some(ParticipantMethods::Follower(methods));
    }

    fn acquire_snapshot(&self, leader: &ParticipantId, index: LogIndex) {
        self.record(StateHandleEvent::AcquireSnapshot(leader.clone(), index));
    }

    fn update_commit_index(&self, index: LogIndex) {
        self.record(StateHandleEvent::CommitIndex(index));
    }

    fn drop_entries(&self) {
        self.record(StateHandleEvent::DropEntries);
    }
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A follower nobody can reach.
pub(crate) struct UnreachableFollower {
    id: ParticipantId,
}

impl UnreachableFollower {
    pub(crate) fn new(id: &str) -> Self {
        UnreachableFollower {
            id: ParticipantId::from(id),
        }
    }
}

#[async_trait]
impl AbstractFollower for UnreachableFollower {
    fn participant_id(&self) -> &ParticipantId {
        &self.id
    }

    async fn append_entries(&self, _: AppendEntriesRequest) -> Result<AppendEntriesResult, FollowerRpcError> {
        Err(FollowerRpcError::Unreachable(self.id.to_string()))
    }
}

/// Hands out registered followers. Unregistered ones are unreachable.
#[derive(Default)]
pub(crate) struct LocalFollowerFactory {
    followers: Mutex<HashMap<ParticipantId, Arc<dyn AbstractFollower>>>,
}

impl LocalFollowerFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(LocalFollowerFactory::default())
    }

    pub(crate) fn register(&self, follower: Arc<dyn AbstractFollower>) {
        let id = follower.participant_id().clone();
        self.followers.lock().unwrap().insert(id, follower);
    }
}

impl FollowerFactory for LocalFollowerFactory {
    fn construct_follower(&self, id: &ParticipantId) -> Arc<dyn AbstractFollower> {
        match self.followers.lock().unwrap().get(id) {
            Some(follower) => follower.clone(),
            None => Arc::new(UnreachableFollower::new(id.as_str())),
        }
    }
}
