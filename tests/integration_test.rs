use async_trait::async_trait;
use replicated_log::{
    AbstractFollower, AppendEntriesRequest, AppendEntriesResult, FollowerFactory, FollowerRpcError,
    InMemoryStorageEngine, LogCore, LogId, LogIndex, LogPayload, LogPlanConfig, LogPlanTermSpecification, LogStatus,
    LogTerm, ParticipantFlags, ParticipantId, ParticipantsConfig, ReplicatedLog, ReplicatedLogConfig,
    ReplicatedLogError, ReplicatedLogOptions, ReplicatedState, SnapshotError, StateMachine,
};
use slog::Drain;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn replicates_to_all_participants() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(&["A", "B", "C"]).await?;
    cluster.update_term(1, "A", 2).await?;

    let first = insert(cluster.state("A"), "Hello world").await?;
    let second = insert(cluster.state("A"), "it's me").await?;
    assert!(second > first);

    for id in cluster.ids() {
        wait_for_applied(cluster.state(id), second).await?;
        assert_eq!(cluster.state(id).machine().values(), vec!["Hello world", "it's me"]);
    }

    match cluster.log("A").status().await {
        LogStatus::Leader(status) => {
            assert!(status.leadership_established);
            assert_eq!(status.followers.len(), 2);
        }
        other => panic!("Expected A to lead, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn commits_without_unreachable_follower() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(&["A", "B", "C"]).await?;
    cluster.network.set_reachable("C", false);
    cluster.update_term(1, "A", 2).await?;

    let index = insert(cluster.state("A"), "without C").await?;
    wait_for_applied(cluster.state("B"), index).await?;
    assert!(cluster.state("C").applied_index() < index);

    cluster.network.set_reachable("C", true);
    wait_for_applied(cluster.state("C"), index).await?;
    assert_eq!(cluster.state("C").machine().values(), vec!["without C"]);

    Ok(())
}

#[tokio::test]
async fn fails_over_to_new_leader() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(&["A", "B", "C"]).await?;
    cluster.update_term(1, "A", 2).await?;
    let index = insert(cluster.state("A"), "first term").await?;
    for id in cluster.ids() {
        wait_for_applied(cluster.state(id), index).await?;
    }

    cluster.update_term(2, "B", 2).await?;
    assert_eq!(cluster.state("A").insert(LogPayload::create_from_string("stale")), Err(ReplicatedLogError::NotLeader));

    let index = insert(cluster.state("B"), "second term").await?;
    for id in cluster.ids() {
        wait_for_applied(cluster.state(id), index).await?;
        assert_eq!(cluster.state(id).machine().values(), vec!["first term", "second term"]);
    }

    match cluster.log("A").status().await {
        LogStatus::Follower(status) => {
            assert_eq!(status.term, LogTerm::new(2));
            assert_eq!(status.leader, Some(ParticipantId::from("B")));
        }
        other => panic!("Expected A to follow, got {:?}", other),
    }

    Ok(())
}

struct Cluster {
    network: Network,
    machines: Arc<MachineRegistry>,
    logs: BTreeMap<ParticipantId, ReplicatedLog>,
    states: HashMap<ParticipantId, ReplicatedState<KvMachine>>,
    // Keep the states connected.
    _connections: Vec<replicated_log::Connection>,
}

impl Cluster {
    async fn start(ids: &[&str]) -> Result<Cluster, Box<dyn Error>> {
        let network = Network::default();
        let machines = Arc::new(MachineRegistry::default());
        let mut logs = BTreeMap::new();
        let mut states = HashMap::new();
        let mut connections = Vec::with_capacity(ids.len());

        for (i, id) in ids.iter().enumerate() {
            let participant = ParticipantId::from(*id);
            let logger = create_root_logger_for_stdout(id.to_string());
            let log = ReplicatedLog::construct(ReplicatedLogConfig {
                participant_id: participant.clone(),
                core: LogCore::new(InMemoryStorageEngine::new().open_log(LogId::new(i as u64 + 1))),
                follower_factory: Arc::new(network.clone()),
                options: ReplicatedLogOptions {
                    initial_retry_backoff: Some(Duration::from_millis(10)),
                    max_retry_backoff: Some(Duration::from_millis(200)),
                    ..ReplicatedLogOptions::default()
                },
                logger: logger.clone(),
            })?;
            network.register(log.clone());

            let state = ReplicatedState::new(KvMachine::new(machines.clone()), logger);
            machines.register(participant.clone(), state.clone());
            connections.push(log.connect(Arc::new(state.clone())).await?);

            logs.insert(participant.clone(), log);
            states.insert(participant, state);
        }

        Ok(Cluster {
            network,
            machines,
            logs,
            states,
            _connections: connections,
        })
    }

    async fn update_term(&self, term: u64, leader: &str, write_concern: usize) -> Result<(), Box<dyn Error>> {
        let participants = self
            .logs
            .keys()
            .map(|id| (id.clone(), ParticipantFlags::default()))
            .collect();
        let config = ParticipantsConfig {
            generation: 1,
            participants,
            config: LogPlanConfig {
                effective_write_concern: write_concern,
                ..LogPlanConfig::default()
            },
        };
        let term = LogPlanTermSpecification {
            term: LogTerm::new(term),
            leader: Some(ParticipantId::from(leader)),
        };

        for log in self.logs.values() {
            log.update_config(term.clone(), config.clone()).await?;
        }
        Ok(())
    }

    fn ids(&self) -> Vec<&str> {
        self.logs.keys().map(ParticipantId::as_str).collect()
    }

    fn log(&self, id: &str) -> &ReplicatedLog {
        self.logs.get(&ParticipantId::from(id)).expect("Unknown participant")
    }

    fn state(&self, id: &str) -> &ReplicatedState<KvMachine> {
        self.states.get(&ParticipantId::from(id)).expect("Unknown participant")
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // States and machines reference each other through the registry.
        self.machines.clear();
    }
}

/// In-process transport: append-entries are handed to the addressed ReplicatedLog.
#[derive(Clone, Default)]
struct Network {
    state: Arc<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    logs: Mutex<HashMap<ParticipantId, ReplicatedLog>>,
    unreachable: Mutex<HashSet<ParticipantId>>,
}

impl Network {
    fn register(&self, log: ReplicatedLog) {
        let mut logs = self.state.logs.lock().unwrap();
        logs.insert(log.participant_id().clone(), log);
    }

    fn set_reachable(&self, id: &str, reachable: bool) {
        let mut unreachable = self.state.unreachable.lock().unwrap();
        if reachable {
            unreachable.remove(&ParticipantId::from(id));
        } else {
            unreachable.insert(ParticipantId::from(id));
        }
    }
}

impl FollowerFactory for Network {
    fn construct_follower(&self, participant: &ParticipantId) -> Arc<dyn AbstractFollower> {
        Arc::new(NetworkFollower {
            id: participant.clone(),
            network: self.state.clone(),
        })
    }
}

struct NetworkFollower {
    id: ParticipantId,
    network: Arc<NetworkState>,
}

#[async_trait]
impl AbstractFollower for NetworkFollower {
    fn participant_id(&self) -> &ParticipantId {
        &self.id
    }

    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResult, FollowerRpcError> {
        let log = {
            let unreachable = self.network.unreachable.lock().unwrap();
            if unreachable.contains(&self.id) || unreachable.contains(&request.leader_id) {
                return Err(FollowerRpcError::Unreachable(self.id.to_string()));
            }
            self.network.logs.lock().unwrap().get(&self.id).cloned()
        };
        let log = log.ok_or_else(|| FollowerRpcError::Unreachable(self.id.to_string()))?;

        // Through the wire frames, like a real transport would.
        let request = AppendEntriesRequest::from_bytes(&request.to_bytes())
            .map_err(|e| FollowerRpcError::Unreachable(e.to_string()))?;
        let result = log.append_entries(request).await;
        AppendEntriesResult::from_bytes(&result.to_bytes()).map_err(|e| FollowerRpcError::Unreachable(e.to_string()))
    }
}

#[derive(Default)]
struct MachineRegistry {
    states: Mutex<HashMap<ParticipantId, ReplicatedState<KvMachine>>>,
}

impl MachineRegistry {
    fn register(&self, id: ParticipantId, state: ReplicatedState<KvMachine>) {
        self.states.lock().unwrap().insert(id, state);
    }

    fn get(&self, id: &ParticipantId) -> Option<ReplicatedState<KvMachine>> {
        self.states.lock().unwrap().get(id).cloned()
    }

    fn clear(&self) {
        self.states.lock().unwrap().clear();
    }
}

/// Keeps every applied payload by index. Snapshots copy the leader's payloads.
struct KvMachine {
    registry: Arc<MachineRegistry>,
    values: Mutex<BTreeMap<LogIndex, String>>,
}

impl KvMachine {
    fn new(registry: Arc<MachineRegistry>) -> Self {
        KvMachine {
            registry,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    fn values(&self) -> Vec<String> {
        self.values.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl StateMachine for KvMachine {
    fn apply_committed_entry(&self, index: LogIndex, entry: LogPayload) {
        let value = String::from_utf8_lossy(entry.as_bytes()).into_owned();
        self.values.lock().unwrap().insert(index, value);
    }

    async fn acquire_snapshot(&self, leader: &ParticipantId, index: LogIndex) -> Result<LogIndex, SnapshotError> {
        let source = self
            .registry
            .get(leader)
            .ok_or_else(|| SnapshotError::Unavailable(format!("No state for {}", leader)))?;
        if source.applied_index() < index {
            return Err(SnapshotError::Unavailable(format!("{} hasn't applied {} yet", leader, index)));
        }

        let snapshot: BTreeMap<LogIndex, String> = source
            .machine()
            .values
            .lock()
            .unwrap()
            .range(..=index)
            .map(|(i, v)| (*i, v.clone()))
            .collect();
        *self.values.lock().unwrap() = snapshot;
        Ok(index)
    }
}

async fn insert(state: &ReplicatedState<KvMachine>, value: &str) -> Result<LogIndex, Box<dyn Error>> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let attempt = tokio::time::timeout_at(deadline, state.insert_and_wait(LogPayload::create_from_string(value)))
            .await?;
        match attempt {
            Ok(index) => return Ok(index),
            // Leadership not established yet.
            Err(ReplicatedLogError::NotLeader) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn wait_for_applied(state: &ReplicatedState<KvMachine>, index: LogIndex) -> Result<(), Box<dyn Error>> {
    tokio::time::timeout(TIMEOUT, state.wait_for_applied(index)).await??;
    Ok(())
}

fn create_root_logger_for_stdout(participant: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Participant" => participant))
}
