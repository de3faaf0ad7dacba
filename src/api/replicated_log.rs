use crate::api::{
    LogPlanTermSpecification, ParticipantsConfig, ReplicatedLogError, ReplicatedLogOptions,
    ReplicatedLogOptionsValidated, ReplicatedStateHandle,
};
use crate::commitlog::LogCore;
use crate::replica::{
    AppendEntriesErrorReason, AppendEntriesRequest, AppendEntriesResult, FollowerFactory, LogFollower, LogLeader,
    LogStatus, LogTerm, ParticipantId, StorageManager,
};
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct ReplicatedLogConfig {
    pub participant_id: ParticipantId,
    // The persisted log this participant owns until the ReplicatedLog resigns.
    pub core: LogCore,
    pub follower_factory: Arc<dyn FollowerFactory>,
    pub options: ReplicatedLogOptions,
    pub logger: slog::Logger,
}

/// ReplicatedLog is one participant's replica of a replicated log. A supervising layer tells it
/// which term it is in and who participates ([`ReplicatedLog::update_config`]); the user of the
/// log connects a [`ReplicatedStateHandle`] to it. Once both happened, the log leads or follows
/// as the term says.
///
/// ReplicatedLog is cheap to clone. All clones are the same replica.
#[derive(Clone)]
pub struct ReplicatedLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    id: ParticipantId,
    follower_factory: Arc<dyn FollowerFactory>,
    options: ReplicatedLogOptionsValidated,
    guarded: Mutex<GuardedLogData>,
    logger: slog::Logger,
}

enum Participant {
    Unconfigured,
    Leader(LogLeader),
    Follower(LogFollower),
}

struct GuardedLogData {
    // Held here while no participant owns it.
    core: Option<LogCore>,
    participant: Participant,
    term: Option<LogPlanTermSpecification>,
    config: Option<ParticipantsConfig>,
    connection: Option<(u64, Arc<dyn ReplicatedStateHandle>)>,
    next_connection_id: u64,
    resigned: bool,
}

impl ReplicatedLog {
    pub fn construct(config: ReplicatedLogConfig) -> Result<ReplicatedLog, ReplicatedLogError> {
        let options = ReplicatedLogOptionsValidated::try_from(config.options)
            .map_err(|e| ReplicatedLogError::PreconditionFailed(e.to_string()))?;
        let logger = config.logger.new(slog::o!(
            "LogId" => format!("{:?}", config.core.log_id()),
            "Participant" => config.participant_id.to_string(),
        ));

        Ok(ReplicatedLog {
            inner: Arc::new(LogInner {
                id: config.participant_id,
                follower_factory: config.follower_factory,
                options,
                guarded: Mutex::new(GuardedLogData {
                    core: Some(config.core),
                    participant: Participant::Unconfigured,
                    term: None,
                    config: None,
                    connection: None,
                    next_connection_id: 0,
                    resigned: false,
                }),
                logger,
            }),
        })
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.inner.id
    }

    /// Connects the user of the log. Only one state handle can be connected at a time; it stays
    /// connected until the returned [`Connection`] is dropped or disconnected.
    pub async fn connect(&self, state_handle: Arc<dyn ReplicatedStateHandle>) -> Result<Connection, ReplicatedLogError> {
        let mut guard = self.inner.guarded.lock().await;
        if guard.resigned {
            return Err(ReplicatedLogError::Resigned);
        }
        if guard.connection.is_some() {
            return Err(ReplicatedLogError::PreconditionFailed(
                "A state handle is already connected".into(),
            ));
        }

        guard.next_connection_id += 1;
        let id = guard.next_connection_id;
        guard.connection = Some((id, state_handle));
        slog::info!(self.inner.logger, "State handle connected");

        self.try_build_participant(&mut guard)?;
        Ok(Connection {
            log: Some(self.clone()),
            id,
        })
    }

    /// Applies a new configuration. A newer term replaces the participant: the current one
    /// resigns and a leader or follower for the new term is built on the same core. Within the
    /// current term, a newer generation of the participants config is handed to the leader.
    pub async fn update_config(
        &self,
        term: LogPlanTermSpecification,
        config: ParticipantsConfig,
    ) -> Result<(), ReplicatedLogError> {
        let config = self.inner.options.apply_to(config, &self.inner.logger)?;

        let mut guard = self.inner.guarded.lock().await;
        if guard.resigned {
            return Err(ReplicatedLogError::Resigned);
        }

        match guard.term.clone() {
            Some(current) if term.term < current.term => Err(ReplicatedLogError::PreconditionFailed(format!(
                "Term {} is older than the current term {}",
                term.term, current.term
            ))),
            Some(current) if term.term == current.term => {
                if term.leader != current.leader {
                    return Err(ReplicatedLogError::PreconditionFailed(format!(
                        "Term {} is led by {:?}, not {:?}",
                        term.term, current.leader, term.leader
                    )));
                }
                let generation = guard.config.as_ref().map_or(0, |c| c.generation);
                if config.generation <= generation {
                    return Err(ReplicatedLogError::PreconditionFailed(format!(
                        "Generation {} is not newer than {}",
                        config.generation, generation
                    )));
                }
                if let Participant::Leader(leader) = &guard.participant {
                    leader.update_participants_config(config.clone())?;
                }
                guard.config = Some(config);
                Ok(())
            }
            _ => {
                slog::info!(self.inner.logger, "Term {} led by {:?}", term.term, term.leader);
                self.resign_participant(&mut guard).await?;
                guard.term = Some(term);
                guard.config = Some(config);
                self.try_build_participant(&mut guard)
            }
        }
    }

    /// Stops participating and hands back the core, once everything submitted was written.
    pub async fn resign(&self) -> Result<LogCore, ReplicatedLogError> {
        let mut guard = self.inner.guarded.lock().await;
        if guard.resigned {
            return Err(ReplicatedLogError::Resigned);
        }
        guard.resigned = true;
        slog::info!(self.inner.logger, "Replicated log resigning");

        self.resign_participant(&mut guard).await?;
        guard.connection = None;
        guard.core.take().ok_or(ReplicatedLogError::Resigned)
    }

    pub async fn status(&self) -> LogStatus {
        let guard = self.inner.guarded.lock().await;
        match &guard.participant {
            Participant::Unconfigured => LogStatus::Unconfigured,
            Participant::Leader(leader) => LogStatus::Leader(leader.status()),
            Participant::Follower(follower) => LogStatus::Follower(follower.status()),
        }
    }

    /// Entry point for append-entries sent to this participant. Rejected with LostLogCore unless
    /// the participant currently follows.
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResult {
        let (follower, term) = {
            let guard = self.inner.guarded.lock().await;
            let term = Self::current_term(&guard);
            match &guard.participant {
                Participant::Follower(follower) => (Some(follower.clone()), term),
                _ => (None, term),
            }
        };

        match follower {
            Some(follower) => follower.handle_append_entries(request).await,
            None => {
                slog::debug!(self.inner.logger, "Not following, rejecting {:?}", request.message_id);
                AppendEntriesResult::rejected(term, request.message_id, AppendEntriesErrorReason::LostLogCore)
            }
        }
    }

    async fn disconnect(&self, connection_id: u64) -> Result<(), ReplicatedLogError> {
        let mut guard = self.inner.guarded.lock().await;
        match &guard.connection {
            Some((id, _)) if *id == connection_id => {}
            _ => return Ok(()),
        }

        self.resign_participant(&mut guard).await?;
        guard.connection = None;
        slog::info!(self.inner.logger, "State handle disconnected");
        Ok(())
    }

    // Builds the participant for the current term, once there's a term, a config and a state
    // handle.
    fn try_build_participant(&self, guard: &mut GuardedLogData) -> Result<(), ReplicatedLogError> {
        if !matches!(guard.participant, Participant::Unconfigured) {
            return Ok(());
        }
        let (term, config, state_handle) = match (&guard.term, &guard.config, &guard.connection) {
            (Some(term), Some(config), Some((_, state_handle))) => {
                (term.clone(), config.clone(), state_handle.clone())
            }
            _ => return Ok(()),
        };
        let core = match guard.core.take() {
            Some(core) => core,
            None => {
                slog::error!(self.inner.logger, "Log core was lost, can't participate in term {}", term.term);
                return Err(ReplicatedLogError::Resigned);
            }
        };

        let storage = StorageManager::new(core, self.inner.logger.clone())?;
        guard.participant = if term.leader.as_ref() == Some(&self.inner.id) {
            Participant::Leader(LogLeader::construct(
                self.inner.id.clone(),
                term.term,
                config,
                storage,
                state_handle,
                self.inner.follower_factory.clone(),
                self.inner.options.leader,
                self.inner.logger.clone(),
            )?)
        } else {
            Participant::Follower(LogFollower::construct(
                self.inner.id.clone(),
                term.term,
                term.leader,
                storage,
                state_handle,
                self.inner.logger.clone(),
            ))
        };
        Ok(())
    }

    // Ends the current participant and takes back its core.
    async fn resign_participant(&self, guard: &mut GuardedLogData) -> Result<(), ReplicatedLogError> {
        let resigned = match std::mem::replace(&mut guard.participant, Participant::Unconfigured) {
            Participant::Unconfigured => return Ok(()),
            Participant::Leader(leader) => leader.resign(),
            Participant::Follower(follower) => follower.resign(),
        };
        if let Some((_, state_handle)) = &guard.connection {
            state_handle.resign_current_state();
        }

        let core = resigned.await?;
        guard.core = Some(core);
        Ok(())
    }

    fn current_term(guard: &GuardedLogData) -> LogTerm {
        guard.term.as_ref().map(|t| t.term).unwrap_or_default()
    }
}

/// Connection keeps a state handle connected to a [`ReplicatedLog`]. Dropping it disconnects in
/// the background; [`Connection::disconnect`] does it in place.
pub struct Connection {
    log: Option<ReplicatedLog>,
    id: u64,
}

impl Connection {
    pub async fn disconnect(mut self) -> Result<(), ReplicatedLogError> {
        match self.log.take() {
            Some(log) => log.disconnect(self.id).await,
            None => Ok(()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let log = match self.log.take() {
            Some(log) => log,
            None => return,
        };
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = log.disconnect(id).await {
                    slog::warn!(log.inner.logger, "Failed to disconnect state handle: {}", e);
                }
            });
        }
    }
}
