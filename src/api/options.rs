use crate::api::{ParticipantsConfig, ReplicatedLogError};
use crate::replica::ParticipantId;
use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct ReplicatedLogOptions {
    pub allow_extended_names: Option<bool>,
    pub max_shards: Option<usize>,
    pub min_replication_factor: Option<usize>,
    /// 0 means unbounded.
    pub max_replication_factor: Option<usize>,
    pub enforce_replication_factor: Option<bool>,
    pub default_shards: Option<usize>,
    pub default_replication_factor: Option<usize>,
    pub default_write_concern: Option<usize>,
    pub one_shard_db: Option<bool>,
    pub max_entries_per_request: Option<usize>,
    pub initial_retry_backoff: Option<Duration>,
    pub max_retry_backoff: Option<Duration>,
}

#[derive(Clone, Debug)]
pub(crate) struct ReplicatedLogOptionsValidated {
    pub allow_extended_names: bool,
    pub max_shards: usize,
    pub min_replication_factor: usize,
    pub max_replication_factor: usize,
    pub enforce_replication_factor: bool,
    pub default_shards: usize,
    pub default_replication_factor: usize,
    pub default_write_concern: usize,
    pub one_shard_db: bool,
    pub leader: LeaderOptions,
}

/// Tunables of the leader's replication loop.
#[derive(Copy, Clone, Debug)]
pub(crate) struct LeaderOptions {
    pub max_entries_per_request: usize,
    pub initial_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
}

impl Default for LeaderOptions {
    fn default() -> Self {
        LeaderOptions {
            max_entries_per_request: 1000,
            initial_retry_backoff: Duration::from_millis(50),
            max_retry_backoff: Duration::from_secs(5),
        }
    }
}

impl ReplicatedLogOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.default_replication_factor < self.min_replication_factor {
            return Err("Default replication factor must not be less than the minimum replication factor");
        }
        if self.max_replication_factor != 0 && self.default_replication_factor > self.max_replication_factor {
            return Err("Default replication factor must not be greater than the maximum replication factor");
        }
        if self.default_write_concern == 0 {
            return Err("Default write concern must be at least 1");
        }
        if self.default_write_concern > self.default_replication_factor {
            return Err("Default write concern must not be greater than the default replication factor");
        }
        if self.default_shards == 0 {
            return Err("Default number of shards must be at least 1");
        }
        if self.max_shards != 0 && self.default_shards > self.max_shards {
            return Err("Default number of shards must not be greater than the maximum number of shards");
        }
        if self.one_shard_db && self.default_shards != 1 {
            return Err("A one-shard database must default to one shard");
        }
        if self.leader.max_entries_per_request == 0 {
            return Err("Leader must be allowed to send at least one entry per request");
        }
        if self.leader.initial_retry_backoff > self.leader.max_retry_backoff {
            return Err("Initial retry backoff must not be greater than the maximum retry backoff");
        }

        Ok(())
    }

    /// Fills in defaults for anything `config` leaves open and checks it against the limits.
    pub(crate) fn apply_to(
        &self,
        mut config: ParticipantsConfig,
        logger: &slog::Logger,
    ) -> Result<ParticipantsConfig, ReplicatedLogError> {
        for participant in config.participants.keys() {
            if !self.is_valid_name(participant) {
                return Err(precondition(format!("Invalid participant name {:?}", participant)));
            }
        }

        if config.config.effective_write_concern == 0 {
            config.config.effective_write_concern = self.default_write_concern;
        }
        if config.config.soft_write_concern < config.config.effective_write_concern {
            config.config.soft_write_concern = config.config.effective_write_concern;
        }
        let replication_factor = *config
            .config
            .replication_factor
            .get_or_insert(self.default_replication_factor);
        let number_of_shards = *config.config.number_of_shards.get_or_insert(self.default_shards);

        if self.max_shards != 0 && number_of_shards > self.max_shards {
            return Err(precondition(format!(
                "Number of shards {} exceeds the maximum of {}",
                number_of_shards, self.max_shards
            )));
        }
        if self.one_shard_db && number_of_shards != 1 {
            return Err(precondition(format!(
                "One-shard database can't have {} shards",
                number_of_shards
            )));
        }

        let mut violations = vec![];
        if replication_factor < self.min_replication_factor {
            violations.push(format!(
                "Replication factor {} is below the minimum of {}",
                replication_factor, self.min_replication_factor
            ));
        }
        if self.max_replication_factor != 0 && replication_factor > self.max_replication_factor {
            violations.push(format!(
                "Replication factor {} exceeds the maximum of {}",
                replication_factor, self.max_replication_factor
            ));
        }
        if config.participants.len() < replication_factor {
            violations.push(format!(
                "{} participants can't satisfy replication factor {}",
                config.participants.len(),
                replication_factor
            ));
        }
        if config.config.effective_write_concern > config.participants.len() {
            violations.push(format!(
                "Write concern {} is larger than the {} participants",
                config.config.effective_write_concern,
                config.participants.len()
            ));
        }

        if let Some(first) = violations.first() {
            if self.enforce_replication_factor {
                return Err(precondition(first.clone()));
            }
            for violation in violations.iter() {
                slog::warn!(logger, "Accepting config anyway: {}", violation);
            }
        }

        Ok(config)
    }

    fn is_valid_name(&self, participant: &ParticipantId) -> bool {
        let name = participant.as_str();
        if self.allow_extended_names {
            !name.is_empty()
                && name.len() <= 128
                && !name.contains('/')
                && !name.chars().any(char::is_control)
                && name.trim() == name
        } else {
            !name.is_empty()
                && name.len() <= 64
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
    }
}

fn precondition(message: String) -> ReplicatedLogError {
    ReplicatedLogError::PreconditionFailed(message)
}

impl TryFrom<ReplicatedLogOptions> for ReplicatedLogOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ReplicatedLogOptions) -> Result<Self, Self::Error> {
        let leader_defaults = LeaderOptions::default();
        let values = ReplicatedLogOptionsValidated {
            allow_extended_names: options.allow_extended_names.unwrap_or(false),
            max_shards: options.max_shards.unwrap_or(1000),
            min_replication_factor: options.min_replication_factor.unwrap_or(1),
            max_replication_factor: options.max_replication_factor.unwrap_or(10),
            enforce_replication_factor: options.enforce_replication_factor.unwrap_or(true),
            default_shards: options.default_shards.unwrap_or(1),
            default_replication_factor: options.default_replication_factor.unwrap_or(1),
            default_write_concern: options.default_write_concern.unwrap_or(1),
            one_shard_db: options.one_shard_db.unwrap_or(false),
            leader: LeaderOptions {
                max_entries_per_request: options
                    .max_entries_per_request
                    .unwrap_or(leader_defaults.max_entries_per_request),
                initial_retry_backoff: options
                    .initial_retry_backoff
                    .unwrap_or(leader_defaults.initial_retry_backoff),
                max_retry_backoff: options.max_retry_backoff.unwrap_or(leader_defaults.max_retry_backoff),
            },
        };

        values.validate()?;
        Ok(values)
    }
}
