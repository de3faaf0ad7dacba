//! Configuration a supervising layer hands to a replicated log: who leads which term, and who
//! participates under which write concern.

use crate::replica::{LogTerm, ParticipantId, WriteConcern};
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ParticipantFlags {
    // Must be part of every quorum.
    pub forced: bool,
    // Never counts towards a quorum.
    pub excluded: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogPlanConfig {
    /// 0 means "use the default write concern".
    pub effective_write_concern: usize,
    pub soft_write_concern: usize,
    pub wait_for_sync: bool,
    pub replication_factor: Option<usize>,
    pub number_of_shards: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticipantsConfig {
    pub generation: u64,
    pub participants: HashMap<ParticipantId, ParticipantFlags>,
    pub config: LogPlanConfig,
}

impl ParticipantsConfig {
    pub(crate) fn write_concern(&self) -> WriteConcern {
        let effective = std::cmp::max(self.config.effective_write_concern, 1);
        WriteConcern {
            soft: std::cmp::max(self.config.soft_write_concern, effective),
            effective,
            hard: std::cmp::max(self.participants.len(), effective),
        }
    }

    pub(crate) fn flags_of(&self, participant: &ParticipantId) -> ParticipantFlags {
        self.participants.get(participant).copied().unwrap_or_default()
    }
}

/// Which term the log is in and who leads it. A term without a leader leaves everyone a follower
/// that won't accept anything.
#[derive(Clone, Debug, PartialEq)]
pub struct LogPlanTermSpecification {
    pub term: LogTerm,
    pub leader: Option<ParticipantId>,
}
