use crate::api::ParticipantFlags;
use crate::replica::{LogIndex, ParticipantId};
use std::cmp;

/// Position of one participant as seen by the leader.
#[derive(Clone, Debug)]
pub(crate) struct ParticipantState {
    pub(crate) last_ack_index: LogIndex,
    pub(crate) id: ParticipantId,
    pub(crate) flags: ParticipantFlags,
}

impl ParticipantState {
    pub(crate) fn new(id: ParticipantId, last_ack_index: LogIndex, flags: ParticipantFlags) -> Self {
        ParticipantState {
            last_ack_index,
            id,
            flags,
        }
    }

    fn is_eligible(&self) -> bool {
        !self.flags.excluded
    }
}

/// Write concern of a log. Only `effective` takes part in commit calculation, the bounds are
/// carried along for status reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriteConcern {
    pub soft: usize,
    pub effective: usize,
    pub hard: usize,
}

impl WriteConcern {
    pub fn new(effective: usize) -> Self {
        WriteConcern {
            soft: effective,
            effective,
            hard: effective,
        }
    }
}

/// Why the commit index didn't move further than it did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitFailReason {
    NothingToCommit,
    QuorumSizeNotReached { who: Vec<ParticipantId> },
    ForcedParticipantNotInQuorum { who: ParticipantId },
    NonEligibleServerRequiredForQuorum { candidates: Vec<ParticipantId> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CommitResult {
    pub(crate) commit_index: LogIndex,
    pub(crate) reason: CommitFailReason,
    // Eligible participants that acknowledged at least `commit_index`.
    pub(crate) quorum: Vec<ParticipantId>,
}

/// Computes the largest index acknowledged by `write_concern.effective` eligible participants and
/// by every forced participant, bounded by the leader's `spearhead`. The result never goes below
/// `current_commit`.
pub(crate) fn calculate_commit_index(
    participants: &[ParticipantState],
    write_concern: WriteConcern,
    current_commit: LogIndex,
    spearhead: LogIndex,
) -> CommitResult {
    let quorum_size = cmp::max(write_concern.effective, 1);

    if participants.iter().all(|p| p.last_ack_index <= current_commit) {
        return CommitResult {
            commit_index: current_commit,
            reason: CommitFailReason::NothingToCommit,
            quorum: vec![],
        };
    }

    let mut eligible: Vec<&ParticipantState> = participants.iter().filter(|p| p.is_eligible()).collect();
    if eligible.len() < quorum_size {
        return CommitResult {
            commit_index: current_commit,
            reason: CommitFailReason::QuorumSizeNotReached { who: vec![] },
            quorum: vec![],
        };
    }

    eligible.sort_by(|a, b| b.last_ack_index.cmp(&a.last_ack_index));
    let mut candidate = eligible[quorum_size - 1].last_ack_index;

    let lowest_forced = participants
        .iter()
        .filter(|p| p.flags.forced)
        .map(|p| p.last_ack_index)
        .min();
    if let Some(lowest_forced) = lowest_forced {
        candidate = cmp::min(candidate, lowest_forced);
    }

    let commit_index = cmp::max(cmp::min(candidate, spearhead), current_commit);
    let quorum = eligible
        .iter()
        .filter(|p| p.last_ack_index >= commit_index)
        .map(|p| p.id.clone())
        .collect();

    CommitResult {
        commit_index,
        reason: fail_reason(participants, quorum_size, commit_index, spearhead),
        quorum,
    }
}

// Reason for not committing the index right after `commit_index`.
fn fail_reason(
    participants: &[ParticipantState],
    quorum_size: usize,
    commit_index: LogIndex,
    spearhead: LogIndex,
) -> CommitFailReason {
    if commit_index >= spearhead {
        return CommitFailReason::NothingToCommit;
    }
    let next = commit_index.plus(1);

    if let Some(forced) = participants.iter().find(|p| p.flags.forced && p.last_ack_index < next) {
        return CommitFailReason::ForcedParticipantNotInQuorum { who: forced.id.clone() };
    }

    let eligible_acks = participants
        .iter()
        .filter(|p| p.is_eligible() && p.last_ack_index >= next)
        .count();
    let all_acks = participants.iter().filter(|p| p.last_ack_index >= next).count();
    if eligible_acks < quorum_size && all_acks >= quorum_size {
        let candidates = participants
            .iter()
            .filter(|p| !p.is_eligible() && p.last_ack_index >= next)
            .map(|p| p.id.clone())
            .collect();
        return CommitFailReason::NonEligibleServerRequiredForQuorum { candidates };
    }

    let who = participants
        .iter()
        .filter(|p| p.last_ack_index < next)
        .map(|p| p.id.clone())
        .collect();
    CommitFailReason::QuorumSizeNotReached { who }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: &str, ack: u64) -> ParticipantState {
        ParticipantState::new(ParticipantId::from(id), LogIndex::new(ack), ParticipantFlags::default())
    }

    fn forced(id: &str, ack: u64) -> ParticipantState {
        let mut state = p(id, ack);
        state.flags.forced = true;
        state
    }

    fn excluded(id: &str, ack: u64) -> ParticipantState {
        let mut state = p(id, ack);
        state.flags.excluded = true;
        state
    }

    fn ids(ids: &[&str]) -> Vec<ParticipantId> {
        ids.iter().map(|id| ParticipantId::from(*id)).collect()
    }

    fn run(
        expected: (u64, CommitFailReason),
        participants: Vec<ParticipantState>,
        write_concern: usize,
        current_commit: u64,
        spearhead: u64,
    ) -> CommitResult {
        let result = calculate_commit_index(
            &participants,
            WriteConcern::new(write_concern),
            LogIndex::new(current_commit),
            LogIndex::new(spearhead),
        );
        assert_eq!(
            (result.commit_index.as_u64(), result.reason.clone()),
            expected,
            "participants {:?}, wc {}",
            participants,
            write_concern
        );
        result
    }

    #[test]
    fn test_quorum_of_plain_participants() {
        let abc = || vec![p("A", 50), p("B", 25), p("C", 35)];

        let result = run(
            (35, CommitFailReason::QuorumSizeNotReached { who: ids(&["B", "C"]) }),
            abc(),
            2,
            1,
            50,
        );
        assert_eq!(result.quorum, ids(&["A", "C"]));

        run(
            (25, CommitFailReason::QuorumSizeNotReached { who: ids(&["B"]) }),
            abc(),
            3,
            1,
            50,
        );
        run(
            (50, CommitFailReason::QuorumSizeNotReached { who: ids(&["A", "B", "C"]) }),
            abc(),
            1,
            1,
            60,
        );

        // Single participant
        let result = run((50, CommitFailReason::NothingToCommit), vec![p("A", 50)], 1, 1, 50);
        assert_eq!(result.quorum, ids(&["A"]));

        // Ordering doesn't matter
        run(
            (35, CommitFailReason::QuorumSizeNotReached { who: ids(&["C", "B"]) }),
            vec![p("C", 35), p("A", 50), p("B", 25)],
            2,
            1,
            50,
        );
    }

    #[test]
    fn test_nothing_to_commit() {
        run(
            (40, CommitFailReason::NothingToCommit),
            vec![p("A", 30), p("B", 40), p("C", 20)],
            2,
            40,
            50,
        );
        run((0, CommitFailReason::NothingToCommit), vec![p("A", 0), p("B", 0)], 1, 0, 0);
    }

    #[test]
    fn test_commit_index_never_regresses() {
        run(
            (30, CommitFailReason::QuorumSizeNotReached { who: ids(&["B", "C"]) }),
            vec![p("A", 50), p("B", 25), p("C", 20)],
            2,
            30,
            50,
        );
    }

    #[test]
    fn test_bounded_by_spearhead() {
        run(
            (40, CommitFailReason::NothingToCommit),
            vec![p("A", 50), p("B", 50), p("C", 50)],
            2,
            1,
            40,
        );
    }

    #[test]
    fn test_forced_participant_holds_back_commit() {
        run(
            (25, CommitFailReason::ForcedParticipantNotInQuorum { who: ParticipantId::from("B") }),
            vec![p("A", 50), forced("B", 25), p("C", 35)],
            2,
            1,
            50,
        );

        // A forced participant ahead of the quorum changes nothing.
        run(
            (35, CommitFailReason::QuorumSizeNotReached { who: ids(&["B", "C"]) }),
            vec![forced("A", 50), p("B", 25), p("C", 35)],
            2,
            1,
            50,
        );

        // All forced: everyone must have it.
        run(
            (25, CommitFailReason::ForcedParticipantNotInQuorum { who: ParticipantId::from("B") }),
            vec![forced("A", 50), forced("B", 25), forced("C", 35)],
            1,
            1,
            50,
        );
    }

    #[test]
    fn test_excluded_participants_dont_count() {
        run(
            (25, CommitFailReason::NonEligibleServerRequiredForQuorum { candidates: ids(&["A"]) }),
            vec![excluded("A", 50), p("B", 25), p("C", 35)],
            2,
            1,
            50,
        );

        run(
            (1, CommitFailReason::QuorumSizeNotReached { who: vec![] }),
            vec![excluded("A", 50), excluded("B", 25), p("C", 35)],
            2,
            1,
            50,
        );

        run(
            (1, CommitFailReason::QuorumSizeNotReached { who: vec![] }),
            vec![excluded("A", 50), excluded("B", 25), excluded("C", 35)],
            1,
            1,
            50,
        );

        // An excluded participant that's behind is irrelevant.
        run(
            (35, CommitFailReason::QuorumSizeNotReached { who: ids(&["B", "C"]) }),
            vec![p("A", 50), excluded("B", 25), p("C", 35)],
            2,
            1,
            50,
        );
    }

    #[test]
    fn test_write_concern_zero_is_one() {
        run((50, CommitFailReason::NothingToCommit), vec![p("A", 50), p("B", 10)], 0, 1, 50);
    }
}
