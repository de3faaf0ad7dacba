use crate::api::LeaderOptions;
use crate::replica::{
    AbstractFollower, AppendEntriesErrorReason, AppendEntriesRequest, AppendEntriesResult, FollowerRpcError,
    FollowerStatistics, InMemoryLog, LogIndex, LogRange, LogTerm, MessageId, ParticipantId, RequestError,
    TermIndexPair,
};
use rand::Rng;
use std::cmp;
use std::sync::Arc;
use std::time::Duration;

/// FollowerInfo is the leader's bookkeeping for one follower.
pub(super) struct FollowerInfo {
    connection: Arc<dyn AbstractFollower>,

    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    last_acked_index: LogIndex,
    // Entries after this one are sent next. Starts out optimistic, at the leader's last entry,
    // and is walked back by the follower's conflict hints.
    next_prev_index: LogIndex,

    // Message ids are the leader's logical clock towards this follower. At most one request is
    // outstanding: the one with the last sent id.
    last_sent_message_id: MessageId,
    last_received_message_id: MessageId,

    // What the follower last confirmed to know about the leader's state.
    last_acked_commit: LogIndex,
    last_acked_lowest_index_to_keep: LogIndex,

    errors_since_success: u32,
    last_error: Option<RequestError>,
    last_request_latency: Option<Duration>,
}

/// What the leader remembers about an outstanding request.
#[derive(Debug, Clone)]
pub(super) struct SentRequest {
    pub(super) message_id: MessageId,
    pub(super) last_index_covered: LogIndex,
    pub(super) leader_commit: LogIndex,
    pub(super) lowest_index_to_keep: LogIndex,
}

impl FollowerInfo {
    pub(super) fn new(connection: Arc<dyn AbstractFollower>, leader_last_index: LogIndex) -> Self {
        FollowerInfo {
            connection,
            last_acked_index: LogIndex::default(),
            next_prev_index: leader_last_index,
            last_sent_message_id: MessageId::default(),
            last_received_message_id: MessageId::default(),
            last_acked_commit: LogIndex::default(),
            last_acked_lowest_index_to_keep: LogIndex::default(),
            errors_since_success: 0,
            last_error: None,
            last_request_latency: None,
        }
    }

    pub(super) fn connection(&self) -> Arc<dyn AbstractFollower> {
        self.connection.clone()
    }

    pub(super) fn last_acked_index(&self) -> LogIndex {
        self.last_acked_index
    }

    pub(super) fn has_outstanding_request(&self) -> bool {
        self.last_received_message_id < self.last_sent_message_id
    }

    /// True if the follower is missing entries or hasn't heard of the current commit index yet,
    /// and nothing is in flight.
    pub(super) fn needs_request(&self, last_index: LogIndex, commit: LogIndex, lowest_index_to_keep: LogIndex) -> bool {
        !self.has_outstanding_request()
            && (self.next_prev_index < last_index
                || self.last_acked_commit < commit
                || self.last_acked_lowest_index_to_keep < lowest_index_to_keep
                || self.errors_since_success > 0)
    }

    /// Builds the next request for this follower out of `log` and marks it outstanding.
    pub(super) fn prepare_request(
        &mut self,
        log: &InMemoryLog,
        leader: RequestHeader,
        max_entries: usize,
    ) -> (AppendEntriesRequest, SentRequest) {
        let mut prev_index = cmp::min(self.next_prev_index, log.last_index());
        let prev_log_entry = match log.term_of(prev_index) {
            Some(term) => TermIndexPair::new(term, prev_index),
            None => {
                // Not in the log, or compacted away. The follower starts over where the log
                // starts, even if nothing is left to ship.
                prev_index = log.first_index().saturating_minus(1);
                TermIndexPair::new(LogTerm::default(), prev_index)
            }
        };

        let from = prev_index.plus(1);
        let entries = log
            .slice(LogRange::new(from, from.plus(max_entries as u64)))
            .persisted_entries();

        self.last_sent_message_id = self.last_sent_message_id.next();
        let request = AppendEntriesRequest {
            leader_term: leader.term,
            leader_id: leader.id,
            prev_log_entry,
            leader_commit: leader.commit_index,
            lowest_index_to_keep: leader.lowest_index_to_keep,
            message_id: self.last_sent_message_id,
            wait_for_sync: leader.wait_for_sync,
            entries,
        };
        let sent = SentRequest {
            message_id: request.message_id,
            last_index_covered: request.last_index_covered(),
            leader_commit: request.leader_commit,
            lowest_index_to_keep: request.lowest_index_to_keep,
        };
        (request, sent)
    }

    /// Returns false if the response was for something we're not waiting for anymore.
    pub(super) fn handle_response(
        &mut self,
        logger: &slog::Logger,
        sent: &SentRequest,
        response: Result<AppendEntriesResult, FollowerRpcError>,
        latency: Duration,
    ) -> bool {
        if !self.ratchet_fwd_received_message_id(sent.message_id) {
            slog::warn!(logger, "Dropping response to out of date {:?}", sent.message_id);
            return false;
        }
        self.last_request_latency = Some(latency);

        let result = match response {
            Ok(result) => result,
            Err(e) => {
                slog::warn!(logger, "Append entries {:?} failed: {}", sent.message_id, e);
                self.record_error(RequestError::Rpc(e));
                return true;
            }
        };
        if result.message_id != sent.message_id {
            slog::warn!(
                logger,
                "Follower answered {:?} with a response for {:?}",
                sent.message_id,
                result.message_id
            );
            self.record_error(RequestError::Rejected(result.reason));
            return true;
        }

        match result.reason {
            AppendEntriesErrorReason::None => {
                self.last_acked_index = cmp::max(self.last_acked_index, sent.last_index_covered);
                self.next_prev_index = sent.last_index_covered;
                self.last_acked_commit = sent.leader_commit;
                self.last_acked_lowest_index_to_keep = sent.lowest_index_to_keep;
                self.errors_since_success = 0;
                self.last_error = None;
            }
            AppendEntriesErrorReason::NoPrevLogMatch => {
                let rewound = match result.conflict {
                    Some(conflict) => conflict.index.saturating_minus(1),
                    None => self.next_prev_index.saturating_minus(1),
                };
                slog::debug!(
                    logger,
                    "Follower log doesn't match at {:?}, continuing from {:?}",
                    self.next_prev_index,
                    rewound
                );
                // Walking back is progress. Getting sent to the same place again is not.
                if rewound >= self.next_prev_index {
                    self.errors_since_success += 1;
                }
                self.next_prev_index = rewound;
                self.last_error = Some(RequestError::Rejected(result.reason));
            }
            reason => {
                slog::warn!(logger, "Follower rejected {:?}: {}", sent.message_id, reason);
                self.record_error(RequestError::Rejected(reason));
            }
        }
        true
    }

    /// Capped exponential backoff with jitter, once requests started failing.
    pub(super) fn retry_delay(&self, options: &LeaderOptions) -> Option<Duration> {
        if self.errors_since_success == 0 {
            return None;
        }
        let exponent = cmp::min(self.errors_since_success - 1, 16);
        let backoff = cmp::min(options.initial_retry_backoff * 2u32.pow(exponent), options.max_retry_backoff);
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        Some(backoff.mul_f64(jitter))
    }

    pub(super) fn statistics(&self) -> FollowerStatistics {
        FollowerStatistics {
            last_ack: self.last_acked_index,
            last_error: self.last_error.clone(),
            last_request_latency: self.last_request_latency,
            errors_since_last_success: self.errors_since_success,
            request_in_flight: self.has_outstanding_request(),
        }
    }

    fn record_error(&mut self, error: RequestError) {
        self.errors_since_success += 1;
        self.last_error = Some(error);
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_message_id(&mut self, received: MessageId) -> bool {
        if self.last_received_message_id < received && received <= self.last_sent_message_id {
            self.last_received_message_id = received;
            true
        } else {
            false
        }
    }
}

/// The leader's side of a request, the same for every follower.
#[derive(Clone)]
pub(super) struct RequestHeader {
    pub(super) term: LogTerm,
    pub(super) id: ParticipantId,
    pub(super) commit_index: LogIndex,
    pub(super) lowest_index_to_keep: LogIndex,
    pub(super) wait_for_sync: bool,
}
