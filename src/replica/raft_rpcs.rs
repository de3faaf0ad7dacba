use crate::replica::write_ahead_log::ProtoLogEntry;
use crate::replica::{
    AppendEntriesErrorReason, AppendEntriesRequest, AppendEntriesResult, EntryDecodeError, EntrySerialization,
    LogIndex, LogTerm, MessageId, ParticipantId, PersistingLogEntry, TermIndexPair,
};
use prost::Message;

// Wire frames for append-entries. Transports that cross a process boundary ship these.

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoAppendEntriesRequest {
    #[prost(uint64, tag = "1")]
    pub leader_term: u64,
    #[prost(string, tag = "2")]
    pub leader_id: String,
    #[prost(uint64, tag = "3")]
    pub prev_log_term: u64,
    #[prost(uint64, tag = "4")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "5")]
    pub leader_commit: u64,
    #[prost(uint64, tag = "6")]
    pub lowest_index_to_keep: u64,
    #[prost(uint64, tag = "7")]
    pub message_id: u64,
    #[prost(bool, tag = "8")]
    pub wait_for_sync: bool,
    #[prost(message, repeated, tag = "9")]
    pub entries: Vec<ProtoLogEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoAppendEntriesResult {
    #[prost(uint64, tag = "1")]
    pub log_term: u64,
    #[prost(uint64, tag = "2")]
    pub message_id: u64,
    #[prost(int32, tag = "3")]
    pub reason: i32,
    #[prost(uint64, tag = "4")]
    pub last_acked: u64,
    #[prost(uint64, optional, tag = "5")]
    pub conflict_term: Option<u64>,
    #[prost(uint64, optional, tag = "6")]
    pub conflict_index: Option<u64>,
}

impl AppendEntriesRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let proto = ProtoAppendEntriesRequest {
            leader_term: self.leader_term.as_u64(),
            leader_id: self.leader_id.as_str().to_string(),
            prev_log_term: self.prev_log_entry.term.as_u64(),
            prev_log_index: self.prev_log_entry.index.as_u64(),
            leader_commit: self.leader_commit.as_u64(),
            lowest_index_to_keep: self.lowest_index_to_keep.as_u64(),
            message_id: self.message_id.as_u64(),
            wait_for_sync: self.wait_for_sync,
            entries: self
                .entries
                .iter()
                .map(|e| e.to_proto(EntrySerialization::Full))
                .collect(),
        };
        let mut bytes = Vec::with_capacity(proto.encoded_len());
        let _ = proto.encode(&mut bytes);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EntryDecodeError> {
        let proto = ProtoAppendEntriesRequest::decode(bytes).map_err(|e| EntryDecodeError::Malformed(e.to_string()))?;
        let entries = proto
            .entries
            .into_iter()
            .map(|e| PersistingLogEntry::from_proto(e, None))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AppendEntriesRequest {
            leader_term: LogTerm::new(proto.leader_term),
            leader_id: ParticipantId::new(proto.leader_id),
            prev_log_entry: TermIndexPair::new(LogTerm::new(proto.prev_log_term), LogIndex::new(proto.prev_log_index)),
            leader_commit: LogIndex::new(proto.leader_commit),
            lowest_index_to_keep: LogIndex::new(proto.lowest_index_to_keep),
            message_id: MessageId::new(proto.message_id),
            wait_for_sync: proto.wait_for_sync,
            entries,
        })
    }
}

impl AppendEntriesResult {
    pub fn to_bytes(&self) -> Vec<u8> {
        let proto = ProtoAppendEntriesResult {
            log_term: self.log_term.as_u64(),
            message_id: self.message_id.as_u64(),
            reason: self.reason.as_i32(),
            last_acked: self.last_acked.as_u64(),
            conflict_term: self.conflict.map(|c| c.term.as_u64()),
            conflict_index: self.conflict.map(|c| c.index.as_u64()),
        };
        let mut bytes = Vec::with_capacity(proto.encoded_len());
        let _ = proto.encode(&mut bytes);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EntryDecodeError> {
        let proto = ProtoAppendEntriesResult::decode(bytes).map_err(|e| EntryDecodeError::Malformed(e.to_string()))?;
        let reason = AppendEntriesErrorReason::from_i32(proto.reason)
            .ok_or_else(|| EntryDecodeError::Malformed(format!("Unknown reason {}", proto.reason)))?;
        let conflict = match (proto.conflict_term, proto.conflict_index) {
            (Some(term), Some(index)) => Some(TermIndexPair::new(LogTerm::new(term), LogIndex::new(index))),
            (None, None) => None,
            _ => return Err(EntryDecodeError::Malformed("Half a conflict hint".into())),
        };

        Ok(AppendEntriesResult {
            log_term: LogTerm::new(proto.log_term),
            message_id: MessageId::new(proto.message_id),
            reason,
            last_acked: LogIndex::new(proto.last_acked),
            conflict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::LogPayload;

    #[test]
    fn request_frame() {
        let request = AppendEntriesRequest {
            leader_term: LogTerm::new(3),
            leader_id: ParticipantId::from("leader"),
            prev_log_entry: TermIndexPair::new(LogTerm::new(2), LogIndex::new(7)),
            leader_commit: LogIndex::new(6),
            lowest_index_to_keep: LogIndex::new(2),
            message_id: MessageId::new(42),
            wait_for_sync: true,
            entries: vec![
                PersistingLogEntry::meta(LogTerm::new(3), LogIndex::new(8)),
                PersistingLogEntry::with_payload(LogTerm::new(3), LogIndex::new(9), LogPayload::create_from_string("")),
            ],
        };

        let decoded = AppendEntriesRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(decoded, request);
        assert!(decoded.entries[0].is_meta());
        assert!(!decoded.entries[1].is_meta());
    }

    #[test]
    fn result_frame_with_conflict() {
        let result = AppendEntriesResult::with_conflict(
            LogTerm::new(3),
            MessageId::new(5),
            LogIndex::new(12),
            TermIndexPair::new(LogTerm::new(2), LogIndex::new(9)),
        );
        let decoded = AppendEntriesResult::from_bytes(&result.to_bytes()).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.reason, AppendEntriesErrorReason::NoPrevLogMatch);
    }

    #[test]
    fn rejects_unknown_reason() {
        let proto = ProtoAppendEntriesResult {
            reason: 99,
            ..ProtoAppendEntriesResult::default()
        };
        let mut bytes = Vec::new();
        proto.encode(&mut bytes).unwrap();

        assert!(matches!(
            AppendEntriesResult::from_bytes(&bytes),
            Err(EntryDecodeError::Malformed(_))
        ));
    }
}
