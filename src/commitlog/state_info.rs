use crate::commitlog::StorageError;
use crate::replica::LogId;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SnapshotStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl Default for SnapshotStatus {
    fn default() -> Self {
        SnapshotStatus::NotStarted
    }
}

impl SnapshotStatus {
    fn as_i32(self) -> i32 {
        match self {
            SnapshotStatus::NotStarted => 0,
            SnapshotStatus::InProgress => 1,
            SnapshotStatus::Completed => 2,
            SnapshotStatus::Failed => 3,
        }
    }

    fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(SnapshotStatus::NotStarted),
            1 => Some(SnapshotStatus::InProgress),
            2 => Some(SnapshotStatus::Completed),
            3 => Some(SnapshotStatus::Failed),
            _ => None,
        }
    }
}

/// PersistedStateInfo is the metadata record stored next to a log. It survives restarts, which is
/// how a follower knows whether its local state was ever brought up to date by a snapshot.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PersistedStateInfo {
    pub log_id: LogId,
    pub generation: u64,
    pub snapshot_status: SnapshotStatus,
    pub snapshot_updated_at: Option<DateTime<Utc>>,
}

impl PersistedStateInfo {
    pub fn new(log_id: LogId) -> Self {
        PersistedStateInfo {
            log_id,
            ..PersistedStateInfo::default()
        }
    }

    pub fn with_snapshot_status(&self, status: SnapshotStatus) -> Self {
        PersistedStateInfo {
            snapshot_status: status,
            snapshot_updated_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub(crate) fn to_record(&self) -> Vec<u8> {
        let proto = ProtoPersistedStateInfo {
            log_id: self.log_id.as_u64(),
            generation: self.generation,
            snapshot_status: self.snapshot_status.as_i32(),
            snapshot_updated_at_millis: self.snapshot_updated_at.map(|t| t.timestamp_millis()),
        };
        let mut bytes = Vec::with_capacity(proto.encoded_len());
        let _ = proto.encode(&mut bytes);
        bytes
    }

    pub(crate) fn from_record(bytes: &[u8]) -> Result<Self, StorageError> {
        let proto =
            ProtoPersistedStateInfo::decode(bytes).map_err(|e| StorageError::CorruptMetadata(e.to_string()))?;
        let snapshot_status = SnapshotStatus::from_i32(proto.snapshot_status).ok_or_else(|| {
            StorageError::CorruptMetadata(format!("Unknown snapshot status {}", proto.snapshot_status))
        })?;

        let snapshot_updated_at = match proto.snapshot_updated_at_millis {
            Some(ms) => Some(Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
                StorageError::CorruptMetadata(format!("Snapshot timestamp {} out of range", ms))
            })?),
            None => None,
        };

        Ok(PersistedStateInfo {
            log_id: LogId::new(proto.log_id),
            generation: proto.generation,
            snapshot_status,
            snapshot_updated_at,
        })
    }
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoPersistedStateInfo {
    #[prost(uint64, tag = "1")]
    log_id: u64,
    #[prost(uint64, tag = "2")]
    generation: u64,
    #[prost(int32, tag = "3")]
    snapshot_status: i32,
    #[prost(int64, optional, tag = "4")]
    snapshot_updated_at_millis: Option<i64>,
}
