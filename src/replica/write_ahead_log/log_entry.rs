use crate::replica::{LogIndex, LogTerm, TermIndexPair};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost::Message;
use std::fmt;

/// LogPayload is the opaque application data carried by a log entry.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct LogPayload(Bytes);

impl LogPayload {
    pub fn create_from_string(data: &str) -> Self {
        LogPayload(Bytes::copy_from_slice(data.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn byte_size(&self) -> usize {
        self.0.len()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for LogPayload {
    fn from(bytes: Bytes) -> Self {
        LogPayload(bytes)
    }
}

impl From<Vec<u8>> for LogPayload {
    fn from(bytes: Vec<u8>) -> Self {
        LogPayload(Bytes::from(bytes))
    }
}

impl fmt::Debug for LogPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogPayload({} bytes)", self.0.len())
    }
}

/// PersistingLogEntry is the part of an entry that is written to disk and shipped to followers.
/// An entry without a payload is a meta-entry, e.g. the entry a new leader writes to stake its
/// term. A meta-entry is not the same thing as an entry with an empty payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistingLogEntry {
    term_index: TermIndexPair,
    payload: Option<LogPayload>,
}

impl PersistingLogEntry {
    pub fn new(term: LogTerm, index: LogIndex, payload: Option<LogPayload>) -> Self {
        PersistingLogEntry {
            term_index: TermIndexPair::new(term, index),
            payload,
        }
    }

    pub fn with_payload(term: LogTerm, index: LogIndex, payload: LogPayload) -> Self {
        Self::new(term, index, Some(payload))
    }

    pub fn meta(term: LogTerm, index: LogIndex) -> Self {
        Self::new(term, index, None)
    }

    pub fn log_term(&self) -> LogTerm {
        self.term_index.term
    }

    pub fn log_index(&self) -> LogIndex {
        self.term_index.index
    }

    pub fn log_term_index_pair(&self) -> TermIndexPair {
        self.term_index
    }

    pub fn payload(&self) -> Option<&LogPayload> {
        self.payload.as_ref()
    }

    pub fn is_meta(&self) -> bool {
        self.payload.is_none()
    }

    /// Rough in-memory footprint of the entry.
    pub fn approx_byte_size(&self) -> usize {
        let header = 2 * std::mem::size_of::<u64>();
        header + self.payload.as_ref().map(LogPayload::byte_size).unwrap_or(0)
    }

    /// Byte representation of a record:
    ///
    /// ```text
    /// | 0 | 1 | 2 | ...                                   |
    /// +---+---+---+-----------------------------------...-+
    /// |Vrs|  ProtoLogEntry (protobuf, variable size)  ... |
    /// +---+-------------------------------------------...-+
    /// ```
    ///
    /// * `Vrs` - version of the serialized record
    /// * `ProtoLogEntry` - term, index (absent for [`EntrySerialization::OmitLogIndex`]), and
    ///   payload (absent for meta-entries)
    ///
    /// Not needed:
    ///
    /// * Checksum. The storage engine guarantees record integrity.
    /// * Length prefix. The storage engine hands back exactly the record's bytes.
    pub fn to_record(&self, serialization: EntrySerialization) -> Vec<u8> {
        let proto = self.to_proto(serialization);
        let mut bytes = Vec::with_capacity(1 + proto.encoded_len());
        bytes.push(LOG_ENTRY_FORMAT_VERSION);
        // Encoding into a Vec can only fail on insufficient capacity, which Vec grows past.
        let _ = proto.encode(&mut bytes);
        bytes
    }

    /// `implied_index` is the index known from the record's position, required for records
    /// written with [`EntrySerialization::OmitLogIndex`].
    pub fn from_record(bytes: &[u8], implied_index: Option<LogIndex>) -> Result<Self, EntryDecodeError> {
        match bytes.first() {
            None => Err(EntryDecodeError::Empty),
            Some(&LOG_ENTRY_FORMAT_VERSION) => {
                let proto = ProtoLogEntry::decode(&bytes[1..])
                    .map_err(|e| EntryDecodeError::Malformed(e.to_string()))?;
                Self::from_proto(proto, implied_index)
            }
            Some(other) => Err(EntryDecodeError::UnsupportedVersion(*other)),
        }
    }

    pub(crate) fn to_proto(&self, serialization: EntrySerialization) -> ProtoLogEntry {
        ProtoLogEntry {
            term: self.log_term().as_u64(),
            index: match serialization {
                EntrySerialization::Full => Some(self.log_index().as_u64()),
                EntrySerialization::OmitLogIndex => None,
            },
            payload: self.payload.as_ref().map(|p| p.as_bytes().to_vec()),
        }
    }

    pub(crate) fn from_proto(proto: ProtoLogEntry, implied_index: Option<LogIndex>) -> Result<Self, EntryDecodeError> {
        let index = match (proto.index.map(LogIndex::new), implied_index) {
            (Some(recorded), Some(implied)) if recorded != implied => {
                return Err(EntryDecodeError::IndexMismatch { recorded, implied });
            }
            (Some(index), _) | (None, Some(index)) => index,
            (None, None) => return Err(EntryDecodeError::MissingIndex),
        };

        Ok(PersistingLogEntry::new(
            LogTerm::new(proto.term),
            index,
            proto.payload.map(LogPayload::from),
        ))
    }
}

const LOG_ENTRY_FORMAT_VERSION: u8 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntrySerialization {
    Full,
    /// The index is implied by the record's key, so it's not written again.
    OmitLogIndex,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProtoLogEntry {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, optional, tag = "2")]
    pub index: Option<u64>,
    #[prost(bytes, optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EntryDecodeError {
    #[error("Entry record is empty")]
    Empty,
    #[error("Unsupported entry record version {0}")]
    UnsupportedVersion(u8),
    #[error("Malformed entry record: {0}")]
    Malformed(String),
    #[error("Entry record has no index and none is implied by its position")]
    MissingIndex,
    #[error("Entry record says index {recorded:?} but is stored at {implied:?}")]
    IndexMismatch { recorded: LogIndex, implied: LogIndex },
}

/// InMemoryLogEntry adds bookkeeping that is never persisted: when the entry was inserted on
/// this server and whether the inserter asked for a durable sync.
#[derive(Clone, Debug)]
pub struct InMemoryLogEntry {
    entry: PersistingLogEntry,
    insert_tp: DateTime<Utc>,
    wait_for_sync: bool,
}

impl InMemoryLogEntry {
    pub fn new(entry: PersistingLogEntry, wait_for_sync: bool) -> Self {
        InMemoryLogEntry {
            entry,
            insert_tp: Utc::now(),
            wait_for_sync,
        }
    }

    pub fn entry(&self) -> &PersistingLogEntry {
        &self.entry
    }

    pub fn into_entry(self) -> PersistingLogEntry {
        self.entry
    }

    pub fn insert_tp(&self) -> DateTime<Utc> {
        self.insert_tp
    }

    pub fn wait_for_sync(&self) -> bool {
        self.wait_for_sync
    }

    pub fn log_index(&self) -> LogIndex {
        self.entry.log_index()
    }

    pub fn log_term(&self) -> LogTerm {
        self.entry.log_term()
    }
}

impl From<PersistingLogEntry> for InMemoryLogEntry {
    fn from(entry: PersistingLogEntry) -> Self {
        InMemoryLogEntry::new(entry, false)
    }
}
