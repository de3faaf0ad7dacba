use crate::replica::LogIndex;

/// Byte representation of a log entry key:
///
/// ```text
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 10| 11| 12| 13| 14| 15|
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
/// |      Object ID (8 bytes, BE)      |     Log Index (8 bytes, BE)   |
/// +-----------------------------------+-------------------------------+
/// ```
///
/// Big-endian, so lexicographic key order is (object, index) order and a range scan over one
/// object's prefix walks its log front to back.
pub(crate) type EntryKey = [u8; 16];

/// Metadata records are keyed by object ID alone, in their own column.
pub(crate) type MetadataKey = [u8; 8];

pub(crate) fn entry_key(object_id: u64, index: LogIndex) -> EntryKey {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&object_id.to_be_bytes());
    key[8..].copy_from_slice(&index.as_u64().to_be_bytes());
    key
}

pub(crate) fn metadata_key(object_id: u64) -> MetadataKey {
    object_id.to_be_bytes()
}

pub(crate) fn index_of_key(key: &EntryKey) -> LogIndex {
    let mut index = [0u8; 8];
    index.copy_from_slice(&key[8..]);
    LogIndex::new(u64::from_be_bytes(index))
}
