use crate::replica::{InMemoryLogEntry, LogIndex, LogRange, LogTerm, PersistingLogEntry, TermIndexPair};
use std::fmt;

/// InMemoryLog is an immutable view of a contiguous run of log entries. Every "mutation" returns
/// a new value that shares structure with the old one, so a reader holding an older InMemoryLog
/// keeps seeing exactly what it saw, regardless of later appends or truncations.
///
/// The log keeps track of its first index even when empty, so an empty log still knows where
/// the next entry has to go.
#[derive(Clone)]
pub struct InMemoryLog {
    log: im::Vector<InMemoryLogEntry>,
    first_index: LogIndex,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        InMemoryLog::empty_at(LogIndex::start_index())
    }
}

impl InMemoryLog {
    pub fn empty_at(first_index: LogIndex) -> Self {
        InMemoryLog {
            log: im::Vector::new(),
            first_index,
        }
    }

    /// Builds a log from entries with consecutive indexes. Returns None if the indexes have gaps
    /// or go backwards.
    pub fn from_entries<I>(entries: I) -> Option<Self>
    where
        I: IntoIterator<Item = InMemoryLogEntry>,
    {
        let mut log = im::Vector::new();
        let mut first_index = None;
        let mut expected = LogIndex::default();
        for entry in entries {
            match first_index {
                None => first_index = Some(entry.log_index()),
                Some(_) if entry.log_index() != expected => return None,
                Some(_) => {}
            }
            expected = entry.log_index().plus(1);
            log.push_back(entry);
        }

        Some(InMemoryLog {
            log,
            first_index: first_index.unwrap_or_else(LogIndex::start_index),
        })
    }

    pub fn from_persisted<I>(entries: I) -> Option<Self>
    where
        I: IntoIterator<Item = PersistingLogEntry>,
    {
        Self::from_entries(entries.into_iter().map(InMemoryLogEntry::from))
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Index of the last entry, or the index just before the first index if the log is empty.
    pub fn last_index(&self) -> LogIndex {
        self.next_index().saturating_minus(1)
    }

    pub fn next_index(&self) -> LogIndex {
        self.first_index.plus(self.log.len() as u64)
    }

    pub fn range(&self) -> LogRange {
        LogRange::new(self.first_index, self.next_index())
    }

    pub fn last_term_index_pair(&self) -> TermIndexPair {
        self.log
            .last()
            .map(|e| e.entry().log_term_index_pair())
            .unwrap_or_default()
    }

    pub fn get(&self, index: LogIndex) -> Option<&InMemoryLogEntry> {
        self.position(index).and_then(|pos| self.log.get(pos))
    }

    pub fn term_of(&self, index: LogIndex) -> Option<LogTerm> {
        self.get(index).map(InMemoryLogEntry::log_term)
    }

    /// Lowest index of the run of entries with the same term as the entry at `index`.
    pub fn first_index_of_term_at(&self, index: LogIndex) -> Option<LogIndex> {
        let term = self.term_of(index)?;
        let mut first = index;
        while let Some(prev) = first.checked_minus(1) {
            match self.term_of(prev) {
                Some(t) if t == term => first = prev,
                _ => break,
            }
        }
        Some(first)
    }

    pub fn append(&self, entry: InMemoryLogEntry) -> Self {
        assert_eq!(
            entry.log_index(),
            self.next_index(),
            "Appended entry must continue the log"
        );
        let mut log = self.log.clone();
        log.push_back(entry);
        InMemoryLog {
            log,
            first_index: self.first_index,
        }
    }

    /// Concatenates `other` onto this log. An empty self takes on `other`'s position.
    pub fn append_log(&self, other: &InMemoryLog) -> Self {
        if self.is_empty() {
            if other.is_empty() {
                return InMemoryLog::empty_at(std::cmp::max(self.first_index, other.first_index));
            }
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        assert_eq!(
            other.first_index,
            self.next_index(),
            "Appended log must continue the log"
        );
        let mut log = self.log.clone();
        log.append(other.log.clone());
        InMemoryLog {
            log,
            first_index: self.first_index,
        }
    }

    /// Entries in `range`, clamped to what this log holds.
    pub fn slice(&self, range: LogRange) -> Self {
        let clamped = self.range().intersect(&range);
        if clamped.is_empty() {
            let at = std::cmp::min(std::cmp::max(range.from, self.first_index), self.next_index());
            return InMemoryLog::empty_at(at);
        }
        let skip = self.first_index.distance_to(clamped.from) as usize;
        let take = clamped.count() as usize;
        InMemoryLog {
            log: self.log.skip(skip).take(take),
            first_index: clamped.from,
        }
    }

    /// Entries with index `>= from`.
    pub fn slice_from(&self, from: LogIndex) -> Self {
        self.slice(LogRange::new(from, self.next_index()))
    }

    /// Entries with index `< to`.
    pub fn slice_to(&self, to: LogIndex) -> Self {
        self.slice(LogRange::new(self.first_index, to))
    }

    /// Snapshot of the log up to and including `index`.
    pub fn take_snapshot_up_to(&self, index: LogIndex) -> Self {
        self.slice_to(index.plus(1))
    }

    /// Drops every entry strictly below `stop`. Removing past the end leaves an empty log that
    /// continues at `stop`.
    pub fn remove_front(&self, stop: LogIndex) -> Self {
        if stop <= self.first_index {
            return self.clone();
        }
        if stop >= self.next_index() {
            return InMemoryLog::empty_at(stop);
        }
        self.slice_from(stop)
    }

    /// Drops every entry at or above `start`.
    pub fn remove_back(&self, start: LogIndex) -> Self {
        if start <= self.first_index {
            return InMemoryLog::empty_at(self.first_index);
        }
        self.slice_to(start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InMemoryLogEntry> + '_ {
        self.log.iter()
    }

    pub fn iter_from(&self, from: LogIndex) -> impl Iterator<Item = &InMemoryLogEntry> + '_ {
        let skip = self.first_index.distance_to(from) as usize;
        self.log.iter().skip(skip)
    }

    pub fn persisted_entries(&self) -> Vec<PersistingLogEntry> {
        self.log.iter().map(|e| e.entry().clone()).collect()
    }

    /// True if any entry in the log asked for a durable sync.
    pub fn requires_sync(&self) -> bool {
        self.log.iter().any(InMemoryLogEntry::wait_for_sync)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if self.range().contains(index) {
            Some(self.first_index.distance_to(index) as usize)
        } else {
            None
        }
    }
}

impl fmt::Debug for InMemoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InMemoryLog{:?}", self.range())
    }
}
