use std::fmt;

/// LogTerm identifies a leadership epoch of a replicated log. Terms strictly increase over the
/// lifetime of a log. Term 0 is never led by anyone and is used for "no entry".
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct LogTerm(u64);

impl LogTerm {
    pub const fn new(term: u64) -> Self {
        LogTerm(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> LogTerm {
        LogTerm(self.0 + 1)
    }
}

impl fmt::Debug for LogTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// LogIndex is the position of an entry in the log. The first entry of a log is written at
/// index 1, so index 0 means "nothing" (e.g. a commit index before anything was committed).
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const fn new(index: u64) -> Self {
        LogIndex(index)
    }

    pub fn start_index() -> Self {
        LogIndex(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> LogIndex {
        LogIndex(self.0 + delta)
    }

    pub fn saturating_minus(&self, delta: u64) -> LogIndex {
        LogIndex(self.0.saturating_sub(delta))
    }

    pub fn checked_minus(&self, delta: u64) -> Option<LogIndex> {
        self.0.checked_sub(delta).map(LogIndex)
    }

    /// Number of indexes between self and a later index.
    pub fn distance_to(&self, later: LogIndex) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Debug for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TermIndexPair orders lexicographically: first by term, then by index.
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct TermIndexPair {
    pub term: LogTerm,
    pub index: LogIndex,
}

impl TermIndexPair {
    pub fn new(term: LogTerm, index: LogIndex) -> Self {
        TermIndexPair { term, index }
    }
}

impl fmt::Debug for TermIndexPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{})", self.term.0, self.index.0)
    }
}

/// LogRange is the half-open interval `[from, to)` of log indexes.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct LogRange {
    pub from: LogIndex,
    pub to: LogIndex,
}

impl LogRange {
    /// A `to` below `from` collapses into the empty range at `from`.
    pub fn new(from: LogIndex, to: LogIndex) -> Self {
        LogRange {
            from,
            to: std::cmp::max(from, to),
        }
    }

    pub fn empty_at(index: LogIndex) -> Self {
        LogRange { from: index, to: index }
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    pub fn count(&self) -> u64 {
        self.from.distance_to(self.to)
    }

    pub fn contains(&self, index: LogIndex) -> bool {
        self.from <= index && index < self.to
    }

    pub fn intersect(&self, other: &LogRange) -> LogRange {
        let from = std::cmp::max(self.from, other.from);
        let to = std::cmp::min(self.to, other.to);
        LogRange::new(from, to)
    }
}

impl fmt::Debug for LogRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from.0, self.to.0)
    }
}

/// ParticipantId is the name of a server participating in a replicated log.
#[derive(Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        ParticipantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        ParticipantId(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        ParticipantId(id)
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct LogId(u64);

impl LogId {
    pub const fn new(id: u64) -> Self {
        LogId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// MessageId is a leader's logical clock for the append-entries requests it sends. A follower
/// drops any request that is not newer than the last one it accepted.
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn new(id: u64) -> Self {
        MessageId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> MessageId {
        MessageId(self.0 + 1)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
