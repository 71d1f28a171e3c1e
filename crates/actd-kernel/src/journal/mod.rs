pub mod fs;
pub mod mem;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monotonic cursor assigned to every persisted journal entry.
pub type JournalSeq = u64;

/// Classification of a journal entry, one per registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    RegisterGroup,
    UnregisterGroup,
    UpdateGroupDescriptor,
    GroupIncarnation,
    RegisterObject,
    UnregisterObject,
    UpdateObjectDescriptor,
}

/// Borrowed entry used when appending to the journal.
#[derive(Debug, Clone, Copy)]
pub struct JournalEntry<'a> {
    pub kind: JournalKind,
    pub payload: &'a [u8],
}

impl<'a> JournalEntry<'a> {
    pub fn new(kind: JournalKind, payload: &'a [u8]) -> Self {
        Self { kind, payload }
    }
}

/// Owned entry returned by journal readers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnedJournalEntry {
    pub seq: JournalSeq,
    pub kind: JournalKind,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Append-only record log with a movable head, so entries already covered by a
/// snapshot can be dropped.
pub trait Journal: Send {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError>;

    /// Loads entries starting at `from` (inclusive). Passing 0 returns the full log.
    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError>;

    /// Returns the next sequence that will be assigned on append.
    fn next_seq(&self) -> JournalSeq;

    /// Drops every entry with a sequence below `seq`. Sequence numbering is
    /// unaffected: the next append still receives `next_seq()`.
    fn truncate_before(&mut self, seq: JournalSeq) -> Result<(), JournalError>;
}

/// On-disk framing of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskRecord<'a> {
    seq: JournalSeq,
    kind: JournalKind,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}

impl<'a> From<&'a OwnedJournalEntry> for DiskRecord<'a> {
    fn from(entry: &'a OwnedJournalEntry) -> Self {
        Self {
            seq: entry.seq,
            kind: entry.kind,
            payload: &entry.payload,
        }
    }
}
