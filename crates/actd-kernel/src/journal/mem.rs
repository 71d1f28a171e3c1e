use std::sync::{Arc, Mutex, MutexGuard};

use super::{Journal, JournalEntry, JournalError, JournalSeq, OwnedJournalEntry};

#[derive(Debug, Default)]
struct MemLog {
    entries: Vec<OwnedJournalEntry>,
    next_seq: JournalSeq,
}

/// In-memory journal. Clones share storage, so a test can keep a handle and
/// "reopen" the log by handing another clone to a fresh registry.
#[derive(Debug, Default, Clone)]
pub struct MemJournal {
    log: Arc<Mutex<MemLog>>,
}

impl MemJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<OwnedJournalEntry> {
        self.lock().entries.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Journal for MemJournal {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let mut log = self.lock();
        let seq = log.next_seq;
        log.entries.push(OwnedJournalEntry {
            seq,
            kind: entry.kind,
            payload: entry.payload.to_vec(),
        });
        log.next_seq += 1;
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        Ok(self
            .entries()
            .into_iter()
            .filter(|entry| entry.seq >= from)
            .collect())
    }

    fn next_seq(&self) -> JournalSeq {
        self.lock().next_seq
    }

    fn truncate_before(&mut self, seq: JournalSeq) -> Result<(), JournalError> {
        self.lock().entries.retain(|entry| entry.seq >= seq);
        Ok(())
    }
}
