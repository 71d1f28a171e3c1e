use actd_cbor::{from_cbor, to_canonical_cbor};

use crate::error::KernelError;
use crate::journal::{Journal, JournalEntry};
use crate::record::LogRecord;
use crate::snapshot::{RegistrySnapshot, SnapshotStore};
use crate::state::RegistryState;

/// Number of appended records between two snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 200;

/// Durable side of the registry: a journal of [`LogRecord`]s plus the latest
/// snapshot that lets the journal be cut back.
pub struct ActivationLog {
    journal: Box<dyn Journal>,
    snapshots: Box<dyn SnapshotStore>,
    snapshot_interval: u64,
    updates: u64,
}

impl ActivationLog {
    pub fn new(journal: Box<dyn Journal>, snapshots: Box<dyn SnapshotStore>) -> Self {
        Self {
            journal,
            snapshots,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            updates: 0,
        }
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval.max(1);
        self
    }

    /// Rebuilds the registry from the latest snapshot and the journal tail.
    ///
    /// `fresh` supplies the state used when no snapshot exists yet; that state
    /// is snapshotted right away so its system id survives the next restart.
    /// A record that cannot be decoded or applied is skipped with a warning.
    pub fn recover(
        &mut self,
        fresh: impl FnOnce() -> RegistryState,
    ) -> Result<RegistryState, KernelError> {
        let loaded = self.snapshots.load()?;
        let first_boot = loaded.is_none();
        let (height, mut state) = match loaded {
            Some(snapshot) => (snapshot.height, snapshot.state),
            None => (0, fresh()),
        };
        let entries = self.journal.load_from(height)?;
        let mut replayed = 0u64;
        for entry in entries {
            let record: LogRecord = match from_cbor(&entry.payload) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("skipping undecodable log record {}: {err}", entry.seq);
                    continue;
                }
            };
            if let Err(err) = record.apply(&mut state) {
                log::warn!(
                    "log recovery: {:?} record {} not applied: {err}",
                    record.kind(),
                    entry.seq
                );
            }
            replayed += 1;
        }
        self.updates = replayed;
        if first_boot {
            self.snapshot(&state)?;
        }
        log::info!(
            "registry recovered at height {height} with {replayed} replayed records ({} groups, {} objects)",
            state.group_count(),
            state.object_count()
        );
        Ok(state)
    }

    /// Writes `record`, which the caller has already applied to `state`.
    ///
    /// A failed append is only logged and forces the next snapshot; a failed
    /// snapshot is returned as [`KernelError::SnapshotFailed`].
    pub fn append(&mut self, record: &LogRecord, state: &RegistryState) -> Result<(), KernelError> {
        let written = to_canonical_cbor(record)
            .map_err(KernelError::from)
            .and_then(|payload| {
                self.journal
                    .append(JournalEntry::new(record.kind(), &payload))
                    .map_err(KernelError::from)
            });
        match written {
            Ok(_) => self.updates += 1,
            Err(err) => {
                log::warn!("log append failed, forcing snapshot: {err}");
                self.updates = self.snapshot_interval;
            }
        }
        if self.updates >= self.snapshot_interval {
            self.snapshot(state)?;
        }
        Ok(())
    }

    /// Persists `state` as covering everything journaled so far, then cuts the
    /// journal back to the snapshot height.
    pub fn snapshot(&mut self, state: &RegistryState) -> Result<(), KernelError> {
        let snapshot = RegistrySnapshot {
            height: self.journal.next_seq(),
            state: state.clone(),
        };
        self.snapshots
            .store(&snapshot)
            .map_err(|err| KernelError::SnapshotFailed(err.to_string()))?;
        self.updates = 0;
        if let Err(err) = self.journal.truncate_before(snapshot.height) {
            log::warn!(
                "snapshot at height {} stored but journal truncation failed: {err}",
                snapshot.height
            );
        }
        log::debug!("registry snapshot taken at height {}", snapshot.height);
        Ok(())
    }

    pub fn pending_updates(&self) -> u64 {
        self.updates
    }
}
