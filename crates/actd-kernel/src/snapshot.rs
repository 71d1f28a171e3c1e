use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use actd_cbor::{Hash, from_cbor, to_canonical_cbor};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::KernelError;
use crate::journal::JournalSeq;
use crate::state::RegistryState;

const SNAPSHOT_DIR: &str = "snapshot";
const SNAPSHOT_FILE: &str = "registry.snapshot";

/// Registry state as of journal sequence `height`: every entry below `height`
/// is folded in, every entry at or above it still has to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub height: JournalSeq,
    pub state: RegistryState,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    digest: String,
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
}

impl RegistrySnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, KernelError> {
        let body = to_canonical_cbor(self)?;
        let envelope = SnapshotEnvelope {
            digest: Hash::of_bytes(&body).to_hex(),
            body,
        };
        Ok(to_canonical_cbor(&envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KernelError> {
        let envelope: SnapshotEnvelope =
            from_cbor(bytes).map_err(|err| KernelError::SnapshotDecode(err.to_string()))?;
        let actual = Hash::of_bytes(&envelope.body).to_hex();
        if actual != envelope.digest {
            return Err(KernelError::SnapshotDecode(format!(
                "digest mismatch: expected {}, found {actual}",
                envelope.digest
            )));
        }
        from_cbor(&envelope.body).map_err(|err| KernelError::SnapshotDecode(err.to_string()))
    }
}

pub trait SnapshotStore: Send {
    fn load(&self) -> Result<Option<RegistrySnapshot>, KernelError>;
    /// Replaces the stored snapshot. Either the old or the new one survives a crash.
    fn store(&mut self, snapshot: &RegistrySnapshot) -> Result<(), KernelError>;
}

/// Keeps a single snapshot file under `<root>/snapshot/`.
#[derive(Debug)]
pub struct FsSnapshotStore {
    dir: PathBuf,
}

impl FsSnapshotStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, KernelError> {
        let dir = root.as_ref().join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir).map_err(io_failed)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }
}

fn io_failed(err: std::io::Error) -> KernelError {
    KernelError::SnapshotFailed(err.to_string())
}

impl SnapshotStore for FsSnapshotStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>, KernelError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes =
            fs::read(&path).map_err(|err| KernelError::SnapshotDecode(err.to_string()))?;
        RegistrySnapshot::decode(&bytes).map(Some)
    }

    fn store(&mut self, snapshot: &RegistrySnapshot) -> Result<(), KernelError> {
        let bytes = snapshot.encode()?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_failed)?;
        tmp.write_all(&bytes).map_err(io_failed)?;
        tmp.as_file().sync_all().map_err(io_failed)?;
        tmp.persist(self.path())
            .map_err(|err| io_failed(err.error))?;
        Ok(())
    }
}

/// In-memory store; clones share the stored snapshot.
#[derive(Debug, Default, Clone)]
pub struct MemSnapshotStore {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemSnapshotStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>, KernelError> {
        let slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_deref().map(RegistrySnapshot::decode).transpose()
    }

    fn store(&mut self, snapshot: &RegistrySnapshot) -> Result<(), KernelError> {
        let bytes = snapshot.encode()?;
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(bytes);
        Ok(())
    }
}
