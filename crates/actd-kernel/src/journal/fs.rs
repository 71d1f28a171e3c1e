use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use actd_cbor::to_canonical_cbor;
use tempfile::NamedTempFile;

use super::{DiskRecord, Journal, JournalEntry, JournalError, JournalSeq, OwnedJournalEntry};

const JOURNAL_DIR: &str = "journal";
const JOURNAL_FILE: &str = "journal.log";
const BASE_FILE: &str = "journal.base";

/// Filesystem-backed journal that stores length-prefixed canonical CBOR records.
///
/// A record cut short by a crash mid-append is dropped on open; a complete
/// record that fails to decode is reported as corruption.
#[derive(Debug)]
pub struct FsJournal {
    dir: PathBuf,
    path: PathBuf,
    next_seq: JournalSeq,
}

impl FsJournal {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = root.as_ref().join(JOURNAL_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(JOURNAL_FILE);
        if !path.exists() {
            File::create(&path)?;
        }
        let scan = scan_records(&fs::read(&path)?)?;
        if let Some(valid_len) = scan.torn_at {
            log::warn!(
                "dropping torn trailing record in {} at byte {valid_len}",
                path.display()
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let base = read_base(&dir)?;
        let next_seq = scan
            .entries
            .last()
            .map(|entry| entry.seq + 1)
            .unwrap_or(0)
            .max(base);
        Ok(Self {
            dir,
            path,
            next_seq,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        let scan = scan_records(&fs::read(&self.path)?)?;
        if scan.torn_at.is_some() {
            return Err(JournalError::Corrupt("truncated entry payload".into()));
        }
        Ok(scan.entries)
    }
}

impl Journal for FsJournal {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let seq = self.next_seq;
        let record = DiskRecord {
            seq,
            kind: entry.kind,
            payload: entry.payload,
        };
        let bytes = frame(&record)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        let len_before = file.metadata()?.len();
        if let Err(err) = file.write_all(&bytes).and_then(|()| file.sync_all()) {
            // A partial frame would hide every later record behind a torn tail.
            if let Err(rollback) = file.set_len(len_before) {
                log::error!(
                    "could not roll back partial record in {}: {rollback}",
                    self.path.display()
                );
            }
            return Err(err.into());
        }
        self.next_seq += 1;
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        let mut entries = self.read_all()?;
        entries.retain(|entry| entry.seq >= from);
        Ok(entries)
    }

    fn next_seq(&self) -> JournalSeq {
        self.next_seq
    }

    fn truncate_before(&mut self, seq: JournalSeq) -> Result<(), JournalError> {
        let mut kept = Vec::new();
        if seq < self.next_seq {
            for entry in self.read_all()?.iter().filter(|entry| entry.seq >= seq) {
                kept.extend_from_slice(&frame(&DiskRecord::from(entry))?);
            }
        }
        // Base first: if we crash between the two renames, reopening still
        // yields a sequence at or past everything the snapshot covers.
        write_atomic(&self.dir, &self.dir.join(BASE_FILE), &seq.to_le_bytes())?;
        write_atomic(&self.dir, &self.path, &kept)?;
        Ok(())
    }
}

fn frame(record: &DiskRecord<'_>) -> Result<Vec<u8>, JournalError> {
    let bytes = to_canonical_cbor(record)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| JournalError::Corrupt("entry larger than 4GiB".into()))?;
    let mut out = Vec::with_capacity(bytes.len() + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&bytes);
    Ok(out)
}

struct Scan {
    entries: Vec<OwnedJournalEntry>,
    /// Byte offset of an incomplete trailing record, if any.
    torn_at: Option<u64>,
}

fn scan_records(bytes: &[u8]) -> Result<Scan, JournalError> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        let Some(header) = rest.get(..4) else {
            return Ok(Scan {
                entries,
                torn_at: Some(offset as u64),
            });
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let Some(body) = rest.get(4..4 + len) else {
            return Ok(Scan {
                entries,
                torn_at: Some(offset as u64),
            });
        };
        let entry: OwnedJournalEntry = serde_cbor::from_slice(body).map_err(|err| {
            JournalError::Corrupt(format!("undecodable record at byte {offset}: {err}"))
        })?;
        entries.push(entry);
        offset += 4 + len;
    }
    Ok(Scan {
        entries,
        torn_at: None,
    })
}

fn read_base(dir: &Path) -> Result<JournalSeq, JournalError> {
    let path = dir.join(BASE_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let bytes = fs::read(&path)?;
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| JournalError::Corrupt(format!("bad base marker in {}", path.display())))?;
    Ok(u64::from_le_bytes(raw))
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), JournalError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|err| JournalError::Io(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalKind;
    use tempfile::TempDir;

    #[test]
    fn writes_and_recovers_entries() {
        let tmp = TempDir::new().unwrap();
        let mut journal = FsJournal::open(tmp.path()).unwrap();
        assert_eq!(journal.next_seq(), 0);
        journal
            .append(JournalEntry::new(JournalKind::RegisterGroup, b"a"))
            .unwrap();
        journal
            .append(JournalEntry::new(JournalKind::RegisterObject, b"b"))
            .unwrap();

        let again = FsJournal::open(tmp.path()).unwrap();
        assert_eq!(again.next_seq(), 2);
        let entries = again.load_from(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[0].payload, b"a");
        assert_eq!(entries[1].kind, JournalKind::RegisterObject);
    }

    #[test]
    fn torn_tail_is_dropped_on_open() {
        let tmp = TempDir::new().unwrap();
        {
            let mut journal = FsJournal::open(tmp.path()).unwrap();
            journal
                .append(JournalEntry::new(JournalKind::RegisterGroup, b"kept"))
                .unwrap();
            journal
                .append(JournalEntry::new(JournalKind::RegisterObject, b"torn"))
                .unwrap();
        }

        let log_path = tmp.path().join(JOURNAL_DIR).join(JOURNAL_FILE);
        let len = std::fs::metadata(&log_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&log_path).unwrap();
        file.set_len(len - 1).unwrap();

        let mut journal = FsJournal::open(tmp.path()).unwrap();
        assert_eq!(journal.next_seq(), 1);
        let entries = journal.load_from(0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"kept");

        assert_eq!(
            journal
                .append(JournalEntry::new(JournalKind::RegisterObject, b"again"))
                .unwrap(),
            1
        );
    }

    #[test]
    fn corrupt_complete_record_is_an_error() {
        let tmp = TempDir::new().unwrap();
        FsJournal::open(tmp.path()).unwrap();
        let log_path = tmp.path().join(JOURNAL_DIR).join(JOURNAL_FILE);
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        std::fs::write(&log_path, bytes).unwrap();

        let err = FsJournal::open(tmp.path()).unwrap_err();
        assert!(matches!(err, JournalError::Corrupt(_)));
    }

    #[test]
    fn full_truncation_clears_partial_records() {
        let tmp = TempDir::new().unwrap();
        let mut journal = FsJournal::open(tmp.path()).unwrap();
        journal
            .append(JournalEntry::new(JournalKind::RegisterGroup, b"zero"))
            .unwrap();

        // Leftover of a write that died halfway through the frame.
        let mut file = OpenOptions::new().append(true).open(journal.path()).unwrap();
        file.write_all(&[0x20, 0x00]).unwrap();
        drop(file);

        let height = journal.next_seq();
        journal.truncate_before(height).unwrap();
        journal
            .append(JournalEntry::new(JournalKind::RegisterObject, b"one"))
            .unwrap();
        journal
            .append(JournalEntry::new(JournalKind::RegisterObject, b"two"))
            .unwrap();

        let reopened = FsJournal::open(tmp.path()).unwrap();
        assert_eq!(reopened.next_seq(), 3);
        let payloads: Vec<_> = reopened
            .load_from(0)
            .unwrap()
            .into_iter()
            .map(|entry| entry.payload)
            .collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn truncation_keeps_sequence_numbering() {
        let tmp = TempDir::new().unwrap();
        let mut journal = FsJournal::open(tmp.path()).unwrap();
        for payload in [b"one".as_ref(), b"two", b"three"] {
            journal
                .append(JournalEntry::new(JournalKind::RegisterObject, payload))
                .unwrap();
        }
        journal.truncate_before(3).unwrap();
        assert!(journal.load_from(0).unwrap().is_empty());

        let mut reopened = FsJournal::open(tmp.path()).unwrap();
        assert_eq!(reopened.next_seq(), 3);
        let seq = reopened
            .append(JournalEntry::new(JournalKind::UnregisterObject, b"four"))
            .unwrap();
        assert_eq!(seq, 3);
        reopened.truncate_before(3).unwrap();
        let entries = reopened.load_from(0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"four");
    }
}
