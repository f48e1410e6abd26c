//! Write-ahead journal.
//!
//! Namespace mutations are recorded as [`JournalEntry`] values and written to
//! a [`Journal`] sink. Two sinks are provided:
//!
//! - [`MemoryJournal`]: keeps entries in memory; used by tests and embedded
//!   masters that do not need crash recovery.
//! - [`FileJournal`]: appends length-prefixed bincode frames to a file and
//!   syncs on flush; replaying the file rebuilds the namespace.

mod context;
mod entry;

pub use context::{BlockDeletionContext, JournalContext, TransactionContext};
pub use entry::{DirectoryUpdate, FileUpdate, InodeUpdate, JournalEntry, XAttrPatch};

use crate::error::{CanopyError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Durable sink for journal entries.
pub trait Journal: Send + Sync {
    /// Append entries; returns the sequence number of the last one.
    fn write(&self, entries: &[JournalEntry]) -> Result<u64>;

    /// Make every written entry durable.
    fn flush(&self) -> Result<()>;

    /// Read back every durable entry in order.
    fn replay(&self) -> Result<Vec<JournalEntry>>;

    /// Sequence number of the last written entry, 0 if none.
    fn last_sequence(&self) -> u64;
}

/// A framed journal record.
///
/// The entry is stored pre-encoded so a reader can skip records without
/// decoding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRecord {
    sequence: u64,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// In-memory journal.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
    flushes: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every written entry.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Number of written entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of flush calls.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Simulate a journal outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CanopyError::Unavailable("Journal is not running".to_string()));
        }
        Ok(())
    }
}

impl Journal for MemoryJournal {
    fn write(&self, entries: &[JournalEntry]) -> Result<u64> {
        self.check_available()?;
        let mut log = self.entries.lock();
        log.extend_from_slice(entries);
        Ok(log.len() as u64)
    }

    fn flush(&self) -> Result<()> {
        self.check_available()?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalEntry>> {
        Ok(self.entries())
    }

    fn last_sequence(&self) -> u64 {
        self.entries.lock().len() as u64
    }
}

/// File-backed journal.
pub struct FileJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sequence: AtomicU64,
}

impl FileJournal {
    /// Open or create a journal file, continuing after its last record.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing = if path.exists() {
            let (records, valid_len) = read_records(&path)?;
            // Drop a torn tail so new frames follow the last complete one.
            OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
            records.len() as u64
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), entries = existing, "Opened journal");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            sequence: AtomicU64::new(existing),
        })
    }

    /// Location of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn write(&self, entries: &[JournalEntry]) -> Result<u64> {
        let mut writer = self.writer.lock();
        let mut last = self.sequence.load(Ordering::SeqCst);
        for entry in entries {
            last += 1;
            let record = JournalRecord {
                sequence: last,
                payload: bincode::serialize(entry)?,
            };
            let frame = bincode::serialize(&record)?;
            writer.write_all(&(frame.len() as u32).to_le_bytes())?;
            writer.write_all(&frame)?;
        }
        self.sequence.store(last, Ordering::SeqCst);
        Ok(last)
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        debug!(sequence = self.sequence.load(Ordering::SeqCst), "Flushed journal");
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalEntry>> {
        self.writer.lock().flush()?;
        read_records(&self.path)?
            .0
            .into_iter()
            .map(|record| Ok(bincode::deserialize(&record.payload)?))
            .collect()
    }

    fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

/// Read every complete frame and the byte length they cover; a torn
/// trailing frame is ignored.
fn read_records(path: &Path) -> Result<(Vec<JournalRecord>, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        match reader.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!(path = %path.display(), "Ignoring torn journal frame");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let record: JournalRecord = bincode::deserialize(&frame)?;
        let expected = records.len() as u64 + 1;
        if record.sequence != expected {
            return Err(CanopyError::Internal(format!(
                "Journal sequence gap: expected {}, got {}",
                expected, record.sequence
            )));
        }
        records.push(record);
        valid_len += 4 + len as u64;
    }
    Ok((records, valid_len))
}
