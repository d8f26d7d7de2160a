//! Append-only chain log file.
//!
//! The file holds the record stream byte-identical to what the transport
//! ships, so a cold start can replay it through the same scanner before any
//! peer is reachable.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::chain::record::ChainRecord;
use crate::chain::scan::ChainScanner;
use crate::error::{ChainError, Result};

const REPLAY_CHUNK_BYTES: usize = 8 * 1024;

pub struct ChainLog {
    path: PathBuf,
    file: File,
    fsync_every_n_records: usize,
    pending_since_sync: usize,
}

/// What replay found in the file.
pub struct ReplayOutcome {
    pub records: Vec<ChainRecord>,
    /// Offset of the last complete record boundary.
    pub confirmed_bytes: u64,
    /// Length of the torn tail past that boundary, if any.
    pub trailing_bytes: usize,
    /// Set when a structurally damaged block stopped replay. The file is
    /// left untouched past `confirmed_bytes` for operator diagnosis.
    pub corruption: Option<String>,
}

impl ChainLog {
    pub fn open(path: impl AsRef<Path>, fsync_every_n_records: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            fsync_every_n_records,
            pending_since_sync: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &ChainRecord) -> Result<()> {
        self.file.write_all(&record.to_bytes())?;
        self.pending_since_sync += 1;
        if self.pending_since_sync >= self.fsync_every_n_records {
            self.sync()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        self.pending_since_sync = 0;
        Ok(())
    }

    /// Drop everything past `offset`. Used after replay reports a torn tail
    /// or a corrupt block.
    pub fn truncate_to(&mut self, offset: u64) -> Result<()> {
        self.file.set_len(offset)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Stream the file through a scanner. A torn tail stops replay cleanly
    /// at the last boundary; corruption surfaces as `CorruptBlock` with the
    /// boundary preserved so the operator can inspect and truncate.
    pub fn replay(path: impl AsRef<Path>) -> Result<ReplayOutcome> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).open(path)?;
        file.seek(SeekFrom::Start(0))?;

        let mut scanner = ChainScanner::new();
        let mut records = Vec::new();
        let mut corruption = None;
        let mut chunk = vec![0u8; REPLAY_CHUNK_BYTES];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            match scanner.feed(&chunk[..n]) {
                Ok(batch) => records.extend(batch),
                Err(ChainError::CorruptBlock { offset, detail }) => {
                    warn!(
                        path = %path.display(),
                        offset,
                        detail,
                        "corrupt block stops chain log replay"
                    );
                    corruption = Some(detail);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let trailing = scanner.pending_bytes();
        if corruption.is_none() {
            if trailing > 0 {
                warn!(
                    path = %path.display(),
                    offset = scanner.confirmed_bytes(),
                    trailing,
                    "torn tail in chain log"
                );
            } else {
                info!(
                    path = %path.display(),
                    records = records.len(),
                    bytes = scanner.confirmed_bytes(),
                    "chain log replayed"
                );
            }
        }
        Ok(ReplayOutcome {
            records,
            confirmed_bytes: scanner.confirmed_bytes(),
            trailing_bytes: trailing,
            corruption,
        })
    }
}

impl Drop for ChainLog {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

/// Cold-start recovery: replay the file, truncating a torn tail in place so
/// the next append lands on a clean boundary.
///
/// A corrupt block yields the records before it but no open log — the file
/// keeps its damaged bytes for diagnosis and must not be appended to until
/// an operator intervenes.
pub fn replay_and_repair(
    path: impl AsRef<Path>,
    fsync_every_n: usize,
) -> Result<(Option<ChainLog>, ReplayOutcome)> {
    let path = path.as_ref();
    let outcome = match ChainLog::replay(path) {
        Ok(outcome) => outcome,
        Err(ChainError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            let log = ChainLog::open(path, fsync_every_n)?;
            return Ok((
                Some(log),
                ReplayOutcome {
                    records: Vec::new(),
                    confirmed_bytes: 0,
                    trailing_bytes: 0,
                    corruption: None,
                },
            ));
        }
        Err(e) => return Err(e),
    };
    if outcome.corruption.is_some() {
        return Ok((None, outcome));
    }
    let mut log = ChainLog::open(path, fsync_every_n)?;
    if outcome.trailing_bytes > 0 {
        log.truncate_to(outcome.confirmed_bytes)?;
    }
    Ok((Some(log), outcome))
}
