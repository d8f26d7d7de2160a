//! Block discovery: finding record boundaries in a raw byte stream.
//!
//! A `ChainScanner` is fed bytes in whatever chunks the source produces
//! (file reads, socket reads) and yields fully decoded records. A record cut
//! off mid-encoding is not an error: its bytes stay in the pending buffer
//! and decoding resumes when more input arrives. Confirmed bytes are dropped
//! from the buffer immediately, so nothing is ever parsed twice.

use tracing::warn;

use crate::chain::record::ChainRecord;
use crate::error::{ChainError, Result};

#[derive(Debug, Default)]
pub struct ChainScanner {
    pending: Vec<u8>,
    confirmed: u64,
}

impl ChainScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes fully consumed as complete records since the scanner was
    /// created.
    pub fn confirmed_bytes(&self) -> u64 {
        self.confirmed
    }

    /// Bytes held back because they do not yet form a complete record.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Feed a chunk and decode every complete record it completes.
    ///
    /// Corruption fails hard with `CorruptBlock` carrying the last good
    /// offset; the caller should truncate its source there and stop
    /// ingesting from it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ChainRecord>> {
        self.pending.extend_from_slice(bytes);
        let mut records = Vec::new();
        let mut pos = 0usize;
        loop {
            match ChainRecord::decode(&self.pending[pos..]) {
                Ok((record, used)) => {
                    pos += used;
                    self.confirmed += used as u64;
                    records.push(record);
                }
                Err(ChainError::Truncated) => break,
                Err(e) => {
                    warn!(offset = self.confirmed, error = %e, "corrupt block in stream");
                    return Err(ChainError::CorruptBlock {
                        offset: self.confirmed,
                        detail: e.to_string(),
                    });
                }
            }
        }
        self.pending.drain(..pos);
        Ok(records)
    }

    /// Give back the retained partial tail, resetting the scanner's buffer.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Verify that `buf` ends on a well-formed record by decoding it backward
/// from the end. Cold start uses this to check the persisted tail before
/// trusting the file.
pub fn verify_tail(buf: &[u8]) -> Result<ChainRecord> {
    ChainRecord::decode_back(buf)
}
