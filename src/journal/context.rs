//! Per-call transaction contexts.
//!
//! A [`TransactionContext`] is opened at the start of a namespace mutation and
//! closed when the call returns. It buffers journal entries and the blocks to
//! delete. Closing flushes the journal before any block is deleted, so after
//! a crash the journal can always be replayed and unreferenced blocks found.

use super::{Journal, JournalEntry};
use crate::block::BlockMaster;
use crate::error::Result;
use crate::types::BlockId;
use std::mem;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Attempts made to delete the blocks of one context.
const BLOCK_DELETION_ATTEMPTS: u32 = 3;

/// Buffered journal writer for one call.
///
/// Entries are already applied to the in-memory state when appended. Dropping
/// the context flushes whatever is still buffered.
pub struct JournalContext {
    journal: Arc<dyn Journal>,
    pending: Vec<JournalEntry>,
    written: usize,
}

impl JournalContext {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            journal,
            pending: Vec::new(),
            written: 0,
        }
    }

    /// Buffer an applied entry.
    pub fn append(&mut self, entry: JournalEntry) {
        self.pending.push(entry);
    }

    /// Write and sync every buffered entry.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let entries = mem::take(&mut self.pending);
            self.journal.write(&entries)?;
            self.written += entries.len();
        }
        self.journal.flush()
    }

    /// Flush once at least `batch` entries are buffered.
    pub fn flush_if_over(&mut self, batch: usize) -> Result<()> {
        if batch > 0 && self.pending.len() >= batch {
            debug!(entries = self.pending.len(), "Flushing journal batch");
            self.flush()?;
        }
        Ok(())
    }

    /// Entries buffered but not yet written.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Entries written by this context so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl Drop for JournalContext {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            error!(error = %e, "Failed to flush journal context");
        }
    }
}

/// Blocks to delete once the journal is durable.
pub struct BlockDeletionContext {
    blocks: Arc<dyn BlockMaster>,
    pending: Vec<BlockId>,
}

impl BlockDeletionContext {
    pub fn new(blocks: Arc<dyn BlockMaster>) -> Self {
        Self {
            blocks,
            pending: Vec::new(),
        }
    }

    /// Record blocks to delete.
    pub fn register(&mut self, ids: &[BlockId]) {
        self.pending.extend_from_slice(ids);
    }

    /// Blocks recorded so far.
    pub fn pending(&self) -> &[BlockId] {
        &self.pending
    }

    /// Delete the recorded blocks. Failures are logged, never returned: the
    /// namespace change they belong to is already committed.
    pub async fn close(mut self) {
        let ids = mem::take(&mut self.pending);
        if ids.is_empty() {
            return;
        }
        for attempt in 1..=BLOCK_DELETION_ATTEMPTS {
            match self.blocks.remove_blocks(&ids, true).await {
                Ok(()) => {
                    debug!(blocks = ids.len(), "Deleted blocks");
                    return;
                }
                Err(e) if attempt < BLOCK_DELETION_ATTEMPTS => {
                    warn!(attempt, error = %e, "Block deletion failed, retrying");
                }
                Err(e) => {
                    error!(
                        blocks = ids.len(),
                        attempts = attempt,
                        error = %e,
                        "Giving up on block deletion; orphaned blocks remain"
                    );
                }
            }
        }
    }
}

/// Journal and block deletion contexts of one call.
pub struct TransactionContext {
    journal: JournalContext,
    deletions: BlockDeletionContext,
}

impl TransactionContext {
    pub fn new(journal: Arc<dyn Journal>, blocks: Arc<dyn BlockMaster>) -> Self {
        Self {
            journal: JournalContext::new(journal),
            deletions: BlockDeletionContext::new(blocks),
        }
    }

    pub fn journal(&mut self) -> &mut JournalContext {
        &mut self.journal
    }

    pub fn deletions(&mut self) -> &mut BlockDeletionContext {
        &mut self.deletions
    }

    /// Flush the journal, then delete blocks.
    ///
    /// Blocks are only deleted when the flush succeeds.
    pub async fn close(self) -> Result<()> {
        let TransactionContext {
            mut journal,
            deletions,
        } = self;
        journal.flush()?;
        drop(journal);
        deletions.close().await;
        Ok(())
    }
}
