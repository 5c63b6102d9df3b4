use crate::error::{Result, StoreError};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Editor id used for DIRTY records replayed from the journal. Live editors
/// are numbered from 1.
pub(crate) const REPLAYED_EDITOR: u64 = 0;

/// Bookkeeping for one keyed entry. File contents live on disk as
/// `{key}.{slot}` (clean) and `{key}.{slot}.tmp` (dirty).
#[derive(Debug)]
pub(crate) struct Entry {
    pub key: String,

    /// Lengths of this entry's clean files.
    pub lengths: Vec<u64>,

    /// True once the entry has been committed at least once.
    pub readable: bool,

    /// True if the entry must be deleted once the current edit or read completes.
    pub zombie: bool,

    /// Id of the ongoing edit, if any.
    pub current_editor: Option<u64>,

    /// Open slot readers that block writes and deletes on filesystems that
    /// cannot remove open files. Reaching zero on a zombie removes the entry.
    pub locking_readers: usize,

    /// Sequence number of the most recently committed edit.
    pub sequence_number: u64,
}

impl Entry {
    pub fn new(key: String, slot_count: usize) -> Self {
        Self {
            key,
            lengths: vec![0; slot_count],
            readable: false,
            zombie: false,
            current_editor: None,
            locking_readers: 0,
            sequence_number: 0,
        }
    }

    pub fn clean_file(&self, directory: &Path, slot: usize) -> PathBuf {
        directory.join(format!("{}.{}", self.key, slot))
    }

    pub fn dirty_file(&self, directory: &Path, slot: usize) -> PathBuf {
        directory.join(format!("{}.{}.tmp", self.key, slot))
    }

    pub fn total_length(&self) -> u64 {
        self.lengths.iter().sum()
    }

    /// Set lengths from decimal strings like "10123".
    pub fn set_lengths(&mut self, parts: &[&str]) -> Result<()> {
        if parts.len() != self.lengths.len() {
            return Err(invalid_lengths(parts));
        }
        let mut parsed = Vec::with_capacity(parts.len());
        for part in parts {
            parsed.push(part.parse::<u64>().map_err(|_| invalid_lengths(parts))?);
        }
        self.lengths = parsed;
        Ok(())
    }

    /// Append space-prefixed lengths to `out`.
    pub fn write_lengths(&self, out: &mut String) {
        for length in &self.lengths {
            let _ = write!(out, " {length}");
        }
    }
}

fn invalid_lengths(parts: &[&str]) -> StoreError {
    StoreError::CorruptJournal(format!("unexpected lengths: {parts:?}"))
}
