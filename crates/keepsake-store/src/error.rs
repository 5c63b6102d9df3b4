//! Error types for store operations

use std::io;
use thiserror::Error;

/// Main error type for the journaled store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure that could not be recovered locally
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key does not match `[a-z0-9_-]{1,120}`
    #[error("keys must match regex [a-z0-9_-]{{1,120}}: \"{0}\"")]
    InvalidKey(String),

    /// Operation attempted after `close()`
    #[error("store is closed")]
    Closed,

    /// First commit of an entry without a value for every slot
    #[error("newly created entry didn't create value for slot {slot}")]
    IncompleteEdit { slot: usize },

    #[error("slot {slot} out of range for an entry with {slot_count} slots")]
    SlotOutOfRange { slot: usize, slot_count: usize },

    /// Invalid store options; a programmer error, reported at open
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed journal header or record
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
