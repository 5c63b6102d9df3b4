//! Journaled, crash-recoverable disk LRU store.
//!
//! Entries are named by short keys and carry a fixed number of byte slots.
//! Commits are atomic per entry, reads see a consistent snapshot, and an
//! append-only journal lets the store recover its index after a crash.

mod arena;
mod entry;
pub mod error;
pub mod journal;
mod lru;
mod sink;
mod store;

pub use error::{Result, StoreError};
pub use sink::SlotSink;
pub use store::{
    DiskLruStore, Editor, FileLocking, SlotReader, Snapshot, Snapshots, StoreOptions,
};
