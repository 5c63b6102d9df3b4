//! Journaled disk LRU store.
//!
//! Every entry has a fixed number of value slots, each stored as its own file.
//! An append-only journal records edits, commits, removals and reads so that
//! the entry index survives crashes. The total size of all clean files is kept
//! under a configured maximum by evicting least recently used entries on a
//! background cleanup thread.
//!
//! All index, journal and size mutations happen under one store-wide mutex.
//! Reads from an already-vended [`Snapshot`] do not take it.

use crate::entry::{Entry, REPLAYED_EDITOR};
use crate::error::{Result, StoreError};
use crate::journal::{
    self, Header, JournalOp, JournalWriter, COMPACT_THRESHOLD, JOURNAL_FILE, JOURNAL_FILE_BACKUP,
    JOURNAL_FILE_TEMP,
};
use crate::lru::LruIndex;
use crate::sink::SlotSink;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// How the store treats files that are open for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileLocking {
    /// Probe the directory once at open: can an open file be deleted?
    #[default]
    Detect,
    /// Open files may be deleted and replaced (typical Unix filesystems).
    Permissive,
    /// Open files block deletes and overwrites. Readers are counted, and a
    /// removed entry with open readers becomes a zombie until they close.
    Exclusive,
}

/// Options for [`DiskLruStore::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub directory: PathBuf,
    /// Maximum bytes of clean files before eviction kicks in.
    pub max_size: u64,
    /// Recorded in the journal header; a mismatch discards the store.
    pub app_version: u32,
    /// Value slots per entry.
    pub slot_count: usize,
    pub file_locking: FileLocking,
}

impl StoreOptions {
    pub fn new(directory: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            directory: directory.into(),
            max_size,
            app_version: 1,
            slot_count: 2,
            file_locking: FileLocking::Detect,
        }
    }

    pub fn app_version(mut self, app_version: u32) -> Self {
        self.app_version = app_version;
        self
    }

    pub fn slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    pub fn file_locking(mut self, file_locking: FileLocking) -> Self {
        self.file_locking = file_locking;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(StoreError::Config("max_size must be greater than 0".into()));
        }
        if self.slot_count == 0 {
            return Err(StoreError::Config("slot_count must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Mutable store state. Guarded by [`Shared::state`].
struct State {
    index: LruIndex,
    /// Bytes of clean files across all entries.
    size: u64,
    journal: JournalWriter,
    /// Journal lines that a rebuild would drop.
    redundant_op_count: usize,
    next_sequence_number: u64,
    next_editor_id: u64,
    /// Open files may be deleted on this filesystem.
    civilized: bool,
    closed: bool,
    most_recent_trim_failed: bool,
    most_recent_rebuild_failed: bool,
    cleanup_scheduled: bool,
}

impl State {
    fn new(civilized: bool) -> Self {
        Self {
            index: LruIndex::new(),
            size: 0,
            journal: JournalWriter::blackhole(),
            redundant_op_count: 0,
            next_sequence_number: 1,
            next_editor_id: REPLAYED_EDITOR + 1,
            civilized,
            closed: false,
            most_recent_trim_failed: false,
            most_recent_rebuild_failed: false,
            cleanup_scheduled: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

struct Shared {
    directory: PathBuf,
    max_size: u64,
    header: Header,
    state: Mutex<State>,
    cleanup: Condvar,
}

/// Journaled, crash-recoverable disk LRU store.
///
/// Dropping the store closes it. Outstanding snapshots stay readable;
/// outstanding editors are detached and their commits become no-ops.
pub struct DiskLruStore {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiskLruStore {
    /// Open the store in `options.directory`, replaying an existing journal.
    ///
    /// A corrupt journal wipes the directory and starts empty. Only invalid
    /// options and directory-level I/O failures are returned as errors.
    pub fn open(options: StoreOptions) -> Result<Self> {
        options.validate()?;
        fs::create_dir_all(&options.directory)?;

        let directory = options.directory.clone();
        let journal_file = directory.join(JOURNAL_FILE);
        let backup_file = directory.join(JOURNAL_FILE_BACKUP);

        // A backup only survives a crash mid-rebuild; prefer the real journal.
        if backup_file.exists() {
            if journal_file.exists() {
                fs::remove_file(&backup_file)?;
            } else {
                fs::rename(&backup_file, &journal_file)?;
            }
        }

        let civilized = match options.file_locking {
            FileLocking::Detect => is_civilized(&directory),
            FileLocking::Permissive => true,
            FileLocking::Exclusive => false,
        };

        let shared = Arc::new(Shared {
            directory,
            max_size: options.max_size,
            header: Header {
                app_version: options.app_version,
                slot_count: options.slot_count,
            },
            state: Mutex::new(State::new(civilized)),
            cleanup: Condvar::new(),
        });

        {
            let mut guard = shared.state.lock();
            let state = &mut *guard;

            let mut recovered = false;
            if journal_file.exists() {
                match shared.replay(state) {
                    Ok(()) => recovered = true,
                    Err(e) => {
                        warn!(
                            directory = %shared.directory.display(),
                            error = %e,
                            "store is corrupt, removing"
                        );
                        *state = State::new(civilized);
                        delete_contents(&shared.directory)?;
                    }
                }
            }
            if !recovered {
                shared.rebuild_journal(state)?;
            }

            info!(
                directory = %shared.directory.display(),
                entries = state.index.len(),
                size = state.size,
                max_size = shared.max_size,
                civilized,
                "store opened"
            );
        }

        let worker = spawn_cleanup_worker(Arc::clone(&shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    pub fn max_size(&self) -> u64 {
        self.shared.max_size
    }

    /// Returns a snapshot of the entry named `key`, or `None` if it doesn't
    /// exist or is not currently readable. A returned entry becomes the most
    /// recently used.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        validate_key(key)?;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        if state.index.touch(key).is_none() {
            return Ok(None);
        }
        let Some(snapshot) = self.shared.open_snapshot(state, key)? else {
            return Ok(None);
        };

        state.redundant_op_count += 1;
        state.journal.read(key);
        if self.shared.rebuild_required(state) {
            self.shared.schedule_cleanup(state);
        }

        Ok(Some(snapshot))
    }

    /// Returns an editor for the entry named `key`, or `None` if another edit
    /// is in progress, readers block the write, or the store is degraded.
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        self.shared.edit(key, None)
    }

    /// Like [`DiskLruStore::edit`], but only if the entry's most recent commit
    /// still carries `sequence_number`.
    pub fn edit_if_current(&self, key: &str, sequence_number: u64) -> Result<Option<Editor>> {
        self.shared.edit(key, Some(sequence_number))
    }

    /// Drops the entry for `key` if it exists. If the entry is being edited,
    /// that edit will complete normally but its value will not be stored.
    ///
    /// Returns true if an entry was removed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        let removed = self.shared.remove_entry(state, key)?;
        if removed && state.size <= self.shared.max_size {
            state.most_recent_trim_failed = false;
        }
        Ok(removed)
    }

    /// Deletes every stored value. In-flight edits complete normally but
    /// their values are not stored.
    pub fn evict_all(&self) -> Result<()> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        for key in state.index.keys_lru() {
            self.shared.remove_entry(state, &key)?;
        }
        state.most_recent_trim_failed = false;
        Ok(())
    }

    /// Bytes currently used by clean files. May exceed the maximum while a
    /// background trim is pending.
    pub fn size(&self) -> u64 {
        self.shared.state.lock().size
    }

    /// Number of readable entries.
    pub fn entry_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .index
            .iter_lru()
            .filter(|entry| entry.readable && !entry.zombie)
            .count()
    }

    /// Trim to size and force buffered journal records to the filesystem.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        self.shared.trim_to_size(state)?;
        state.journal.flush();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close the store. Stored values remain on disk.
    pub fn close(&self) -> Result<()> {
        let trimmed = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.closed {
                return Ok(());
            }

            for (key, editor_id) in state.index.keys_with_editors() {
                if let Err(e) = self.shared.detach(state, &key, editor_id) {
                    warn!(key = %key, error = %e, "failed to detach editor on close");
                }
            }

            let trimmed = self.shared.trim_to_size(state);
            state.journal.close();
            state.closed = true;
            self.shared.cleanup.notify_all();
            trimmed
        };

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("store cleanup worker panicked");
            }
        }

        debug!(directory = %self.shared.directory.display(), "store closed");
        trimmed
    }

    /// Close the store and delete everything in its directory, including
    /// files the store did not create.
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        delete_contents(&self.shared.directory)?;
        Ok(())
    }

    /// Iterate snapshots of the current entries, least recently used first.
    ///
    /// Entries added during iteration are not returned; entries removed
    /// during iteration are skipped. I/O failures end up as skipped entries
    /// rather than errors. Iterating does not change recency.
    pub fn snapshots(&self) -> Result<Snapshots> {
        let guard = self.shared.state.lock();
        guard.check_open()?;
        Ok(Snapshots {
            shared: Arc::clone(&self.shared),
            keys: guard.index.keys_lru().into_iter(),
        })
    }

    #[cfg(test)]
    fn redundant_op_count(&self) -> usize {
        self.shared.state.lock().redundant_op_count
    }

    #[cfg(test)]
    fn is_civilized(&self) -> bool {
        self.shared.state.lock().civilized
    }

    #[cfg(test)]
    fn trim_failed(&self) -> bool {
        self.shared.state.lock().most_recent_trim_failed
    }
}

impl Drop for DiskLruStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close store");
        }
    }
}

impl Shared {
    fn path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn slot_count(&self) -> usize {
        self.header.slot_count
    }

    /// Rebuild only when it removes at least [`COMPACT_THRESHOLD`] lines and
    /// at least halves the journal.
    fn rebuild_required(&self, state: &State) -> bool {
        state.redundant_op_count >= COMPACT_THRESHOLD
            && state.redundant_op_count >= state.index.len()
    }

    fn schedule_cleanup(&self, state: &mut State) {
        state.cleanup_scheduled = true;
        self.cleanup.notify_one();
    }

    /// Rebuild the entry index from the journal, then compute the initial
    /// size and delete inconsistent (DIRTY) entries.
    fn replay(&self, state: &mut State) -> Result<()> {
        let journal_file = self.path(JOURNAL_FILE);
        let replay = journal::read_journal(&journal_file, self.header)?;
        let line_count = replay.ops.len();

        for op in replay.ops {
            match op {
                JournalOp::Remove { key } => {
                    state.index.remove(&key);
                }
                JournalOp::Clean { key, lengths } => {
                    let entry = state.index.get_or_insert(&key, self.slot_count());
                    let parts: Vec<&str> = lengths.iter().map(String::as_str).collect();
                    entry.set_lengths(&parts)?;
                    entry.readable = true;
                    entry.current_editor = None;
                }
                JournalOp::Dirty { key } => {
                    state.index.get_or_insert(&key, self.slot_count()).current_editor =
                        Some(REPLAYED_EDITOR);
                }
                JournalOp::Read { key } => {
                    state.index.touch(&key);
                }
            }
        }

        state.redundant_op_count = line_count.saturating_sub(state.index.len());

        // A truncated final line must not be appended to.
        if replay.truncated {
            self.rebuild_journal(state)?;
        } else {
            state.journal = JournalWriter::open_append(&journal_file)?;
        }

        self.process_journal(state)
    }

    fn process_journal(&self, state: &mut State) -> Result<()> {
        delete_if_exists(&self.path(JOURNAL_FILE_TEMP))?;

        for key in state.index.keys_lru() {
            let Some(entry) = state.index.get(&key) else {
                continue;
            };
            if entry.current_editor.is_none() {
                state.size += entry.total_length();
                continue;
            }

            for slot in 0..self.slot_count() {
                delete_if_exists(&entry.clean_file(&self.directory, slot))?;
                delete_if_exists(&entry.dirty_file(&self.directory, slot))?;
            }
            debug!(key = %key, "discarding entry with uncommitted edit");
            state.index.remove(&key);
        }
        Ok(())
    }

    /// Write a compacted journal and swap it in via rename-with-backup.
    fn rebuild_journal(&self, state: &mut State) -> Result<()> {
        state.journal.close();

        let journal_file = self.path(JOURNAL_FILE);
        let temp_file = self.path(JOURNAL_FILE_TEMP);
        let backup_file = self.path(JOURNAL_FILE_BACKUP);

        journal::write_compacted(&temp_file, self.header, state.index.iter_lru())?;

        if journal_file.exists() {
            fs::rename(&journal_file, &backup_file)?;
        }
        fs::rename(&temp_file, &journal_file)?;
        delete_if_exists(&backup_file)?;

        state.journal = JournalWriter::open_append(&journal_file)?;
        state.redundant_op_count = 0;
        state.most_recent_rebuild_failed = false;

        debug!(entries = state.index.len(), "journal rebuilt");
        Ok(())
    }

    /// One pass of background maintenance: trim, then compact if due.
    fn run_cleanup(&self, state: &mut State) {
        if state.closed {
            return;
        }

        if let Err(e) = self.trim_to_size(state) {
            warn!(error = %e, "trim failed; blocking edits until it succeeds");
            state.most_recent_trim_failed = true;
        }

        if self.rebuild_required(state) {
            if let Err(e) = self.rebuild_journal(state) {
                warn!(error = %e, "journal rebuild failed; blocking edits until it succeeds");
                state.most_recent_rebuild_failed = true;
                state.journal = JournalWriter::blackhole();
            }
        }
    }

    fn trim_to_size(&self, state: &mut State) -> Result<()> {
        while state.size > self.max_size {
            if !self.remove_oldest_entry(state)? {
                // Everything left is a zombie waiting on readers.
                warn!(
                    size = state.size,
                    max_size = self.max_size,
                    "cannot trim: no removable entries"
                );
                state.most_recent_trim_failed = true;
                return Ok(());
            }
        }
        state.most_recent_trim_failed = false;
        Ok(())
    }

    /// Returns false if every entry is a zombie.
    fn remove_oldest_entry(&self, state: &mut State) -> Result<bool> {
        let oldest = state
            .index
            .iter_lru()
            .find(|entry| !entry.zombie)
            .map(|entry| entry.key.clone());

        match oldest {
            Some(key) => {
                debug!(key = %key, "evicting least recently used entry");
                self.remove_entry(state, &key)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_entry(&self, state: &mut State, key: &str) -> Result<bool> {
        let civilized = state.civilized;
        let Some(entry) = state.index.get_mut(key) else {
            return Ok(false);
        };

        // Files still open cannot be deleted here; mark the entry so its
        // files are deleted once readers and editors finish.
        if !civilized {
            if entry.locking_readers > 0 {
                // DIRTY so a crash before the readers close never revives it.
                state.journal.dirty(key);
                state.journal.flush();
            }
            if entry.locking_readers > 0 || entry.current_editor.is_some() {
                entry.zombie = true;
                return Ok(true);
            }
        }

        // Prevent an in-flight edit from completing normally.
        if entry.current_editor.take().is_some() {
            for slot in 0..self.header.slot_count {
                delete_if_exists(&entry.dirty_file(&self.directory, slot))?;
            }
        }

        for slot in 0..self.header.slot_count {
            delete_if_exists(&entry.clean_file(&self.directory, slot))?;
            state.size = state.size.saturating_sub(entry.lengths[slot]);
            entry.lengths[slot] = 0;
        }

        state.redundant_op_count += 1;
        state.journal.remove(key);
        state.index.remove(key);

        if self.rebuild_required(state) {
            self.schedule_cleanup(state);
        }
        Ok(true)
    }

    fn edit(self: &Arc<Self>, key: &str, expected_sequence: Option<u64>) -> Result<Option<Editor>> {
        validate_key(key)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        match state.index.touch(key) {
            Some(entry) => {
                if expected_sequence.is_some_and(|seq| entry.sequence_number != seq) {
                    return Ok(None); // Snapshot is stale.
                }
                if entry.current_editor.is_some() {
                    return Ok(None); // Another edit is in progress.
                }
                if entry.locking_readers != 0 {
                    return Ok(None); // A reader still holds the files open.
                }
            }
            None if expected_sequence.is_some() => return Ok(None),
            None => {}
        }

        if state.most_recent_trim_failed || state.most_recent_rebuild_failed {
            // Storing more would overshoot the limit, or the journal cannot
            // record the edit. Retry the cleanup instead.
            self.schedule_cleanup(state);
            return Ok(None);
        }

        // Record the edit before any file exists so a crash leaves a trace.
        state.journal.dirty(key);
        state.journal.flush();
        if state.journal.has_errors() {
            return Ok(None);
        }

        let editor_id = state.next_editor_id;
        state.next_editor_id += 1;

        let slot_count = self.slot_count();
        let entry = state.index.get_or_insert(key, slot_count);
        entry.current_editor = Some(editor_id);
        let written = (!entry.readable).then(|| vec![false; slot_count]);

        Ok(Some(Editor {
            shared: Arc::clone(self),
            key: key.to_string(),
            id: editor_id,
            written,
            done: false,
        }))
    }

    fn complete_edit(
        &self,
        state: &mut State,
        key: &str,
        editor_id: u64,
        written: Option<&[bool]>,
        success: bool,
    ) -> Result<()> {
        let slot_count = self.slot_count();

        // A first commit must produce every slot.
        let incomplete = {
            let Some(entry) = state.index.get(key) else {
                return Ok(());
            };
            if entry.current_editor != Some(editor_id) {
                return Ok(());
            }
            if success && !entry.readable {
                (0..slot_count).find_map(|slot| {
                    let was_written = written
                        .and_then(|w| w.get(slot).copied())
                        .unwrap_or(false);
                    if !was_written {
                        Some(Some(slot))
                    } else if !entry.dirty_file(&self.directory, slot).exists() {
                        Some(None)
                    } else {
                        None
                    }
                })
            } else {
                None
            }
        };
        if let Some(unwritten) = incomplete {
            self.complete_edit(state, key, editor_id, written, false)?;
            return match unwritten {
                Some(slot) => Err(StoreError::IncompleteEdit { slot }),
                None => Ok(()),
            };
        }

        let Some(entry) = state.index.get_mut(key) else {
            return Ok(());
        };

        if success && !entry.zombie {
            if let Err(e) = publish_slots(&self.directory, entry, &mut state.size) {
                self.complete_edit(state, key, editor_id, written, false)?;
                return Err(e.into());
            }
        } else {
            for slot in 0..slot_count {
                delete_if_exists(&entry.dirty_file(&self.directory, slot))?;
            }
        }

        entry.current_editor = None;
        if entry.zombie {
            self.remove_entry(state, key)?;
            return Ok(());
        }

        state.redundant_op_count += 1;
        if entry.readable || success {
            entry.readable = true;
            if success {
                entry.sequence_number = state.next_sequence_number;
                state.next_sequence_number += 1;
            }
            state.journal.clean(entry);
        } else {
            state.index.remove(key);
            state.journal.remove(key);
        }
        state.journal.flush();

        if state.size > self.max_size || self.rebuild_required(state) {
            self.schedule_cleanup(state);
        }
        Ok(())
    }

    /// Stop an editor from completing normally after an I/O failure or an
    /// eviction, deleting its partial files.
    fn detach(&self, state: &mut State, key: &str, editor_id: u64) -> Result<()> {
        let civilized = state.civilized;
        let Some(entry) = state.index.get_mut(key) else {
            return Ok(());
        };
        if entry.current_editor != Some(editor_id) {
            return Ok(());
        }
        if civilized {
            self.complete_edit(state, key, editor_id, None, false)
        } else {
            // Cannot delete yet; the commit or abort will remove it.
            entry.zombie = true;
            Ok(())
        }
    }

    fn detach_editor(&self, key: &str, editor_id: u64) {
        let mut guard = self.state.lock();
        if let Err(e) = self.detach(&mut guard, key, editor_id) {
            warn!(key = %key, error = %e, "failed to detach editor");
        }
    }

    /// Open every slot eagerly so the snapshot reflects a single commit.
    fn open_snapshot(self: &Arc<Self>, state: &mut State, key: &str) -> Result<Option<Snapshot>> {
        let civilized = state.civilized;
        let slot_count = self.slot_count();
        let Some(entry) = state.index.get_mut(key) else {
            return Ok(None);
        };
        if !entry.readable {
            return Ok(None);
        }
        if !civilized && (entry.current_editor.is_some() || entry.zombie) {
            return Ok(None);
        }

        let mut files = Vec::with_capacity(slot_count);
        for slot in 0..slot_count {
            match File::open(entry.clean_file(&self.directory, slot)) {
                Ok(file) => files.push(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Deleted behind our back; drop the entry so the size is accurate.
                    drop(files);
                    warn!(key = %key, slot, "cache file missing, removing entry");
                    if let Err(e) = self.remove_entry(state, key) {
                        warn!(key = %key, error = %e, "failed to remove damaged entry");
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !civilized {
            entry.locking_readers += slot_count;
        }
        let readers = files
            .into_iter()
            .map(|file| SlotReader {
                file,
                _lease: (!civilized).then(|| ReaderLease {
                    shared: Arc::clone(self),
                    key: key.to_string(),
                }),
            })
            .collect();

        Ok(Some(Snapshot {
            shared: Arc::clone(self),
            key: key.to_string(),
            sequence_number: entry.sequence_number,
            readers,
            lengths: entry.lengths.clone(),
        }))
    }

    fn release_reader(&self, key: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.index.get_mut(key) else {
            return;
        };
        entry.locking_readers = entry.locking_readers.saturating_sub(1);
        if entry.locking_readers == 0 && entry.zombie {
            if let Err(e) = self.remove_entry(state, key) {
                warn!(key = %key, error = %e, "failed to remove zombie entry");
            }
        }
    }
}

/// Rename each written dirty file over its clean file and account the size
/// change.
fn publish_slots(directory: &Path, entry: &mut Entry, size: &mut u64) -> io::Result<()> {
    for slot in 0..entry.lengths.len() {
        let dirty = entry.dirty_file(directory, slot);
        if !dirty.exists() {
            continue;
        }
        let clean = entry.clean_file(directory, slot);
        fs::rename(&dirty, &clean)?;
        let old_length = entry.lengths[slot];
        let new_length = fs::metadata(&clean)?.len();
        entry.lengths[slot] = new_length;
        *size = size.saturating_sub(old_length) + new_length;
    }
    Ok(())
}

fn spawn_cleanup_worker(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("keepsake-store-cleanup".into())
        .spawn(move || {
            let mut guard = shared.state.lock();
            loop {
                while !guard.cleanup_scheduled && !guard.closed {
                    shared.cleanup.wait(&mut guard);
                }
                if guard.closed {
                    return;
                }
                guard.cleanup_scheduled = false;
                shared.run_cleanup(&mut guard);
            }
        })
}

/// A consistent read-only view of one entry's slots.
///
/// Holds an open file per slot. Dropping the snapshot closes them.
pub struct Snapshot {
    shared: Arc<Shared>,
    key: String,
    sequence_number: u64,
    readers: Vec<SlotReader>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Byte length of `slot` when the snapshot was taken.
    pub fn length(&self, slot: usize) -> Option<u64> {
        self.lengths.get(slot).copied()
    }

    /// Unbuffered reader positioned at the start of `slot`.
    pub fn reader(&mut self, slot: usize) -> Option<&mut SlotReader> {
        self.readers.get_mut(slot)
    }

    /// Read the rest of `slot` into memory.
    pub fn read_slot(&mut self, slot: usize) -> io::Result<Bytes> {
        let length = self.length(slot).unwrap_or(0);
        let reader = self.readers.get_mut(slot).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no slot {slot}"))
        })?;
        let mut buf = Vec::with_capacity(length as usize);
        reader.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// An editor for this entry, or `None` if the entry changed since this
    /// snapshot was taken or another edit is in progress.
    pub fn edit(&self) -> Result<Option<Editor>> {
        self.shared.edit(&self.key, Some(self.sequence_number))
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("key", &self.key)
            .field("sequence_number", &self.sequence_number)
            .field("lengths", &self.lengths)
            .finish()
    }
}

/// Reader over one slot of a [`Snapshot`].
pub struct SlotReader {
    file: File,
    _lease: Option<ReaderLease>,
}

impl Read for SlotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Counts an open reader against its entry until dropped.
struct ReaderLease {
    shared: Arc<Shared>,
    key: String,
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.shared.release_reader(&self.key);
    }
}

/// Exclusive write handle for one entry.
///
/// Call exactly one of [`Editor::commit`] or [`Editor::abort`]; dropping an
/// editor without either aborts it. Sinks must be dropped (or at least no
/// longer written to) before committing.
pub struct Editor {
    shared: Arc<Shared>,
    key: String,
    id: u64,
    /// Slots written so far; tracked only for an entry's first commit.
    written: Option<Vec<bool>>,
    done: bool,
}

impl Editor {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        let slot_count = self.shared.slot_count();
        if slot >= slot_count {
            return Err(StoreError::SlotOutOfRange { slot, slot_count });
        }
        Ok(())
    }

    /// A writer for `slot`. Writes go to a temp file that only becomes
    /// visible on commit. If the editor has been detached, or the file cannot
    /// be created, the sink silently discards everything.
    pub fn new_sink(&mut self, slot: usize) -> Result<SlotSink> {
        self.check_slot(slot)?;
        let guard = self.shared.state.lock();
        let Some(entry) = guard.index.get(&self.key) else {
            return Ok(SlotSink::blackhole());
        };
        if entry.current_editor != Some(self.id) {
            return Ok(SlotSink::blackhole());
        }

        if let Some(written) = self.written.as_mut() {
            written[slot] = true;
        }

        let path = entry.dirty_file(&self.shared.directory, slot);
        let file = match File::create(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!(key = %self.key, slot, error = %e, "cannot create slot file");
                return Ok(SlotSink::blackhole());
            }
        };

        let shared = Arc::clone(&self.shared);
        let key = self.key.clone();
        let editor_id = self.id;
        Ok(SlotSink::new(
            file,
            Box::new(move |error| {
                warn!(key = %key, error = %error, "slot write failed, detaching editor");
                shared.detach_editor(&key, editor_id);
            }),
        ))
    }

    /// The last committed value of `slot`, or `None` if nothing has been
    /// committed or the editor is no longer current.
    pub fn new_source(&self, slot: usize) -> Result<Option<File>> {
        self.check_slot(slot)?;
        let guard = self.shared.state.lock();
        let Some(entry) = guard.index.get(&self.key) else {
            return Ok(None);
        };
        if !entry.readable || entry.current_editor != Some(self.id) || entry.zombie {
            return Ok(None);
        }
        Ok(File::open(entry.clean_file(&self.shared.directory, slot)).ok())
    }

    /// Publish this edit to readers and release the edit lock.
    pub fn commit(mut self) -> Result<()> {
        self.finish(true)
    }

    /// Discard this edit and release the edit lock.
    pub fn abort(mut self) -> Result<()> {
        self.finish(false)
    }

    fn finish(&mut self, success: bool) -> Result<()> {
        self.done = true;
        let mut guard = self.shared.state.lock();
        let written = self.written.as_deref();
        self.shared
            .complete_edit(&mut guard, &self.key, self.id, written, success)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.finish(false) {
                warn!(key = %self.key, error = %e, "failed to abort dropped editor");
            }
        }
    }
}

/// Iterator returned by [`DiskLruStore::snapshots`].
pub struct Snapshots {
    shared: Arc<Shared>,
    keys: std::vec::IntoIter<String>,
}

impl Iterator for Snapshots {
    type Item = Snapshot;

    fn next(&mut self) -> Option<Snapshot> {
        loop {
            let key = self.keys.next()?;
            let mut guard = self.shared.state.lock();
            if guard.closed {
                return None;
            }
            if let Ok(Some(snapshot)) = self.shared.open_snapshot(&mut guard, &key) {
                return Some(snapshot);
            }
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    let legal = (1..=120).contains(&key.len())
        && key
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'));
    if legal {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// True if a file that is still open can be deleted in `directory`.
fn is_civilized(directory: &Path) -> bool {
    let probe = directory.join(JOURNAL_FILE_BACKUP);
    let Ok(file) = File::create(&probe) else {
        return false;
    };
    let civilized = fs::remove_file(&probe).is_ok();
    drop(file);
    if !civilized {
        let _ = fs::remove_file(&probe);
    }
    civilized
}

fn delete_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn delete_contents(directory: &Path) -> io::Result<()> {
    for item in fs::read_dir(directory)? {
        let path = item?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn open(dir: &TempDir, max_size: u64) -> DiskLruStore {
        DiskLruStore::open(StoreOptions::new(dir.path(), max_size)).unwrap()
    }

    fn put(store: &DiskLruStore, key: &str, a: &str, b: &str) {
        let mut editor = store.edit(key).unwrap().expect("editor");
        editor.new_sink(0).unwrap().write_all(a.as_bytes()).unwrap();
        editor.new_sink(1).unwrap().write_all(b.as_bytes()).unwrap();
        editor.commit().unwrap();
    }

    #[test]
    fn rejects_invalid_options() {
        let dir = TempDir::new().unwrap();
        let zero_size = DiskLruStore::open(StoreOptions::new(dir.path(), 0));
        assert!(matches!(zero_size, Err(StoreError::Config(_))));

        let zero_slots = DiskLruStore::open(StoreOptions::new(dir.path(), 10).slot_count(0));
        assert!(matches!(zero_slots, Err(StoreError::Config(_))));
    }

    #[test]
    fn validates_keys() {
        assert!(validate_key("abc_123-x").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("Upper").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key(&"a".repeat(120)).is_ok());
        assert!(validate_key(&"a".repeat(121)).is_err());
    }

    #[test]
    fn file_locking_mode_is_honoured() {
        let dir = TempDir::new().unwrap();
        let store = DiskLruStore::open(
            StoreOptions::new(dir.path(), 1024).file_locking(FileLocking::Exclusive),
        )
        .unwrap();
        assert!(!store.is_civilized());
        drop(store);

        let store = DiskLruStore::open(
            StoreOptions::new(dir.path(), 1024).file_locking(FileLocking::Permissive),
        )
        .unwrap();
        assert!(store.is_civilized());
    }

    #[test]
    fn reads_count_as_redundant_ops() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        put(&store, "k1", "a", "b");
        let after_commit = store.redundant_op_count();

        for _ in 0..3 {
            store.get("k1").unwrap().expect("snapshot");
        }
        assert_eq!(store.redundant_op_count(), after_commit + 3);
    }

    #[test]
    fn compaction_resets_redundant_ops() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024 * 1024);
        put(&store, "k1", "a", "b");

        for _ in 0..COMPACT_THRESHOLD + 10 {
            store.get("k1").unwrap().expect("snapshot");
        }

        // The cleanup thread compacts in the background.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while store.redundant_op_count() >= COMPACT_THRESHOLD {
            assert!(std::time::Instant::now() < deadline, "journal never compacted");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let journal = fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert!(journal.lines().filter(|l| l.starts_with("READ")).count() < COMPACT_THRESHOLD);
        assert!(journal.contains("CLEAN k1 1 1"));
    }

    #[test]
    fn all_zombies_flags_trim_failure_and_blocks_edits() {
        let dir = TempDir::new().unwrap();
        let store = DiskLruStore::open(
            StoreOptions::new(dir.path(), 100).file_locking(FileLocking::Exclusive),
        )
        .unwrap();
        put(&store, "k1", &"x".repeat(60), "");

        let snapshot = store.get("k1").unwrap().expect("snapshot");
        assert!(store.remove("k1").unwrap());

        // Zombie still counts toward the size; force it over the limit.
        {
            let mut guard = store.shared.state.lock();
            guard.size = 500;
            store.shared.trim_to_size(&mut guard).unwrap();
        }
        assert!(store.trim_failed());
        assert!(store.edit("k2").unwrap().is_none());

        drop(snapshot);
        // Releasing the last reader removed the zombie; the retried cleanup recovers.
        {
            let mut guard = store.shared.state.lock();
            guard.size = 0;
            store.shared.run_cleanup(&mut guard);
        }
        assert!(!store.trim_failed());
        assert!(store.edit("k2").unwrap().is_some());
    }

    #[test]
    fn journal_errors_block_edits() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        put(&store, "k1", "a", "b");

        // Every flush through a read-only handle fails.
        let read_only = File::open(dir.path().join(JOURNAL_FILE)).unwrap();
        store.shared.state.lock().journal = JournalWriter::from_file(read_only);

        assert!(store.edit("k2").unwrap().is_none());
        assert!(store.shared.state.lock().journal.has_errors());
        assert!(store.edit("k2").unwrap().is_none());
        assert!(store.get("k1").unwrap().is_some());
    }

    #[test]
    fn failed_rebuild_blocks_edits_until_one_succeeds() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        put(&store, "k1", "a", "b");

        // A directory where the compacted journal goes makes the rebuild fail.
        let temp = dir.path().join(JOURNAL_FILE_TEMP);
        fs::create_dir(&temp).unwrap();
        {
            let mut guard = store.shared.state.lock();
            guard.redundant_op_count = COMPACT_THRESHOLD;
            store.shared.run_cleanup(&mut guard);
            assert!(guard.most_recent_rebuild_failed);
        }
        assert!(store.edit("k2").unwrap().is_none());

        fs::remove_dir(&temp).unwrap();
        {
            let mut guard = store.shared.state.lock();
            store.shared.run_cleanup(&mut guard);
            assert!(!guard.most_recent_rebuild_failed);
        }
        let mut editor = store.edit("k2").unwrap().expect("editor after rebuild");
        editor.new_sink(0).unwrap().write_all(b"c").unwrap();
        editor.new_sink(1).unwrap().write_all(b"d").unwrap();
        editor.commit().unwrap();

        let journal = fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert!(journal.contains("CLEAN k1 1 1"));
        assert!(journal.contains("CLEAN k2 1 1"));
    }

    #[test]
    fn operations_fail_after_close() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 1024);
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.get("k1"), Err(StoreError::Closed)));
        assert!(matches!(store.edit("k1"), Err(StoreError::Closed)));
        // Closing twice is fine.
        store.close().unwrap();
    }
}
