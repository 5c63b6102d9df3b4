//! Append-only journal format.
//!
//! ```text
//! libcore.io.DiskLruCache
//! 1
//! 100
//! 2
//!
//! CLEAN 3400330d1dfc7f3f7f4b8d4d803dfcf6 832 21054
//! DIRTY 335c4c6028171cfddfbaae1a9c313c52
//! CLEAN 335c4c6028171cfddfbaae1a9c313c52 3934 2342
//! REMOVE 335c4c6028171cfddfbaae1a9c313c52
//! DIRTY 1ab96a171faeeee38496d8b330771a7a
//! CLEAN 1ab96a171faeeee38496d8b330771a7a 1600 234
//! READ 335c4c6028171cfddfbaae1a9c313c52
//! READ 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! ```
//!
//! The header is the magic string, the journal version, the application
//! version, the slot count and a blank line. Each following line records one
//! state change of one entry.

use crate::entry::Entry;
use crate::error::{Result, StoreError};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const JOURNAL_FILE: &str = "journal";
pub const JOURNAL_FILE_TEMP: &str = "journal.tmp";
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
pub const MAGIC: &str = "libcore.io.DiskLruCache";
pub const VERSION_1: &str = "1";

/// Redundant operations tolerated before the journal is compacted.
pub const COMPACT_THRESHOLD: usize = 2000;

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JournalOp {
    Clean { key: String, lengths: Vec<String> },
    Dirty { key: String },
    Remove { key: String },
    Read { key: String },
}

impl JournalOp {
    pub fn parse(line: &str) -> Result<Self> {
        let unexpected = || StoreError::CorruptJournal(format!("unexpected journal line: {line}"));

        let (op, rest) = line.split_once(' ').ok_or_else(unexpected)?;
        match op {
            CLEAN => {
                let (key, lengths) = rest.split_once(' ').ok_or_else(unexpected)?;
                Ok(JournalOp::Clean {
                    key: key.to_string(),
                    lengths: lengths.split(' ').map(str::to_string).collect(),
                })
            }
            DIRTY if !rest.contains(' ') => Ok(JournalOp::Dirty {
                key: rest.to_string(),
            }),
            REMOVE if !rest.contains(' ') => Ok(JournalOp::Remove {
                key: rest.to_string(),
            }),
            READ if !rest.contains(' ') => Ok(JournalOp::Read {
                key: rest.to_string(),
            }),
            _ => Err(unexpected()),
        }
    }
}

/// Journal header values that must match on replay.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub app_version: u32,
    pub slot_count: usize,
}

impl Header {
    fn render(&self) -> String {
        format!(
            "{MAGIC}\n{VERSION_1}\n{}\n{}\n\n",
            self.app_version, self.slot_count
        )
    }

    fn verify(&self, lines: &[String]) -> Result<()> {
        let expected = [
            MAGIC.to_string(),
            VERSION_1.to_string(),
            self.app_version.to_string(),
            self.slot_count.to_string(),
            String::new(),
        ];
        if lines != &expected[..] {
            return Err(StoreError::CorruptJournal(format!(
                "unexpected journal header: {lines:?}"
            )));
        }
        Ok(())
    }
}

/// Records read back from an existing journal.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    pub ops: Vec<JournalOp>,
    /// The file ended in a partial line, which was dropped.
    pub truncated: bool,
}

/// Read the journal at `path`. Header mismatches and malformed complete lines
/// are reported as corruption; a trailing partial line is not.
pub(crate) fn read_journal(path: &Path, header: Header) -> Result<Replay> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    let mut truncated = false;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            truncated = true;
            break;
        }
        buf.pop();
        let line = String::from_utf8(std::mem::take(&mut buf))
            .map_err(|_| StoreError::CorruptJournal("journal is not valid UTF-8".into()))?;
        lines.push(line);
    }

    if lines.len() < 5 {
        return Err(StoreError::CorruptJournal(format!(
            "journal header truncated after {} lines",
            lines.len()
        )));
    }
    let body = lines.split_off(5);
    header.verify(&lines)?;

    let ops = body
        .iter()
        .map(|line| JournalOp::parse(line))
        .collect::<Result<Vec<_>>>()?;

    Ok(Replay { ops, truncated })
}

/// Write a compacted journal for `entries` to `path`: one DIRTY line for each
/// entry with an edit in flight, one CLEAN line for every other entry.
pub(crate) fn write_compacted<'a>(
    path: &Path,
    header: Header,
    entries: impl Iterator<Item = &'a Entry>,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(header.render().as_bytes())?;

    let mut line = String::new();
    for entry in entries {
        line.clear();
        if entry.current_editor.is_some() {
            line.push_str(DIRTY);
            line.push(' ');
            line.push_str(&entry.key);
        } else {
            line.push_str(CLEAN);
            line.push(' ');
            line.push_str(&entry.key);
            entry.write_lengths(&mut line);
        }
        line.push('\n');
        out.write_all(line.as_bytes())?;
    }

    out.flush()?;
    out.get_ref().sync_all()
}

/// Append-only journal writer that hides I/O faults.
///
/// The first failed write or flush sets [`JournalWriter::has_errors`]; every
/// later call is silently dropped until the journal is rebuilt and a fresh
/// writer replaces this one.
pub(crate) struct JournalWriter {
    inner: Option<BufWriter<File>>,
    has_errors: bool,
}

impl JournalWriter {
    pub fn open_append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self {
            inner: Some(BufWriter::new(file)),
            has_errors: false,
        })
    }

    #[cfg(test)]
    pub fn from_file(file: File) -> Self {
        Self {
            inner: Some(BufWriter::new(file)),
            has_errors: false,
        }
    }

    /// A writer that discards everything. Installed when a rebuild fails.
    pub fn blackhole() -> Self {
        Self {
            inner: None,
            has_errors: false,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    fn write_line(&mut self, line: &str) {
        if self.has_errors {
            return;
        }
        if let Some(out) = self.inner.as_mut() {
            let result = out
                .write_all(line.as_bytes())
                .and_then(|_| out.write_all(b"\n"));
            if let Err(e) = result {
                tracing::warn!(error = %e, "journal write failed");
                self.has_errors = true;
            }
        }
    }

    pub fn clean(&mut self, entry: &Entry) {
        let mut line = format!("{CLEAN} {}", entry.key);
        entry.write_lengths(&mut line);
        self.write_line(&line);
    }

    pub fn dirty(&mut self, key: &str) {
        self.write_line(&format!("{DIRTY} {key}"));
    }

    pub fn remove(&mut self, key: &str) {
        self.write_line(&format!("{REMOVE} {key}"));
    }

    pub fn read(&mut self, key: &str) {
        self.write_line(&format!("{READ} {key}"));
    }

    pub fn flush(&mut self) {
        if self.has_errors {
            return;
        }
        if let Some(out) = self.inner.as_mut() {
            if let Err(e) = out.flush() {
                tracing::warn!(error = %e, "journal flush failed");
                self.has_errors = true;
            }
        }
    }

    pub fn close(&mut self) {
        self.flush();
        self.inner = None;
    }
}
