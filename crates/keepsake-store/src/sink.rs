use std::fs::File;
use std::io::{self, Write};

/// Callback fired on the first I/O failure of a [`SlotSink`].
pub(crate) type OnFault = Box<dyn FnOnce(&io::Error) + Send>;

/// Writer for one slot of an entry being edited.
///
/// Writes never fail. The first I/O error is reported once to the owning
/// store (which detaches the editor so the edit cannot commit) and every later
/// write is discarded. A sink handed out by a detached editor has no file at
/// all and swallows everything.
pub struct SlotSink {
    file: Option<File>,
    has_errors: bool,
    on_fault: Option<OnFault>,
}

impl SlotSink {
    pub(crate) fn new(file: File, on_fault: OnFault) -> Self {
        Self {
            file: Some(file),
            has_errors: false,
            on_fault: Some(on_fault),
        }
    }

    pub(crate) fn blackhole() -> Self {
        Self {
            file: None,
            has_errors: false,
            on_fault: None,
        }
    }

    /// True when this sink discards writes, either because its editor was
    /// detached or because a write already failed.
    pub fn is_discarding(&self) -> bool {
        self.file.is_none() || self.has_errors
    }

    fn fault(&mut self, error: io::Error) {
        self.has_errors = true;
        if let Some(on_fault) = self.on_fault.take() {
            on_fault(&error);
        }
    }
}

impl Write for SlotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.has_errors {
            return Ok(buf.len());
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(buf.len());
        };
        match file.write_all(buf) {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                self.fault(e);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.has_errors {
            return Ok(());
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                self.fault(e);
            }
        }
        Ok(())
    }
}
