//! Append-only JSON-lines journal.
//!
//! Every durable structure in the vault (escrow records, tokens, the signal
//! outcome log, receipts) is an append-only sequence of serde values, one per
//! line. Opening a journal replays what is already on disk so state survives
//! restarts.
//!
//! A crash can leave a torn final line; opening drops it with a warning and
//! truncates the file back to the last complete entry. A corrupt line
//! anywhere else is a hard error.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    marker::PhantomData,
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};

use grantvault_types::{Result, VaultError};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};

/// Durable append-only log of `T`.
#[derive(Debug)]
pub struct Journal<T> {
    file: Mutex<File>,
    /// Appends left to fail with `Io` (simulated disk fault).
    faults: AtomicU32,
    _entries: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// Open (or create) the journal at `path` and replay its entries.
    ///
    /// # Errors
    /// `Io` if the file cannot be opened, `Serialization` on a corrupt entry.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<T>)> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let entries = Self::replay(path, &file)?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "journal opened");
        Ok((
            Self {
                file: Mutex::new(file),
                faults: AtomicU32::new(0),
                _entries: PhantomData,
            },
            entries,
        ))
    }

    fn replay(path: &Path, mut file: &File) -> Result<Vec<T>> {
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut entries = Vec::new();
        let mut good_len = 0usize;
        let mut offset = 0usize;
        let mut line_no = 0usize;
        while offset < raw.len() {
            line_no += 1;
            let (line, next) = match raw[offset..].iter().position(|&b| b == b'\n') {
                Some(pos) => (&raw[offset..offset + pos], offset + pos + 1),
                None => (&raw[offset..], raw.len()),
            };
            let terminated = raw[next - 1] == b'\n';
            let is_last = next == raw.len();

            let parsed = if line.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                Some(serde_json::from_slice::<T>(line))
            };
            match parsed {
                None if terminated => good_len = next,
                None => {}
                Some(Ok(entry)) => {
                    entries.push(entry);
                    good_len = next;
                }
                Some(Err(err)) if is_last => {
                    tracing::warn!(
                        path = %path.display(),
                        line = line_no,
                        error = %err,
                        "dropping torn trailing journal entry"
                    );
                }
                Some(Err(err)) => {
                    return Err(VaultError::Serialization(format!(
                        "{}:{line_no}: {err}",
                        path.display()
                    )));
                }
            }
            offset = next;
        }

        // A complete final entry missing its newline still needs one before
        // the next append.
        if good_len == raw.len() && raw.last().is_some_and(|&b| b != b'\n') {
            file.write_all(b"\n")?;
            file.sync_data()?;
        } else if good_len < raw.len() {
            file.set_len(good_len as u64)?;
            file.sync_data()?;
        }
        Ok(entries)
    }

    /// Durably append one entry.
    ///
    /// The entry is flushed and synced before this returns `Ok`. A failed
    /// write is cut back off the file so the journal never keeps a partial
    /// line.
    ///
    /// # Errors
    /// `Io` if the write or sync fails.
    pub fn append(&self, entry: &T) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = self.file.lock();
        if self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VaultError::Io("simulated journal write fault".into()));
        }
        let before = file.metadata()?.len();
        let written = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_data());
        if let Err(err) = written {
            if let Err(undo) = file.set_len(before) {
                tracing::error!(error = %undo, "failed to cut back partial journal write");
            }
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl<T> Journal<T> {
    /// Make the next `appends` appends fail with `Io` without writing.
    pub fn fail_next(&self, appends: u32) {
        self.faults.store(appends, Ordering::SeqCst);
    }
}
