//! Append-only log of validation runs
//!
//! Records are immutable; a re-run appends a new record. When backed by a
//! file, each record is written and synced as one JSON line before it
//! becomes visible in memory.

use crate::error::StorageError;
use isg_core::{CandidateId, ValidationResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the validation log inside a store directory
pub const VALIDATION_LOG_FILE: &str = "validations.jsonl";

#[derive(Debug, Default)]
pub struct ValidationLog {
    records: RwLock<HashMap<CandidateId, Vec<Arc<ValidationResult>>>>,
    sink: Option<(PathBuf, Mutex<File>)>,
}

impl ValidationLog {
    /// Log kept only in memory
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) a file-backed log and replay it
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or a record before the last
    /// one does not decode. A torn final record is dropped and truncated away.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let mut bytes = Vec::new();
        (&file)
            .read_to_end(&mut bytes)
            .map_err(|e| StorageError::io(&path, e))?;

        let mut records: HashMap<CandidateId, Vec<Arc<ValidationResult>>> = HashMap::new();
        let mut replayed = 0usize;
        // End of the last complete record
        let mut good = 0usize;
        let mut unterminated = false;
        let mut offset = 0usize;
        let mut lines = bytes.split_inclusive(|b| *b == b'\n').peekable();
        while let Some(raw) = lines.next() {
            offset += raw.len();
            let text = raw.strip_suffix(b"\n").unwrap_or(raw);
            if text.iter().all(u8::is_ascii_whitespace) {
                good = offset;
                continue;
            }
            match serde_json::from_slice::<ValidationResult>(text) {
                Ok(result) => {
                    records.entry(result.candidate).or_default().push(Arc::new(result));
                    replayed += 1;
                    good = offset;
                    unterminated = !raw.ends_with(b"\n");
                }
                // A crash mid-append can only tear the final line
                Err(e) if lines.peek().is_none() => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = good,
                        error = %e,
                        "dropping torn trailing validation record"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if good < bytes.len() {
            file.set_len(good as u64).map_err(|e| StorageError::io(&path, e))?;
        }
        if unterminated {
            (&file).write_all(b"\n").map_err(|e| StorageError::io(&path, e))?;
        }
        tracing::debug!(path = %path.display(), replayed, "validation log opened");

        Ok(Self {
            records: RwLock::new(records),
            sink: Some((path, Mutex::new(file))),
        })
    }

    /// Append a run record
    ///
    /// # Errors
    /// Returns error if the record cannot be written to the backing file
    pub fn append(&self, result: ValidationResult) -> Result<Arc<ValidationResult>, StorageError> {
        if let Some((path, file)) = &self.sink {
            let mut line = serde_json::to_vec(&result)?;
            line.push(b'\n');
            let mut file = file.lock();
            let before = file.metadata().map_err(|e| StorageError::io(path, e))?.len();
            let written = file.write_all(&line).and_then(|()| file.sync_data());
            if let Err(e) = written {
                // Never leave a partial line for the next record to glue onto
                if let Err(undo) = file.set_len(before) {
                    tracing::warn!(path = %path.display(), error = %undo, "could not roll back partial append");
                }
                return Err(StorageError::io(path, e));
            }
        }
        let result = Arc::new(result);
        self.records
            .write()
            .entry(result.candidate)
            .or_default()
            .push(Arc::clone(&result));
        Ok(result)
    }

    /// Most recent run for a candidate
    #[must_use]
    pub fn latest(&self, candidate: &CandidateId) -> Option<Arc<ValidationResult>> {
        self.records
            .read()
            .get(candidate)
            .and_then(|runs| runs.last().cloned())
    }

    /// Every run for a candidate, oldest first
    #[must_use]
    pub fn history(&self, candidate: &CandidateId) -> Vec<Arc<ValidationResult>> {
        self.records.read().get(candidate).cloned().unwrap_or_default()
    }

    /// Total number of runs recorded
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
