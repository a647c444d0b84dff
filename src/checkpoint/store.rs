//! Checkpoint Store: one durable JSON file per fetched page.
//!
//! Units are named `<signature>.p<index>.json`, or `<signature>.p<index>.end.json`
//! for a terminal page, so listing a directory is enough to know which pages
//! exist and whether the end has been seen. Each unit is written to a
//! temporary file in the same directory, synced, then published with a
//! no-clobber rename: readers never observe a partial unit and the first
//! write of a page wins.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use super::signature::QuerySignature;
use crate::fetch::PageResult;
use crate::record::RawRecord;

const UNIT_SUFFIX: &str = ".json";
const TERMINAL_SUFFIX: &str = ".end.json";

/// Errors raised by the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem operation failed.
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A unit exists but cannot be trusted.
    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt {
        /// The unit.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// A page could not be serialized.
    #[error("cannot encode checkpoint {path}: {source}")]
    Encode {
        /// The unit being written.
        path: PathBuf,
        /// Serializer error.
        #[source]
        source: serde_json::Error,
    },
}

impl CheckpointError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Contents of one unit. Self-describing: it can be re-read without any
/// other state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Signature of the query that produced the page.
    pub signature: String,
    /// Zero-based page index.
    pub page_index: u64,
    /// Whether the page was the last one.
    pub is_terminal: bool,
    /// Total declared by the API, if any.
    #[serde(default)]
    pub declared_total: Option<u64>,
    /// Records in API order.
    pub records: Vec<RawRecord>,
}

/// A unit seen in the store, as described by its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckpointUnit {
    /// Zero-based page index.
    pub page_index: u64,
    /// Whether the page was terminal.
    pub is_terminal: bool,
}

/// Directory of per-page checkpoint units.
///
/// Writers never touch each other's units, so concurrent `put` calls for
/// distinct pages need no coordination.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CheckpointError::io(&root, e))?;
        Ok(Self { root })
    }

    /// A store over `root` without touching the filesystem. Reading a
    /// missing directory yields no units.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the units.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persists `page` under `signature`.
    ///
    /// Returns `false` when a unit for that page already existed; the
    /// existing unit is left untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckpointError`] if the unit cannot be encoded or
    /// written. Nothing is published in that case.
    pub fn put(&self, signature: &QuerySignature, page: &PageResult) -> Result<bool, CheckpointError> {
        if let Some(existing) = self.find(signature, page.page_index) {
            debug!(page = page.page_index, path = %existing.display(), "checkpoint already present");
            return Ok(false);
        }

        let path = self.unit_path(signature, page.page_index, page.is_terminal);
        let checkpoint = Checkpoint {
            signature: signature.as_str().to_string(),
            page_index: page.page_index,
            is_terminal: page.is_terminal,
            declared_total: page.declared_total,
            records: page.records.clone(),
        };
        let json = serde_json::to_vec(&checkpoint).map_err(|source| CheckpointError::Encode {
            path: path.clone(),
            source,
        })?;

        fs::create_dir_all(&self.root).map_err(|e| CheckpointError::io(&self.root, e))?;
        let mut temp_file =
            NamedTempFile::new_in(&self.root).map_err(|e| CheckpointError::io(&self.root, e))?;
        let temp_path = temp_file.path().to_path_buf();
        temp_file
            .write_all(&json)
            .map_err(|e| CheckpointError::io(&temp_path, e))?;
        temp_file
            .flush()
            .map_err(|e| CheckpointError::io(&temp_path, e))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| CheckpointError::io(&temp_path, e))?;

        match temp_file.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(page = page.page_index, "checkpoint written concurrently, keeping first");
                return Ok(false);
            }
            Err(e) => return Err(CheckpointError::io(&path, e.error)),
        }

        if let Ok(dir) = fs::File::open(&self.root)
            && let Err(error) = dir.sync_all()
        {
            warn!(path = %self.root.display(), %error, "failed to sync checkpoint directory");
        }

        debug!(
            page = page.page_index,
            records = page.records.len(),
            terminal = page.is_terminal,
            "checkpoint persisted"
        );
        Ok(true)
    }

    /// Async form of [`put`](Self::put). The write and syncs run on the
    /// blocking thread pool so they never stall the runtime's workers.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put); a panicked write task is reported as
    /// [`CheckpointError::Io`].
    pub async fn persist(
        &self,
        signature: &QuerySignature,
        page: PageResult,
    ) -> Result<bool, CheckpointError> {
        let store = self.clone();
        let signature = signature.clone();
        tokio::task::spawn_blocking(move || store.put(&signature, &page))
            .await
            .map_err(|e| CheckpointError::io(&self.root, io::Error::other(e)))?
    }

    /// Reads the unit for `page_index`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Corrupt`] if the unit does not decode or
    /// belongs to a different page or query.
    pub fn get(
        &self,
        signature: &QuerySignature,
        page_index: u64,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(path) = self.find(signature, page_index) else {
            return Ok(None);
        };
        let bytes = fs::read(&path).map_err(|e| CheckpointError::io(&path, e))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| CheckpointError::corrupt(&path, e.to_string()))?;

        if checkpoint.signature != signature.as_str() || checkpoint.page_index != page_index {
            return Err(CheckpointError::corrupt(
                &path,
                format!(
                    "holds page {} of '{}'",
                    checkpoint.page_index, checkpoint.signature
                ),
            ));
        }
        Ok(Some(checkpoint))
    }

    /// Indices of every persisted page for `signature`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the directory exists but cannot be
    /// read.
    pub fn list(&self, signature: &QuerySignature) -> Result<BTreeSet<u64>, CheckpointError> {
        Ok(self
            .units(signature)?
            .into_iter()
            .map(|unit| unit.page_index)
            .collect())
    }

    /// Every persisted unit for `signature`, ascending by page index.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the directory exists but cannot be
    /// read.
    pub fn units(&self, signature: &QuerySignature) -> Result<Vec<CheckpointUnit>, CheckpointError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.root, e)),
        };

        let prefix = format!("{signature}.p");
        let mut units = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(&self.root, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(unit) = parse_unit_name(name, &prefix) {
                units.push(unit);
            }
        }
        units.sort_unstable();
        units.dedup_by_key(|unit| unit.page_index);
        Ok(units)
    }

    fn unit_path(&self, signature: &QuerySignature, page_index: u64, is_terminal: bool) -> PathBuf {
        let suffix = if is_terminal { TERMINAL_SUFFIX } else { UNIT_SUFFIX };
        self.root
            .join(format!("{signature}.p{page_index:06}{suffix}"))
    }

    fn find(&self, signature: &QuerySignature, page_index: u64) -> Option<PathBuf> {
        [false, true]
            .into_iter()
            .map(|terminal| self.unit_path(signature, page_index, terminal))
            .find(|path| path.is_file())
    }
}

fn parse_unit_name(name: &str, prefix: &str) -> Option<CheckpointUnit> {
    let rest = name.strip_prefix(prefix)?;
    let (digits, is_terminal) = match rest.strip_suffix(TERMINAL_SUFFIX) {
        Some(digits) => (digits, true),
        None => (rest.strip_suffix(UNIT_SUFFIX)?, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(CheckpointUnit {
        page_index: digits.parse().ok()?,
        is_terminal,
    })
}
