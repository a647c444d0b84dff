//! Durable per-page checkpoints and resume inspection.
//!
//! A [`CheckpointLocation`] decides where units live: a caller-supplied
//! directory that persists across runs, or a temporary directory removed
//! once the run succeeds.

mod resume;
mod signature;
mod store;

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

pub use resume::{ResumeState, scan};
pub use signature::QuerySignature;
pub use store::{Checkpoint, CheckpointError, CheckpointStore, CheckpointUnit};

use crate::config::Server;

/// Where a server's checkpoint units are kept.
#[derive(Debug)]
pub enum CheckpointLocation {
    /// Caller-managed directory; survives the run and enables resume.
    Persistent(PathBuf),
    /// Temporary directory removed by [`CheckpointLocation::cleanup`].
    Ephemeral(TempDir),
}

impl CheckpointLocation {
    /// Resolves the location for `server`: `dir` when given, otherwise a new
    /// temporary directory prefixed `<server>_batches_`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Io`] if the directory cannot be created.
    pub fn prepare(dir: Option<&Path>, server: Server) -> Result<Self, CheckpointError> {
        match dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
                Ok(Self::Persistent(dir.to_path_buf()))
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix(&format!("{server}_batches_"))
                    .tempdir()
                    .map_err(|source| CheckpointError::Io {
                        path: std::env::temp_dir(),
                        source,
                    })?;
                debug!(path = %temp.path().display(), "created ephemeral checkpoint directory");
                Ok(Self::Ephemeral(temp))
            }
        }
    }

    /// Directory holding the units.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Persistent(path) => path,
            Self::Ephemeral(temp) => temp.path(),
        }
    }

    /// Whether the directory is removed after a successful run.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral(_))
    }

    /// Gives up automatic removal and returns the directory path.
    ///
    /// Used after a failed run so the partial state can be resumed.
    #[must_use]
    pub fn retain(self) -> PathBuf {
        match self {
            Self::Persistent(path) => path,
            Self::Ephemeral(temp) => temp.keep(),
        }
    }

    /// Removes an ephemeral directory; persistent ones are left alone.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be removed.
    pub fn cleanup(self) -> io::Result<()> {
        match self {
            Self::Persistent(_) => Ok(()),
            Self::Ephemeral(temp) => {
                let path = temp.path().to_path_buf();
                temp.close()?;
                info!(path = %path.display(), "removed ephemeral checkpoint directory");
                Ok(())
            }
        }
    }
}
