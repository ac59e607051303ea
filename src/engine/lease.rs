//! Cross-process run ownership.
//!
//! The process driving a run holds an exclusive advisory lock on
//! `<dir>/<run-id>.lock` from setup until teardown. Several conductor
//! processes may share one run database and workspace root; a run is only
//! treated as interrupted when its lock can be taken.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::engine::models::RunId;

/// Directory holding one lock file per live run.
#[derive(Debug, Clone)]
pub struct LeaseDir {
    dir: PathBuf,
}

impl LeaseDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{}.lock", run_id.simple()))
    }

    /// Take the lease for `run_id`. `Ok(None)` when another holder has it.
    pub fn try_acquire(&self, run_id: RunId) -> io::Result<Option<RunLease>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(run_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(RunLease { file, path })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether some live process owns `run_id`. Errors count as owned so a
    /// run is never failed on a guess.
    pub fn is_held(&self, run_id: RunId) -> bool {
        match self.try_acquire(run_id) {
            Ok(Some(lease)) => {
                lease.release();
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Could not check run lease");
                true
            }
        }
    }
}

/// An exclusively held run lock. Dropping it unlocks; [`RunLease::release`]
/// also removes the file.
#[derive(Debug)]
pub struct RunLease {
    file: File,
    path: PathBuf,
}

impl RunLease {
    pub fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove lease file");
        }
        drop(self.file);
    }
}
