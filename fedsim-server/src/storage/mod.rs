//! Storage backends of a run.
//!
//! All artifacts live on the local disk and are written with
//! [`fedsim_core::io::write_atomic`], so a reader sees either no file or a complete one:
//!
//! - [`FileStateStore`]: the persisted local state of every client, versioned by round;
//! - [`PackageStore`]: the shared hand-off directory between the coordinator and the workers,
//!   holding the downlink, the worker tasks and the uplinks of every round.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Local};

pub mod packages;
pub mod state;

pub use self::{
    packages::PackageStore,
    state::{FileStateStore, LocalState, RoundKey, StateStore, StoreError},
};

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like a full disk, a missing permission or a corrupted file.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// The directories of a run.
///
/// ```text
/// <run>/dataset/
/// <run>/share/
/// <run>/state/
/// <run>/summary.jsonl
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunDirs {
    pub run: PathBuf,
    pub dataset: PathBuf,
    pub share: PathBuf,
    pub state: PathBuf,
}

impl RunDirs {
    pub fn new(run: impl Into<PathBuf>) -> Self {
        let run = run.into();
        Self {
            dataset: run.join("dataset"),
            share: run.join("share"),
            state: run.join("state"),
            run,
        }
    }

    /// The directories of a run started at `time`, below `root`.
    pub fn timestamped(root: &Path, time: DateTime<Local>) -> Self {
        Self::new(root.join(time.format("%Y%m%d_%H%M%S").to_string()))
    }

    /// Creates all directories.
    pub fn create(&self) -> StorageResult<()> {
        for dir in &[&self.dataset, &self.share, &self.state] {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run.join("summary.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_run_dirs() {
        let time = Local.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        let dirs = RunDirs::timestamped(Path::new("/tmp/runs"), time);
        assert_eq!(dirs.run, Path::new("/tmp/runs/20210304_050607"));
        assert_eq!(dirs.state, Path::new("/tmp/runs/20210304_050607/state"));

        let root = tempfile::tempdir().unwrap();
        let dirs = RunDirs::new(root.path().join("run"));
        dirs.create().unwrap();
        assert!(dirs.dataset.is_dir() && dirs.share.is_dir() && dirs.state.is_dir());
        assert_eq!(dirs.summary_path(), root.path().join("run").join("summary.jsonl"));
    }
}
