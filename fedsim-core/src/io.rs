//! Crash-safe persistence of serialized values.
//!
//! Files are written to a temporary sibling first, flushed to disk and then
//! renamed into place. A reader therefore either finds no file or a complete
//! one. Temporary files left behind by an interrupted writer carry the
//! [`TMP_EXTENSION`] and are never read.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// The extension of files that are still being written.
pub const TMP_EXTENSION: &str = "tmp";

/// An error related to reading or writing a serialized value.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{path}: {source}")]
    Codec { path: PathBuf, source: bincode::Error },
}

impl IoError {
    /// Checks whether the error was caused by a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IoError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> IoError + '_ {
    move |source| IoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TMP_EXTENSION);
    path.with_file_name(name)
}

/// Serializes `value` with `bincode` and atomically writes it to `path`.
///
/// Missing parent directories are created. The parent directory is synced
/// after the rename.
pub fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), IoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = tmp_path(path);
    let file = File::create(&tmp).map_err(io_err(&tmp))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, value).map_err(|source| IoError::Codec {
        path: tmp.clone(),
        source,
    })?;
    writer.flush().map_err(io_err(&tmp))?;
    let file = writer
        .into_inner()
        .map_err(|err| io_err(&tmp)(err.into_error()))?;
    file.sync_all().map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))?;
    match path.parent() {
        Some(parent) => sync_dir(parent),
        None => Ok(()),
    }
}

/// Flushes the entries of a directory, so that a rename within it survives a crash.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), IoError> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(io_err(dir))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), IoError> {
    Ok(())
}

/// Reads a value written by [`write_atomic`].
pub fn read<T: DeserializeOwned>(path: &Path) -> Result<T, IoError> {
    let file = File::open(path).map_err(io_err(path))?;
    bincode::deserialize_from(BufReader::new(file)).map_err(|source| IoError::Codec {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("value.bin");
        write_atomic(&path, &vec![1_u32, 2, 3]).unwrap();
        assert_eq!(read::<Vec<u32>>(&path).unwrap(), vec![1, 2, 3]);
        assert!(!tmp_path(&path).exists());

        write_atomic(&path, &vec![4_u32]).unwrap();
        assert_eq!(read::<Vec<u32>>(&path).unwrap(), vec![4]);
    }

    #[cfg(unix)]
    #[test]
    fn test_sync_dir() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).unwrap();
        sync_dir(Path::new("")).unwrap();
        let err = sync_dir(&dir.path().join("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read::<u32>(&dir.path().join("missing.bin")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_read_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.bin");
        fs::write(&path, [1_u8, 2]).unwrap();
        let err = read::<(u64, u64)>(&path).unwrap_err();
        assert!(!err.is_not_found());
    }
}
