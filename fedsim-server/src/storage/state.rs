//! Persisted local state of the clients.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use derive_more::Display;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

use super::StorageError;
use fedsim_core::{
    io::{self as atomic, TMP_EXTENSION},
    ClientId,
    ModelState,
    RoundId,
};

/// Everything a client keeps between the rounds it participates in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    /// The round in which the state was written.
    pub round: RoundId,
    pub model: ModelState,
    /// The client's PRNG, so that shuffling continues where the last round stopped.
    pub prng: ChaCha20Rng,
}

/// The version of a local state to load.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RoundKey {
    #[display(fmt = "the latest round")]
    Latest,
    #[display(fmt = "round {}", _0)]
    Round(RoundId),
}

/// An error related to loading a local state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no local state of client {client} for {key}")]
    NotFound { client: ClientId, key: RoundKey },
    #[error("state storage failed: {0:#}")]
    Storage(#[from] StorageError),
}

/// A store of the local states of all clients.
///
/// The store does not lock. Each client is written by at most one task at a time.
pub trait StateStore {
    /// Saves the state of `client` written in `round`.
    ///
    /// # Behavior
    ///
    /// - If no state has been saved for this client and round yet, save it.
    /// - If a state exists, override it.
    fn save(&self, client: ClientId, round: RoundId, state: &LocalState) -> Result<(), StoreError>;

    /// Loads a state of `client`.
    ///
    /// # Behavior
    ///
    /// - If no state has been saved for the key, return [`StoreError::NotFound`].
    /// - [`RoundKey::Latest`] loads the state of the most recent round the client saved.
    fn load(&self, client: ClientId, key: RoundKey) -> Result<LocalState, StoreError>;

    /// Returns the most recent round in which `client` saved a state, if any.
    fn latest_round(&self, client: ClientId) -> Result<Option<RoundId>, StoreError>;
}

/// A [`StateStore`] keeping one file per client and round:
/// `<dir>/client_<id>/round_<round>.bin`.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn client_dir(&self, client: ClientId) -> PathBuf {
        self.dir.join(format!("client_{}", client))
    }

    fn path(&self, client: ClientId, round: RoundId) -> PathBuf {
        self.client_dir(client).join(format!("round_{}.bin", round))
    }
}

/// Parses the round out of a state file name, skipping unfinished writes.
fn parse_round(path: &Path) -> Option<RoundId> {
    if path.extension()? == TMP_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("round_")?
        .parse()
        .ok()
}

impl StateStore for FileStateStore {
    fn save(&self, client: ClientId, round: RoundId, state: &LocalState) -> Result<(), StoreError> {
        let path = self.path(client, round);
        atomic::write_atomic(&path, state)
            .with_context(|| format!("failed to save the local state of client {}", client))?;
        debug!("saved local state of client {} to {}", client, path.display());
        Ok(())
    }

    fn load(&self, client: ClientId, key: RoundKey) -> Result<LocalState, StoreError> {
        let round = match key {
            RoundKey::Round(round) => round,
            RoundKey::Latest => self
                .latest_round(client)?
                .ok_or(StoreError::NotFound { client, key })?,
        };
        match atomic::read(&self.path(client, round)) {
            Ok(state) => Ok(state),
            Err(err) if err.is_not_found() => Err(StoreError::NotFound { client, key }),
            Err(err) => Err(StorageError::from(err)
                .context(format!("failed to load the local state of client {}", client))
                .into()),
        }
    }

    fn latest_round(&self, client: ClientId) -> Result<Option<RoundId>, StoreError> {
        let dir = self.client_dir(client);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StorageError::from(err)
                    .context(format!("failed to list {}", dir.display()))
                    .into())
            }
        };
        let mut latest = None;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
            if let Some(round) = parse_round(&entry.path()) {
                latest = latest.max(Some(round));
            }
        }
        Ok(latest)
    }
}
