//! The shared hand-off directory between the coordinator and the workers.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;

use super::StorageResult;
use crate::client::WorkerTask;
use fedsim_core::{io as atomic, ClientId, DownlinkPackage, RoundId, UplinkPackage};

/// The packages of all rounds, laid out as
///
/// ```text
/// <dir>/round_<round>/downlink.bin
/// <dir>/round_<round>/task_<client>.bin
/// <dir>/round_<round>/uplink_<client>.bin
/// ```
#[derive(Clone, Debug)]
pub struct PackageStore {
    dir: PathBuf,
}

impl PackageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn round_dir(&self, round: RoundId) -> PathBuf {
        self.dir.join(format!("round_{}", round))
    }

    pub fn downlink_path(&self, round: RoundId) -> PathBuf {
        self.round_dir(round).join("downlink.bin")
    }

    pub fn task_path(&self, round: RoundId, client: ClientId) -> PathBuf {
        self.round_dir(round).join(format!("task_{}.bin", client))
    }

    pub fn uplink_path(&self, round: RoundId, client: ClientId) -> PathBuf {
        self.round_dir(round).join(format!("uplink_{}.bin", client))
    }

    pub fn write_downlink(&self, downlink: &DownlinkPackage) -> StorageResult<()> {
        atomic::write_atomic(&self.downlink_path(downlink.round), downlink)
            .with_context(|| format!("failed to write the downlink of round {}", downlink.round))
    }

    pub fn read_downlink(&self, round: RoundId) -> StorageResult<DownlinkPackage> {
        atomic::read(&self.downlink_path(round))
            .with_context(|| format!("failed to read the downlink of round {}", round))
    }

    /// Writes a task and returns the path a worker reads it from.
    pub fn write_task(&self, task: &WorkerTask) -> StorageResult<PathBuf> {
        let path = self.task_path(task.round, task.client);
        atomic::write_atomic(&path, task)
            .with_context(|| format!("failed to write the task of client {}", task.client))?;
        Ok(path)
    }

    pub fn read_task(path: &Path) -> StorageResult<WorkerTask> {
        atomic::read(path).with_context(|| format!("failed to read the task {}", path.display()))
    }

    pub fn write_uplink(&self, uplink: &UplinkPackage) -> StorageResult<()> {
        atomic::write_atomic(&self.uplink_path(uplink.round, uplink.client), uplink)
            .with_context(|| format!("failed to write the uplink of client {}", uplink.client))
    }

    /// Reads the uplink of a client, or `None` if the client has not written it.
    pub fn read_uplink(
        &self,
        round: RoundId,
        client: ClientId,
    ) -> StorageResult<Option<UplinkPackage>> {
        match atomic::read(&self.uplink_path(round, client)) {
            Ok(uplink) => Ok(Some(uplink)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read the uplink of client {}", client)),
        }
    }

    /// Removes an uplink left behind by an earlier attempt of the same round.
    pub fn clear_uplink(&self, round: RoundId, client: ClientId) -> StorageResult<()> {
        let path = self.uplink_path(round, client);
        match fs::remove_file(&path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                Err(err).with_context(|| format!("failed to remove {}", path.display()))
            }
            _ => Ok(()),
        }
    }
}
