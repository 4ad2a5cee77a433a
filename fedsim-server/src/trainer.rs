//! The parallel client trainer.
//!
//! Every round the trainer turns the selected clients into [`WorkerTask`]s, runs them with a
//! bounded number of tasks in flight and collects the uplinks in the order the clients were
//! selected, whatever the order in which the tasks finish.
//!
//! Tasks hand their results over through the disk: the downlink, the tasks and the uplinks are
//! written to the [`PackageStore`] and the local states to the state store. In
//! [`ExecutionMode::Process`] every task is executed by a fresh `worker` process, which inherits
//! nothing from the coordinator but the task file path.

use std::{
    collections::HashSet,
    env,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt, StreamExt};
use thiserror::Error;
use tokio::{process::Command, task::JoinError};

use crate::{
    client::{ClientWorker, WorkerTask},
    settings::{ExecutionKind, Settings, TrainingSettings},
    storage::{PackageStore, RunDirs, StorageError},
    utils::concurrent_futures::ConcurrentFutures,
};
use fedsim_core::{ClientId, DownlinkPackage, PartitionedDataset, RoundId, UplinkPackage};

/// The name of the worker executable.
pub const WORKER_BIN: &str = "worker";

/// An error related to the local training of a round.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("client {0} was selected more than once")]
    DuplicateClient(ClientId),
    #[error("local task of client {client} failed: {source:#}")]
    Task {
        client: ClientId,
        source: anyhow::Error,
    },
    #[error("local task aborted: {0}")]
    Join(#[from] JoinError),
    #[error("client {0} finished without writing an uplink")]
    MissingUplink(ClientId),
    #[error("failed to locate the worker executable: {0}")]
    Worker(io::Error),
    #[error("package storage failed: {0:#}")]
    Packages(#[from] StorageError),
}

/// How the tasks of a round are executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Every task is executed by a fresh process of `program`, started with `--task <file>`.
    Process { program: PathBuf },
    /// The tasks run one after another on a blocking thread of the coordinator.
    Serial,
}

impl ExecutionMode {
    /// Gets the execution mode from the settings.
    ///
    /// Without an explicit worker path, the `worker` executable next to the running executable is
    /// used.
    pub fn from_settings(settings: &Settings) -> Result<Self, TrainerError> {
        match settings.simulation.execution {
            ExecutionKind::Serial => Ok(Self::Serial),
            ExecutionKind::Process => {
                let program = match &settings.simulation.worker {
                    Some(program) => program.clone(),
                    None => {
                        let mut dir = env::current_exe().map_err(TrainerError::Worker)?;
                        dir.pop();
                        dir.join(format!("{}{}", WORKER_BIN, env::consts::EXE_SUFFIX))
                    }
                };
                Ok(Self::Process { program })
            }
        }
    }
}

/// The settings of a [`ParallelClientTrainer`].
#[derive(Clone, Debug)]
pub struct TrainerSettings {
    pub num_parallels: usize,
    pub seed: u64,
    pub training: TrainingSettings,
    pub log_filter: Option<String>,
}

impl From<&Settings> for TrainerSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            num_parallels: settings.simulation.num_parallels,
            seed: settings.simulation.seed,
            training: settings.training(),
            log_filter: Some(settings.log.filter.to_string()),
        }
    }
}

type TaskOutcome = (ClientId, anyhow::Result<()>);

/// Runs the local training of the selected clients of a round.
pub struct ParallelClientTrainer {
    mode: ExecutionMode,
    settings: TrainerSettings,
    dataset: Arc<PartitionedDataset>,
    dirs: RunDirs,
    packages: PackageStore,
    /// clients which have saved a local state
    participated: HashSet<ClientId>,
    uplinks: Vec<UplinkPackage>,
}

impl ParallelClientTrainer {
    /// Creates a trainer for the run in `dirs`.
    ///
    /// The dataset must already be stored in the dataset directory of the run, where worker
    /// processes open it.
    pub fn new(
        mode: ExecutionMode,
        settings: TrainerSettings,
        dataset: Arc<PartitionedDataset>,
        dirs: RunDirs,
    ) -> Self {
        Self {
            mode,
            settings,
            dataset,
            packages: PackageStore::new(&dirs.share),
            dirs,
            participated: HashSet::new(),
            uplinks: Vec::new(),
        }
    }

    /// Runs the local training of the `selected` clients for the round of the `downlink`.
    ///
    /// At most `num_parallels` tasks are in flight at any time. If a task fails, the remaining
    /// tasks are still awaited before the first failure is returned.
    ///
    /// # Errors
    /// Fails if a client is selected twice, if a task fails or if a client did not write its
    /// uplink.
    pub async fn local_process(
        &mut self,
        downlink: &DownlinkPackage,
        selected: &[ClientId],
    ) -> Result<(), TrainerError> {
        self.uplinks.clear();
        let mut seen = HashSet::with_capacity(selected.len());
        if let Some(&client) = selected.iter().find(|&&client| !seen.insert(client)) {
            return Err(TrainerError::DuplicateClient(client));
        }

        let round = downlink.round;
        self.packages.write_downlink(downlink)?;

        let max_in_flight = match self.mode {
            ExecutionMode::Process { .. } => self.settings.num_parallels,
            ExecutionMode::Serial => 1,
        };
        info!(
            "running {} local tasks, at most {} at a time",
            selected.len(),
            max_in_flight
        );
        let mut pool = ConcurrentFutures::<BoxFuture<'static, TaskOutcome>>::new(max_in_flight);
        for &client in selected {
            let task = self.task(client, round);
            self.packages.clear_uplink(round, client)?;
            let path = self.packages.write_task(&task)?;
            pool.push(self.execute(task, path));
        }

        let mut failure = None;
        while let Some(joined) = pool.next().await {
            match joined {
                Ok((client, Ok(()))) => {
                    debug!("local task of client {} finished", client);
                    self.participated.insert(client);
                }
                Ok((client, Err(source))) => {
                    error!("local task of client {} failed: {:#}", client, source);
                    failure.get_or_insert(TrainerError::Task { client, source });
                }
                Err(err) => {
                    error!("local task aborted: {}", err);
                    failure.get_or_insert(TrainerError::Join(err));
                }
            }
        }
        if let Some(failure) = failure {
            return Err(failure);
        }

        let mut uplinks = Vec::with_capacity(selected.len());
        for &client in selected {
            let uplink = self
                .packages
                .read_uplink(round, client)?
                .ok_or(TrainerError::MissingUplink(client))?;
            uplinks.push(uplink);
        }
        self.uplinks = uplinks;
        Ok(())
    }

    /// Takes the uplinks of the last [`local_process`], in the order the clients were selected.
    ///
    /// [`local_process`]: ParallelClientTrainer::local_process
    pub fn uplink_package(&mut self) -> Vec<UplinkPackage> {
        std::mem::take(&mut self.uplinks)
    }

    /// Checks whether a client has saved a local state in an earlier round.
    pub fn has_participated(&self, client: ClientId) -> bool {
        self.participated.contains(&client)
    }

    fn task(&self, client: ClientId, round: RoundId) -> WorkerTask {
        WorkerTask {
            client,
            round,
            seed: self.settings.seed,
            settings: self.settings.training.clone(),
            expect_state: self.has_participated(client),
            dataset_dir: self.dirs.dataset.clone(),
            state_dir: self.dirs.state.clone(),
            share_dir: self.dirs.share.clone(),
            log_filter: self.settings.log_filter.clone(),
        }
    }

    fn execute(&self, task: WorkerTask, path: PathBuf) -> BoxFuture<'static, TaskOutcome> {
        let client = task.client;
        match &self.mode {
            ExecutionMode::Process { program } => {
                let program = program.clone();
                async move { (client, run_process(&program, &path).await) }.boxed()
            }
            ExecutionMode::Serial => {
                let dataset = Arc::clone(&self.dataset);
                async move {
                    let result = tokio::task::spawn_blocking(move || {
                        ClientWorker::new(&task, &dataset).run().map(|_| ())
                    })
                    .await;
                    let result = match result {
                        Ok(result) => result.map_err(anyhow::Error::from),
                        Err(err) => Err(anyhow::Error::from(err)),
                    };
                    (client, result)
                }
                .boxed()
            }
        }
    }
}

/// Runs a worker process on a task file and waits for it to exit.
///
/// The process is killed if the returned future is dropped.
async fn run_process(program: &Path, task: &Path) -> anyhow::Result<()> {
    let status = Command::new(program)
        .arg("--task")
        .arg(task)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|err| anyhow::anyhow!("failed to run {}: {}", program.display(), err))?;
    if status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("worker exited with {}", status))
    }
}
