//! The local training of one client in one round.
//!
//! A [`WorkerTask`] fully describes the work; it is written to the shared directory by the
//! trainer and executed by a [`ClientWorker`], either in a `worker` process or inside the
//! coordinator. The worker is stateless: everything it knows about the client comes from the
//! dataset store and the state store.

use std::path::PathBuf;

use ndarray::Array2;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

use crate::{
    settings::TrainingSettings,
    storage::{
        FileStateStore,
        LocalState,
        PackageStore,
        RoundKey,
        StateStore,
        StorageError,
        StoreError,
    },
};
use fedsim_core::{
    common::{derive_seed, prng, Stream},
    dataset::DatasetError,
    train::{fit_hard, fit_soft, predict_proba, Metrics},
    ClientId,
    DownlinkPackage,
    Model,
    ModelError,
    ModelSelector,
    PartitionedDataset,
    RoundId,
    UplinkPackage,
    ZooSelector,
};

/// The local training task of a client in a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub client: ClientId,
    pub round: RoundId,
    /// The base seed of the run.
    pub seed: u64,
    /// The model name, the local schedule and the distillation schedule.
    pub settings: TrainingSettings,
    /// Whether the client has participated before, in which case its local state must exist.
    pub expect_state: bool,
    pub dataset_dir: PathBuf,
    pub state_dir: PathBuf,
    pub share_dir: PathBuf,
    /// The logging directives of a worker process.
    pub log_filter: Option<String>,
}

/// An error related to the execution of a [`WorkerTask`].
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("client {0} participated before but its local state is missing")]
    MissingState(ClientId),
    #[error("invalid downlink: {0}")]
    InvalidDownlink(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    State(#[from] StoreError),
    #[error("package storage failed: {0:#}")]
    Packages(#[from] StorageError),
}

/// Executes [`WorkerTask`]s against an opened dataset.
pub struct ClientWorker<'a> {
    task: &'a WorkerTask,
    dataset: &'a PartitionedDataset,
    states: FileStateStore,
    packages: PackageStore,
}

impl<'a> ClientWorker<'a> {
    pub fn new(task: &'a WorkerTask, dataset: &'a PartitionedDataset) -> Self {
        Self {
            task,
            dataset,
            states: FileStateStore::new(&task.state_dir),
            packages: PackageStore::new(&task.share_dir),
        }
    }

    /// Runs the task: distills on the consensus of the previous round, trains on the private
    /// shard, predicts on this round's probe subset and persists the local state.
    ///
    /// The uplink is written to the shared directory and returned.
    pub fn run(self) -> Result<UplinkPackage, WorkerError> {
        let WorkerTask { client, round, .. } = *self.task;
        let span = info_span!("client", id = %client, round);
        let _enter = span.enter();

        let (mut model, mut prng) = self.load_state()?;
        let downlink = self.packages.read_downlink(round)?;

        if let Some(kd) = self.distill(model.as_mut(), &downlink, &mut prng)? {
            debug!("distilled on the consensus: loss {:.4}", kd.loss);
        }

        let (features, labels) = self.dataset.private_batch(client)?;
        let metrics = fit_hard(
            model.as_mut(),
            features.view(),
            &labels,
            self.dataset.num_classes(),
            self.task.settings.client.schedule(),
            &mut prng,
        );
        debug!(
            "trained on {} samples: loss {:.4}, accuracy {:.4}",
            labels.len(),
            metrics.loss,
            metrics.acc
        );

        let probe = self.dataset.probe(&downlink.next_indices)?;
        let soft_labels = predict_proba(model.as_ref(), probe.view());

        let state = LocalState {
            round,
            model: model.state(),
            prng,
        };
        self.states.save(client, round, &state)?;

        let uplink = UplinkPackage {
            client,
            round,
            soft_labels,
            indices: downlink.next_indices,
            num_samples: labels.len(),
            train_loss: metrics.loss,
            train_acc: metrics.acc,
        };
        self.packages.write_uplink(&uplink)?;
        Ok(uplink)
    }

    /// Loads the model and the PRNG of the client, or creates them on its first participation.
    fn load_state(&self) -> Result<(Box<dyn Model>, ChaCha20Rng), WorkerError> {
        let WorkerTask {
            client,
            seed,
            ref settings,
            expect_state,
            ..
        } = *self.task;
        let selector = ZooSelector {
            num_features: self.dataset.num_features(),
            num_classes: self.dataset.num_classes(),
            hidden: settings.model.hidden,
            seed: derive_seed(seed, Stream::Client(client)),
        };
        let mut model = selector.select_model(&settings.model.name)?;

        match self.states.load(client, RoundKey::Latest) {
            Ok(state) => {
                debug!("resuming from the local state of round {}", state.round);
                model.load_state(&state.model)?;
                Ok((model, state.prng))
            }
            Err(StoreError::NotFound { .. }) if !expect_state => {
                debug!("first participation, creating a fresh local state");
                Ok((model, prng(seed, Stream::Client(client))))
            }
            Err(StoreError::NotFound { .. }) => Err(WorkerError::MissingState(client)),
            Err(err) => Err(err.into()),
        }
    }

    /// Distills the model on the consensus soft labels of the downlink, if there are any.
    fn distill(
        &self,
        model: &mut dyn Model,
        downlink: &DownlinkPackage,
        prng: &mut ChaCha20Rng,
    ) -> Result<Option<Metrics>, WorkerError> {
        let (soft_labels, indices) = match downlink.consensus() {
            Some(consensus) => consensus,
            None => return Ok(None),
        };
        check_consensus(soft_labels, indices, self.dataset.num_classes())?;
        let probe = self.dataset.probe(indices)?;
        Ok(Some(fit_soft(
            model,
            probe.view(),
            soft_labels.view(),
            self.task.settings.distillation.schedule(),
            prng,
        )))
    }
}

fn check_consensus(
    soft_labels: &Array2<f32>,
    indices: &[usize],
    num_classes: usize,
) -> Result<(), WorkerError> {
    if soft_labels.dim() != (indices.len(), num_classes) {
        return Err(WorkerError::InvalidDownlink(format!(
            "soft labels of shape {:?} for {} probe samples and {} classes",
            soft_labels.dim(),
            indices.len(),
            num_classes
        )));
    }
    Ok(())
}
