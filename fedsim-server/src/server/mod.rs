//! The server handler.
//!
//! The handler owns the global side of a run: it decides which clients take part in a round and
//! which probe samples they predict on, it buffers their uplinks and, once every sampled client has
//! reported, it aggregates the predictions into consensus soft labels and distills its own model
//! on them.
//!
//! A round moves through the phases
//!
//! ```text
//! Idle --sample_clients--> Collecting --load (last uplink)--> Aggregating --> Idle | Stopped
//! ```
//!
//! Only predictions on the public probe samples are received from the clients. Their model
//! parameters never reach the server.

pub mod aggregation;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use derive_more::Display;
use ndarray::Array2;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

use self::aggregation::{agreement, entropy_reduction, weighted_average};
use crate::settings::{DistillationSettings, ModelSettings, Settings};
use fedsim_core::{
    common::{derive_seed, prng, Stream},
    dataset::{sample_probe_indices, DatasetError},
    ops::mean_entropy,
    train::{evaluate, fit_soft},
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

/// The metrics of the last aggregated round, by name.
pub type Summary = BTreeMap<String, f64>;

/// The phase of the current round.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Collecting")]
    Collecting,
    #[display(fmt = "Aggregating")]
    Aggregating,
    #[display(fmt = "Stopped")]
    Stopped,
}

/// An error related to the handling of uplinks.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("uplink of round {found} received in round {expected}")]
    WrongRound { expected: RoundId, found: RoundId },
    #[error("client {0} was not sampled in this round")]
    NotSampled(ClientId),
    #[error("client {0} already reported in this round")]
    Duplicate(ClientId),
    #[error("uplink of client {client} has an invalid shape: {reason}")]
    InvalidUplink { client: ClientId, reason: String },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// The settings of a [`ServerHandler`].
#[derive(Clone, Debug)]
pub struct HandlerSettings {
    pub num_clients: usize,
    pub global_round: RoundId,
    pub sample_ratio: f64,
    pub seed: u64,
    pub model: ModelSettings,
    pub distillation: DistillationSettings,
}

impl From<&Settings> for HandlerSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            num_clients: settings.simulation.num_clients,
            global_round: settings.simulation.global_round,
            sample_ratio: settings.simulation.sample_ratio,
            seed: settings.simulation.seed,
            model: settings.model.clone(),
            distillation: settings.distillation,
        }
    }
}

/// The consensus of the last aggregated round.
#[derive(Clone, Debug, PartialEq)]
pub struct Consensus {
    /// The entropy reduced soft labels, one row per probe sample.
    pub soft_labels: Array2<f32>,
    /// The probe pool indices of the soft labels.
    pub indices: Vec<usize>,
}

/// Samples clients, broadcasts the consensus and aggregates the uplinks of every round.
pub struct ServerHandler {
    settings: HandlerSettings,
    dataset: Arc<PartitionedDataset>,
    model: Box<dyn Model>,
    prng: ChaCha20Rng,
    round: RoundId,
    phase: PhaseName,
    sampled: BTreeSet<ClientId>,
    next_indices: Vec<usize>,
    uplinks: BTreeMap<ClientId, UplinkPackage>,
    consensus: Option<Consensus>,
    summary: Summary,
}

impl ServerHandler {
    /// Creates a handler in round `0`.
    ///
    /// # Errors
    /// Fails if the model name is unknown.
    pub fn new(
        settings: HandlerSettings,
        dataset: Arc<PartitionedDataset>,
    ) -> Result<Self, HandlerError> {
        let selector = ZooSelector {
            num_features: dataset.num_features(),
            num_classes: dataset.num_classes(),
            hidden: settings.model.hidden,
            seed: derive_seed(settings.seed, Stream::Server),
        };
        let model = selector.select_model(&settings.model.name)?;
        let phase = if settings.global_round == 0 {
            PhaseName::Stopped
        } else {
            PhaseName::Idle
        };
        Ok(Self {
            prng: prng(settings.seed, Stream::Server),
            settings,
            dataset,
            model,
            round: 0,
            phase,
            sampled: BTreeSet::new(),
            next_indices: Vec::new(),
            uplinks: BTreeMap::new(),
            consensus: None,
            summary: Summary::new(),
        })
    }

    /// The current round.
    pub fn round(&self) -> RoundId {
        self.round
    }

    pub fn phase(&self) -> PhaseName {
        self.phase
    }

    /// The consensus of the last aggregated round, if any.
    pub fn consensus(&self) -> Option<&Consensus> {
        self.consensus.as_ref()
    }

    /// Checks whether all rounds are done.
    pub fn if_stop(&self) -> bool {
        self.round >= self.settings.global_round
    }

    /// The number of clients sampled per round: `floor(sample_ratio * num_clients)`, but at least
    /// one.
    pub fn num_sampled(&self) -> usize {
        let count =
            (self.settings.sample_ratio * self.settings.num_clients as f64).floor() as usize;
        count.max(1).min(self.settings.num_clients)
    }

    /// Samples the clients of the current round and fixes the probe samples they predict on.
    ///
    /// The choice only depends on the seed and the round. The clients are returned in ascending
    /// order.
    pub fn sample_clients(&mut self) -> Vec<ClientId> {
        let mut prng = prng(self.settings.seed, Stream::Sampling(self.round));
        let mut sampled: Vec<ClientId> =
            rand::seq::index::sample(&mut prng, self.settings.num_clients, self.num_sampled())
                .into_iter()
                .map(|index| ClientId::new(index as u32))
                .collect();
        sampled.sort_unstable();

        self.next_indices = sample_probe_indices(
            self.dataset.open_size(),
            self.settings.distillation.open_size_per_round,
            self.settings.seed,
            self.round,
        );
        self.sampled = sampled.iter().copied().collect();
        self.uplinks.clear();
        self.set_phase(PhaseName::Collecting);
        debug!("sampled clients {:?}", sampled);
        sampled
    }

    /// The downlink of the current round.
    pub fn downlink_package(&self) -> DownlinkPackage {
        DownlinkPackage {
            round: self.round,
            soft_labels: self.consensus.as_ref().map(|c| c.soft_labels.clone()),
            indices: self.consensus.as_ref().map(|c| c.indices.clone()),
            next_indices: self.next_indices.clone(),
        }
    }

    /// Buffers the uplink of a sampled client.
    ///
    /// Once every sampled client has reported, the round is aggregated, the round counter is
    /// incremented and `true` is returned.
    ///
    /// # Errors
    /// Fails if the uplink belongs to another round or an unsampled client, if the client already
    /// reported or if the predictions do not match the probe samples of the round. A rejected
    /// uplink leaves the handler unchanged.
    pub fn load(&mut self, uplink: UplinkPackage) -> Result<bool, HandlerError> {
        self.check(&uplink)?;
        self.uplinks.insert(uplink.client, uplink);
        if self.uplinks.len() < self.sampled.len() {
            return Ok(false);
        }

        self.set_phase(PhaseName::Aggregating);
        self.aggregate()?;
        self.round += 1;
        let next = if self.if_stop() {
            PhaseName::Stopped
        } else {
            PhaseName::Idle
        };
        self.set_phase(next);
        Ok(true)
    }

    /// The metrics of the last aggregated round.
    pub fn get_summary(&self) -> Summary {
        self.summary.clone()
    }

    fn set_phase(&mut self, phase: PhaseName) {
        debug!("round {}: {} -> {}", self.round, self.phase, phase);
        self.phase = phase;
    }

    fn check(&self, uplink: &UplinkPackage) -> Result<(), HandlerError> {
        let client = uplink.client;
        if uplink.round != self.round {
            return Err(HandlerError::WrongRound {
                expected: self.round,
                found: uplink.round,
            });
        }
        if self.phase != PhaseName::Collecting || !self.sampled.contains(&client) {
            return Err(HandlerError::NotSampled(client));
        }
        if self.uplinks.contains_key(&client) {
            return Err(HandlerError::Duplicate(client));
        }
        if uplink.indices != self.next_indices {
            return Err(HandlerError::InvalidUplink {
                client,
                reason: "predictions for other probe samples".into(),
            });
        }
        let expected = (self.next_indices.len(), self.dataset.num_classes());
        if uplink.soft_labels.dim() != expected {
            return Err(HandlerError::InvalidUplink {
                client,
                reason: format!(
                    "soft labels of shape {:?} instead of {:?}",
                    uplink.soft_labels.dim(),
                    expected
                ),
            });
        }
        Ok(())
    }

    /// Aggregates the buffered uplinks into the consensus and distills the server model on it.
    fn aggregate(&mut self) -> Result<(), HandlerError> {
        let uplinks = std::mem::take(&mut self.uplinks);
        let indices = std::mem::take(&mut self.next_indices);
        self.sampled.clear();

        let num_classes = self.dataset.num_classes();
        let average = weighted_average(
            uplinks
                .values()
                .map(|uplink| (&uplink.soft_labels, uplink.num_samples)),
        )
        .unwrap_or_else(|| {
            Array2::from_elem((indices.len(), num_classes), 1. / num_classes as f32)
        });
        let soft_labels =
            entropy_reduction(average.view(), self.settings.distillation.era_temperature);

        let probe = self.dataset.probe(&indices)?;
        let kd = fit_soft(
            self.model.as_mut(),
            probe.view(),
            soft_labels.view(),
            self.settings.distillation.schedule(),
            &mut self.prng,
        );
        let (test_x, test_y) = self.dataset.test_set();
        let test = evaluate(self.model.as_ref(), test_x.view(), test_y, num_classes);

        let count = uplinks.len().max(1) as f64;
        let mean = |f: &dyn Fn(&UplinkPackage) -> f32| {
            uplinks.values().map(|u| f(u) as f64).sum::<f64>() / count
        };
        let mut summary = Summary::new();
        summary.insert("server_acc".into(), test.acc as f64);
        summary.insert("server_loss".into(), test.loss as f64);
        summary.insert("kd_loss".into(), kd.loss as f64);
        summary.insert("consensus_entropy".into(), mean_entropy(soft_labels.view()) as f64);
        summary.insert(
            "client_agreement".into(),
            mean(&|u| agreement(u.soft_labels.view(), soft_labels.view())),
        );
        summary.insert("client_train_loss".into(), mean(&|u| u.train_loss));
        summary.insert("client_train_acc".into(), mean(&|u| u.train_acc));
        summary.insert("num_uplinks".into(), uplinks.len() as f64);
        self.summary = summary;

        self.consensus = Some(Consensus { soft_labels, indices });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{dataset, training};
    use fedsim_core::ops::softmax;

    fn settings(num_clients: usize, sample_ratio: f64) -> HandlerSettings {
        let training = training();
        HandlerSettings {
            num_clients,
            global_round: 2,
            sample_ratio,
            seed: 13,
            model: training.model,
            distillation: training.distillation,
        }
    }

    fn handler(num_clients: usize, sample_ratio: f64) -> ServerHandler {
        ServerHandler::new(settings(num_clients, sample_ratio), Arc::new(dataset(num_clients)))
            .unwrap()
    }

    /// A valid uplink for the current round, with client specific predictions.
    fn uplink(handler: &ServerHandler, client: ClientId) -> UplinkPackage {
        let downlink = handler.downlink_package();
        let logits = Array2::from_shape_fn((downlink.next_indices.len(), 3), |(row, class)| {
            ((row + class * (client.index() + 1)) % 5) as f32
        });
        UplinkPackage {
            client,
            round: downlink.round,
            soft_labels: softmax(logits.view(), 1.),
            indices: downlink.next_indices,
            num_samples: 10 + client.index(),
            train_loss: 0.5,
            train_acc: 0.75,
        }
    }

    #[test]
    fn test_sample_count() {
        assert_eq!(handler(4, 0.5).num_sampled(), 2);
        assert_eq!(handler(4, 0.3).num_sampled(), 1);
        assert_eq!(handler(4, 0.01).num_sampled(), 1);
        assert_eq!(handler(4, 1.).num_sampled(), 4);
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let mut first = handler(4, 0.5);
        let mut second = handler(4, 0.5);
        let sampled = first.sample_clients();
        assert_eq!(sampled, second.sample_clients());
        assert_eq!(first.downlink_package(), second.downlink_package());
        assert_eq!(sampled.len(), 2);
        assert!(sampled.windows(2).all(|w| w[0] < w[1]));
        assert!(sampled.iter().all(|client| client.index() < 4));

        let downlink = first.downlink_package();
        assert_eq!(downlink.round, 0);
        assert!(downlink.consensus().is_none());
        assert_eq!(downlink.next_indices.len(), 10);
    }

    #[test]
    fn test_round_lifecycle() {
        let mut handler = handler(4, 0.5);
        assert_eq!(handler.phase(), PhaseName::Idle);
        assert!(handler.get_summary().is_empty());

        for round in 0..2 {
            assert!(!handler.if_stop());
            assert_eq!(handler.round(), round);
            let sampled = handler.sample_clients();
            assert_eq!(handler.phase(), PhaseName::Collecting);
            let uplinks: Vec<_> = sampled.iter().map(|&client| uplink(&handler, client)).collect();
            let mut done = Vec::new();
            for uplink in uplinks {
                done.push(handler.load(uplink).unwrap());
            }
            assert_eq!(done, vec![false, true]);
            assert_eq!(handler.round(), round + 1);

            let summary = handler.get_summary();
            assert_eq!(summary["num_uplinks"], 2.);
            assert!(summary.contains_key("server_acc"));
            assert!(summary["consensus_entropy"] >= 0.);
        }
        assert!(handler.if_stop());
        assert_eq!(handler.phase(), PhaseName::Stopped);

        let downlink = handler.downlink_package();
        let (soft_labels, indices) = downlink.consensus().unwrap();
        assert_eq!(soft_labels.nrows(), indices.len());
        for row in soft_labels.rows() {
            assert!((row.sum() - 1.).abs() < 1e-5);
        }
    }

    #[test]
    fn test_consensus_is_commutative() {
        let run = |reverse: bool| {
            let mut handler = handler(4, 1.);
            let sampled = handler.sample_clients();
            let mut uplinks: Vec<_> =
                sampled.iter().map(|&client| uplink(&handler, client)).collect();
            if reverse {
                uplinks.reverse();
            }
            for uplink in uplinks {
                handler.load(uplink).unwrap();
            }
            (handler.consensus().cloned(), handler.get_summary())
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn test_invalid_uplinks_are_rejected() {
        let mut handler = handler(4, 0.5);
        let stray = uplink(&handler, ClientId::new(0));
        assert!(matches!(handler.load(stray), Err(HandlerError::NotSampled(_))));

        let sampled = handler.sample_clients();
        let unsampled = ClientId::all(4).find(|client| !sampled.contains(client)).unwrap();
        assert!(matches!(
            handler.load(uplink(&handler, unsampled)),
            Err(HandlerError::NotSampled(client)) if client == unsampled
        ));

        let mut late = uplink(&handler, sampled[0]);
        late.round = 1;
        assert!(matches!(
            handler.load(late),
            Err(HandlerError::WrongRound { expected: 0, found: 1 })
        ));

        let mut truncated = uplink(&handler, sampled[0]);
        truncated.soft_labels = truncated.soft_labels.slice(ndarray::s![..1, ..]).to_owned();
        assert!(matches!(handler.load(truncated), Err(HandlerError::InvalidUplink { .. })));

        let mut shifted = uplink(&handler, sampled[0]);
        shifted.indices[0] += 1;
        assert!(matches!(handler.load(shifted), Err(HandlerError::InvalidUplink { .. })));

        assert_eq!(handler.load(uplink(&handler, sampled[0])).unwrap(), false);
        assert!(matches!(
            handler.load(uplink(&handler, sampled[0])),
            Err(HandlerError::Duplicate(_))
        ));
        assert_eq!(handler.round(), 0);
        assert_eq!(handler.load(uplink(&handler, sampled[1])).unwrap(), true);
        assert_eq!(handler.round(), 1);
    }

    #[test]
    fn test_unknown_model() {
        let mut settings = settings(4, 0.5);
        settings.model.name = "transformer".into();
        assert!(matches!(
            ServerHandler::new(settings, Arc::new(dataset(4))),
            Err(HandlerError::Model(ModelError::UnknownModel(_)))
        ));
    }

    #[test]
    fn test_zero_rounds() {
        let mut settings = settings(4, 0.5);
        settings.global_round = 0;
        let handler = ServerHandler::new(settings, Arc::new(dataset(4))).unwrap();
        assert!(handler.if_stop());
        assert_eq!(handler.phase(), PhaseName::Stopped);
    }
}
