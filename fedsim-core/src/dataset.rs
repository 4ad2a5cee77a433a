//! The dataset collaborator.
//!
//! The coordinator generates a [`SyntheticDataset`], assigns its train samples
//! to the clients with a [`Partition`] and stores both once per run with
//! [`PartitionedDataset::save`]. Worker processes re-open the stored dataset
//! read-only and build the [`Shard`] of the client they train.
//!
//! Besides the labeled train and test sets, the dataset contains an unlabeled
//! probe (open) pool. Every round a subset of this pool is drawn with
//! [`sample_probe_indices`]; it is the only data that both clients and server
//! make predictions for.

use std::{
    f32::consts::PI,
    path::{Path, PathBuf},
    sync::Arc,
};

use ndarray::{Array1, Array2};
use rand::{seq::SliceRandom, Rng};
use thiserror::Error;
use tracing::debug;

use crate::{
    common::{prng, ClientId, RoundId, Stream},
    io::{self, IoError},
    ops::stack,
    view::{FilteredView, ViewError},
};

/// The feature vector of a sample.
pub type Features = Array1<f32>;

/// The class of a sample.
pub type Label = usize;

/// The private train data of a client.
pub type Shard = FilteredView<Features, Label>;

const DATASET_FILE: &str = "dataset.bin";

/// An error related to the generation, partitioning or storage of a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("invalid dataset configuration: {0}")]
    Invalid(String),
    #[error("client {client} is not part of a partition of {num_clients} clients")]
    UnknownClient { client: ClientId, num_clients: usize },
    #[error("sample {0} of the shard has no label")]
    Unlabeled(usize),
    #[error("probe index {index} out of bounds for a pool of size {len}")]
    ProbeIndex { index: usize, len: usize },
    #[error("failed to build the private shard: {0}")]
    View(#[from] ViewError),
    #[error("dataset storage failed: {0}")]
    Storage(#[from] IoError),
}

/// The parameters of a [`SyntheticDataset`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    pub num_train: usize,
    pub num_test: usize,
    /// The size of the unlabeled probe pool.
    pub open_size: usize,
    pub num_features: usize,
    pub num_classes: usize,
    /// The standard deviation of the samples around their class center.
    pub noise: f32,
    pub seed: u64,
}

/// A classification dataset of Gaussian clusters, one per class.
#[derive(Clone, Debug)]
pub struct SyntheticDataset {
    pub num_features: usize,
    pub num_classes: usize,
    pub train_x: Vec<Features>,
    pub train_y: Vec<Label>,
    pub test_x: Vec<Features>,
    pub test_y: Vec<Label>,
    pub open_x: Vec<Features>,
}

impl SyntheticDataset {
    /// Generates the dataset. The result only depends on the configuration.
    ///
    /// # Errors
    /// Fails if the configuration describes an empty dataset.
    pub fn generate(config: &SyntheticConfig) -> Result<Self, DatasetError> {
        if config.num_features == 0 || config.num_classes < 2 {
            return Err(DatasetError::Invalid(
                "at least one feature and two classes are required".into(),
            ));
        }
        if config.num_train == 0 || config.num_test == 0 || config.open_size == 0 {
            return Err(DatasetError::Invalid(
                "train set, test set and probe pool must not be empty".into(),
            ));
        }

        let mut prng = prng(config.seed, Stream::Dataset);
        let centers: Vec<Features> = (0..config.num_classes)
            .map(|_| Array1::from_shape_fn(config.num_features, |_| prng.gen_range(-2_f32..2.)))
            .collect();

        let mut draw = |count: usize| -> (Vec<Features>, Vec<Label>) {
            (0..count)
                .map(|_| {
                    let label = prng.gen_range(0..config.num_classes);
                    let sample = centers[label].mapv(|c| c + config.noise * gaussian(&mut prng));
                    (sample, label)
                })
                .unzip()
        };
        let (train_x, train_y) = draw(config.num_train);
        let (test_x, test_y) = draw(config.num_test);
        let (open_x, _) = draw(config.open_size);

        Ok(Self {
            num_features: config.num_features,
            num_classes: config.num_classes,
            train_x,
            train_y,
            test_x,
            test_y,
            open_x,
        })
    }
}

/// Draws from a standard normal distribution (Box-Muller transform).
fn gaussian(prng: &mut impl Rng) -> f32 {
    let u1: f32 = prng.gen_range(f32::EPSILON..1.);
    let u2: f32 = prng.gen();
    (-2. * u1.ln()).sqrt() * (2. * PI * u2).cos()
}

/// How the train samples are split across clients.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PartitionKind {
    /// Uniformly at random, in shards of (almost) equal size.
    Iid,
    /// Sorted by label and cut into `num_shards` shards, each client receiving
    /// `num_shards / num_clients` of them (label skew).
    Shards { num_shards: usize },
}

/// The assignment of train sample indices to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    clients: Vec<Vec<usize>>,
}

impl Partition {
    /// Partitions the samples with the given `labels` across `num_clients` clients.
    ///
    /// # Errors
    /// Fails if a client would end up without samples or if the number of
    /// shards is not a multiple of the number of clients.
    pub fn new(
        kind: PartitionKind,
        labels: &[Label],
        num_clients: usize,
        seed: u64,
    ) -> Result<Self, DatasetError> {
        if num_clients == 0 || labels.len() < num_clients {
            return Err(DatasetError::Invalid(format!(
                "cannot split {} samples across {} clients",
                labels.len(),
                num_clients
            )));
        }
        let mut prng = prng(seed, Stream::Partition);
        let clients = match kind {
            PartitionKind::Iid => {
                let mut indices: Vec<usize> = (0..labels.len()).collect();
                indices.shuffle(&mut prng);
                split_evenly(&indices, num_clients)
            }
            PartitionKind::Shards { num_shards } => {
                if num_shards == 0 || num_shards % num_clients != 0 || num_shards > labels.len() {
                    return Err(DatasetError::Invalid(format!(
                        "{} shards cannot be split across {} clients",
                        num_shards, num_clients
                    )));
                }
                let mut indices: Vec<usize> = (0..labels.len()).collect();
                indices.sort_by_key(|&index| (labels[index], index));
                let mut shards = split_evenly(&indices, num_shards);
                shards.shuffle(&mut prng);
                shards
                    .chunks(num_shards / num_clients)
                    .map(|chunk| chunk.concat())
                    .collect()
            }
        };
        Ok(Self { clients })
    }

    /// Uses an explicit assignment of the indices of `num_samples` train
    /// samples to clients.
    ///
    /// # Errors
    /// Fails if a client has no samples, if an index is out of bounds or if a
    /// sample is assigned more than once.
    pub fn from_indices(
        clients: Vec<Vec<usize>>,
        num_samples: usize,
    ) -> Result<Self, DatasetError> {
        let mut assigned = vec![false; num_samples];
        for (client, indices) in clients.iter().enumerate() {
            if indices.is_empty() {
                return Err(DatasetError::Invalid(format!("client {} has no samples", client)));
            }
            for &index in indices {
                match assigned.get_mut(index) {
                    Some(seen) if !*seen => *seen = true,
                    Some(_) => {
                        return Err(DatasetError::Invalid(format!(
                            "sample {} is assigned more than once",
                            index
                        )))
                    }
                    None => {
                        return Err(DatasetError::Invalid(format!(
                            "sample {} out of bounds for {} samples",
                            index, num_samples
                        )))
                    }
                }
            }
        }
        Ok(Self { clients })
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// The train sample indices of a client.
    pub fn indices(&self, client: ClientId) -> Result<&[usize], DatasetError> {
        self.clients
            .get(client.index())
            .map(Vec::as_slice)
            .ok_or(DatasetError::UnknownClient {
                client,
                num_clients: self.clients.len(),
            })
    }
}

/// Splits `items` into `parts` contiguous chunks whose lengths differ by at most one.
fn split_evenly(items: &[usize], parts: usize) -> Vec<Vec<usize>> {
    let (size, rest) = (items.len() / parts, items.len() % parts);
    let mut start = 0;
    (0..parts)
        .map(|part| {
            let end = start + size + if part < rest { 1 } else { 0 };
            let chunk = items[start..end].to_vec();
            start = end;
            chunk
        })
        .collect()
}

/// Draws the probe subset of a round: `per_round` distinct indices into a
/// pool of size `open_size`, in ascending order.
///
/// The subset only depends on `seed` and `round`.
pub fn sample_probe_indices(
    open_size: usize,
    per_round: usize,
    seed: u64,
    round: RoundId,
) -> Vec<usize> {
    let mut prng = prng(seed, Stream::Probe(round));
    let mut indices =
        rand::seq::index::sample(&mut prng, open_size, per_round.min(open_size)).into_vec();
    indices.sort_unstable();
    indices
}

#[derive(Serialize)]
struct StoredRef<'a> {
    num_features: usize,
    num_classes: usize,
    train_x: &'a [Features],
    train_y: &'a [Label],
    test_x: &'a Array2<f32>,
    test_y: &'a [Label],
    open_x: &'a Array2<f32>,
    partition: &'a Partition,
}

#[derive(Deserialize)]
struct Stored {
    num_features: usize,
    num_classes: usize,
    train_x: Vec<Features>,
    train_y: Vec<Label>,
    test_x: Array2<f32>,
    test_y: Vec<Label>,
    open_x: Array2<f32>,
    partition: Partition,
}

/// A dataset together with its partition across clients.
///
/// Cloning is cheap: the train set is shared by all shards built from it.
#[derive(Clone, Debug)]
pub struct PartitionedDataset {
    num_features: usize,
    num_classes: usize,
    train_x: Arc<[Features]>,
    train_y: Arc<[Label]>,
    test_x: Array2<f32>,
    test_y: Vec<Label>,
    open_x: Array2<f32>,
    partition: Partition,
}

impl PartitionedDataset {
    pub fn new(dataset: SyntheticDataset, partition: Partition) -> Self {
        let test_x = stack(&dataset.test_x, dataset.num_features);
        let open_x = stack(&dataset.open_x, dataset.num_features);
        Self {
            num_features: dataset.num_features,
            num_classes: dataset.num_classes,
            train_x: dataset.train_x.into(),
            train_y: dataset.train_y.into(),
            test_x,
            test_y: dataset.test_y,
            open_x,
            partition,
        }
    }

    /// The path of the stored dataset within `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(DATASET_FILE)
    }

    /// Stores the dataset in `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), DatasetError> {
        let path = Self::path(dir);
        debug!("storing dataset at {}", path.display());
        io::write_atomic(
            &path,
            &StoredRef {
                num_features: self.num_features,
                num_classes: self.num_classes,
                train_x: &self.train_x,
                train_y: &self.train_y,
                test_x: &self.test_x,
                test_y: &self.test_y,
                open_x: &self.open_x,
                partition: &self.partition,
            },
        )?;
        Ok(())
    }

    /// Opens a dataset stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self, DatasetError> {
        let stored: Stored = io::read(&Self::path(dir))?;
        Ok(Self {
            num_features: stored.num_features,
            num_classes: stored.num_classes,
            train_x: stored.train_x.into(),
            train_y: stored.train_y.into(),
            test_x: stored.test_x,
            test_y: stored.test_y,
            open_x: stored.open_x,
            partition: stored.partition,
        })
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_clients(&self) -> usize {
        self.partition.num_clients()
    }

    /// The size of the probe pool.
    pub fn open_size(&self) -> usize {
        self.open_x.nrows()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Builds the private shard of a client.
    pub fn private_shard(&self, client: ClientId) -> Result<Shard, DatasetError> {
        let indices = self.partition.indices(client)?.to_vec();
        Ok(FilteredView::with_targets(
            indices,
            Arc::clone(&self.train_x),
            Arc::clone(&self.train_y),
        )?)
    }

    /// Builds the private shard of a client as a labeled batch.
    pub fn private_batch(
        &self,
        client: ClientId,
    ) -> Result<(Array2<f32>, Vec<Label>), DatasetError> {
        let shard = self.private_shard(client)?;
        let mut features = Vec::with_capacity(shard.len());
        let mut labels = Vec::with_capacity(shard.len());
        for (position, record) in shard.iter().enumerate() {
            let (x, y) = record?;
            features.push(x);
            labels.push(y.ok_or(DatasetError::Unlabeled(position))?);
        }
        Ok((stack(&features, self.num_features), labels))
    }

    /// Gets the probe samples with the given pool indices, as a batch.
    pub fn probe(&self, indices: &[usize]) -> Result<Array2<f32>, DatasetError> {
        let len = self.open_size();
        if let Some(&index) = indices.iter().find(|&&index| index >= len) {
            return Err(DatasetError::ProbeIndex { index, len });
        }
        Ok(crate::ops::select_rows(self.open_x.view(), indices))
    }

    /// The held-out test set.
    pub fn test_set(&self) -> (&Array2<f32>, &[Label]) {
        (&self.test_x, &self.test_y)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use super::*;

    pub fn config() -> SyntheticConfig {
        SyntheticConfig {
            num_train: 200,
            num_test: 50,
            open_size: 40,
            num_features: 4,
            num_classes: 3,
            noise: 0.5,
            seed: 11,
        }
    }

    #[test]
    fn test_generate_is_deterministic() {
        let a = SyntheticDataset::generate(&config()).unwrap();
        let b = SyntheticDataset::generate(&config()).unwrap();
        assert_eq!(a.train_x, b.train_x);
        assert_eq!(a.train_y, b.train_y);
        assert_eq!(a.open_x.len(), 40);
        assert_eq!(a.test_x.len(), 50);
        assert!(a.train_y.iter().all(|&y| y < 3));
    }

    #[test]
    fn test_generate_rejects_empty_sets() {
        let mut config = config();
        config.open_size = 0;
        assert!(SyntheticDataset::generate(&config).is_err());
    }

    #[test]
    fn test_iid_partition_covers_all_samples() {
        let labels = vec![0; 10];
        let partition = Partition::new(PartitionKind::Iid, &labels, 3, 1).unwrap();
        let mut seen = HashSet::new();
        for client in ClientId::all(3) {
            let indices = partition.indices(client).unwrap();
            assert!(indices.len() == 3 || indices.len() == 4);
            seen.extend(indices.iter().copied());
        }
        assert_eq!(seen.len(), 10);
        assert!(partition.indices(ClientId::new(3)).is_err());
    }

    #[test]
    fn test_shard_partition_skews_labels() {
        let labels: Vec<usize> = (0..40).map(|i| i % 4).collect();
        let partition =
            Partition::new(PartitionKind::Shards { num_shards: 4 }, &labels, 4, 1).unwrap();
        for client in ClientId::all(4) {
            let classes: HashSet<_> = partition
                .indices(client)
                .unwrap()
                .iter()
                .map(|&i| labels[i])
                .collect();
            assert_eq!(classes.len(), 1);
        }
        assert!(Partition::new(PartitionKind::Shards { num_shards: 6 }, &labels, 4, 1).is_err());
    }

    #[test]
    fn test_partition_rejects_too_many_clients() {
        assert!(Partition::new(PartitionKind::Iid, &[0, 1], 3, 1).is_err());
    }

    #[test]
    fn test_explicit_partition() {
        let partition = Partition::from_indices(vec![vec![0, 3], vec![1], vec![2]], 4).unwrap();
        assert_eq!(partition.num_clients(), 3);
        assert_eq!(partition.indices(ClientId::new(0)).unwrap(), &[0, 3]);

        assert!(Partition::from_indices(vec![vec![0], vec![]], 4).is_err());
        assert!(Partition::from_indices(vec![vec![0, 4]], 4).is_err());
        assert!(Partition::from_indices(vec![vec![0, 1], vec![1]], 4).is_err());
    }

    #[test]
    fn test_sample_probe_indices() {
        let a = sample_probe_indices(100, 10, 5, 0);
        assert_eq!(a, sample_probe_indices(100, 10, 5, 0));
        assert_ne!(a, sample_probe_indices(100, 10, 5, 1));
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sample_probe_indices(3, 10, 5, 0), vec![0, 1, 2]);
    }

    #[test]
    fn test_save_and_load() {
        let dataset = SyntheticDataset::generate(&config()).unwrap();
        let partition = Partition::new(PartitionKind::Iid, &dataset.train_y, 4, 3).unwrap();
        let dataset = PartitionedDataset::new(dataset, partition);

        let dir = tempfile::tempdir().unwrap();
        dataset.save(dir.path()).unwrap();
        let loaded = PartitionedDataset::load(dir.path()).unwrap();
        assert_eq!(loaded.partition(), dataset.partition());
        assert_eq!(loaded.test_set().0, dataset.test_set().0);

        let shard = loaded.private_shard(ClientId::new(1)).unwrap();
        assert_eq!(shard.len(), 50);
        let (x, y) = shard.get(0).unwrap();
        let index = shard.indices()[0];
        assert_eq!(x, dataset.train_x[index]);
        assert_eq!(y, Some(dataset.train_y[index]));

        let (batch, labels) = loaded.private_batch(ClientId::new(1)).unwrap();
        assert_eq!(batch.nrows(), 50);
        assert_eq!(batch.row(0), dataset.train_x[index].view());
        assert_eq!(labels[0], dataset.train_y[index]);

        let probe = loaded.probe(&[0, 39]).unwrap();
        assert_eq!(probe.nrows(), 2);
        assert!(matches!(
            loaded.probe(&[40]),
            Err(DatasetError::ProbeIndex { index: 40, len: 40 })
        ));
    }
}
