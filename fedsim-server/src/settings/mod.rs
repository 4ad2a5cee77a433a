//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in the `configs/` directory located in the repository root.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use fedsim_core::{
    dataset::{PartitionKind, SyntheticConfig},
    train::Schedule,
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub simulation: SimulationSettings,
    pub model: ModelSettings,
    #[validate]
    pub client: ClientSettings,
    #[validate]
    pub distillation: DistillationSettings,
    #[validate]
    pub dataset: DatasetSettings,
    pub storage: StorageSettings,
    pub log: LoggingSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedsim").separator("__"))?;
        config.try_into()
    }

    /// The parameters of the synthetic dataset of a run.
    pub fn synthetic_config(&self) -> SyntheticConfig {
        SyntheticConfig {
            num_train: self.dataset.num_train,
            num_test: self.dataset.num_test,
            open_size: self.dataset.open_size,
            num_features: self.dataset.num_features,
            num_classes: self.dataset.num_classes,
            noise: self.dataset.noise,
            seed: self.simulation.seed,
        }
    }

    /// The settings a worker needs to train a client.
    pub fn training(&self) -> TrainingSettings {
        TrainingSettings {
            model: self.model.clone(),
            client: self.client,
            distillation: self.distillation,
        }
    }

    /// Checks the settings which span several sections.
    fn validate_settings(&self) -> Result<(), ValidationError> {
        if self.simulation.num_clients > self.dataset.num_train {
            return Err(ValidationError::new("more clients than train samples"));
        }
        if self.distillation.open_size_per_round > self.dataset.open_size {
            return Err(ValidationError::new("probe subset larger than the probe pool"));
        }
        if let PartitionKind::Shards { num_shards } = self.dataset.partition {
            let num_clients = self.simulation.num_clients.max(1);
            if num_shards == 0 || num_shards % num_clients != 0 {
                return Err(ValidationError::new(
                    "number of shards must be a multiple of the number of clients",
                ));
            }
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.validate_settings()
}

/// How the local training tasks of a round are executed.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Every task runs in a fresh worker process.
    Process,
    /// The tasks run one after another inside the coordinator.
    Serial,
}

/// The simulation settings.
#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_simulation"))]
pub struct SimulationSettings {
    /// The number of simulated clients.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [simulation]
    /// num_clients = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_SIMULATION__NUM_CLIENTS=100
    /// ```
    #[validate(range(min = 1))]
    pub num_clients: usize,

    /// The number of rounds after which the simulation stops.
    pub global_round: u32,

    /// The fraction of clients sampled in every round. The value must be in `(0, 1]`. At least one
    /// client is sampled per round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [simulation]
    /// sample_ratio = 0.1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_SIMULATION__SAMPLE_RATIO=0.1
    /// ```
    pub sample_ratio: f64,

    /// The base seed all random decisions of a run are derived from.
    pub seed: u64,

    /// The maximal number of local training tasks running at the same time.
    #[validate(range(min = 1))]
    pub num_parallels: usize,

    /// The execution mode of the local training tasks, `process` or `serial`.
    pub execution: ExecutionKind,

    /// The path of the worker executable. Defaults to the `worker` executable next to the
    /// coordinator.
    #[serde(default)]
    pub worker: Option<PathBuf>,
}

impl SimulationSettings {
    fn validate_simulation(&self) -> Result<(), ValidationError> {
        if 0. < self.sample_ratio && self.sample_ratio <= 1. {
            Ok(())
        } else {
            Err(ValidationError::new("invalid sample ratio"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_simulation(s: &SimulationSettings) -> Result<(), ValidationError> {
    s.validate_simulation()
}

/// The model settings, shared by the clients and the server.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ModelSettings {
    /// The name of the model, `linear` or `mlp`.
    pub name: String,
    /// The width of the hidden layer of the `mlp` model.
    pub hidden: usize,
}

/// The local training settings of the clients.
#[derive(Debug, Validate, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct ClientSettings {
    /// The number of epochs over the private shard per round.
    pub epochs: usize,
    #[validate(range(min = 1))]
    pub batch_size: usize,
    pub lr: f32,
}

impl ClientSettings {
    pub fn schedule(&self) -> Schedule {
        Schedule {
            epochs: self.epochs,
            batch_size: self.batch_size,
            lr: self.lr,
        }
    }
}

/// The settings of the distillation-based consensus.
#[derive(Debug, Validate, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[validate(schema(function = "validate_distillation"))]
pub struct DistillationSettings {
    /// The number of distillation epochs over the consensus soft labels.
    pub kd_epochs: usize,
    #[validate(range(min = 1))]
    pub kd_batch_size: usize,
    pub kd_lr: f32,
    /// The temperature of the entropy reduction aggregation. Values below `1` sharpen the
    /// consensus, values above `1` soften it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [distillation]
    /// era_temperature = 0.1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_DISTILLATION__ERA_TEMPERATURE=0.1
    /// ```
    pub era_temperature: f32,
    /// The number of probe samples the clients predict on per round.
    #[validate(range(min = 1))]
    pub open_size_per_round: usize,
}

impl DistillationSettings {
    pub fn schedule(&self) -> Schedule {
        Schedule {
            epochs: self.kd_epochs,
            batch_size: self.kd_batch_size,
            lr: self.kd_lr,
        }
    }

    fn validate_distillation(&self) -> Result<(), ValidationError> {
        if self.era_temperature > 0. && self.era_temperature.is_finite() {
            Ok(())
        } else {
            Err(ValidationError::new("invalid era temperature"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_distillation(s: &DistillationSettings) -> Result<(), ValidationError> {
    s.validate_distillation()
}

/// The settings of the synthetic dataset.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
pub struct DatasetSettings {
    #[validate(range(min = 1))]
    pub num_train: usize,
    #[validate(range(min = 1))]
    pub num_test: usize,
    /// The size of the unlabeled probe pool.
    #[validate(range(min = 1))]
    pub open_size: usize,
    #[validate(range(min = 1))]
    pub num_features: usize,
    #[validate(range(min = 2))]
    pub num_classes: usize,
    pub noise: f32,
    /// The partition of the train samples across clients.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [dataset.partition]
    /// kind = "shards"
    /// num_shards = 200
    /// ```
    pub partition: PartitionKind,
}

/// The storage settings.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// The directory below which every run creates its own timestamped directory for the dataset,
    /// the shared packages, the local states and the summaries.
    pub root_dir: PathBuf,
}

/// The settings a worker trains a client with.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TrainingSettings {
    pub model: ModelSettings,
    pub client: ClientSettings,
    pub distillation: DistillationSettings,
}

/// The round summary settings.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct MetricsSettings {
    /// Whether the round summaries are appended to `summary.jsonl` in the run directory. They are
    /// always logged.
    pub jsonl: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { jsonl: true }
    }
}

#[derive(Debug, Deserialize)]
/// The logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here]. The workers log with the same directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.25/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.25/tracing_subscriber/filter/struct.EnvFilter.html#directives"
            )
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
