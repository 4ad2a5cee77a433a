//! Trainable models and the model selector capability.
//!
//! The coordinator and the workers never depend on a concrete architecture:
//! they ask a [`ModelSelector`] for a fresh instance by name and interact with
//! it through the [`Model`] trait. Parameters leave a model only as a
//! [`ModelState`], which is what a client persists between the rounds it
//! participates in. They are never sent to the server.

mod linear;
mod mlp;

pub use self::{linear::Linear, mlp::Mlp};

use ndarray::{Array2, ArrayD, ArrayView2, Ix1, Ix2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

/// An error related to model selection or to model states.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model name: {0}")]
    UnknownModel(String),
    #[error("state of model {found} cannot be loaded into model {expected}")]
    WrongModel { expected: String, found: String },
    #[error("invalid model state: {0}")]
    InvalidState(String),
}

/// A serializable snapshot of the parameters of a model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// The name the model was selected with.
    pub name: String,
    /// The parameter tensors, in a model specific order.
    pub tensors: Vec<ArrayD<f32>>,
}

impl ModelState {
    pub(crate) fn matrix(&self, index: usize) -> Result<Array2<f32>, ModelError> {
        self.tensors
            .get(index)
            .cloned()
            .ok_or_else(|| ModelError::InvalidState(format!("missing tensor {}", index)))?
            .into_dimensionality::<Ix2>()
            .map_err(|err| ModelError::InvalidState(err.to_string()))
    }

    pub(crate) fn vector(&self, index: usize) -> Result<ndarray::Array1<f32>, ModelError> {
        self.tensors
            .get(index)
            .cloned()
            .ok_or_else(|| ModelError::InvalidState(format!("missing tensor {}", index)))?
            .into_dimensionality::<Ix1>()
            .map_err(|err| ModelError::InvalidState(err.to_string()))
    }
}

/// A classifier trained with stochastic gradient descent.
pub trait Model: Send {
    /// The name the model was selected with.
    fn name(&self) -> &str;

    /// Computes the logits of a batch of samples.
    fn forward(&self, batch: ArrayView2<f32>) -> Array2<f32>;

    /// Performs one gradient descent step of the mean cross entropy between the
    /// predictions for `batch` and the target distributions `targets`.
    ///
    /// Hard labels are passed as one-hot rows. Returns the loss before the step.
    fn step(&mut self, batch: ArrayView2<f32>, targets: ArrayView2<f32>, lr: f32) -> f32;

    /// Takes a snapshot of the parameters.
    fn state(&self) -> ModelState;

    /// Restores the parameters from a snapshot.
    ///
    /// # Errors
    /// Fails if the snapshot was taken from a different model or if its tensors
    /// have the wrong shapes.
    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError>;
}

/// Produces fresh trainable models by name.
pub trait ModelSelector {
    /// Selects a new model instance.
    ///
    /// # Errors
    /// Fails if the name is not recognized.
    fn select_model(&self, name: &str) -> Result<Box<dyn Model>, ModelError>;
}

/// The model selector of the built-in models.
///
/// - `"linear"`: a softmax regression
/// - `"mlp"`: a perceptron with one hidden ReLU layer
///
/// The initial parameters only depend on the selector's seed, hence selecting
/// the same name twice yields identical models.
#[derive(Clone, Debug)]
pub struct ZooSelector {
    pub num_features: usize,
    pub num_classes: usize,
    pub hidden: usize,
    pub seed: u64,
}

impl ZooSelector {
    fn prng(&self) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(self.seed)
    }
}

impl ModelSelector for ZooSelector {
    fn select_model(&self, name: &str) -> Result<Box<dyn Model>, ModelError> {
        let mut prng = self.prng();
        match name {
            Linear::NAME => Ok(Box::new(Linear::new(
                self.num_features,
                self.num_classes,
                &mut prng,
            ))),
            Mlp::NAME => Ok(Box::new(Mlp::new(
                self.num_features,
                self.hidden,
                self.num_classes,
                &mut prng,
            ))),
            _ => Err(ModelError::UnknownModel(name.to_string())),
        }
    }
}

/// Draws a `fan_in x fan_out` matrix uniformly from `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
pub(crate) fn init_matrix(fan_in: usize, fan_out: usize, prng: &mut impl Rng) -> Array2<f32> {
    let bound = 1. / (fan_in.max(1) as f32).sqrt();
    Array2::from_shape_fn((fan_in, fan_out), |_| prng.gen_range(-bound..bound))
}

pub(crate) fn check_name(expected: &str, state: &ModelState) -> Result<(), ModelError> {
    if state.name == expected {
        Ok(())
    } else {
        Err(ModelError::WrongModel {
            expected: expected.to_string(),
            found: state.name.clone(),
        })
    }
}

pub(crate) fn check_shape(
    name: &str,
    found: &[usize],
    expected: &[usize],
) -> Result<(), ModelError> {
    if found == expected {
        Ok(())
    } else {
        Err(ModelError::InvalidState(format!(
            "tensor {} has shape {:?}, expected {:?}",
            name, found, expected
        )))
    }
}
