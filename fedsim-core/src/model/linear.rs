use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;

use super::{check_name, check_shape, init_matrix, Model, ModelError, ModelState};
use crate::ops::{cross_entropy, softmax};

/// A softmax regression: `logits = x W + b`.
#[derive(Clone, Debug)]
pub struct Linear {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub const NAME: &'static str = "linear";

    pub fn new(num_features: usize, num_classes: usize, prng: &mut impl Rng) -> Self {
        Self {
            weights: init_matrix(num_features, num_classes, prng),
            bias: Array1::zeros(num_classes),
        }
    }
}

impl Model for Linear {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn forward(&self, batch: ArrayView2<f32>) -> Array2<f32> {
        batch.dot(&self.weights) + &self.bias
    }

    fn step(&mut self, batch: ArrayView2<f32>, targets: ArrayView2<f32>, lr: f32) -> f32 {
        let rows = batch.nrows();
        if rows == 0 {
            return 0.;
        }
        let logits = self.forward(batch);
        let loss = cross_entropy(logits.view(), targets);

        // d(loss)/d(logits) of the mean cross entropy
        let grad = (softmax(logits.view(), 1.) - &targets) / rows as f32;
        self.weights.scaled_add(-lr, &batch.t().dot(&grad));
        self.bias.scaled_add(-lr, &grad.sum_axis(Axis(0)));
        loss
    }

    fn state(&self) -> ModelState {
        ModelState {
            name: Self::NAME.to_string(),
            tensors: vec![
                self.weights.clone().into_dyn(),
                self.bias.clone().into_dyn(),
            ],
        }
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        check_name(Self::NAME, state)?;
        let weights = state.matrix(0)?;
        let bias = state.vector(1)?;
        check_shape("weights", weights.shape(), self.weights.shape())?;
        check_shape("bias", bias.shape(), self.bias.shape())?;
        self.weights = weights;
        self.bias = bias;
        Ok(())
    }
}
