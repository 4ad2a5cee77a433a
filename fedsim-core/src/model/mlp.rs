use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;

use super::{check_name, check_shape, init_matrix, Model, ModelError, ModelState};
use crate::ops::{cross_entropy, softmax};

/// A perceptron with one hidden ReLU layer.
#[derive(Clone, Debug)]
pub struct Mlp {
    hidden_weights: Array2<f32>,
    hidden_bias: Array1<f32>,
    output_weights: Array2<f32>,
    output_bias: Array1<f32>,
}

impl Mlp {
    pub const NAME: &'static str = "mlp";

    pub fn new(
        num_features: usize,
        hidden: usize,
        num_classes: usize,
        prng: &mut impl Rng,
    ) -> Self {
        Self {
            hidden_weights: init_matrix(num_features, hidden, prng),
            hidden_bias: Array1::zeros(hidden),
            output_weights: init_matrix(hidden, num_classes, prng),
            output_bias: Array1::zeros(num_classes),
        }
    }

    /// The hidden pre-activations of a batch.
    fn hidden(&self, batch: ArrayView2<f32>) -> Array2<f32> {
        batch.dot(&self.hidden_weights) + &self.hidden_bias
    }
}

impl Model for Mlp {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn forward(&self, batch: ArrayView2<f32>) -> Array2<f32> {
        let activations = self.hidden(batch).mapv(|x| x.max(0.));
        activations.dot(&self.output_weights) + &self.output_bias
    }

    fn step(&mut self, batch: ArrayView2<f32>, targets: ArrayView2<f32>, lr: f32) -> f32 {
        let rows = batch.nrows();
        if rows == 0 {
            return 0.;
        }
        let pre_activations = self.hidden(batch);
        let activations = pre_activations.mapv(|x| x.max(0.));
        let logits = activations.dot(&self.output_weights) + &self.output_bias;
        let loss = cross_entropy(logits.view(), targets);

        let grad_logits = (softmax(logits.view(), 1.) - &targets) / rows as f32;
        let mut grad_hidden = grad_logits.dot(&self.output_weights.t());
        grad_hidden.zip_mut_with(&pre_activations, |g, &x| {
            if x <= 0. {
                *g = 0.
            }
        });

        self.output_weights
            .scaled_add(-lr, &activations.t().dot(&grad_logits));
        self.output_bias
            .scaled_add(-lr, &grad_logits.sum_axis(Axis(0)));
        self.hidden_weights
            .scaled_add(-lr, &batch.t().dot(&grad_hidden));
        self.hidden_bias
            .scaled_add(-lr, &grad_hidden.sum_axis(Axis(0)));
        loss
    }

    fn state(&self) -> ModelState {
        ModelState {
            name: Self::NAME.to_string(),
            tensors: vec![
                self.hidden_weights.clone().into_dyn(),
                self.hidden_bias.clone().into_dyn(),
                self.output_weights.clone().into_dyn(),
                self.output_bias.clone().into_dyn(),
            ],
        }
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        check_name(Self::NAME, state)?;
        let hidden_weights = state.matrix(0)?;
        let hidden_bias = state.vector(1)?;
        let output_weights = state.matrix(2)?;
        let output_bias = state.vector(3)?;
        check_shape("hidden_weights", hidden_weights.shape(), self.hidden_weights.shape())?;
        check_shape("hidden_bias", hidden_bias.shape(), self.hidden_bias.shape())?;
        check_shape("output_weights", output_weights.shape(), self.output_weights.shape())?;
        check_shape("output_bias", output_bias.shape(), self.output_bias.shape())?;
        self.hidden_weights = hidden_weights;
        self.hidden_bias = hidden_bias;
        self.output_weights = output_weights;
        self.output_bias = output_bias;
        Ok(())
    }
}
