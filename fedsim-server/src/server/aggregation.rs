//! Aggregation of client predictions into consensus soft labels.

use ndarray::{Array2, ArrayView2};

use fedsim_core::ops::{argmax, softmax};

/// Averages the class distributions predicted by the clients, weighted by the number of samples
/// each client trained on.
///
/// If all weights are zero the predictions are averaged uniformly. Returns `None` if there are no
/// predictions.
///
/// # Panics
/// Panics if the predictions differ in shape.
pub fn weighted_average<'a, I>(predictions: I) -> Option<Array2<f32>>
where
    I: IntoIterator<Item = (&'a Array2<f32>, usize)>,
    I::IntoIter: Clone,
{
    let predictions = predictions.into_iter();
    let (first, _) = predictions.clone().next()?;
    let total_weight: usize = predictions.clone().map(|(_, weight)| weight).sum();
    let uniform = total_weight == 0;

    let mut res = Array2::zeros(first.dim());
    let mut norm = 0.;
    for (prediction, weight) in predictions {
        let weight = if uniform { 1. } else { weight as f32 };
        res.scaled_add(weight, prediction);
        norm += weight;
    }
    res /= norm;
    Some(res)
}

/// Entropy reduction aggregation: sharpens (`temperature < 1`) or softens (`temperature > 1`) the
/// averaged distributions with a tempered softmax.
pub fn entropy_reduction(average: ArrayView2<f32>, temperature: f32) -> Array2<f32> {
    softmax(average, temperature)
}

/// The fraction of probe samples on which a client's most likely class matches the consensus.
pub fn agreement(prediction: ArrayView2<f32>, consensus: ArrayView2<f32>) -> f32 {
    let rows = prediction.nrows();
    if rows == 0 {
        return 0.;
    }
    let matching = argmax(prediction)
        .into_iter()
        .zip(argmax(consensus))
        .filter(|(a, b)| a == b)
        .count();
    matching as f32 / rows as f32
}
