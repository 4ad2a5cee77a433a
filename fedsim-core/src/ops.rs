//! Row-wise tensor operations on batches of logits and class distributions.
//!
//! All functions take a batch as a 2-dimensional array with one row per sample
//! and one column per class.

use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Computes the row-wise softmax of `logits / temperature`.
///
/// The maximum of every row is subtracted first for numerical stability.
pub fn softmax(logits: ArrayView2<f32>, temperature: f32) -> Array2<f32> {
    let mut out = logits.mapv(|x| x / temperature);
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    out
}

/// Computes the row-wise log-softmax of `logits`.
pub fn log_softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        let log_sum = row.fold(0., |acc, &x| acc + (x - max).exp()).ln() + max;
        row.mapv_inplace(|x| x - log_sum);
    }
    out
}

/// Encodes class labels as one-hot rows.
pub fn one_hot(labels: &[usize], num_classes: usize) -> Array2<f32> {
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (row, &label) in labels.iter().enumerate() {
        out[[row, label]] = 1.;
    }
    out
}

/// The mean cross entropy between the predicted `logits` and the target
/// distributions `targets` (one-hot or soft).
pub fn cross_entropy(logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
    let rows = logits.nrows();
    if rows == 0 {
        return 0.;
    }
    let log_probs = log_softmax(logits);
    -(&log_probs * &targets).sum() / rows as f32
}

/// The mean Kullback-Leibler divergence `KL(targets || softmax(logits))`.
pub fn kl_divergence(logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
    let rows = logits.nrows();
    if rows == 0 {
        return 0.;
    }
    cross_entropy(logits, targets) - mean_entropy(targets)
}

/// The mean Shannon entropy (in nats) of the rows of `probs`.
pub fn mean_entropy(probs: ArrayView2<f32>) -> f32 {
    let rows = probs.nrows();
    if rows == 0 {
        return 0.;
    }
    let total: f32 = probs
        .iter()
        .filter(|&&p| p > 0.)
        .map(|&p| -p * p.ln())
        .sum();
    total / rows as f32
}

/// The index of the largest entry of every row.
pub fn argmax(batch: ArrayView2<f32>) -> Vec<usize> {
    batch
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, max), (i, &x)| {
                    if x > max {
                        (i, x)
                    } else {
                        (best, max)
                    }
                })
                .0
        })
        .collect()
}

/// The fraction of rows whose argmax equals the label.
pub fn accuracy(batch: ArrayView2<f32>, labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.;
    }
    let correct = argmax(batch)
        .into_iter()
        .zip(labels)
        .filter(|(predicted, label)| *predicted == **label)
        .count();
    correct as f32 / labels.len() as f32
}

/// Stacks feature vectors into a batch.
///
/// # Panics
/// Panics if the rows differ in length.
pub fn stack<'a>(rows: impl IntoIterator<Item = &'a Array1<f32>>, width: usize) -> Array2<f32> {
    let mut data = Vec::new();
    let mut count = 0;
    for row in rows {
        assert_eq!(row.len(), width, "feature vectors differ in length");
        data.extend(row.iter().copied());
        count += 1;
    }
    // Safe unwrap: the length of `data` is `count * width` by construction
    Array2::from_shape_vec((count, width), data).unwrap()
}

/// Selects the given rows of a batch.
pub fn select_rows(batch: ArrayView2<f32>, rows: &[usize]) -> Array2<f32> {
    batch.select(Axis(0), rows)
}
