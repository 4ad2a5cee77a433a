//! Minibatch training loops shared by the clients and the server.

use ndarray::{Array2, ArrayView2};
use rand::{seq::SliceRandom, Rng};

use crate::{
    dataset::Label,
    model::Model,
    ops::{accuracy, argmax, cross_entropy, one_hot, select_rows, softmax},
};

/// Loss and accuracy of a pass over a dataset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub loss: f32,
    pub acc: f32,
}

/// The parameters of a training loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Schedule {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f32,
}

/// Trains `model` on labeled data.
///
/// Returns the mean loss and accuracy over the batches of the last epoch, or
/// the defaults if no batch was trained on.
pub fn fit_hard(
    model: &mut dyn Model,
    features: ArrayView2<f32>,
    labels: &[Label],
    num_classes: usize,
    schedule: Schedule,
    prng: &mut impl Rng,
) -> Metrics {
    let targets = one_hot(labels, num_classes);
    fit(model, features, targets.view(), schedule, prng)
}

/// Trains `model` to match the soft `targets`, one class distribution per row
/// of `features`.
///
/// The accuracy is measured against the argmax of the targets.
pub fn fit_soft(
    model: &mut dyn Model,
    features: ArrayView2<f32>,
    targets: ArrayView2<f32>,
    schedule: Schedule,
    prng: &mut impl Rng,
) -> Metrics {
    fit(model, features, targets, schedule, prng)
}

fn fit(
    model: &mut dyn Model,
    features: ArrayView2<f32>,
    targets: ArrayView2<f32>,
    schedule: Schedule,
    prng: &mut impl Rng,
) -> Metrics {
    let rows = features.nrows();
    let mut order: Vec<usize> = (0..rows).collect();
    let mut last = Metrics::default();
    if rows == 0 || schedule.batch_size == 0 {
        return last;
    }

    for _ in 0..schedule.epochs {
        order.shuffle(prng);
        let (mut loss, mut correct) = (0., 0.);
        for batch in order.chunks(schedule.batch_size) {
            let x = select_rows(features, batch);
            let y = select_rows(targets, batch);
            let hard = argmax(y.view());
            correct += accuracy(model.forward(x.view()).view(), &hard) * batch.len() as f32;
            loss += model.step(x.view(), y.view(), schedule.lr) * batch.len() as f32;
        }
        last = Metrics {
            loss: loss / rows as f32,
            acc: correct / rows as f32,
        };
    }
    last
}

/// Predicts the class distributions of a batch.
pub fn predict_proba(model: &dyn Model, features: ArrayView2<f32>) -> Array2<f32> {
    softmax(model.forward(features).view(), 1.)
}

/// Evaluates `model` on labeled data without training it.
pub fn evaluate(
    model: &dyn Model,
    features: ArrayView2<f32>,
    labels: &[Label],
    num_classes: usize,
) -> Metrics {
    let logits = model.forward(features);
    let targets = one_hot(labels, num_classes);
    Metrics {
        loss: cross_entropy(logits.view(), targets.view()),
        acc: accuracy(logits.view(), labels),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::model::{ModelSelector, ZooSelector};

    fn selector() -> ZooSelector {
        ZooSelector {
            num_features: 2,
            num_classes: 2,
            hidden: 8,
            seed: 3,
        }
    }

    fn data() -> (Array2<f32>, Vec<Label>) {
        (
            array![[1., 1.], [1.5, 0.5], [-1., -1.], [-0.5, -1.5], [2., 1.], [-2., -1.]],
            vec![0, 0, 1, 1, 0, 1],
        )
    }

    const SCHEDULE: Schedule = Schedule {
        epochs: 50,
        batch_size: 2,
        lr: 0.5,
    };

    #[test]
    fn test_fit_hard_learns() {
        let (x, y) = data();
        let mut model = selector().select_model("linear").unwrap();
        let before = evaluate(model.as_ref(), x.view(), &y, 2);
        let mut prng = ChaCha20Rng::seed_from_u64(0);
        let metrics = fit_hard(model.as_mut(), x.view(), &y, 2, SCHEDULE, &mut prng);
        let after = evaluate(model.as_ref(), x.view(), &y, 2);
        assert!(after.loss < before.loss);
        assert_eq!(after.acc, 1.);
        assert!(metrics.acc > 0.5);
    }

    #[test]
    fn test_fit_is_reproducible() {
        let (x, y) = data();
        let run = || {
            let mut model = selector().select_model("mlp").unwrap();
            let mut prng = ChaCha20Rng::seed_from_u64(9);
            fit_hard(model.as_mut(), x.view(), &y, 2, SCHEDULE, &mut prng);
            predict_proba(model.as_ref(), x.view())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_fit_soft_matches_targets() {
        let x = array![[1., 0.], [0., 1.]];
        let targets = array![[0.8, 0.2], [0.3, 0.7]];
        let mut model = selector().select_model("linear").unwrap();
        let mut prng = ChaCha20Rng::seed_from_u64(1);
        let schedule = Schedule {
            epochs: 300,
            ..SCHEDULE
        };
        let metrics = fit_soft(model.as_mut(), x.view(), targets.view(), schedule, &mut prng);
        assert_eq!(metrics.acc, 1.);
        let probs = predict_proba(model.as_ref(), x.view());
        assert!((probs[[0, 0]] - 0.8).abs() < 0.05);
        assert!((probs[[1, 1]] - 0.7).abs() < 0.05);
    }

    #[test]
    fn test_fit_on_empty_data() {
        let mut model = selector().select_model("linear").unwrap();
        let mut prng = ChaCha20Rng::seed_from_u64(1);
        let features = Array2::<f32>::zeros((0, 2));
        let metrics = fit_hard(model.as_mut(), features.view(), &[], 2, SCHEDULE, &mut prng);
        assert_eq!(metrics, Metrics::default());
    }
}
