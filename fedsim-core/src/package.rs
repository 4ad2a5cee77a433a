//! The artifacts exchanged between the server and the clients in a round.

use ndarray::Array2;

use crate::common::{ClientId, RoundId};

/// The global artifact the server broadcasts to the sampled clients of a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownlinkPackage {
    pub round: RoundId,
    /// The consensus soft labels of the previous round, one row per entry of
    /// `indices`. Absent in the first round.
    pub soft_labels: Option<Array2<f32>>,
    /// The probe pool indices `soft_labels` refer to.
    pub indices: Option<Vec<usize>>,
    /// The probe pool indices the clients predict on in this round.
    pub next_indices: Vec<usize>,
}

impl DownlinkPackage {
    /// Gets the consensus of the previous round, if there is one.
    pub fn consensus(&self) -> Option<(&Array2<f32>, &[usize])> {
        match (&self.soft_labels, &self.indices) {
            (Some(soft_labels), Some(indices)) => Some((soft_labels, indices.as_slice())),
            _ => None,
        }
    }
}

/// The artifact a client reports back after its local training.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UplinkPackage {
    pub client: ClientId,
    pub round: RoundId,
    /// The predicted class distributions, one row per entry of `indices`.
    pub soft_labels: Array2<f32>,
    pub indices: Vec<usize>,
    /// The size of the private shard the client trained on.
    pub num_samples: usize,
    pub train_loss: f32,
    pub train_acc: f32,
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_consensus() {
        let mut downlink = DownlinkPackage {
            round: 0,
            soft_labels: None,
            indices: None,
            next_indices: vec![1, 2],
        };
        assert!(downlink.consensus().is_none());

        downlink.soft_labels = Some(array![[0.5, 0.5]]);
        assert!(downlink.consensus().is_none());

        downlink.indices = Some(vec![3]);
        let (soft_labels, indices) = downlink.consensus().unwrap();
        assert_eq!(soft_labels.nrows(), 1);
        assert_eq!(indices, &[3]);
    }
}
