//! Client identities and reproducible randomness.
//!
//! Every random decision of a run (data generation, partitioning, client
//! sampling, probe selection, model initialization, batch shuffling) draws
//! from a `ChaCha20` PRNG. All of them share the run's base seed and differ
//! only in the stream they read from, so two runs with the same seed make the
//! same choices regardless of the order in which the streams are used.

use derive_more::{Display, From, Into};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// The index of a round, starting at `0`.
pub type RoundId = u32;

#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Hash,
    Into,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[display(fmt = "{}", _0)]
/// A stable handle of a simulated participant, in `[0, num_clients)`.
pub struct ClientId(u32);

impl ClientId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The identity as an index into per-client tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// All client identities of a run with `num_clients` participants.
    pub fn all(num_clients: usize) -> impl Iterator<Item = ClientId> {
        (0..num_clients as u32).map(ClientId)
    }
}

/// The independent PRNG streams derived from a base seed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stream {
    /// Generation of the synthetic dataset.
    Dataset,
    /// Assignment of train samples to clients.
    Partition,
    /// Selection of the clients of a round.
    Sampling(RoundId),
    /// Selection of the probe subset of a round.
    Probe(RoundId),
    /// Model initialization and shuffling of one client.
    Client(ClientId),
    /// Model initialization and shuffling of the server.
    Server,
}

impl Stream {
    fn id(self) -> u64 {
        let (tag, value): (u64, u64) = match self {
            Stream::Dataset => (1, 0),
            Stream::Partition => (2, 0),
            Stream::Sampling(round) => (3, round as u64),
            Stream::Probe(round) => (4, round as u64),
            Stream::Client(client) => (5, client.0 as u64),
            Stream::Server => (6, 0),
        };
        tag << 32 | value
    }
}

/// Creates the PRNG of the given stream.
pub fn prng(seed: u64, stream: Stream) -> ChaCha20Rng {
    let mut prng = ChaCha20Rng::seed_from_u64(seed);
    prng.set_stream(stream.id());
    prng
}

/// Derives a seed for the given stream, e.g. to seed a model selector.
pub fn derive_seed(seed: u64, stream: Stream) -> u64 {
    use rand::RngCore;
    prng(seed, stream).next_u64()
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn test_streams_are_reproducible() {
        let mut first = prng(7, Stream::Probe(3));
        let mut second = prng(7, Stream::Probe(3));
        let a: Vec<u32> = (0..8).map(|_| first.gen()).collect();
        let b: Vec<u32> = (0..8).map(|_| second.gen()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut a = prng(7, Stream::Sampling(0));
        let mut b = prng(7, Stream::Sampling(1));
        let mut c = prng(7, Stream::Client(ClientId::new(0)));
        let (x, y, z): (u64, u64, u64) = (a.gen(), b.gen(), c.gen());
        assert_ne!(x, y);
        assert_ne!(x, z);
        assert_ne!(derive_seed(7, Stream::Server), derive_seed(8, Stream::Server));
    }

    #[test]
    fn test_client_ids() {
        let ids: Vec<_> = ClientId::all(3).collect();
        assert_eq!(ids, vec![ClientId::new(0), ClientId::new(1), ClientId::new(2)]);
        assert_eq!(ClientId::new(2).index(), 2);
        assert_eq!(ClientId::new(5).to_string(), "5");
    }
}
