//! Round parameters and deterministic randomness.

use derive_more::{Display, From, Into};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// The random stream a generator is drawn for.
///
/// Every purpose gets its own ChaCha stream so that, for example, enabling
/// dropout does not shift the participant sample of the same round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum Stream {
    Dataset = 1,
    Split = 2,
    Init = 3,
    Selection = 4,
    Participation = 5,
    Dropout = 6,
    Client = 7,
    Generator = 8,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, From, Into, Serialize, Deserialize)]
/// A seed for a round.
///
/// Derived from the experiment seed and the round number only, so a resumed
/// experiment draws exactly the numbers the uninterrupted one would have.
pub struct RoundSeed(u64);

impl RoundSeed {
    /// The seed of round `round` of the experiment seeded with `seed`.
    ///
    /// Round `0` is reserved for the experiment setup (dataset, split and
    /// model initialization).
    pub fn derive(seed: u64, round: u64) -> Self {
        Self(mix(seed ^ mix(round.wrapping_add(0x9e37_79b9_7f4a_7c15))))
    }

    /// The seed used while setting up an experiment.
    pub fn setup(seed: u64) -> Self {
        Self::derive(seed, 0)
    }

    /// Creates the generator for a stream of this round.
    ///
    /// `index` separates generators within a stream, e.g. one per client.
    pub fn rng(&self, stream: Stream, index: u64) -> ChaCha20Rng {
        let mut rng = ChaCha20Rng::seed_from_u64(self.0);
        rng.set_stream(((stream as u64) << 32) | (index & 0xffff_ffff));
        rng
    }
}

// splitmix64 finalizer
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The parameters every client receives for a round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundParameters {
    /// The round number, starting at 1.
    pub global_epoch: u64,
    /// The random round seed.
    pub seed: RoundSeed,
    /// The number of local gradient steps every client takes.
    pub step_budget: usize,
    /// The learning rate of the round.
    pub lr: f64,
}

/// Computes the number of local gradient updates per round.
///
/// This is `floor(train_len / num_clients * local_epoch / batch_size)`, i.e.
/// the number of mini-batches an average client needs for `local_epoch`
/// passes over its partition. It never drops below one step.
pub fn step_budget(
    train_len: usize,
    num_clients: usize,
    local_epoch: usize,
    batch_size: usize,
) -> usize {
    if num_clients == 0 || batch_size == 0 {
        return 1;
    }
    let steps =
        (train_len as f64 / num_clients as f64 * local_epoch as f64 / batch_size as f64).floor();
    (steps as usize).max(1)
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn test_step_budget() {
        assert_eq!(step_budget(50_000, 100, 5, 10), 250);
        assert_eq!(step_budget(1000, 3, 1, 64), 5);
        assert_eq!(step_budget(10, 10, 1, 64), 1);
        assert_eq!(step_budget(10, 0, 1, 64), 1);
    }

    #[test]
    fn test_round_seed_is_deterministic() {
        assert_eq!(RoundSeed::derive(7, 3), RoundSeed::derive(7, 3));
        assert_ne!(RoundSeed::derive(7, 3), RoundSeed::derive(7, 4));
        assert_ne!(RoundSeed::derive(7, 3), RoundSeed::derive(8, 3));
    }

    #[test]
    fn test_streams_are_independent() {
        let seed = RoundSeed::derive(1, 1);
        let a: u64 = seed.rng(Stream::Selection, 0).gen();
        let b: u64 = seed.rng(Stream::Dropout, 0).gen();
        let c: u64 = seed.rng(Stream::Selection, 0).gen();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
