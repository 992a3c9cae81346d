use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use fedsim_core::{
    common::{RoundSeed, Stream},
    ClientId,
};

/// Decides which clients fail to deliver an update.
///
/// A client drops out of a round if the `(round, client)` pair was scripted,
/// or with probability `rate` drawn from the round seed. Both are
/// deterministic, so a resumed experiment sees the same dropouts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DropoutPolicy {
    rate: f64,
    scripted: BTreeSet<(u64, ClientId)>,
}

impl DropoutPolicy {
    /// Creates a policy that never drops a client.
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a policy dropping clients at random. The rate is clamped to `[0, 1]`.
    pub fn with_rate(rate: f64) -> Self {
        Self {
            rate: if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) },
            scripted: BTreeSet::new(),
        }
    }

    /// Additionally drops `client` in round `round`.
    pub fn script(mut self, round: u64, client: ClientId) -> Self {
        self.scripted.insert((round, client));
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Checks whether `client` drops out of the round.
    pub fn drops(&self, round: u64, seed: RoundSeed, client: ClientId) -> bool {
        if self.scripted.contains(&(round, client)) {
            return true;
        }
        self.rate > 0.0
            && seed
                .rng(Stream::Dropout, u64::from(client))
                .gen_bool(self.rate)
    }
}
