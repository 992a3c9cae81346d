use std::collections::BTreeSet;

use rand::seq::index;

use fedsim_core::{
    common::{RoundSeed, Stream},
    ClientId,
};

/// Samples the participants of a round.
///
/// With a participation rate of `1` every client participates. Otherwise
/// `ceil(rate * N)` clients, but at least one, are drawn without replacement
/// from the round seed.
pub fn sample_participants(
    ids: impl IntoIterator<Item = ClientId>,
    rate: f64,
    seed: RoundSeed,
) -> BTreeSet<ClientId> {
    let ids: Vec<ClientId> = ids.into_iter().collect();
    let count = ((rate * ids.len() as f64).ceil() as usize).clamp(1, ids.len().max(1));
    if count >= ids.len() {
        return ids.into_iter().collect();
    }
    let mut rng = seed.rng(Stream::Participation, 0);
    index::sample(&mut rng, ids.len(), count)
        .into_iter()
        .map(|i| ids[i])
        .collect()
}
