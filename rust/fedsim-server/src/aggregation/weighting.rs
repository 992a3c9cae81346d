//! How client deltas are weighted.
//!
//! All functions operate on the responders of a round only, i.e. clients
//! that dropped out are excluded before the weights are normalized. The
//! weights returned by [`normalize`] always sum up to one.

use std::collections::BTreeMap;

use fedsim_core::ClientId;

use super::AggregationError;

/// Normalizes raw weights to sum up to one.
///
/// # Errors
/// Fails with [`AggregationError::NoResponders`] for an empty input and with
/// [`AggregationError::ZeroWeight`] if the total weight is not positive.
pub fn normalize(raw: Vec<f64>) -> Result<Vec<f64>, AggregationError> {
    if raw.is_empty() {
        return Err(AggregationError::NoResponders);
    }
    let total: f64 = raw.iter().sum();
    if !total.is_finite() || total <= 0.0 || raw.iter().any(|w| *w < 0.0) {
        return Err(AggregationError::ZeroWeight);
    }
    Ok(raw.into_iter().map(|w| w / total).collect())
}

/// Weights proportional to the local sample counts.
pub fn by_sample_count(counts: &[usize]) -> Result<Vec<f64>, AggregationError> {
    normalize(counts.iter().map(|&n| n as f64).collect())
}

/// Equal weights for every responder.
pub fn uniform(responders: usize) -> Result<Vec<f64>, AggregationError> {
    normalize(vec![1.0; responders])
}

/// Re-derives the dynamic weights of the responders from their loss feedback.
///
/// Clients with a loss above the mean lose weight, clients below gain
/// weight: `w_i' ∝ w_i · exp(-beta · (loss_i - mean))`. The responders keep
/// their previous total mass, so the weights of all clients still sum up to
/// one. Returns the new weights of the responders only.
pub fn rederive(
    current: &BTreeMap<ClientId, f64>,
    feedback: &[(ClientId, f64)],
    beta: f64,
) -> BTreeMap<ClientId, f64> {
    let known: Vec<(ClientId, f64, f64)> = feedback
        .iter()
        .filter(|(_, loss)| loss.is_finite())
        .filter_map(|(id, loss)| current.get(id).map(|w| (*id, *w, *loss)))
        .collect();
    if known.is_empty() {
        return BTreeMap::new();
    }
    let mass: f64 = known.iter().map(|(_, w, _)| w).sum();
    let mean = known.iter().map(|(_, _, l)| l).sum::<f64>() / known.len() as f64;
    let raw: Vec<f64> = known
        .iter()
        .map(|(_, w, l)| w * (-beta * (l - mean)).exp())
        .collect();
    let total: f64 = raw.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return BTreeMap::new();
    }
    known
        .iter()
        .zip(raw)
        .map(|((id, _, _), r)| (*id, mass * r / total))
        .collect()
}
