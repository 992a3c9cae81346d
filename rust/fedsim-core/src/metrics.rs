//! Round metrics and the experiment log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct Accumulator {
    sum: f64,
    weight: f64,
}

/// Accumulates named scalar metrics as weighted means.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSink {
    values: BTreeMap<String, Accumulator>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observation of `name` with the given weight, e.g. a sample count.
    pub fn add(&mut self, name: &str, value: f64, weight: f64) {
        let acc = self.values.entry(name.to_string()).or_default();
        acc.sum += value * weight;
        acc.weight += weight;
    }

    /// The weighted mean of all observations of `name`.
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.values
            .get(name)
            .filter(|acc| acc.weight > 0.0)
            .map(|acc| acc.sum / acc.weight)
    }

    /// The weighted means of all metrics.
    pub fn summary(&self) -> BTreeMap<String, f64> {
        self.values
            .keys()
            .filter_map(|name| self.mean(name).map(|mean| (name.clone(), mean)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}

/// The log entry of a completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub global_epoch: u64,
    /// The aggregation arm that ran the round.
    pub arm: String,
    pub participants: usize,
    pub responders: usize,
    pub metrics: BTreeMap<String, f64>,
}

/// An append-only log of completed rounds.
///
/// Metrics of the running round are buffered until the round is closed with
/// [`Logger::close_round`]. The buffer is cleared with [`Logger::reset`]
/// before every checkpoint, so checkpoints only carry closed rounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Logger {
    history: Vec<RoundRecord>,
    buffer: MetricSink,
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a metric of the running round.
    pub fn append(&mut self, name: &str, value: f64, weight: f64) {
        self.buffer.add(name, value, weight);
    }

    /// Appends the buffered metrics as the record of a completed round.
    pub fn close_round(
        &mut self,
        global_epoch: u64,
        arm: &str,
        participants: usize,
        responders: usize,
    ) -> &RoundRecord {
        let record = RoundRecord {
            global_epoch,
            arm: arm.to_string(),
            participants,
            responders,
            metrics: self.buffer.summary(),
        };
        self.history.push(record);
        &self.history[self.history.len() - 1]
    }

    /// Clears the buffered metrics. The history is kept.
    pub fn reset(&mut self) {
        self.buffer.reset();
    }

    pub fn history(&self) -> &[RoundRecord] {
        &self.history
    }

    pub fn last(&self) -> Option<&RoundRecord> {
        self.history.last()
    }
}
