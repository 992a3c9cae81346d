use thiserror::Error;

use crate::{
    aggregation::AggregationError,
    search::RoundError,
    storage::CheckpointError,
};
use fedsim_core::ConfigurationError;

/// Errors that end an experiment.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("checkpointing failed: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("aborted by a shutdown request")]
    Aborted,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RoundError> for ExperimentError {
    fn from(err: RoundError) -> Self {
        match err {
            RoundError::Configuration(err) => Self::Configuration(err),
            RoundError::Aggregation(err) => Self::Aggregation(err),
        }
    }
}

/// An [`ExperimentError`] together with the experiment it ended.
#[derive(Debug, Error)]
#[error("experiment {tag} (seed {seed}) failed: {source}")]
pub struct ExperimentFailure {
    pub tag: String,
    pub seed: u64,
    #[source]
    pub source: ExperimentError,
}
