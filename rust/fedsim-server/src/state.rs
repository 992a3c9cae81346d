//! The persisted state of an experiment.

use serde::{Deserialize, Serialize};

use crate::search::CombinationSearch;
use fedsim_client::{AlgorithmMode, ClientPopulation};
use fedsim_core::{
    data::DataSplit,
    metadata::CommunicationMetadata,
    metrics::Logger,
    model::Model,
    optimizer::OptimizerState,
    ConfigurationError,
};

/// Everything needed to continue an experiment after its last completed round.
///
/// A checkpoint is an encoded `ExperimentState`. It is only ever written
/// between rounds, so it never contains a partially applied round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    /// The experiment tag the checkpoint is stored under.
    pub tag: String,
    pub seed: u64,
    pub mode: AlgorithmMode,
    /// The next round to run, starting at `1`.
    pub global_epoch: u64,
    pub global_model: Model,
    pub clients: ClientPopulation,
    pub metadata: CommunicationMetadata,
    pub search: CombinationSearch,
    /// The data partition, kept verbatim so a resumed run never re-splits.
    pub split: DataSplit,
    pub optimizer: OptimizerState,
    pub logger: Logger,
}

impl ExperimentState {
    /// The number of completed rounds.
    pub fn completed_rounds(&self) -> u64 {
        self.global_epoch.saturating_sub(1)
    }

    /// Checks that a resumed state fits the configured experiment.
    ///
    /// # Errors
    /// Fails with [`ConfigurationError::StateMismatch`] if the population size
    /// or the model shape differ.
    pub fn check_shape(&self, num_clients: usize, model_len: usize) -> Result<(), ConfigurationError> {
        if self.clients.len() != num_clients || self.split.len() != num_clients {
            return Err(ConfigurationError::StateMismatch(format!(
                "checkpoint has {} clients, settings ask for {}",
                self.clients.len(),
                num_clients
            )));
        }
        if self.global_model.len() != model_len {
            return Err(ConfigurationError::StateMismatch(format!(
                "checkpoint model has {} parameters, expected {}",
                self.global_model.len(),
                model_len
            )));
        }
        Ok(())
    }
}
