use thiserror::Error;

use crate::{data::DataError, metadata::Component};

/// An error in the experiment configuration.
///
/// These are detected before or while an experiment is set up and are always
/// fatal: nothing is retried and no round is run.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown algorithm mode `{0}`")]
    UnknownAlgorithm(String),
    #[error("unknown aggregation arm `{0}`")]
    UnknownArm(String),
    #[error("unknown data split mode `{0}`")]
    UnknownSplitMode(String),
    #[error("invalid data split: {0}")]
    InvalidSplit(String),
    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),
    #[error("aggregation arm `{arm}` cannot run on a `{mode}` client population")]
    IncompatibleArm { arm: String, mode: String },
    #[error("communication metadata lacks the {0} component")]
    MissingMetadata(Component),
    #[error("none of the configured aggregation arms is selectable")]
    NoSelectableArm,
    #[error("stored experiment state does not match the settings: {0}")]
    StateMismatch(String),
    #[error("invalid dataset: {0}")]
    Data(#[from] DataError),
}
