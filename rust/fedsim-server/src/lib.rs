#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedsim server
//!
//! Round orchestration of the fedsim federated learning simulator.
//!
//! The server holds the global model and the [`CommunicationMetadata`] of an
//! experiment and drives the client population through synchronous rounds:
//!
//! - [`aggregation`]: the aggregation arms (`fedavg`, `fedprox`, `scaffold`,
//!   ...). An arm broadcasts the global model, lets the participants train
//!   in parallel and combines their deltas.
//! - [`search`]: a bandit that picks one arm per round and scores it by the
//!   validation reward of the model it produced.
//! - [`storage`]: checkpoints of the complete experiment state, so a killed
//!   experiment resumes after its last completed round.
//! - [`runner`]: the experiment loop tying it all together.
//! - [`settings`]: layered configuration of all of the above.
//!
//! All randomness is derived from the experiment seed and the round number,
//! so an experiment is reproducible, including across resumes.
//!
//! [`CommunicationMetadata`]: fedsim_core::metadata::CommunicationMetadata

pub mod aggregation;
mod error;
pub mod runner;
pub mod search;
pub mod settings;
pub mod state;
pub mod storage;

pub use self::error::{ExperimentError, ExperimentFailure};

#[cfg(test)]
pub(crate) mod tests;
