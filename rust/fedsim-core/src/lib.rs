#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedsim core
//!
//! Shared building blocks of the fedsim federated learning simulator.
//!
//! A fixed population of simulated clients trains on private partitions of
//! a dataset and sends model deltas to a server, which combines them into a
//! global model over synchronous rounds. This crate holds the types both
//! sides agree on:
//!
//! - [`Model`]: the flat parameter vector exchanged between server and
//!   clients.
//! - [`DataSplit`]: the immutable assignment of training samples to
//!   clients.
//! - [`CommunicationMetadata`]: the server-owned side channel (dynamic
//!   weights, control variates, the shared generative model) that some
//!   aggregation algorithms need.
//! - [`ClientResponse`]: what a client hands back at the end of a round.
//!
//! It also provides the narrow collaborators a simulation needs to run end
//! to end: a deterministic synthetic [`data::DatasetProvider`], a
//! softmax-regression [`learner::Learner`], plain SGD with a round-level
//! learning-rate schedule, and the metric/logging sinks.
//!
//! [`Model`]: crate::model::Model
//! [`DataSplit`]: crate::data::DataSplit
//! [`CommunicationMetadata`]: crate::metadata::CommunicationMetadata
//! [`ClientResponse`]: crate::message::ClientResponse

pub mod common;
pub mod data;
mod error;
pub mod generator;
pub mod learner;
pub mod message;
pub mod metadata;
pub mod metrics;
pub mod model;
pub mod optimizer;

pub use self::error::ConfigurationError;

/// The identifier of a client, in `0..num_clients`.
pub type ClientId = u32;
