//! Simulated federated learning clients.
//!
//! A client owns a partition of the shared training set and a private
//! parameter buffer. Every round it receives a [`ClientPayload`] with a
//! read-only snapshot of the global model and the [`Directive`] of the
//! aggregation algorithm that runs the round, trains locally for a fixed
//! number of steps and answers with a [`ClientResponse`].
//!
//! The family of client variants is closed: [`ClientState`] enumerates them
//! and [`create_clients`] picks one for a whole population from the
//! configured [`AlgorithmMode`].
//!
//! [`ClientResponse`]: fedsim_core::message::ClientResponse

mod client;
mod directive;
mod dropout;
mod factory;
mod trainer;

pub use self::{
    client::{Client, ClientError, ClientState, LocalSettings, TrainContext},
    directive::{Capability, ClientPayload, Directive, DynamicMode},
    dropout::DropoutPolicy,
    factory::{create_clients, AlgorithmMode, ClientPopulation},
};
