//! Aggregation arms.
//!
//! An [`Arm`] is one complete server-side aggregation algorithm. Every arm
//! runs the same round skeleton:
//!
//! 1. sample the participants of the round,
//! 2. broadcast a read-only snapshot of the global model together with the
//!    arm's [`Directive`],
//! 3. let the participants train in parallel and wait for all of them,
//! 4. combine the deltas of the responders into the next global model,
//! 5. derive the [`MetadataUpdate`] the arm wants to commit.
//!
//! Arms differ in the directive they send, in how they weight the deltas and
//! in the metadata they update. [`Arm::apply_round`] never mutates the global
//! model or the metadata: committing the outcome is up to the caller.

mod participants;
pub mod weighting;

use std::{collections::BTreeMap, convert::TryFrom, fmt, str::FromStr, sync::Arc};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error_span, info, warn};

pub use self::participants::sample_participants;
use crate::settings::AlgorithmSettings;
use fedsim_client::{
    AlgorithmMode,
    Capability,
    ClientError,
    ClientPayload,
    ClientPopulation,
    Directive,
    DynamicMode,
    TrainContext,
};
use fedsim_core::{
    common::RoundParameters,
    data::Dataset,
    generator::GenerativeModel,
    learner::{Evaluation, LearnerError},
    message::{ClientResponse, ClientUpdate},
    metadata::{CommunicationMetadata, Component, MetadataError, MetadataUpdate},
    metrics::MetricSink,
    model::{Model, ModelError},
    ClientId,
    ConfigurationError,
};

/// Errors that abort an aggregation round.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("no client responded")]
    NoResponders,
    #[error("the responders have a total aggregation weight of zero")]
    ZeroWeight,
    #[error("communication metadata lacks the {0} component")]
    MissingMetadata(Component),
    #[error("client {client} failed: {source}")]
    Client {
        client: ClientId,
        #[source]
        source: ClientError,
    },
    #[error("combining the updates failed: {0}")]
    Model(#[from] ModelError),
    #[error("committing the metadata update failed: {0}")]
    Metadata(#[from] MetadataError),
    #[error("refitting the generative model failed: {0}")]
    Generator(#[from] fedsim_core::generator::GeneratorError),
    #[error("evaluating the new global model failed: {0}")]
    Evaluation(#[from] LearnerError),
    #[error("the new global model has non-finite parameters")]
    Diverged,
}

/// Everything an arm needs to run a round besides the state it aggregates.
#[derive(Debug, Clone, Copy)]
pub struct RoundContext<'a> {
    pub train: &'a TrainContext,
    /// The held-out set the new global model is scored on.
    pub validation: &'a Dataset,
    pub round: RoundParameters,
    pub participation_rate: f64,
    pub algorithm: &'a AlgorithmSettings,
}

/// The uncommitted result of an aggregation round.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub arm: Arm,
    /// The next global model.
    pub global: Model,
    pub metadata_update: MetadataUpdate,
    /// The score of the next global model on the validation set.
    pub evaluation: Evaluation,
    /// Sample-weighted local training metrics of the responders.
    pub train_metrics: MetricSink,
    pub participants: usize,
    pub responders: usize,
}

/// A server-side aggregation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Arm {
    /// Sample-weighted averaging.
    FedAvg,
    /// Uniform averaging over the responders.
    FedEnsemble,
    /// Sample-weighted averaging of proximally regularized updates.
    FedProx,
    /// Sample-weighted averaging with control-variate drift correction.
    Scaffold,
    /// Sample-weighted averaging with a shared generative regularizer.
    FedGen,
    /// Averaging with dynamic per-client weights.
    DynamicAvg,
    /// Dynamic weights that also scale the local learning rate.
    DynamicSgd,
    /// Dynamic weights that also scale the local step count.
    DynamicFl,
}

impl Arm {
    pub const ALL: [Arm; 8] = [
        Self::FedAvg,
        Self::FedEnsemble,
        Self::FedProx,
        Self::Scaffold,
        Self::FedGen,
        Self::DynamicAvg,
        Self::DynamicSgd,
        Self::DynamicFl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FedAvg => "fedavg",
            Self::FedEnsemble => "fedensemble",
            Self::FedProx => "fedprox",
            Self::Scaffold => "scaffold",
            Self::FedGen => "fedgen",
            Self::DynamicAvg => "dynamicavg",
            Self::DynamicSgd => "dynamicsgd",
            Self::DynamicFl => "dynamicfl",
        }
    }

    /// The kind of local training the arm asks clients for.
    pub fn capability(&self) -> Capability {
        match self {
            Self::FedAvg | Self::FedEnsemble => Capability::Plain,
            Self::FedProx => Capability::Proximal,
            Self::Scaffold => Capability::ControlVariate,
            Self::FedGen => Capability::Generative,
            Self::DynamicAvg | Self::DynamicSgd | Self::DynamicFl => Capability::Dynamic,
        }
    }

    /// The metadata components the arm reads and updates.
    pub fn requirements(&self) -> &'static [Component] {
        match self {
            Self::FedAvg | Self::FedEnsemble | Self::FedProx => &[],
            Self::Scaffold => &[Component::ControlVariates],
            Self::FedGen => &[Component::Generator],
            Self::DynamicAvg | Self::DynamicSgd | Self::DynamicFl => &[Component::Weights],
        }
    }

    /// The arms a client population runs when no arm is configured explicitly.
    pub fn defaults_for(mode: AlgorithmMode) -> Vec<Arm> {
        match mode {
            AlgorithmMode::FedAvg => vec![Self::FedAvg],
            AlgorithmMode::FedEnsemble => vec![Self::FedEnsemble],
            AlgorithmMode::FedProx => vec![Self::FedProx],
            AlgorithmMode::Scaffold => vec![Self::Scaffold],
            AlgorithmMode::FedGen => vec![Self::FedGen],
            AlgorithmMode::DynamicAvg => vec![Self::DynamicAvg],
            AlgorithmMode::DynamicSgd => vec![Self::DynamicSgd],
            AlgorithmMode::DynamicFl => Self::ALL.to_vec(),
        }
    }

    /// Checks that the clients of `mode` can execute this arm's directive.
    ///
    /// # Errors
    /// Fails with [`ConfigurationError::IncompatibleArm`] otherwise.
    pub fn check_compatible(&self, mode: AlgorithmMode) -> Result<(), ConfigurationError> {
        if mode.supports(self.capability()) {
            Ok(())
        } else {
            Err(ConfigurationError::IncompatibleArm {
                arm: self.to_string(),
                mode: mode.to_string(),
            })
        }
    }

    /// Checks whether the metadata holds everything the arm needs.
    pub fn is_supported_by(&self, metadata: &CommunicationMetadata) -> bool {
        metadata.supports(self.requirements())
    }

    /// Runs one aggregation round without committing it.
    ///
    /// Clients are trained in place; the global model and the metadata are
    /// only read.
    ///
    /// # Errors
    /// Fails if the metadata lacks a required component, if any client fails
    /// internally, if nobody responded or if the combined model is unusable.
    pub fn apply_round(
        &self,
        ctx: &RoundContext,
        clients: &mut ClientPopulation,
        global: &Model,
        metadata: &CommunicationMetadata,
    ) -> Result<RoundOutcome, AggregationError> {
        if let Some(missing) = self.requirements().iter().find(|c| !metadata.has(**c)) {
            return Err(AggregationError::MissingMetadata(*missing));
        }
        let population = clients.len();
        let participants = sample_participants(clients.ids(), ctx.participation_rate, ctx.round.seed);
        debug!("broadcasting to {} of {} clients", participants.len(), population);

        // broadcast
        let snapshot = Arc::new(global.clone());
        let side_channel = SideChannel::new(*self, metadata, ctx.algorithm, population);

        // collect, the end of the parallel iteration is the round barrier
        let responses = clients
            .par_iter_mut()
            .filter(|(id, _)| participants.contains(*id))
            .map(|(id, client)| {
                let span = error_span!("client", id = *id);
                let _enter = span.enter();
                let payload = ClientPayload {
                    round: ctx.round,
                    global: Arc::clone(&snapshot),
                    directive: side_channel.directive(*id, metadata)?,
                };
                client
                    .local_train(ctx.train, &payload)
                    .map_err(|source| AggregationError::Client {
                        client: *id,
                        source,
                    })
            })
            .collect::<Result<Vec<ClientResponse>, AggregationError>>()?;

        let updates: Vec<ClientUpdate> = responses
            .into_iter()
            .filter_map(ClientResponse::into_update)
            .collect();
        let dropouts = participants.len() - updates.len();
        if dropouts > 0 {
            warn!("{} of {} participants dropped out", dropouts, participants.len());
        }
        if updates.is_empty() {
            return Err(AggregationError::NoResponders);
        }

        // combine
        let weights = self.weights(&updates, metadata)?;
        let combined = Model::weighted_sum(
            global.len(),
            updates.iter().zip(weights.iter()).map(|(u, w)| (&u.delta, *w)),
        )?;
        let mut next = global.clone();
        next.add_scaled(&combined, 1.0)?;
        if !next.is_finite() {
            return Err(AggregationError::Diverged);
        }

        let metadata_update = self.metadata_update(&updates, metadata, ctx.algorithm, population)?;
        let evaluation = ctx.train.learner.evaluate(&next, ctx.validation)?;
        let mut train_metrics = MetricSink::new();
        for update in updates.iter() {
            let n = update.sample_count as f64;
            train_metrics.add("train/Loss", update.metrics.loss, n);
            train_metrics.add("train/Accuracy", update.metrics.accuracy, n);
        }
        info!(
            arm = %self,
            responders = updates.len(),
            loss = evaluation.loss,
            accuracy = evaluation.accuracy,
            "aggregated round"
        );

        Ok(RoundOutcome {
            arm: *self,
            global: next,
            metadata_update,
            evaluation,
            train_metrics,
            participants: participants.len(),
            responders: updates.len(),
        })
    }

    /// Computes the aggregation weights of the responders.
    fn weights(
        &self,
        updates: &[ClientUpdate],
        metadata: &CommunicationMetadata,
    ) -> Result<Vec<f64>, AggregationError> {
        let counts: Vec<usize> = updates.iter().map(|u| u.sample_count).collect();
        match self {
            Self::FedAvg | Self::FedProx | Self::Scaffold | Self::FedGen => {
                weighting::by_sample_count(&counts)
            }
            Self::FedEnsemble => weighting::uniform(updates.len()),
            Self::DynamicAvg | Self::DynamicSgd | Self::DynamicFl => {
                let raw = updates
                    .iter()
                    .map(|u| {
                        let w = metadata
                            .weight(u.client_id)
                            .ok_or(AggregationError::MissingMetadata(Component::Weights))?;
                        Ok(match self {
                            Self::DynamicFl => w * u.sample_count as f64,
                            _ => w,
                        })
                    })
                    .collect::<Result<Vec<f64>, AggregationError>>()?;
                weighting::normalize(raw)
            }
        }
    }

    fn metadata_update(
        &self,
        updates: &[ClientUpdate],
        metadata: &CommunicationMetadata,
        algorithm: &AlgorithmSettings,
        population: usize,
    ) -> Result<MetadataUpdate, AggregationError> {
        let mut update = MetadataUpdate::default();
        match self {
            Self::FedAvg | Self::FedEnsemble | Self::FedProx => {}
            Self::Scaffold => {
                let len = metadata
                    .server_control()
                    .ok_or(AggregationError::MissingMetadata(Component::ControlVariates))?
                    .len();
                let deltas: BTreeMap<ClientId, Model> = updates
                    .iter()
                    .filter_map(|u| u.control_delta.clone().map(|d| (u.client_id, d)))
                    .collect();
                // c += |S| / N * mean(Δc_i) = 1 / N * Σ Δc_i
                let scale = 1.0 / population.max(1) as f64;
                let server_delta =
                    Model::weighted_sum(len, deltas.values().map(|d| (d, scale)))?;
                update.control_deltas = deltas;
                update.server_control_delta = Some(server_delta);
            }
            Self::FedGen => {
                let generator = metadata
                    .generator()
                    .ok_or(AggregationError::MissingMetadata(Component::Generator))?;
                let mut stats = generator.empty_statistics();
                for class_stats in updates.iter().filter_map(|u| u.class_stats.as_ref()) {
                    stats.merge(class_stats)?;
                }
                update.generator = Some(generator.refit(&stats)?);
            }
            Self::DynamicAvg | Self::DynamicSgd | Self::DynamicFl => {
                let current = metadata
                    .weights()
                    .ok_or(AggregationError::MissingMetadata(Component::Weights))?;
                let feedback: Vec<(ClientId, f64)> = updates
                    .iter()
                    .filter_map(|u| u.feedback.map(|loss| (u.client_id, loss)))
                    .collect();
                update.weights = weighting::rederive(current, &feedback, algorithm.dynamic_beta);
            }
        }
        Ok(update)
    }
}

/// The parts of a directive shared by every participant of a round.
struct SideChannel {
    arm: Arm,
    mu: f64,
    alpha: f64,
    population: usize,
    server_control: Option<Arc<Model>>,
    generator: Option<Arc<GenerativeModel>>,
}

impl SideChannel {
    fn new(
        arm: Arm,
        metadata: &CommunicationMetadata,
        algorithm: &AlgorithmSettings,
        population: usize,
    ) -> Self {
        Self {
            arm,
            mu: algorithm.fedprox_mu,
            alpha: algorithm.fedgen_alpha,
            population,
            server_control: match arm {
                Arm::Scaffold => metadata.server_control().cloned().map(Arc::new),
                _ => None,
            },
            generator: match arm {
                Arm::FedGen => metadata.generator(),
                _ => None,
            },
        }
    }

    fn directive(
        &self,
        id: ClientId,
        metadata: &CommunicationMetadata,
    ) -> Result<Directive, AggregationError> {
        let directive = match self.arm {
            Arm::FedAvg | Arm::FedEnsemble => Directive::Plain,
            Arm::FedProx => Directive::Proximal { mu: self.mu },
            Arm::Scaffold => Directive::ControlVariate {
                server: self
                    .server_control
                    .clone()
                    .ok_or(AggregationError::MissingMetadata(Component::ControlVariates))?,
                local: metadata
                    .control(id)
                    .cloned()
                    .ok_or(AggregationError::MissingMetadata(Component::ControlVariates))?,
            },
            Arm::FedGen => Directive::Generative {
                generator: self
                    .generator
                    .clone()
                    .ok_or(AggregationError::MissingMetadata(Component::Generator))?,
                alpha: self.alpha,
            },
            Arm::DynamicAvg | Arm::DynamicSgd | Arm::DynamicFl => Directive::Dynamic {
                mode: match self.arm {
                    Arm::DynamicSgd => DynamicMode::Sgd,
                    Arm::DynamicFl => DynamicMode::Fl,
                    _ => DynamicMode::Avg,
                },
                weight: metadata
                    .weight(id)
                    .ok_or(AggregationError::MissingMetadata(Component::Weights))?,
                population: self.population,
            },
        };
        Ok(directive)
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arm {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|arm| arm.as_str() == s)
            .ok_or_else(|| ConfigurationError::UnknownArm(s.to_string()))
    }
}

impl TryFrom<String> for Arm {
    type Error = ConfigurationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Arm> for String {
    fn from(arm: Arm) -> Self {
        arm.as_str().to_string()
    }
}

#[cfg(test)]
mod tests;
