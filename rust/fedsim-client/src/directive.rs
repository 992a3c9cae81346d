use std::sync::Arc;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use fedsim_core::{common::RoundParameters, generator::GenerativeModel, model::Model};

/// A kind of local training a client variant is able to perform.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[display(fmt = "plain")]
    Plain,
    #[display(fmt = "proximal")]
    Proximal,
    #[display(fmt = "control-variate")]
    ControlVariate,
    #[display(fmt = "generative")]
    Generative,
    #[display(fmt = "dynamic")]
    Dynamic,
}

/// How a dynamic client applies its weight.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DynamicMode {
    /// Train plainly, the weight only matters for the aggregation.
    #[display(fmt = "avg")]
    Avg,
    /// Scale the learning rate.
    #[display(fmt = "sgd")]
    Sgd,
    /// Scale the number of local steps.
    #[display(fmt = "fl")]
    Fl,
}

/// The per-round side channel of an aggregation algorithm.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Plain,
    /// Penalize the distance to the global model with `mu / 2 * |w - w_global|²`.
    Proximal { mu: f64 },
    /// Correct every gradient with `server - local`.
    ControlVariate { server: Arc<Model>, local: Model },
    /// Regularize with `alpha` times the loss on synthetic samples.
    Generative {
        generator: Arc<GenerativeModel>,
        alpha: f64,
    },
    /// Scale the local training by `weight * population`.
    Dynamic {
        mode: DynamicMode,
        weight: f64,
        population: usize,
    },
}

impl Directive {
    /// The capability a client needs to execute this directive.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Plain => Capability::Plain,
            Self::Proximal { .. } => Capability::Proximal,
            Self::ControlVariate { .. } => Capability::ControlVariate,
            Self::Generative { .. } => Capability::Generative,
            Self::Dynamic { .. } => Capability::Dynamic,
        }
    }
}

/// Everything a client receives for a round.
#[derive(Debug, Clone)]
pub struct ClientPayload {
    pub round: RoundParameters,
    /// A read-only snapshot of the global model.
    pub global: Arc<Model>,
    pub directive: Directive,
}
