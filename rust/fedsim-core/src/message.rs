//! What clients send back to the server at the end of a round.

use serde::{Deserialize, Serialize};

use crate::{generator::ClassStatistics, model::Model, ClientId};

/// Training statistics of a local run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalMetrics {
    /// Mean training loss over the local steps.
    pub loss: f64,
    /// Training accuracy over the local steps.
    pub accuracy: f64,
    /// The number of gradient steps taken.
    pub steps: usize,
}

/// A local model update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub client_id: ClientId,
    /// The difference between the locally trained model and the broadcast global model.
    pub delta: Model,
    /// The number of samples in the client's partition.
    pub sample_count: usize,
    pub metrics: LocalMetrics,
    /// The change of the client's control variate.
    pub control_delta: Option<Model>,
    /// Per-class feature statistics of the client's partition.
    pub class_stats: Option<ClassStatistics>,
    /// The loss the dynamic weighting reacts to.
    pub feedback: Option<f64>,
}

/// The answer of a client to a training request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientResponse {
    Update(ClientUpdate),
    /// The client could not produce an update this round.
    Dropout(ClientId),
}

impl ClientResponse {
    pub fn client_id(&self) -> ClientId {
        match self {
            Self::Update(update) => update.client_id,
            Self::Dropout(id) => *id,
        }
    }

    pub fn into_update(self) -> Option<ClientUpdate> {
        match self {
            Self::Update(update) => Some(update),
            Self::Dropout(_) => None,
        }
    }

    pub fn is_dropout(&self) -> bool {
        matches!(self, Self::Dropout(_))
    }
}
