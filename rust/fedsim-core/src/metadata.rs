//! Server-owned communication metadata.
//!
//! Some aggregation algorithms need state beyond the global model: dynamic
//! per-client weights, control variates, or a shared generative model. The
//! server owns this state. Clients only ever see copies (or read-only
//! handles), and the server changes it exclusively through
//! [`CommunicationMetadata::commit`] once a round has been aggregated and
//! scored.

use std::{collections::BTreeMap, sync::Arc};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    generator::GenerativeModel,
    model::{Model, ModelError},
    ClientId,
};

/// Tolerance when checking that dynamic weights sum up to one.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// A component of the communication metadata.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Component {
    #[display(fmt = "dynamic weights")]
    Weights,
    #[display(fmt = "control variates")]
    ControlVariates,
    #[display(fmt = "generative model")]
    Generator,
}

#[derive(Debug, Error, PartialEq)]
/// Errors related to committing a metadata update.
pub enum MetadataError {
    #[error("metadata lacks the {0} component")]
    MissingComponent(Component),
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("dynamic weights must be non-negative and sum up to 1, got a sum of {0}")]
    InvalidWeights(f64),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Control variates of the server and of every client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlVariates {
    pub server: Model,
    pub clients: BTreeMap<ClientId, Model>,
}

/// The communication metadata of an experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunicationMetadata {
    weights: Option<BTreeMap<ClientId, f64>>,
    controls: Option<ControlVariates>,
    generator: Option<Arc<GenerativeModel>>,
}

/// A pending change of the communication metadata.
///
/// Produced by an aggregation round and applied as a whole, or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataUpdate {
    /// New weights of the listed clients; unlisted clients keep theirs.
    pub weights: BTreeMap<ClientId, f64>,
    /// Additive changes of client control variates.
    pub control_deltas: BTreeMap<ClientId, Model>,
    /// Additive change of the server control variate.
    pub server_control_delta: Option<Model>,
    /// The replacement generative model.
    pub generator: Option<GenerativeModel>,
}

impl MetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
            && self.control_deltas.is_empty()
            && self.server_control_delta.is_none()
            && self.generator.is_none()
    }
}

impl CommunicationMetadata {
    /// Creates metadata without any component.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds uniform dynamic weights for the given clients.
    pub fn with_weights(mut self, ids: impl IntoIterator<Item = ClientId>) -> Self {
        let ids: Vec<ClientId> = ids.into_iter().collect();
        let weight = 1.0 / ids.len().max(1) as f64;
        self.weights = Some(ids.into_iter().map(|id| (id, weight)).collect());
        self
    }

    /// Adds zero control variates of `model_len` parameters for the server and the given clients.
    pub fn with_control_variates(
        mut self,
        ids: impl IntoIterator<Item = ClientId>,
        model_len: usize,
    ) -> Self {
        self.controls = Some(ControlVariates {
            server: Model::zeros(model_len),
            clients: ids
                .into_iter()
                .map(|id| (id, Model::zeros(model_len)))
                .collect(),
        });
        self
    }

    /// Adds a shared generative model.
    pub fn with_generator(mut self, generator: GenerativeModel) -> Self {
        self.generator = Some(Arc::new(generator));
        self
    }

    /// Creates metadata holding exactly the given components.
    ///
    /// `generator` is only kept if [`Component::Generator`] is requested.
    pub fn for_components(
        ids: &[ClientId],
        components: &[Component],
        model_len: usize,
        generator: GenerativeModel,
    ) -> Self {
        let mut metadata = Self::new();
        if components.contains(&Component::Weights) {
            metadata = metadata.with_weights(ids.iter().copied());
        }
        if components.contains(&Component::ControlVariates) {
            metadata = metadata.with_control_variates(ids.iter().copied(), model_len);
        }
        if components.contains(&Component::Generator) {
            metadata = metadata.with_generator(generator);
        }
        metadata
    }

    /// Checks whether a component is present.
    pub fn has(&self, component: Component) -> bool {
        match component {
            Component::Weights => self.weights.is_some(),
            Component::ControlVariates => self.controls.is_some(),
            Component::Generator => self.generator.is_some(),
        }
    }

    /// Checks whether all given components are present.
    pub fn supports(&self, components: &[Component]) -> bool {
        components.iter().all(|c| self.has(*c))
    }

    pub fn weight(&self, id: ClientId) -> Option<f64> {
        self.weights.as_ref()?.get(&id).copied()
    }

    pub fn weights(&self) -> Option<&BTreeMap<ClientId, f64>> {
        self.weights.as_ref()
    }

    pub fn control(&self, id: ClientId) -> Option<&Model> {
        self.controls.as_ref()?.clients.get(&id)
    }

    pub fn server_control(&self) -> Option<&Model> {
        self.controls.as_ref().map(|c| &c.server)
    }

    /// Gets a read-only handle to the shared generative model.
    pub fn generator(&self) -> Option<Arc<GenerativeModel>> {
        self.generator.clone()
    }

    /// Applies an update.
    ///
    /// Every entry is validated before anything is changed, so a failing
    /// commit leaves the metadata untouched.
    ///
    /// # Errors
    /// Fails if the update touches a missing component or an unknown client,
    /// if a control delta has the wrong length, or if the resulting weights
    /// would not sum up to one.
    pub fn commit(&mut self, update: MetadataUpdate) -> Result<(), MetadataError> {
        let weights = self.validate_weights(&update.weights)?;
        self.validate_controls(&update)?;
        if update.generator.is_some() && self.generator.is_none() {
            return Err(MetadataError::MissingComponent(Component::Generator));
        }

        if let Some(weights) = weights {
            self.weights = Some(weights);
        }
        if let Some(controls) = self.controls.as_mut() {
            for (id, delta) in update.control_deltas.iter() {
                if let Some(control) = controls.clients.get_mut(id) {
                    control.add_scaled(delta, 1.0)?;
                }
            }
            if let Some(delta) = update.server_control_delta.as_ref() {
                controls.server.add_scaled(delta, 1.0)?;
            }
        }
        if let Some(generator) = update.generator {
            self.generator = Some(Arc::new(generator));
        }
        Ok(())
    }

    fn validate_weights(
        &self,
        changes: &BTreeMap<ClientId, f64>,
    ) -> Result<Option<BTreeMap<ClientId, f64>>, MetadataError> {
        if changes.is_empty() {
            return Ok(None);
        }
        let current = self
            .weights
            .as_ref()
            .ok_or(MetadataError::MissingComponent(Component::Weights))?;
        let mut next = current.clone();
        for (id, weight) in changes.iter() {
            match next.get_mut(id) {
                Some(w) => *w = *weight,
                None => return Err(MetadataError::UnknownClient(*id)),
            }
        }
        let sum: f64 = next.values().sum();
        if next.values().any(|w| !w.is_finite() || *w < 0.0)
            || (sum - 1.0).abs() > WEIGHT_TOLERANCE
        {
            return Err(MetadataError::InvalidWeights(sum));
        }
        Ok(Some(next))
    }

    fn validate_controls(&self, update: &MetadataUpdate) -> Result<(), MetadataError> {
        if update.control_deltas.is_empty() && update.server_control_delta.is_none() {
            return Ok(());
        }
        let controls = self
            .controls
            .as_ref()
            .ok_or(MetadataError::MissingComponent(Component::ControlVariates))?;
        for (id, delta) in update.control_deltas.iter() {
            controls
                .clients
                .get(id)
                .ok_or(MetadataError::UnknownClient(*id))?
                .check_len(delta)?;
        }
        if let Some(delta) = update.server_control_delta.as_ref() {
            controls.server.check_len(delta)?;
        }
        Ok(())
    }
}
