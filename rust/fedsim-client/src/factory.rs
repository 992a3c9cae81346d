//! Building the client population of an experiment.

use std::{collections::BTreeMap, convert::TryFrom, fmt, str::FromStr, sync::Arc};

use rayon::{collections::btree_map::IterMut as ParIterMut, prelude::*};
use serde::{Deserialize, Serialize};
use tracing::info;

use fedsim_core::{
    data::DataSplit,
    generator::GenerativeModel,
    metadata::{CommunicationMetadata, Component},
    model::Model,
    ClientId,
    ConfigurationError,
};

use crate::{client::Client, directive::Capability, ClientState};

/// The algorithm family a client population is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AlgorithmMode {
    FedAvg,
    FedEnsemble,
    FedProx,
    Scaffold,
    FedGen,
    DynamicAvg,
    DynamicSgd,
    /// The population for the combination search: every client executes every directive.
    DynamicFl,
}

impl AlgorithmMode {
    pub const ALL: [AlgorithmMode; 8] = [
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

    /// Checks whether clients of this mode can execute directives of the given kind.
    pub fn supports(&self, capability: Capability) -> bool {
        self.initial_state(None, None, None).supports(capability)
    }

    /// The metadata components the clients of this mode read from.
    pub fn required_metadata(&self) -> &'static [Component] {
        match self {
            Self::FedAvg | Self::FedEnsemble | Self::FedProx => &[],
            Self::Scaffold => &[Component::ControlVariates],
            Self::FedGen => &[Component::Generator],
            Self::DynamicAvg | Self::DynamicSgd | Self::DynamicFl => &[Component::Weights],
        }
    }

    fn initial_state(
        &self,
        control: Option<&Model>,
        generator: Option<Arc<GenerativeModel>>,
        weight: Option<f64>,
    ) -> ClientState {
        match self {
            Self::FedAvg | Self::FedEnsemble => ClientState::Plain,
            Self::FedProx => ClientState::Proximal,
            Self::Scaffold => ClientState::ControlVariate {
                control: control.cloned().unwrap_or_default(),
            },
            Self::FedGen => ClientState::Generative { generator },
            Self::DynamicAvg | Self::DynamicSgd => ClientState::Dynamic {
                weight: weight.unwrap_or_default(),
            },
            Self::DynamicFl => ClientState::Combined {
                control: control.cloned(),
                generator,
                weight,
            },
        }
    }
}

impl fmt::Display for AlgorithmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ConfigurationError::UnknownAlgorithm(s.to_string()))
    }
}

impl TryFrom<String> for AlgorithmMode {
    type Error = ConfigurationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AlgorithmMode> for String {
    fn from(mode: AlgorithmMode) -> Self {
        mode.as_str().to_string()
    }
}

/// The clients of an experiment, keyed by id.
///
/// Clients are created once and live for the whole experiment; the
/// population neither grows nor shrinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPopulation(BTreeMap<ClientId, Client>);

impl ClientPopulation {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.0.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.0.values()
    }

    /// Iterates over the clients in parallel, each borrowed exclusively.
    pub fn par_iter_mut(&mut self) -> ParIterMut<'_, ClientId, Client> {
        self.0.par_iter_mut()
    }
}

/// Creates one client per entry of `split`, all starting from `model`.
///
/// # Errors
/// Fails if `metadata` lacks a component the clients of `mode` read from.
pub fn create_clients(
    mode: AlgorithmMode,
    model: &Model,
    split: &DataSplit,
    metadata: &CommunicationMetadata,
) -> Result<ClientPopulation, ConfigurationError> {
    if let Some(missing) = mode
        .required_metadata()
        .iter()
        .find(|component| !metadata.has(**component))
    {
        return Err(ConfigurationError::MissingMetadata(*missing));
    }

    let clients: BTreeMap<ClientId, Client> = split
        .iter()
        .map(|(id, indices)| {
            let state = mode.initial_state(
                metadata.control(id),
                metadata.generator(),
                metadata.weight(id),
            );
            (id, Client::new(id, indices.to_vec(), model.clone(), state))
        })
        .collect();
    info!("created {} {} clients", clients.len(), mode);
    Ok(ClientPopulation(clients))
}
