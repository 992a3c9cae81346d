use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use fedsim_core::{
    common::Stream,
    data::{DataError, Dataset},
    generator::GenerativeModel,
    learner::{Learner, LearnerError},
    message::{ClientResponse, ClientUpdate, LocalMetrics},
    model::{Model, ModelError},
    ClientId,
};

use crate::{
    directive::{Capability, ClientPayload, Directive, DynamicMode},
    dropout::DropoutPolicy,
    trainer::{Correction, LocalRun},
};

/// An internal client failure.
///
/// Unlike a dropout, this is a bug or a misconfiguration and aborts the experiment.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client {client} ({variant}) cannot execute a {capability} directive")]
    IncompatibleDirective {
        client: ClientId,
        variant: &'static str,
        capability: Capability,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Learner(#[from] LearnerError),
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Settings of the local training loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalSettings {
    pub batch_size: usize,
    pub momentum: f64,
    pub weight_decay: f64,
}

/// The read-only environment every client trains in.
#[derive(Debug, Clone)]
pub struct TrainContext {
    /// The shared training set. Clients only read the rows of their partition.
    pub train: Arc<Dataset>,
    pub learner: Arc<dyn Learner>,
    pub settings: LocalSettings,
    pub dropout: DropoutPolicy,
}

/// The variant of a client together with its auxiliary state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientState {
    Plain,
    Proximal,
    /// Keeps a copy of its control variate for the running round.
    ControlVariate { control: Model },
    /// Holds a read-only handle to the server's generative model.
    ///
    /// The handle is not persisted; it is re-attached with the next broadcast.
    Generative {
        #[serde(skip)]
        generator: Option<Arc<GenerativeModel>>,
    },
    /// Remembers the dynamic weight it was last trained with.
    Dynamic { weight: f64 },
    /// Executes every directive.
    Combined {
        control: Option<Model>,
        #[serde(skip)]
        generator: Option<Arc<GenerativeModel>>,
        weight: Option<f64>,
    },
}

impl ClientState {
    pub fn variant(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Proximal => "proximal",
            Self::ControlVariate { .. } => "control-variate",
            Self::Generative { .. } => "generative",
            Self::Dynamic { .. } => "dynamic",
            Self::Combined { .. } => "combined",
        }
    }

    /// Checks whether this variant can execute directives of the given kind.
    pub fn supports(&self, capability: Capability) -> bool {
        match (self, capability) {
            (_, Capability::Plain) | (Self::Combined { .. }, _) => true,
            (Self::Proximal, Capability::Proximal)
            | (Self::ControlVariate { .. }, Capability::ControlVariate)
            | (Self::Generative { .. }, Capability::Generative)
            | (Self::Dynamic { .. }, Capability::Dynamic) => true,
            _ => false,
        }
    }

    /// Stores the directive's side-channel data in the auxiliary state.
    fn absorb(&mut self, directive: &Directive) {
        match (self, directive) {
            (Self::ControlVariate { control }, Directive::ControlVariate { local, .. }) => {
                *control = local.clone();
            }
            (Self::Combined { control, .. }, Directive::ControlVariate { local, .. }) => {
                *control = Some(local.clone());
            }
            (Self::Generative { generator }, Directive::Generative { generator: g, .. })
            | (Self::Combined { generator, .. }, Directive::Generative { generator: g, .. }) => {
                *generator = Some(Arc::clone(g));
            }
            (Self::Dynamic { weight }, Directive::Dynamic { weight: w, .. }) => *weight = *w,
            (Self::Combined { weight, .. }, Directive::Dynamic { weight: w, .. }) => {
                *weight = Some(*w)
            }
            _ => {}
        }
    }
}

/// A simulated federated learning client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    id: ClientId,
    indices: Vec<usize>,
    model: Model,
    state: ClientState,
}

impl Client {
    pub fn new(id: ClientId, indices: Vec<usize>, model: Model, state: ClientState) -> Self {
        Self {
            id,
            indices,
            model,
            state,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The indices of the training samples this client owns.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn sample_count(&self) -> usize {
        self.indices.len()
    }

    /// The local parameter buffer, i.e. the model after the last local training.
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Trains on the local partition, starting from the broadcast global model.
    ///
    /// Returns [`ClientResponse::Dropout`] if the dropout policy removes the
    /// client from the round. The local buffer is overwritten by the
    /// broadcast model in any other case.
    ///
    /// # Errors
    /// Fails if the client variant cannot execute the directive, or if
    /// training itself fails. Such failures are not dropouts.
    pub fn local_train(
        &mut self,
        ctx: &TrainContext,
        payload: &ClientPayload,
    ) -> Result<ClientResponse, ClientError> {
        let round = payload.round;
        if ctx.dropout.drops(round.global_epoch, round.seed, self.id) {
            debug!(client = self.id, "client dropped out");
            return Ok(ClientResponse::Dropout(self.id));
        }

        let capability = payload.directive.capability();
        if !self.state.supports(capability) {
            return Err(ClientError::IncompatibleDirective {
                client: self.id,
                variant: self.state.variant(),
                capability,
            });
        }
        self.state.absorb(&payload.directive);
        self.model.copy_from(&payload.global)?;
        let global = payload.global.as_ref();

        let (steps, lr) = match payload.directive {
            Directive::Dynamic {
                mode,
                weight,
                population,
            } => scale_for_weight(mode, weight, population, round.step_budget, round.lr),
            _ => (round.step_budget, round.lr),
        };
        let correction = match &payload.directive {
            Directive::Plain | Directive::Dynamic { .. } => Correction::None,
            Directive::Proximal { mu } => Correction::Proximal {
                mu: *mu as f32,
                global,
            },
            Directive::ControlVariate { server, local } => Correction::ControlVariate {
                server: server.as_ref(),
                local,
            },
            Directive::Generative { generator, alpha } => Correction::Generative {
                generator: generator.as_ref(),
                alpha: *alpha as f32,
            },
        };
        let run = LocalRun {
            ctx,
            indices: &self.indices,
            steps: if self.indices.is_empty() { 0 } else { steps },
            lr,
            correction,
        };

        let mut rng = round.seed.rng(Stream::Client, u64::from(self.id));
        let metrics = run.train(&mut self.model, &mut rng)?;
        trace!(
            client = self.id,
            steps = metrics.steps,
            loss = metrics.loss,
            "local training done"
        );
        let delta = self.model.delta(global)?;

        let mut update = ClientUpdate {
            client_id: self.id,
            delta,
            sample_count: self.indices.len(),
            metrics,
            control_delta: None,
            class_stats: None,
            feedback: None,
        };
        match &payload.directive {
            Directive::ControlVariate { server, .. } => {
                update.control_delta = Some(control_delta(&update.delta, server, &metrics, lr)?);
            }
            Directive::Generative { generator, .. } => {
                update.class_stats = Some(run.class_statistics(generator)?);
            }
            Directive::Dynamic { .. } if metrics.steps > 0 => {
                update.feedback = Some(metrics.loss);
            }
            _ => {}
        }
        Ok(ClientResponse::Update(update))
    }
}

/// Scales the local step count or learning rate by `weight * population`.
///
/// A weight of `1 / population` is neutral. The step count never exceeds the
/// budget and never drops below one.
fn scale_for_weight(
    mode: DynamicMode,
    weight: f64,
    population: usize,
    budget: usize,
    lr: f64,
) -> (usize, f64) {
    let factor = weight * population as f64;
    match mode {
        DynamicMode::Avg => (budget, lr),
        DynamicMode::Sgd => (budget, lr * factor),
        DynamicMode::Fl => {
            let steps = (budget as f64 * factor).round() as usize;
            (steps.clamp(1, budget.max(1)), lr)
        }
    }
}

/// Computes the change of the client control variate after `K` local steps.
///
/// With `c_i+ = c_i - c + (w_global - w_local) / (K * lr)` the change is
/// `-c - delta / (K * lr)`.
fn control_delta(
    delta: &Model,
    server: &Model,
    metrics: &LocalMetrics,
    lr: f64,
) -> Result<Model, ModelError> {
    server.check_len(delta)?;
    if metrics.steps == 0 || lr <= 0.0 {
        return Ok(Model::zeros(delta.len()));
    }
    let scale = (1.0 / (metrics.steps as f64 * lr)) as f32;
    Ok(delta
        .iter()
        .zip(server.iter())
        .map(|(d, c)| -c - scale * d)
        .collect())
}
