//! The experiment runner.
//!
//! An experiment is a sequence of synchronous rounds over a fixed client
//! population. Each round
//!
//! 1. selects and runs an aggregation arm (see [`CombinationSearch`]),
//! 2. commits the outcome to the global model and the metadata,
//! 3. advances the learning rate schedule and closes the log record,
//! 4. checkpoints the experiment state.
//!
//! Rounds are CPU-bound, so the runner offloads them to a `rayon`
//! thread-pool and only awaits the result. The state moves into the pool and
//! back; nothing is shared mutably between the runner and a running round.
//!
//! [`CombinationSearch`]: crate::search::CombinationSearch

mod initializer;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rayon::ThreadPool;
use tokio::sync::oneshot;
use tracing::{error_span, info, warn};
use tracing_futures::Instrument;

pub use self::initializer::ExperimentInitializer;
use crate::{
    aggregation::RoundContext,
    error::{ExperimentError, ExperimentFailure},
    settings::{AlgorithmSettings, Settings},
    state::ExperimentState,
    storage::{CheckpointStorage, CheckpointStore},
};
use fedsim_client::TrainContext;
use fedsim_core::{
    common::{step_budget, RoundParameters, RoundSeed},
    data::{Dataset, DatasetProvider},
    learner::{Learner, SoftmaxRegression},
};

/// A cooperative stop request.
///
/// Raising the signal lets the running round finish its local training,
/// then discards it: nothing of it is committed or checkpointed.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The read-only environment shared by all rounds of an experiment.
#[derive(Clone, Debug)]
struct RoundEnv {
    train: TrainContext,
    validation: Arc<Dataset>,
    step_budget: usize,
    participation_rate: f64,
    algorithm: AlgorithmSettings,
}

/// Runs all experiments of a [`Settings`] one after another.
pub struct ExperimentRunner<S> {
    settings: Settings,
    store: CheckpointStore<S>,
    provider: Arc<dyn DatasetProvider>,
    thread_pool: Arc<ThreadPool>,
    shutdown: ShutdownSignal,
    learner: Option<Arc<dyn Learner>>,
}

impl<S> ExperimentRunner<S>
where
    S: CheckpointStorage,
{
    pub fn new(
        settings: Settings,
        store: CheckpointStore<S>,
        provider: Arc<dyn DatasetProvider>,
        thread_pool: Arc<ThreadPool>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            settings,
            store,
            provider,
            thread_pool,
            shutdown,
            learner: None,
        }
    }

    /// Trains `learner` instead of a softmax regression sized to the dataset.
    pub fn with_learner(mut self, learner: Arc<dyn Learner>) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &CheckpointStore<S> {
        &self.store
    }

    /// Runs the experiments for all configured seeds and returns their final states.
    ///
    /// # Errors
    /// Stops at the first failing experiment and reports its tag and seed.
    pub async fn run_all(&mut self) -> Result<Vec<ExperimentState>, ExperimentFailure> {
        let mut states = Vec::new();
        for seed in self.settings.experiment.seeds() {
            let tag = self.settings.experiment.tag(seed);
            match self.run_experiment(seed).await {
                Ok(state) => states.push(state),
                Err(source) => return Err(ExperimentFailure { tag, seed, source }),
            }
        }
        Ok(states)
    }

    /// Runs the experiment with `seed` until all configured rounds are complete.
    pub async fn run_experiment(&mut self, seed: u64) -> Result<ExperimentState, ExperimentError> {
        let tag = self.settings.experiment.tag(seed);
        let span = error_span!("experiment", tag = tag.as_str(), seed);

        async move {
            let data = self.provider.fetch(&self.settings.data.name, seed)?;
            let learner: Arc<dyn Learner> = match self.learner.as_ref() {
                Some(learner) => Arc::clone(learner),
                None => Arc::new(SoftmaxRegression::new(
                    data.train.num_features(),
                    data.train.num_classes(),
                )),
            };
            let mut state =
                ExperimentInitializer::new(&self.settings, &data.train, learner.as_ref())
                    .init(&mut self.store, tag, seed)
                    .await?;

            let client = &self.settings.client;
            let env = RoundEnv {
                step_budget: client.max_local_gradient_update.unwrap_or_else(|| {
                    step_budget(
                        data.train.len(),
                        client.num_clients,
                        client.local_epoch,
                        client.batch_size,
                    )
                }),
                train: TrainContext {
                    train: Arc::clone(&data.train),
                    learner,
                    settings: self.settings.local(),
                    dropout: self.settings.dropout(),
                },
                validation: Arc::clone(&data.test),
                participation_rate: client.participation_rate,
                algorithm: self.settings.algorithm,
            };
            info!(
                "running rounds {}..={} with {} local steps",
                state.global_epoch, self.settings.experiment.num_rounds, env.step_budget
            );

            while state.global_epoch <= self.settings.experiment.num_rounds {
                if self.shutdown.is_triggered() {
                    warn!("shutdown requested before round {}", state.global_epoch);
                    return Err(ExperimentError::Aborted);
                }
                state = self.run_round(state, &env).await?;
                state.logger.reset();
                self.store.save(&state).await?;
            }
            info!("experiment complete");
            Ok(state)
        }
        .instrument(span)
        .await
    }

    /// Runs a round on the thread-pool.
    async fn run_round(
        &self,
        state: ExperimentState,
        env: &RoundEnv,
    ) -> Result<ExperimentState, ExperimentError> {
        let (tx, rx) = oneshot::channel::<Result<ExperimentState, ExperimentError>>();
        let env = env.clone();
        let shutdown = self.shutdown.clone();
        let span = tracing::Span::current();
        self.thread_pool.spawn(move || {
            let _enter = span.enter();
            let _ = tx.send(execute_round(state, &env, &shutdown));
        });
        rx.await.unwrap_or_else(|_| {
            Err(ExperimentError::Internal(
                "failed to receive the round from the thread-pool".to_string(),
            ))
        })
    }
}

/// Runs and commits a single round.
fn execute_round(
    mut state: ExperimentState,
    env: &RoundEnv,
    shutdown: &ShutdownSignal,
) -> Result<ExperimentState, ExperimentError> {
    let epoch = state.global_epoch;
    let span = error_span!("round", epoch);
    let _enter = span.enter();

    state.logger.reset();
    let ctx = RoundContext {
        train: &env.train,
        validation: &env.validation,
        round: RoundParameters {
            global_epoch: epoch,
            seed: RoundSeed::derive(state.seed, epoch),
            step_budget: env.step_budget,
            lr: state.optimizer.lr(),
        },
        participation_rate: env.participation_rate,
        algorithm: &env.algorithm,
    };

    let pending = state.search.execute(
        &ctx,
        &mut state.clients,
        &state.global_model,
        &state.metadata,
    )?;
    if shutdown.is_triggered() {
        warn!("shutdown requested: discarding round");
        return Err(ExperimentError::Aborted);
    }
    let summary = state
        .search
        .commit(pending, &mut state.global_model, &mut state.metadata)?;
    state.optimizer.step();

    for (name, value) in summary.train_metrics.summary() {
        state.logger.append(&name, value, 1.0);
    }
    state.logger.append("test/Loss", summary.evaluation.loss, 1.0);
    state
        .logger
        .append("test/Accuracy", summary.evaluation.accuracy, 1.0);
    state.logger.append("search/Reward", summary.reward, 1.0);
    state.logger.close_round(
        epoch,
        summary.arm.as_str(),
        summary.participants,
        summary.responders,
    );
    info!(
        arm = %summary.arm,
        loss = summary.evaluation.loss,
        accuracy = summary.evaluation.accuracy,
        "round complete"
    );

    state.global_epoch += 1;
    Ok(state)
}
