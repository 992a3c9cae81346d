use std::sync::Arc;

use rayon::ThreadPoolBuilder;
use tracing_subscriber::*;

use crate::{
    aggregation::{Arm, RoundContext},
    runner::{ExperimentInitializer, ExperimentRunner, ShutdownSignal},
    settings::{AlgorithmSettings, PolicyKind, ScriptedDropout, Settings},
    state::ExperimentState,
    storage::{CheckpointStorage, CheckpointStore, ResumeMode},
};
use fedsim_client::{AlgorithmMode, TrainContext};
use fedsim_core::{
    common::{step_budget, RoundParameters, RoundSeed},
    data::{Dataset, DatasetProvider, SyntheticProvider},
    learner::{Learner, SoftmaxRegression},
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

/// Small, fast settings for tests.
pub struct SettingsBuilder {
    settings: Settings,
}

#[allow(dead_code)]
impl SettingsBuilder {
    pub fn new() -> Self {
        let mut settings = Settings::default();
        settings.experiment.num_rounds = 3;
        settings.data.train_samples = 200;
        settings.data.test_samples = 60;
        settings.data.features = 4;
        settings.data.classes = 3;
        settings.data.noise = 0.5;
        settings.client.num_clients = 4;
        settings.client.batch_size = 10;
        settings.optimizer.lr = 0.5;
        settings.search.epsilon = 0.0;
        Self { settings }
    }

    pub fn build(self) -> Settings {
        self.settings
    }

    pub fn with_mode(mut self, mode: AlgorithmMode) -> Self {
        self.settings.client.algo_mode = mode;
        self
    }

    pub fn with_arms(mut self, arms: Vec<Arm>) -> Self {
        self.settings.search.arms = arms;
        self
    }

    pub fn with_clients(mut self, num_clients: usize) -> Self {
        self.settings.client.num_clients = num_clients;
        self
    }

    pub fn with_train_samples(mut self, samples: usize) -> Self {
        self.settings.data.train_samples = samples;
        self
    }

    pub fn with_rounds(mut self, rounds: u64) -> Self {
        self.settings.experiment.num_rounds = rounds;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.settings.experiment.init_seed = seed;
        self
    }

    pub fn with_experiments(mut self, num_experiments: u64) -> Self {
        self.settings.experiment.num_experiments = num_experiments;
        self
    }

    pub fn with_control_name(mut self, name: &str) -> Self {
        self.settings.experiment.control_name = name.to_string();
        self
    }

    pub fn with_resume(mut self, mode: ResumeMode) -> Self {
        self.settings.experiment.resume_mode = mode;
        self
    }

    pub fn with_participation(mut self, rate: f64) -> Self {
        self.settings.client.participation_rate = rate;
        self
    }

    pub fn with_dropout_rate(mut self, rate: f64) -> Self {
        self.settings.dropout.rate = rate;
        self
    }

    pub fn with_scripted_dropout(mut self, round: u64, client: u32) -> Self {
        self.settings
            .dropout
            .scripted
            .push(ScriptedDropout { round, client });
        self
    }

    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.settings.search.policy = policy;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.settings.search.epsilon = epsilon;
        self
    }
}

pub fn provider(settings: &Settings) -> SyntheticProvider {
    SyntheticProvider {
        train_samples: settings.data.train_samples,
        test_samples: settings.data.test_samples,
        features: settings.data.features,
        classes: settings.data.classes,
        noise: settings.data.noise,
    }
}

pub fn runner<S: CheckpointStorage>(settings: Settings, storage: S) -> ExperimentRunner<S> {
    runner_with_shutdown(settings, storage, ShutdownSignal::new())
}

pub fn runner_with_shutdown<S: CheckpointStorage>(
    settings: Settings,
    storage: S,
    shutdown: ShutdownSignal,
) -> ExperimentRunner<S> {
    let provider = provider(&settings);
    let thread_pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    ExperimentRunner::new(
        settings,
        CheckpointStore::new(storage),
        Arc::new(provider),
        Arc::new(thread_pool),
        shutdown,
    )
}

/// Everything an arm needs to run a round outside of the runner.
pub struct TestEnv {
    pub train: TrainContext,
    pub validation: Arc<Dataset>,
    pub algorithm: AlgorithmSettings,
    pub participation_rate: f64,
    pub step_budget: usize,
    pub seed: u64,
}

impl TestEnv {
    pub fn context(&self, epoch: u64) -> RoundContext<'_> {
        RoundContext {
            train: &self.train,
            validation: &self.validation,
            round: RoundParameters {
                global_epoch: epoch,
                seed: RoundSeed::derive(self.seed, epoch),
                step_budget: self.step_budget,
                lr: 0.5,
            },
            participation_rate: self.participation_rate,
            algorithm: &self.algorithm,
        }
    }
}

/// Builds a fresh experiment state and its round environment.
pub fn fixture(settings: &Settings) -> (TestEnv, ExperimentState) {
    let seed = settings.experiment.init_seed;
    let data = provider(settings)
        .fetch(&settings.data.name, seed)
        .unwrap();
    let learner: Arc<dyn Learner> = Arc::new(SoftmaxRegression::new(
        data.train.num_features(),
        data.train.num_classes(),
    ));
    let state = ExperimentInitializer::new(settings, &data.train, learner.as_ref())
        .from_settings(settings.experiment.tag(seed), seed)
        .unwrap();
    let env = TestEnv {
        step_budget: step_budget(
            data.train.len(),
            settings.client.num_clients,
            settings.client.local_epoch,
            settings.client.batch_size,
        ),
        train: TrainContext {
            train: Arc::clone(&data.train),
            learner,
            settings: settings.local(),
            dropout: settings.dropout(),
        },
        validation: Arc::clone(&data.test),
        algorithm: settings.algorithm,
        participation_rate: settings.client.participation_rate,
        seed,
    };
    (env, state)
}
