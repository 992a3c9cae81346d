//! Loading and validation of settings.
//!
//! Settings are layered: built-in defaults, an optional configuration file,
//! environment variables and finally explicit overrides (e.g. from the
//! command line). An example configuration file can be found in the
//! `configs/` directory located in the repository root.

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment, Value};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    aggregation::Arm,
    search::{Reward, SearchPolicy},
    storage::ResumeMode,
};
use fedsim_client::{AlgorithmMode, DropoutPolicy, LocalSettings};
use fedsim_core::{data::SplitMode, optimizer::Scheduler, ClientId};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Default, Validate, Deserialize)]
#[serde(default)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub experiment: ExperimentSettings,
    #[validate]
    pub data: DataSettings,
    #[validate]
    pub client: ClientSettings,
    #[validate]
    pub optimizer: OptimizerSettings,
    #[validate]
    pub algorithm: AlgorithmSettings,
    #[validate]
    pub search: SearchSettings,
    #[validate]
    pub dropout: DropoutSettings,
    pub checkpoint: CheckpointSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings.
    ///
    /// `overrides` are `(key, value)` pairs like `("client.num_clients", "20")`
    /// that take precedence over every other source.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new<I, K, V>(path: Option<&Path>, overrides: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let settings: Settings = Self::load(path, overrides)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load<I, K, V>(path: Option<&Path>, overrides: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("FEDSIM")
                .prefix_separator("_")
                .separator("__"),
        );
        for (key, value) in overrides {
            builder = builder.set_override(key.as_ref(), value)?;
        }
        builder.build()?.try_deserialize()
    }

    /// The arms the combination search runs.
    ///
    /// An empty `search.arms` list falls back to the default arms of the
    /// client population.
    pub fn arms(&self) -> Vec<Arm> {
        if self.search.arms.is_empty() {
            Arm::defaults_for(self.client.algo_mode)
        } else {
            self.search.arms.clone()
        }
    }

    /// The settings of the local training loop.
    pub fn local(&self) -> LocalSettings {
        LocalSettings {
            batch_size: self.client.batch_size,
            momentum: self.client.momentum,
            weight_decay: self.client.weight_decay,
        }
    }

    /// The learning rate schedule.
    pub fn scheduler(&self) -> Scheduler {
        match self.optimizer.scheduler {
            SchedulerKind::Constant => Scheduler::Constant,
            SchedulerKind::Step => Scheduler::Step {
                step_size: self.optimizer.step_size,
                gamma: self.optimizer.gamma,
            },
            SchedulerKind::Cosine => Scheduler::Cosine {
                total: self.experiment.num_rounds,
            },
        }
    }

    /// The selection policy of the combination search.
    pub fn policy(&self) -> SearchPolicy {
        match self.search.policy {
            PolicyKind::EpsilonGreedy => SearchPolicy::EpsilonGreedy {
                epsilon: self.search.epsilon,
            },
            PolicyKind::Ucb => SearchPolicy::Ucb {
                c: self.search.ucb_c,
            },
        }
    }

    /// The dropout policy shared by all clients.
    pub fn dropout(&self) -> DropoutPolicy {
        self.dropout
            .scripted
            .iter()
            .fold(DropoutPolicy::with_rate(self.dropout.rate), |policy, s| {
                policy.script(s.round, s.client)
            })
    }

    fn validate_settings(&self) -> Result<(), ValidationError> {
        self.validate_arms()?;
        self.validate_rates()?;
        self.validate_scripted_dropouts()
    }

    /// Checks that the clients can execute every configured arm.
    fn validate_arms(&self) -> Result<(), ValidationError> {
        if self
            .arms()
            .iter()
            .all(|arm| arm.check_compatible(self.client.algo_mode).is_ok())
        {
            Ok(())
        } else {
            Err(ValidationError::new("arm incompatible with algo_mode"))
        }
    }

    /// Checks the open and half-open ranges.
    fn validate_rates(&self) -> Result<(), ValidationError> {
        // the validate attribute only accepts closed ranges, therefore we check these here
        if 0. < self.client.participation_rate
            && self.client.participation_rate <= 1.
            && 0. <= self.search.decay
            && self.search.decay < 1.
        {
            Ok(())
        } else {
            Err(ValidationError::new("participation_rate or decay out of range"))
        }
    }

    fn validate_scripted_dropouts(&self) -> Result<(), ValidationError> {
        let num_clients = self.client.num_clients;
        if self
            .dropout
            .scripted
            .iter()
            .all(|s| (s.client as usize) < num_clients && s.round >= 1)
        {
            Ok(())
        } else {
            Err(ValidationError::new("scripted dropout of an unknown client"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.validate_settings()
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// Experiment settings.
pub struct ExperimentSettings {
    /// The seed of the first experiment.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// init_seed = 0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_EXPERIMENT__INIT_SEED=0
    /// ```
    pub init_seed: u64,
    /// The number of experiments. They run one after another with the seeds
    /// `init_seed..init_seed + num_experiments`.
    #[validate(range(min = 1))]
    pub num_experiments: u64,
    /// An optional suffix of the experiment tags, e.g. `0_baseline`.
    pub control_name: String,
    /// The number of rounds of an experiment.
    #[validate(range(min = 1))]
    pub num_rounds: u64,
    /// Whether to continue from existing checkpoints.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [experiment]
    /// resume_mode = "latest"
    /// ```
    pub resume_mode: ResumeMode,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            init_seed: 0,
            num_experiments: 1,
            control_name: String::new(),
            num_rounds: 10,
            resume_mode: ResumeMode::None,
        }
    }
}

impl ExperimentSettings {
    /// The seeds of all experiments.
    pub fn seeds(&self) -> std::ops::Range<u64> {
        self.init_seed..self.init_seed.saturating_add(self.num_experiments)
    }

    /// The tag the experiment with `seed` is logged and checkpointed under.
    pub fn tag(&self, seed: u64) -> String {
        if self.control_name.is_empty() {
            seed.to_string()
        } else {
            format!("{}_{}", seed, self.control_name)
        }
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// Dataset settings.
pub struct DataSettings {
    /// The name of the dataset. Only the synthetic `blobs` dataset is built in.
    pub name: String,
    /// How the training set is partitioned: `iid`, `non-iid-l-<labels per
    /// client>` or `non-iid-d-<dirichlet alpha>`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// split_mode = "non-iid-l-2"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_DATA__SPLIT_MODE=non-iid-d-0.3
    /// ```
    pub split_mode: SplitMode,
    #[validate(range(min = 1))]
    pub train_samples: usize,
    #[validate(range(min = 1))]
    pub test_samples: usize,
    #[validate(range(min = 1))]
    pub features: usize,
    #[validate(range(min = 2))]
    pub classes: usize,
    /// The standard deviation of the sample noise around the class means.
    #[validate(range(min = 0.0))]
    pub noise: f32,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            name: "blobs".to_string(),
            split_mode: SplitMode::Iid,
            train_samples: 2000,
            test_samples: 500,
            features: 8,
            classes: 4,
            noise: 1.0,
        }
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// Client settings.
pub struct ClientSettings {
    #[validate(range(min = 1))]
    pub num_clients: usize,
    /// The client family, e.g. `fedavg`, `scaffold` or `dynamicfl`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// algo_mode = "dynamicfl"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_CLIENT__ALGO_MODE=dynamicfl
    /// ```
    pub algo_mode: AlgorithmMode,
    #[validate(range(min = 1))]
    pub local_epoch: usize,
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// A fixed number of local gradient updates per round. Derived from the
    /// dataset size, `local_epoch` and `batch_size` if unset.
    #[validate(range(min = 1))]
    pub max_local_gradient_update: Option<usize>,
    /// The fraction of clients that participate in a round. The value must
    /// be in `(0, 1]`.
    pub participation_rate: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub momentum: f64,
    #[validate(range(min = 0.0))]
    pub weight_decay: f64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            num_clients: 10,
            algo_mode: AlgorithmMode::FedAvg,
            local_epoch: 1,
            batch_size: 32,
            max_local_gradient_update: None,
            participation_rate: 1.0,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

/// The kind of learning rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Constant,
    Step,
    Cosine,
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// Round-level optimizer settings.
pub struct OptimizerSettings {
    /// The base learning rate of the local SGD.
    #[validate(range(min = 0.0))]
    pub lr: f64,
    pub scheduler: SchedulerKind,
    /// The number of rounds between two decays of the `step` schedule.
    #[validate(range(min = 1))]
    pub step_size: u64,
    /// The decay factor of the `step` schedule.
    #[validate(range(min = 0.0, max = 1.0))]
    pub gamma: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            lr: 0.1,
            scheduler: SchedulerKind::Constant,
            step_size: 10,
            gamma: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Validate, Deserialize)]
#[serde(default)]
/// Hyperparameters of the aggregation arms.
pub struct AlgorithmSettings {
    /// The strength of the proximal term of `fedprox`.
    #[validate(range(min = 0.0))]
    pub fedprox_mu: f64,
    /// The weight of the generated samples in the loss of `fedgen`.
    #[validate(range(min = 0.0))]
    pub fedgen_alpha: f64,
    /// How strongly the dynamic weights react to the loss feedback.
    #[validate(range(min = 0.0))]
    pub dynamic_beta: f64,
    /// The standard deviation of the samples drawn from the generative model.
    #[validate(range(min = 0.0))]
    pub generator_noise: f32,
}

impl Default for AlgorithmSettings {
    fn default() -> Self {
        Self {
            fedprox_mu: 0.01,
            fedgen_alpha: 0.5,
            dynamic_beta: 1.0,
            generator_noise: 0.5,
        }
    }
}

/// The kind of arm selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    EpsilonGreedy,
    Ucb,
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[serde(default)]
/// Combination search settings.
pub struct SearchSettings {
    /// The arms to search over, in selection order. Empty means the default
    /// arms of `client.algo_mode`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [search]
    /// arms = ["fedavg", "fedprox", "scaffold"]
    /// ```
    pub arms: Vec<Arm>,
    pub policy: PolicyKind,
    #[validate(range(min = 0.0, max = 1.0))]
    pub epsilon: f64,
    #[validate(range(min = 0.0))]
    pub ucb_c: f64,
    /// The smoothing of the arm scores. The value must be in `[0, 1)`.
    pub decay: f64,
    pub reward: Reward,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            arms: Vec::new(),
            policy: PolicyKind::EpsilonGreedy,
            epsilon: 0.1,
            ucb_c: 1.0,
            decay: 0.5,
            reward: Reward::Accuracy,
        }
    }
}

/// A client that fails to deliver in a given round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScriptedDropout {
    pub round: u64,
    pub client: ClientId,
}

#[derive(Debug, Clone, Default, Validate, Deserialize)]
#[serde(default)]
/// Dropout settings.
pub struct DropoutSettings {
    /// The probability of a participant dropping out of a round.
    #[validate(range(min = 0.0, max = 1.0))]
    pub rate: f64,
    /// Dropouts that happen regardless of `rate`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [[dropout.scripted]]
    /// round = 2
    /// client = 0
    /// ```
    pub scripted: Vec<ScriptedDropout>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Checkpoint settings.
pub struct CheckpointSettings {
    /// The directory checkpoints are written to.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [checkpoint]
    /// dir = "checkpoints"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_CHECKPOINT__DIR=/var/lib/fedsim
    /// ```
    pub dir: String,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: "checkpoints".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_LOG__FILTER=fedsim_server=debug,info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_overrides() -> Vec<(&'static str, &'static str)> {
        Vec::new()
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new(Some(Path::new("../../configs/config.toml")), no_overrides()).is_ok());
        assert!(Settings::new(Some(Path::new("")), no_overrides()).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.arms(), vec![Arm::FedAvg]);
        assert_eq!(settings.policy(), SearchPolicy::EpsilonGreedy { epsilon: 0.1 });
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::new(
            None,
            vec![
                ("client.num_clients", "7"),
                ("client.algo_mode", "dynamicfl"),
                ("data.split_mode", "non-iid-l-2"),
                ("search.policy", "ucb"),
                ("experiment.resume_mode", "latest"),
            ],
        )
        .unwrap();
        assert_eq!(settings.client.num_clients, 7);
        assert_eq!(settings.client.algo_mode, AlgorithmMode::DynamicFl);
        assert_eq!(settings.data.split_mode, SplitMode::LabelShards(2));
        assert_eq!(settings.policy(), SearchPolicy::Ucb { c: 1.0 });
        assert_eq!(settings.experiment.resume_mode, ResumeMode::Latest);
        assert_eq!(settings.arms().len(), Arm::ALL.len());
    }

    #[test]
    fn test_unknown_tags_fail_to_load() {
        assert!(Settings::new(None, vec![("client.algo_mode", "fedsgd")]).is_err());
        assert!(Settings::new(None, vec![("data.split_mode", "non-iid-x-2")]).is_err());
        assert!(Settings::new(None, vec![("log.filter", "fedsim=notalevel")]).is_err());
    }

    #[test]
    fn test_validate_ranges() {
        let mut settings = Settings::default();
        settings.client.participation_rate = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.client.participation_rate = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.search.decay = 1.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.client.num_clients = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.data.classes = 1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.dropout.rate = 1.1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_arm_compatibility() {
        let mut settings = Settings::default();
        settings.search.arms = vec![Arm::FedAvg, Arm::Scaffold];
        assert!(settings.validate().is_err());

        settings.client.algo_mode = AlgorithmMode::DynamicFl;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_scripted_dropouts() {
        let mut settings = Settings::default();
        settings.dropout.scripted = vec![ScriptedDropout { round: 2, client: 9 }];
        assert!(settings.validate().is_ok());
        settings.dropout.scripted = vec![ScriptedDropout { round: 2, client: 10 }];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_experiment_tags() {
        let mut experiment = ExperimentSettings::default();
        experiment.init_seed = 3;
        experiment.num_experiments = 2;
        assert_eq!(experiment.seeds().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(experiment.tag(3), "3");
        experiment.control_name = "baseline".to_string();
        assert_eq!(experiment.tag(4), "4_baseline");
    }
}
