use std::{path::PathBuf, process, sync::Arc};

use rayon::ThreadPoolBuilder;
use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;

use fedsim_core::data::SyntheticProvider;
use fedsim_server::{
    runner::{ExperimentRunner, ShutdownSignal},
    settings::Settings,
    storage::{CheckpointStore, FileCheckpointStore},
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedsim", about = "Federated learning simulator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, long = "config", parse(from_os_str))]
    config_path: Option<PathBuf>,

    #[structopt(long)]
    num_clients: Option<usize>,
    /// Client family, e.g. fedavg, scaffold, dynamicfl
    #[structopt(long)]
    algo_mode: Option<String>,
    #[structopt(long)]
    num_rounds: Option<u64>,
    #[structopt(long)]
    init_seed: Option<u64>,
    #[structopt(long)]
    num_experiments: Option<u64>,
    /// Suffix of the experiment tags
    #[structopt(long)]
    control_name: Option<String>,
    /// none or latest
    #[structopt(long)]
    resume_mode: Option<String>,
    #[structopt(long)]
    data_name: Option<String>,
    /// iid, non-iid-l-<labels> or non-iid-d-<alpha>
    #[structopt(long)]
    data_split_mode: Option<String>,
    #[structopt(long)]
    train_samples: Option<usize>,
    #[structopt(long)]
    test_samples: Option<usize>,
    #[structopt(long)]
    features: Option<usize>,
    #[structopt(long)]
    classes: Option<usize>,
    /// Standard deviation of the synthetic samples around their class center
    #[structopt(long)]
    noise: Option<f32>,
    #[structopt(long)]
    local_epoch: Option<usize>,
    #[structopt(long)]
    batch_size: Option<usize>,
    #[structopt(long)]
    max_local_gradient_update: Option<usize>,
    #[structopt(long)]
    participation_rate: Option<f64>,
    #[structopt(long)]
    momentum: Option<f64>,
    #[structopt(long)]
    weight_decay: Option<f64>,
    #[structopt(long)]
    lr: Option<f64>,
    /// constant, step or cosine
    #[structopt(long)]
    scheduler: Option<String>,
    #[structopt(long)]
    step_size: Option<u64>,
    #[structopt(long)]
    gamma: Option<f64>,
    #[structopt(long)]
    fedprox_mu: Option<f64>,
    #[structopt(long)]
    fedgen_alpha: Option<f64>,
    #[structopt(long)]
    dynamic_beta: Option<f64>,
    #[structopt(long)]
    generator_noise: Option<f32>,
    #[structopt(long)]
    dropout_rate: Option<f64>,
    /// epsilon-greedy or ucb
    #[structopt(long)]
    policy: Option<String>,
    #[structopt(long)]
    epsilon: Option<f64>,
    #[structopt(long)]
    ucb_c: Option<f64>,
    #[structopt(long)]
    decay: Option<f64>,
    /// accuracy or negative-loss
    #[structopt(long)]
    reward: Option<String>,
    /// Comma-separated arms to search over
    #[structopt(long, use_delimiter = true)]
    arms: Option<Vec<String>>,
    #[structopt(long)]
    checkpoint_dir: Option<String>,
    /// Logging directives, e.g. fedsim_server=debug,info
    #[structopt(long)]
    log_filter: Option<String>,
}

impl Opt {
    /// The settings keys given on the command line.
    fn overrides(&self) -> Vec<(&'static str, config::Value)> {
        fn set<T: ToString>(
            overrides: &mut Vec<(&'static str, config::Value)>,
            key: &'static str,
            value: &Option<T>,
        ) {
            if let Some(value) = value {
                overrides.push((key, value.to_string().into()));
            }
        }

        let mut overrides = Vec::new();
        set(&mut overrides, "client.num_clients", &self.num_clients);
        set(&mut overrides, "client.algo_mode", &self.algo_mode);
        set(&mut overrides, "experiment.num_rounds", &self.num_rounds);
        set(&mut overrides, "experiment.init_seed", &self.init_seed);
        set(&mut overrides, "experiment.num_experiments", &self.num_experiments);
        set(&mut overrides, "experiment.control_name", &self.control_name);
        set(&mut overrides, "experiment.resume_mode", &self.resume_mode);
        set(&mut overrides, "data.name", &self.data_name);
        set(&mut overrides, "data.split_mode", &self.data_split_mode);
        set(&mut overrides, "data.train_samples", &self.train_samples);
        set(&mut overrides, "data.test_samples", &self.test_samples);
        set(&mut overrides, "data.features", &self.features);
        set(&mut overrides, "data.classes", &self.classes);
        set(&mut overrides, "data.noise", &self.noise);
        set(&mut overrides, "client.local_epoch", &self.local_epoch);
        set(&mut overrides, "client.batch_size", &self.batch_size);
        set(
            &mut overrides,
            "client.max_local_gradient_update",
            &self.max_local_gradient_update,
        );
        set(&mut overrides, "client.participation_rate", &self.participation_rate);
        set(&mut overrides, "client.momentum", &self.momentum);
        set(&mut overrides, "client.weight_decay", &self.weight_decay);
        set(&mut overrides, "optimizer.lr", &self.lr);
        set(&mut overrides, "optimizer.scheduler", &self.scheduler);
        set(&mut overrides, "optimizer.step_size", &self.step_size);
        set(&mut overrides, "optimizer.gamma", &self.gamma);
        set(&mut overrides, "algorithm.fedprox_mu", &self.fedprox_mu);
        set(&mut overrides, "algorithm.fedgen_alpha", &self.fedgen_alpha);
        set(&mut overrides, "algorithm.dynamic_beta", &self.dynamic_beta);
        set(&mut overrides, "algorithm.generator_noise", &self.generator_noise);
        set(&mut overrides, "dropout.rate", &self.dropout_rate);
        set(&mut overrides, "search.policy", &self.policy);
        set(&mut overrides, "search.epsilon", &self.epsilon);
        set(&mut overrides, "search.ucb_c", &self.ucb_c);
        set(&mut overrides, "search.decay", &self.decay);
        set(&mut overrides, "search.reward", &self.reward);
        set(&mut overrides, "checkpoint.dir", &self.checkpoint_dir);
        set(&mut overrides, "log.filter", &self.log_filter);
        if let Some(arms) = self.arms.as_ref() {
            overrides.push(("search.arms", arms.clone().into()));
        }
        overrides
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let mut settings = Settings::new(opt.config_path.as_deref(), opt.overrides())
        .unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(1);
        });
    let log_settings = std::mem::take(&mut settings.log);

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let thread_pool = ThreadPoolBuilder::new().build().unwrap_or_else(|err| {
        error!("failed to build the thread-pool: {}", err);
        process::exit(1);
    });
    let provider = SyntheticProvider {
        train_samples: settings.data.train_samples,
        test_samples: settings.data.test_samples,
        features: settings.data.features,
        classes: settings.data.classes,
        noise: settings.data.noise,
    };
    let store = CheckpointStore::new(FileCheckpointStore::new(&settings.checkpoint.dir));
    let shutdown = ShutdownSignal::new();
    let mut runner = ExperimentRunner::new(
        settings,
        store,
        Arc::new(provider),
        Arc::new(thread_pool),
        shutdown.clone(),
    );

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested: finishing the running round");
            shutdown.trigger();
        }
    });

    match runner.run_all().await {
        Ok(states) => {
            for state in states.iter() {
                if let Some(record) = state.logger.last() {
                    info!(
                        tag = state.tag.as_str(),
                        "final round {}: {:?}", record.global_epoch, record.metrics
                    );
                }
            }
        }
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsim_server::{search::Reward, settings::SchedulerKind};

    fn settings(args: &[&str]) -> Settings {
        let opt = Opt::from_iter(std::iter::once("fedsim").chain(args.iter().copied()));
        Settings::new(None, opt.overrides()).unwrap()
    }

    #[test]
    fn test_flags_override_settings() {
        let settings = settings(&[
            "--momentum",
            "0.5",
            "--weight-decay",
            "0.001",
            "--scheduler",
            "step",
            "--step-size",
            "3",
            "--gamma",
            "0.25",
            "--fedprox-mu",
            "0.2",
            "--fedgen-alpha",
            "0.7",
            "--dynamic-beta",
            "2",
            "--generator-noise",
            "0.1",
            "--reward",
            "negative-loss",
            "--train-samples",
            "300",
            "--test-samples",
            "60",
            "--features",
            "5",
            "--classes",
            "3",
            "--noise",
            "0.4",
            "--log-filter",
            "fedsim_server=debug,info",
        ]);

        assert_eq!(settings.client.momentum, 0.5);
        assert_eq!(settings.client.weight_decay, 0.001);
        assert_eq!(settings.optimizer.scheduler, SchedulerKind::Step);
        assert_eq!(settings.optimizer.step_size, 3);
        assert_eq!(settings.optimizer.gamma, 0.25);
        assert_eq!(settings.algorithm.fedprox_mu, 0.2);
        assert_eq!(settings.algorithm.fedgen_alpha, 0.7);
        assert_eq!(settings.algorithm.dynamic_beta, 2.0);
        assert_eq!(settings.algorithm.generator_noise, 0.1);
        assert_eq!(settings.search.reward, Reward::NegativeLoss);
        assert_eq!(settings.data.train_samples, 300);
        assert_eq!(settings.data.test_samples, 60);
        assert_eq!(settings.data.features, 5);
        assert_eq!(settings.data.classes, 3);
        assert_eq!(settings.data.noise, 0.4);
        assert!(settings
            .log
            .filter
            .to_string()
            .contains("fedsim_server=debug"));
    }

    #[test]
    fn test_absent_flags_keep_defaults() {
        let opt = Opt::from_iter(vec!["fedsim", "--arms", "fedavg,fedprox"]);
        assert_eq!(opt.overrides().len(), 1);

        let settings = settings(&[]);
        assert_eq!(settings.search.reward, Reward::Accuracy);
        assert_eq!(settings.optimizer.scheduler, SchedulerKind::Constant);
    }

    #[test]
    fn test_invalid_flag_value_fails_to_load() {
        let opt = Opt::from_iter(vec!["fedsim", "--reward", "loss"]);
        assert!(Settings::new(None, opt.overrides()).is_err());
        let opt = Opt::from_iter(vec!["fedsim", "--log-filter", "fedsim=notalevel"]);
        assert!(Settings::new(None, opt.overrides()).is_err());
    }
}
