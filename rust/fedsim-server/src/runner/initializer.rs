use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::{
    error::ExperimentError,
    search::CombinationSearch,
    settings::Settings,
    state::ExperimentState,
    storage::{CheckpointStorage, CheckpointStore},
};
use fedsim_client::create_clients;
use fedsim_core::{
    common::{RoundSeed, Stream},
    data::{split_dataset, Dataset},
    generator::GenerativeModel,
    learner::Learner,
    metadata::{CommunicationMetadata, Component},
    metrics::Logger,
    optimizer::OptimizerState,
    ClientId,
    ConfigurationError,
};

/// Builds the state an experiment starts from.
pub struct ExperimentInitializer<'a> {
    settings: &'a Settings,
    train: &'a Dataset,
    learner: &'a dyn Learner,
}

impl<'a> ExperimentInitializer<'a> {
    pub fn new(settings: &'a Settings, train: &'a Dataset, learner: &'a dyn Learner) -> Self {
        Self {
            settings,
            train,
            learner,
        }
    }

    /// Resumes the experiment from its checkpoint if the resume mode allows
    /// it and one exists, and builds a fresh state otherwise.
    pub async fn init<S>(
        self,
        store: &mut CheckpointStore<S>,
        tag: String,
        seed: u64,
    ) -> Result<ExperimentState, ExperimentError>
    where
        S: CheckpointStorage,
    {
        match store
            .resume(&tag, self.settings.experiment.resume_mode)
            .await?
        {
            Some(state) => Ok(self.try_restore_state(state, seed)?),
            None => {
                info!("initialize experiment from settings");
                Ok(self.from_settings(tag, seed)?)
            }
        }
    }

    fn try_restore_state(
        &self,
        state: ExperimentState,
        seed: u64,
    ) -> Result<ExperimentState, ConfigurationError> {
        if state.seed != seed {
            return Err(ConfigurationError::StateMismatch(format!(
                "checkpoint was written with seed {}, expected {}",
                state.seed, seed
            )));
        }
        state.check_shape(
            self.settings.client.num_clients,
            self.learner.num_parameters(),
        )?;
        if !state.split.is_valid_for(self.train.len()) {
            return Err(ConfigurationError::StateMismatch(
                "checkpoint split does not fit the dataset".to_string(),
            ));
        }
        info!(
            "restored experiment after {} completed rounds",
            state.completed_rounds()
        );
        Ok(state)
    }

    /// Builds the state of a fresh experiment.
    ///
    /// The split and the initial model only depend on `seed`.
    pub fn from_settings(&self, tag: String, seed: u64) -> Result<ExperimentState, ConfigurationError> {
        let settings = self.settings;
        let mode = settings.client.algo_mode;
        let arms = settings.arms();
        for arm in arms.iter() {
            arm.check_compatible(mode)?;
        }

        let setup = RoundSeed::setup(seed);
        let split = split_dataset(
            self.train,
            settings.client.num_clients,
            settings.data.split_mode,
            &mut setup.rng(Stream::Split, 0),
        )?;
        let global_model = self.learner.init_model(&mut setup.rng(Stream::Init, 0));

        let components: BTreeSet<Component> = arms
            .iter()
            .flat_map(|arm| arm.requirements().iter())
            .chain(mode.required_metadata().iter())
            .copied()
            .collect();
        let components: Vec<Component> = components.into_iter().collect();
        debug!("metadata components: {:?}", components);
        let ids: Vec<ClientId> = split.iter().map(|(id, _)| id).collect();
        let metadata = CommunicationMetadata::for_components(
            &ids,
            &components,
            global_model.len(),
            GenerativeModel::new(
                self.train.num_classes(),
                self.train.num_features(),
                settings.algorithm.generator_noise,
            ),
        );

        let clients = create_clients(mode, &global_model, &split, &metadata)?;
        let search = CombinationSearch::new(
            arms,
            settings.policy(),
            settings.search.reward,
            settings.search.decay,
        )?;

        Ok(ExperimentState {
            tag,
            seed,
            mode,
            global_epoch: 1,
            global_model,
            clients,
            metadata,
            search,
            split,
            optimizer: OptimizerState::new(settings.optimizer.lr, settings.scheduler()),
            logger: Logger::new(),
        })
    }
}
