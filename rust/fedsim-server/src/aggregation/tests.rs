use super::*;
use crate::tests::utils::{fixture, SettingsBuilder};
use fedsim_core::metadata::WEIGHT_TOLERANCE;

const TOLERANCE: f64 = 1e-5;

/// `global + Σ w_i · (model_i - global)` over the given clients.
fn expected_global(global: &Model, clients: &ClientPopulation, weights: &[(ClientId, f64)]) -> Vec<f64> {
    let mut expected: Vec<f64> = global.iter().map(|w| f64::from(*w)).collect();
    for (id, weight) in weights {
        let local = clients.get(*id).unwrap().model();
        for ((e, l), g) in expected.iter_mut().zip(local.iter()).zip(global.iter()) {
            *e += weight * (f64::from(*l) - f64::from(*g));
        }
    }
    expected
}

fn assert_close(actual: &Model, expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((f64::from(*a) - e).abs() < TOLERANCE, "{} != {}", a, e);
    }
}

#[test]
fn test_parse_arm() {
    for arm in Arm::ALL.iter() {
        assert_eq!(arm.as_str().parse::<Arm>().unwrap(), *arm);
    }
    assert!(matches!(
        "fedsgd".parse::<Arm>(),
        Err(ConfigurationError::UnknownArm(tag)) if tag == "fedsgd"
    ));
}

#[test]
fn test_arm_compatibility() {
    assert!(Arm::FedAvg.check_compatible(AlgorithmMode::Scaffold).is_ok());
    assert!(Arm::FedProx.check_compatible(AlgorithmMode::FedProx).is_ok());
    assert!(matches!(
        Arm::Scaffold.check_compatible(AlgorithmMode::FedAvg),
        Err(ConfigurationError::IncompatibleArm { .. })
    ));
    for arm in Arm::ALL.iter() {
        assert!(arm.check_compatible(AlgorithmMode::DynamicFl).is_ok());
    }
    assert_eq!(Arm::defaults_for(AlgorithmMode::DynamicFl).len(), Arm::ALL.len());
    assert_eq!(Arm::defaults_for(AlgorithmMode::FedGen), vec![Arm::FedGen]);
}

#[test]
fn test_fedavg_weights_by_sample_count() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::FedAvg)
        .with_train_samples(203)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();

    let outcome = Arm::FedAvg
        .apply_round(&env.context(1), &mut state.clients, &global, &state.metadata)
        .unwrap();
    assert_eq!(outcome.participants, 4);
    assert_eq!(outcome.responders, 4);
    assert!(outcome.metadata_update.is_empty());

    let total: usize = state.clients.iter().map(|c| c.sample_count()).sum();
    assert_eq!(total, 203);
    let weights: Vec<(ClientId, f64)> = state
        .clients
        .iter()
        .map(|c| (c.id(), c.sample_count() as f64 / total as f64))
        .collect();
    let sum: f64 = weights.iter().map(|(_, w)| w).sum();
    assert!((sum - 1.0).abs() < WEIGHT_TOLERANCE);
    assert_close(&outcome.global, &expected_global(&global, &state.clients, &weights));
}

#[test]
fn test_fedensemble_weights_uniformly() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::FedEnsemble)
        .with_train_samples(203)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();

    let outcome = Arm::FedEnsemble
        .apply_round(&env.context(1), &mut state.clients, &global, &state.metadata)
        .unwrap();
    let weights: Vec<(ClientId, f64)> = state.clients.ids().map(|id| (id, 0.25)).collect();
    assert_close(&outcome.global, &expected_global(&global, &state.clients, &weights));
}

#[test]
fn test_dropouts_are_renormalized() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::FedAvg)
        .with_scripted_dropout(1, 2)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();

    let outcome = Arm::FedAvg
        .apply_round(&env.context(1), &mut state.clients, &global, &state.metadata)
        .unwrap();
    assert_eq!(outcome.participants, 4);
    assert_eq!(outcome.responders, 3);
    // the dropped client never touched its buffer
    assert_eq!(state.clients.get(2).unwrap().model(), &global);

    let responders: Vec<&fedsim_client::Client> =
        state.clients.iter().filter(|c| c.id() != 2).collect();
    let total: usize = responders.iter().map(|c| c.sample_count()).sum();
    let weights: Vec<(ClientId, f64)> = responders
        .iter()
        .map(|c| (c.id(), c.sample_count() as f64 / total as f64))
        .collect();
    assert_close(&outcome.global, &expected_global(&global, &state.clients, &weights));
}

#[test]
fn test_no_responders() {
    let settings = SettingsBuilder::new().with_dropout_rate(1.0).build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();

    assert!(matches!(
        Arm::FedAvg.apply_round(&env.context(1), &mut state.clients, &global, &state.metadata),
        Err(AggregationError::NoResponders)
    ));
}

#[test]
fn test_partial_participation() {
    let settings = SettingsBuilder::new()
        .with_clients(10)
        .with_participation(0.25)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();

    let outcome = Arm::FedAvg
        .apply_round(&env.context(1), &mut state.clients, &global, &state.metadata)
        .unwrap();
    // ceil(0.25 * 10)
    assert_eq!(outcome.participants, 3);
    assert_eq!(outcome.responders, 3);
    let untouched = state.clients.iter().filter(|c| c.model() == &global).count();
    assert_eq!(untouched, 7);
}

#[test]
fn test_missing_metadata() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::FedAvg)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();

    assert!(matches!(
        Arm::Scaffold.apply_round(&env.context(1), &mut state.clients, &global, &state.metadata),
        Err(AggregationError::MissingMetadata(Component::ControlVariates))
    ));
}

#[test]
fn test_incompatible_clients_fail() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::FedAvg)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();
    let metadata = CommunicationMetadata::new().with_control_variates(state.clients.ids(), global.len());

    assert!(matches!(
        Arm::Scaffold.apply_round(&env.context(1), &mut state.clients, &global, &metadata),
        Err(AggregationError::Client { .. })
    ));
}

#[test]
fn test_scaffold_updates_control_variates() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::Scaffold)
        .with_scripted_dropout(1, 0)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();

    let outcome = Arm::Scaffold
        .apply_round(&env.context(1), &mut state.clients, &global, &state.metadata)
        .unwrap();
    let update = &outcome.metadata_update;
    assert_eq!(update.control_deltas.len(), 3);
    assert!(!update.control_deltas.contains_key(&0));

    // c += 1/N Σ Δc_i over the whole population
    let server_delta = update.server_control_delta.as_ref().unwrap();
    let expected: Vec<f64> = (0..global.len())
        .map(|i| {
            update
                .control_deltas
                .values()
                .map(|d| f64::from(d.as_slice()[i]))
                .sum::<f64>()
                / 4.0
        })
        .collect();
    assert_close(server_delta, &expected);

    let mut metadata = state.metadata.clone();
    metadata.commit(outcome.metadata_update.clone()).unwrap();
    assert_eq!(metadata.control(0), Some(&Model::zeros(global.len())));
    assert_eq!(metadata.control(1), update.control_deltas.get(&1));
    assert_eq!(metadata.server_control(), Some(server_delta));
}

#[test]
fn test_fedgen_refits_generator() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::FedGen)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();
    assert_eq!(state.metadata.generator().unwrap().version(), 0);

    let outcome = Arm::FedGen
        .apply_round(&env.context(1), &mut state.clients, &global, &state.metadata)
        .unwrap();
    let generator = outcome.metadata_update.generator.as_ref().unwrap();
    assert_eq!(generator.version(), 1);
    assert!(generator.is_trained());
}

#[test]
fn test_dynamic_weights_are_rederived() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::DynamicFl)
        .with_scripted_dropout(1, 3)
        .build();
    let (env, mut state) = fixture(&settings);
    let global = state.global_model.clone();

    for arm in [Arm::DynamicAvg, Arm::DynamicSgd, Arm::DynamicFl].iter() {
        let mut clients = state.clients.clone();
        let outcome = arm
            .apply_round(&env.context(1), &mut clients, &global, &state.metadata)
            .unwrap();
        let weights = &outcome.metadata_update.weights;
        assert_eq!(weights.len(), 3);
        assert!(!weights.contains_key(&3));

        let mut metadata = state.metadata.clone();
        metadata.commit(outcome.metadata_update.clone()).unwrap();
        let sum: f64 = metadata.weights().unwrap().values().sum();
        assert!((sum - 1.0).abs() < WEIGHT_TOLERANCE);
        assert_eq!(metadata.weight(3), Some(0.25));
    }
    // dynamicfl clients run every arm
    let outcome = Arm::Scaffold
        .apply_round(&env.context(1), &mut state.clients, &global, &state.metadata)
        .unwrap();
    assert_eq!(outcome.metadata_update.control_deltas.len(), 3);
}

#[test]
fn test_rounds_are_deterministic() {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::FedProx)
        .with_participation(0.5)
        .with_dropout_rate(0.3)
        .build();
    let (env, mut first) = fixture(&settings);
    let (_, mut second) = fixture(&settings);
    assert_eq!(first, second);

    let global = first.global_model.clone();
    let a = Arm::FedProx
        .apply_round(&env.context(2), &mut first.clients, &global, &first.metadata);
    let b = Arm::FedProx
        .apply_round(&env.context(2), &mut second.clients, &global, &second.metadata);
    match (a, b) {
        (Ok(a), Ok(b)) => {
            assert_eq!(a.global, b.global);
            assert_eq!(a.responders, b.responders);
            assert_eq!(a.evaluation, b.evaluation);
        }
        (Err(AggregationError::NoResponders), Err(AggregationError::NoResponders)) => {}
        (a, b) => panic!("diverging rounds: {:?} vs {:?}", a.is_ok(), b.is_ok()),
    }
    assert_eq!(first.clients, second.clients);
}
