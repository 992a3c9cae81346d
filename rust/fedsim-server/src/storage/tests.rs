use super::*;
use crate::tests::utils::{fixture, SettingsBuilder};
use fedsim_client::AlgorithmMode;

fn state(tag_seed: u64) -> ExperimentState {
    let settings = SettingsBuilder::new()
        .with_mode(AlgorithmMode::Scaffold)
        .with_seed(tag_seed)
        .build();
    fixture(&settings).1
}

#[tokio::test]
async fn test_memory_round_trip() {
    let mut store = CheckpointStore::new(MemoryCheckpointStore::new());
    let mut state = state(1);
    state.global_epoch = 3;

    store.save(&state).await.unwrap();
    assert_eq!(store.storage().tags().unwrap(), vec!["1".to_string()]);
    let restored = store.resume("1", ResumeMode::Latest).await.unwrap();
    assert_eq!(restored, Some(state));
}

#[tokio::test]
async fn test_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = CheckpointStore::new(FileCheckpointStore::new(dir.path()));
    let state = state(2);

    store.save(&state).await.unwrap();
    assert!(dir.path().join("2_checkpoint.bin").exists());
    let restored = store.resume("2", ResumeMode::Latest).await.unwrap();
    assert_eq!(restored, Some(state));

    store.remove("2").await.unwrap();
    assert!(store.resume("2", ResumeMode::Latest).await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_mode_none_ignores_checkpoints() {
    let memory = MemoryCheckpointStore::new();
    memory.insert_raw("1", vec![0xff; 3]).unwrap();
    let mut store = CheckpointStore::new(memory);

    assert!(store.resume("1", ResumeMode::None).await.unwrap().is_none());
    assert!(store.resume("2", ResumeMode::Latest).await.unwrap().is_none());
}

#[tokio::test]
async fn test_corrupt_checkpoint() {
    let memory = MemoryCheckpointStore::new();
    let mut store = CheckpointStore::new(memory.clone());
    store.save(&state(1)).await.unwrap();

    // truncated
    let bytes = memory.raw("1").unwrap().unwrap();
    memory.insert_raw("1", bytes[..bytes.len() / 2].to_vec()).unwrap();
    assert!(matches!(
        store.resume("1", ResumeMode::Latest).await,
        Err(CheckpointError::Corrupt { .. })
    ));

    // appended garbage
    let mut padded = bytes.clone();
    padded.extend_from_slice(&[0, 1, 2, 3]);
    memory.insert_raw("1", padded).unwrap();
    assert!(matches!(
        store.resume("1", ResumeMode::Latest).await,
        Err(CheckpointError::Corrupt { .. })
    ));

    // too short for a version
    memory.insert_raw("1", vec![1, 0]).unwrap();
    assert!(matches!(
        store.resume("1", ResumeMode::Latest).await,
        Err(CheckpointError::Corrupt { .. })
    ));
}

#[tokio::test]
async fn test_version_mismatch() {
    let memory = MemoryCheckpointStore::new();
    let mut store = CheckpointStore::new(memory.clone());
    store.save(&state(1)).await.unwrap();

    let mut bytes = memory.raw("1").unwrap().unwrap();
    bytes[..4].copy_from_slice(&(CHECKPOINT_VERSION + 1).to_le_bytes());
    memory.insert_raw("1", bytes).unwrap();
    assert!(matches!(
        store.resume("1", ResumeMode::Latest).await,
        Err(CheckpointError::VersionMismatch { found, expected, .. })
            if found == CHECKPOINT_VERSION + 1 && expected == CHECKPOINT_VERSION
    ));
}

#[tokio::test]
async fn test_checkpoint_of_another_experiment() {
    let memory = MemoryCheckpointStore::new();
    let mut store = CheckpointStore::new(memory.clone());
    store.save(&state(1)).await.unwrap();

    let bytes = memory.raw("1").unwrap().unwrap();
    memory.insert_raw("5", bytes).unwrap();
    assert!(matches!(
        store.resume("5", ResumeMode::Latest).await,
        Err(CheckpointError::Corrupt { .. })
    ));
}
