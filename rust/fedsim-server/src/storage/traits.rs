//! Storage API.

use async_trait::async_trait;

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
/// An abstract store of encoded experiment checkpoints, keyed by experiment tag.
pub trait CheckpointStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Saves the checkpoint of an experiment.
    ///
    /// # Behavior
    ///
    /// - If no checkpoint exists for `tag`, store `bytes` and return `StorageResult::Ok(())`.
    /// - If a checkpoint exists, replace it and return `StorageResult::Ok(())`.
    /// - A reader must never observe a partially written checkpoint: after a
    ///   failed save the previous checkpoint is still intact.
    async fn save(&mut self, tag: &str, bytes: Vec<u8>) -> StorageResult<()>;

    /// Loads the latest checkpoint of an experiment.
    ///
    /// # Behavior
    ///
    /// - If no checkpoint exists for `tag`, return `StorageResult::Ok(Option::None)`.
    /// - If a checkpoint exists, return `StorageResult::Ok(Some(Vec<u8>))`.
    async fn load_latest(&mut self, tag: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Deletes the checkpoint of an experiment.
    ///
    /// # Behavior
    ///
    /// - If the checkpoint was deleted or never existed, return `StorageResult::Ok(())`.
    async fn delete(&mut self, tag: &str) -> StorageResult<()>;
}
