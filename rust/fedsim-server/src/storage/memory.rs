use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::storage::{CheckpointStorage, StorageResult};

/// A checkpoint store that keeps everything in memory.
///
/// Clones share their content, so a test can hand one clone to a runner and
/// inspect or tamper with the checkpoints through another.
#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a checkpoint with arbitrary bytes.
    pub fn insert_raw(&self, tag: &str, bytes: Vec<u8>) -> StorageResult<()> {
        self.checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint store poisoned"))?
            .insert(tag.to_string(), bytes);
        Ok(())
    }

    /// The encoded checkpoint of `tag`, if any.
    pub fn raw(&self, tag: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint store poisoned"))?
            .get(tag)
            .cloned())
    }

    pub fn tags(&self) -> StorageResult<Vec<String>> {
        let checkpoints = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint store poisoned"))?;
        let mut tags: Vec<String> = checkpoints.keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }
}

#[async_trait]
impl CheckpointStorage for MemoryCheckpointStore {
    async fn save(&mut self, tag: &str, bytes: Vec<u8>) -> StorageResult<()> {
        self.insert_raw(tag, bytes)
    }

    async fn load_latest(&mut self, tag: &str) -> StorageResult<Option<Vec<u8>>> {
        self.raw(tag)
    }

    async fn delete(&mut self, tag: &str) -> StorageResult<()> {
        self.checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint store poisoned"))?
            .remove(tag);
        Ok(())
    }
}
