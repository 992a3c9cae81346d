//! A file system checkpoint store.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use crate::storage::{CheckpointStorage, StorageResult};

/// Stores one file `<dir>/<tag>_checkpoint.bin` per experiment.
///
/// A checkpoint is first written to a temporary sibling file, synced and then
/// renamed over the previous one, so the file at the final path is always
/// complete.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The path of the checkpoint of `tag`.
    pub fn path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{}_checkpoint.bin", tag))
    }

    fn tmp_path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{}_checkpoint.bin.tmp", tag))
    }
}

#[async_trait]
impl CheckpointStorage for FileCheckpointStore {
    async fn save(&mut self, tag: &str, bytes: Vec<u8>) -> StorageResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let tmp = self.tmp_path(tag);
        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        let path = self.path(tag);
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move checkpoint to {}", path.display()))?;
        debug!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    async fn load_latest(&mut self, tag: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path(tag);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn delete(&mut self, tag: &str) -> StorageResult<()> {
        let path = self.path(tag);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete {}", path.display())),
        }
    }
}
