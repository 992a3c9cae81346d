//! Checkpoint persistence.
//!
//! The [`CheckpointStorage`] trait abstracts over where encoded checkpoints
//! live. [`CheckpointStore`] sits on top of a backend and handles encoding,
//! versioning and the resume protocol.

pub mod file;
pub mod memory;
mod traits;

use bincode::Options;
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use self::{
    file::FileCheckpointStore,
    memory::MemoryCheckpointStore,
    traits::{CheckpointStorage, StorageError, StorageResult},
};
use crate::state::ExperimentState;

/// The version of the checkpoint encoding.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Errors of the checkpoint store. None of them is recoverable by retrying.
#[derive(Debug, Display, Error)]
pub enum CheckpointError {
    /// Checkpoint storage failed: {0}.
    Storage(#[from] StorageError),
    /// Checkpoint of {tag} is corrupt: {reason}.
    Corrupt { tag: String, reason: String },
    /// Checkpoint of {tag} has version {found}, expected {expected}.
    VersionMismatch {
        tag: String,
        found: u32,
        expected: u32,
    },
    /// Encoding the checkpoint failed: {0}.
    Encode(String),
}

/// Whether an experiment continues from its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// Always start from scratch.
    None,
    /// Continue from the latest checkpoint if there is one.
    Latest,
}

impl Default for ResumeMode {
    fn default() -> Self {
        Self::None
    }
}

/// The encoding of checkpoints. Trailing bytes are rejected, so appended
/// garbage is reported as corruption.
fn encoding() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

#[derive(Serialize)]
struct EncodeCheckpoint<'a> {
    version: u32,
    state: &'a ExperimentState,
}

#[derive(Deserialize)]
struct DecodeCheckpoint {
    version: u32,
    state: ExperimentState,
}

/// Encodes experiment states into a [`CheckpointStorage`] backend.
#[derive(Clone, Debug)]
pub struct CheckpointStore<S> {
    storage: S,
}

impl<S> CheckpointStore<S>
where
    S: CheckpointStorage,
{
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Persists a state under its tag, replacing the previous checkpoint.
    pub async fn save(&mut self, state: &ExperimentState) -> Result<(), CheckpointError> {
        let bytes = encoding()
            .serialize(&EncodeCheckpoint {
                version: CHECKPOINT_VERSION,
                state,
            })
            .map_err(|err| CheckpointError::Encode(err.to_string()))?;
        self.storage.save(&state.tag, bytes).await?;
        debug!(
            tag = state.tag.as_str(),
            global_epoch = state.global_epoch,
            "saved checkpoint"
        );
        Ok(())
    }

    /// Looks up the state to resume `tag` from.
    ///
    /// With [`ResumeMode::None`] the backend is not touched at all.
    ///
    /// # Errors
    /// A checkpoint that cannot be decoded, was written by another encoding
    /// version or belongs to another tag is an error, never a fresh start.
    pub async fn resume(
        &mut self,
        tag: &str,
        mode: ResumeMode,
    ) -> Result<Option<ExperimentState>, CheckpointError> {
        if mode == ResumeMode::None {
            return Ok(None);
        }
        let bytes = match self.storage.load_latest(tag).await? {
            Some(bytes) => bytes,
            None => {
                info!(tag, "no checkpoint found");
                return Ok(None);
            }
        };
        let state = decode(tag, &bytes)?;
        info!(
            tag,
            global_epoch = state.global_epoch,
            "resuming from checkpoint"
        );
        Ok(Some(state))
    }

    /// Deletes the checkpoint of `tag`.
    pub async fn remove(&mut self, tag: &str) -> Result<(), CheckpointError> {
        Ok(self.storage.delete(tag).await?)
    }
}

fn decode(tag: &str, bytes: &[u8]) -> Result<ExperimentState, CheckpointError> {
    let corrupt = |reason: String| {
        warn!(tag, "rejecting corrupt checkpoint");
        CheckpointError::Corrupt {
            tag: tag.to_string(),
            reason,
        }
    };
    // the version leads the encoding and is checked on its own, so a newer
    // layout is reported as such instead of as garbage
    let version: u32 = encoding()
        .allow_trailing_bytes()
        .deserialize(bytes)
        .map_err(|err| corrupt(err.to_string()))?;
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointError::VersionMismatch {
            tag: tag.to_string(),
            found: version,
            expected: CHECKPOINT_VERSION,
        });
    }
    let checkpoint: DecodeCheckpoint = encoding()
        .deserialize(bytes)
        .map_err(|err| corrupt(err.to_string()))?;
    debug_assert_eq!(checkpoint.version, CHECKPOINT_VERSION);
    if checkpoint.state.tag != tag {
        return Err(corrupt(format!(
            "checkpoint belongs to {}",
            checkpoint.state.tag
        )));
    }
    Ok(checkpoint.state)
}

#[cfg(test)]
pub(crate) mod tests;
