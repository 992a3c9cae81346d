//! Datasets, mini-batches and the assignment of samples to clients.
//!
//! A dataset is loaded once per experiment and shared read-only between all
//! clients behind an [`Arc`]. Clients never copy it; they gather the rows of
//! their partition into a per-round scratch [`Batch`].

mod split;
mod synthetic;

use std::sync::Arc;

use ndarray::{s, Array2, ArrayView2, Axis};
use thiserror::Error;

pub use self::{
    split::{split_dataset, DataSplit, SplitMode},
    synthetic::SyntheticProvider,
};
use crate::ConfigurationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to dataset construction and access.
pub enum DataError {
    #[error("{rows} feature rows but {labels} labels")]
    ShapeMismatch { rows: usize, labels: usize },
    #[error("label {label} is out of range for {classes} classes")]
    LabelOutOfRange { label: u32, classes: usize },
    #[error("sample index {0} is out of bounds")]
    OutOfBounds(usize),
}

/// A labelled dataset held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: Array2<f32>,
    labels: Vec<u32>,
    num_classes: usize,
}

impl Dataset {
    /// Creates a dataset from a `samples x features` matrix and one label per row.
    ///
    /// # Errors
    /// Fails if the number of rows and labels differ or a label is out of range.
    pub fn new(
        features: Array2<f32>,
        labels: Vec<u32>,
        num_classes: usize,
    ) -> Result<Self, DataError> {
        if features.nrows() != labels.len() {
            return Err(DataError::ShapeMismatch {
                rows: features.nrows(),
                labels: labels.len(),
            });
        }
        if let Some(&label) = labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(DataError::LabelOutOfRange {
                label,
                classes: num_classes,
            });
        }
        Ok(Self {
            features,
            labels,
            num_classes,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn features(&self) -> ArrayView2<f32> {
        self.features.view()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Gets the label of a sample.
    ///
    /// # Errors
    /// Fails if the index is out of bounds.
    pub fn label(&self, index: usize) -> Result<u32, DataError> {
        self.labels
            .get(index)
            .copied()
            .ok_or(DataError::OutOfBounds(index))
    }

    /// Iterates over contiguous chunks of at most `size` samples.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = (ArrayView2<f32>, &[u32])> {
        self.features
            .axis_chunks_iter(Axis(0), size.max(1))
            .zip(self.labels.chunks(size.max(1)))
    }
}

/// The training and validation halves of a dataset.
#[derive(Debug, Clone)]
pub struct DatasetPair {
    pub train: Arc<Dataset>,
    pub test: Arc<Dataset>,
}

/// A source of datasets.
pub trait DatasetProvider: Send + Sync {
    /// Fetches the dataset `name`, generating it deterministically from `seed` if needed.
    ///
    /// # Errors
    /// Fails with [`ConfigurationError::UnknownDataset`] if the provider does not know `name`.
    fn fetch(&self, name: &str, seed: u64) -> Result<DatasetPair, ConfigurationError>;
}

/// A reusable mini-batch buffer.
///
/// Allocated once per local training run and refilled for every step.
#[derive(Debug, Clone)]
pub struct Batch {
    features: Array2<f32>,
    labels: Vec<u32>,
    len: usize,
}

impl Batch {
    /// Creates an empty batch able to hold `capacity` rows of `num_features` features.
    pub fn with_capacity(capacity: usize, num_features: usize) -> Self {
        Self {
            features: Array2::zeros((capacity, num_features)),
            labels: Vec::with_capacity(capacity),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.features.nrows()
    }

    pub fn clear(&mut self) {
        self.labels.clear();
        self.len = 0;
    }

    /// Gathers the given samples of `dataset` into the buffer, replacing its content.
    ///
    /// # Errors
    /// Fails if a sample index is out of bounds. Indices beyond the capacity are ignored.
    pub fn fill(&mut self, dataset: &Dataset, indices: &[usize]) -> Result<(), DataError> {
        self.clear();
        for &index in indices.iter().take(self.capacity()) {
            let label = dataset.label(index)?;
            self.push(dataset.features.row(index).iter().copied(), label);
        }
        Ok(())
    }

    /// Appends a single sample. Does nothing if the buffer is full.
    pub fn push(&mut self, row: impl IntoIterator<Item = f32>, label: u32) {
        if self.len == self.capacity() {
            return;
        }
        let mut dst = self.features.row_mut(self.len);
        for (d, v) in dst.iter_mut().zip(row) {
            *d = v;
        }
        self.labels.push(label);
        self.len += 1;
    }

    pub fn features(&self) -> ArrayView2<f32> {
        self.features.slice(s![..self.len, ..])
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}
