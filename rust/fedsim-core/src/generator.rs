//! The shared class-conditional generative model.
//!
//! The server owns the generator and hands clients a read-only `Arc` to it.
//! Clients draw synthetic samples from it to regularize their local training
//! and report per-class feature statistics of their partition, from which
//! the server fits the next generator.

use ndarray::ArrayView2;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::Batch;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("statistics shape ({classes} classes, {features} features) does not match the generator")]
    ShapeMismatch { classes: usize, features: usize },
}

/// Per-class feature sums and sample counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassStatistics {
    classes: usize,
    features: usize,
    sums: Vec<f64>,
    counts: Vec<u64>,
}

impl ClassStatistics {
    pub fn new(classes: usize, features: usize) -> Self {
        Self {
            classes,
            features,
            sums: vec![0.0; classes * features],
            counts: vec![0; classes],
        }
    }

    /// Accumulates the rows of a feature matrix with their labels. Out-of-range labels are skipped.
    pub fn observe(&mut self, features: ArrayView2<f32>, labels: &[u32]) {
        for (row, &label) in features.outer_iter().zip(labels) {
            let label = label as usize;
            if label >= self.classes {
                continue;
            }
            let sums = &mut self.sums[label * self.features..(label + 1) * self.features];
            for (s, &x) in sums.iter_mut().zip(row.iter()) {
                *s += f64::from(x);
            }
            self.counts[label] += 1;
        }
    }

    /// Adds the statistics of `other` to `self`.
    ///
    /// # Errors
    /// Fails if the shapes differ.
    pub fn merge(&mut self, other: &ClassStatistics) -> Result<(), GeneratorError> {
        if self.classes != other.classes || self.features != other.features {
            return Err(GeneratorError::ShapeMismatch {
                classes: other.classes,
                features: other.features,
            });
        }
        for (s, o) in self.sums.iter_mut().zip(&other.sums) {
            *s += o;
        }
        for (c, o) in self.counts.iter_mut().zip(&other.counts) {
            *c += o;
        }
        Ok(())
    }

    pub fn count(&self, class: usize) -> u64 {
        self.counts.get(class).copied().unwrap_or_default()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// A class-conditional Gaussian generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerativeModel {
    classes: usize,
    features: usize,
    /// `classes x features` row-major class means.
    means: Vec<f32>,
    /// Whether a class has ever been observed.
    observed: Vec<bool>,
    noise: f32,
    /// The number of times the generator was refitted.
    version: u64,
}

impl GenerativeModel {
    /// Creates an untrained generator. It produces no samples until it was fitted once.
    pub fn new(classes: usize, features: usize, noise: f32) -> Self {
        Self {
            classes,
            features,
            means: vec![0.0; classes * features],
            observed: vec![false; classes],
            noise,
            version: 0,
        }
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_trained(&self) -> bool {
        self.observed.iter().any(|o| *o)
    }

    pub fn mean(&self, class: usize) -> Option<&[f32]> {
        if class < self.classes && self.observed[class] {
            Some(&self.means[class * self.features..(class + 1) * self.features])
        } else {
            None
        }
    }

    pub fn empty_statistics(&self) -> ClassStatistics {
        ClassStatistics::new(self.classes, self.features)
    }

    /// Fits the next generator from aggregated statistics.
    ///
    /// Classes without samples in `stats` keep their previous mean.
    ///
    /// # Errors
    /// Fails if the statistics have a different shape.
    pub fn refit(&self, stats: &ClassStatistics) -> Result<GenerativeModel, GeneratorError> {
        if stats.classes != self.classes || stats.features != self.features {
            return Err(GeneratorError::ShapeMismatch {
                classes: stats.classes,
                features: stats.features,
            });
        }
        let mut next = self.clone();
        for class in 0..self.classes {
            let count = stats.counts[class];
            if count == 0 {
                continue;
            }
            let range = class * self.features..(class + 1) * self.features;
            for (m, s) in next.means[range.clone()].iter_mut().zip(&stats.sums[range]) {
                *m = (s / count as f64) as f32;
            }
            next.observed[class] = true;
        }
        next.version += 1;
        Ok(next)
    }

    /// Fills `batch` with synthetic samples of the observed classes.
    ///
    /// Leaves the batch empty if no class was observed yet.
    pub fn sample_into<R: Rng + ?Sized>(&self, batch: &mut Batch, rng: &mut R) {
        batch.clear();
        let observed: Vec<usize> = (0..self.classes).filter(|&c| self.observed[c]).collect();
        if observed.is_empty() {
            return;
        }
        for _ in 0..batch.capacity() {
            let class = observed[rng.gen_range(0..observed.len())];
            let mean = &self.means[class * self.features..(class + 1) * self.features];
            let noise = self.noise;
            let row: Vec<f32> = mean
                .iter()
                .map(|m| {
                    let z: f32 = StandardNormal.sample(rng);
                    m + noise * z
                })
                .collect();
            batch.push(row, class as u32);
        }
    }
}
