//! Model representation and arithmetic.

use std::{
    iter::{FromIterator, IntoIterator},
    slice::{Iter, IterMut},
};

use derive_more::{From, Index, IndexMut, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, From, Index, IndexMut, Into, Serialize, Deserialize)]
/// A flat parameter vector of a machine learning model.
pub struct Model(Vec<f32>);

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
/// Errors related to model arithmetic.
pub enum ModelError {
    #[error("model length mismatch: expected {expected} parameters, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[allow(clippy::len_without_is_empty)]
impl Model {
    /// Creates a model with `len` zero parameters.
    pub fn zeros(len: usize) -> Self {
        Self(vec![0.0; len])
    }

    /// Gets the number of weights/parameters of this model.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Creates an iterator that yields references to the weights/parameters of this model.
    pub fn iter(&self) -> Iter<f32> {
        self.0.iter()
    }

    /// Creates an iterator that yields mutable references to the weights/parameters of this model.
    pub fn iter_mut(&mut self) -> IterMut<f32> {
        self.0.iter_mut()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.0
    }

    /// Checks that `other` has the same number of parameters.
    ///
    /// # Errors
    /// Fails with [`ModelError::LengthMismatch`] otherwise.
    pub fn check_len(&self, other: &Model) -> Result<(), ModelError> {
        if self.len() == other.len() {
            Ok(())
        } else {
            Err(ModelError::LengthMismatch {
                expected: self.len(),
                actual: other.len(),
            })
        }
    }

    /// Overwrites the parameters with the ones of `other`, reusing the allocation.
    pub fn copy_from(&mut self, other: &Model) -> Result<(), ModelError> {
        self.check_len(other)?;
        self.0.copy_from_slice(&other.0);
        Ok(())
    }

    /// Computes `self += alpha * other`.
    pub fn add_scaled(&mut self, other: &Model, alpha: f32) -> Result<(), ModelError> {
        self.check_len(other)?;
        for (w, o) in self.0.iter_mut().zip(other.iter()) {
            *w += alpha * o;
        }
        Ok(())
    }

    /// Computes the difference `self - base`.
    pub fn delta(&self, base: &Model) -> Result<Model, ModelError> {
        self.check_len(base)?;
        Ok(self.iter().zip(base.iter()).map(|(w, b)| w - b).collect())
    }

    /// Multiplies every parameter with `alpha`.
    pub fn scale(&mut self, alpha: f32) {
        self.0.iter_mut().for_each(|w| *w *= alpha);
    }

    /// Sets every parameter to zero.
    pub fn clear(&mut self) {
        self.0.iter_mut().for_each(|w| *w = 0.0);
    }

    /// The euclidean norm of the parameter vector.
    pub fn l2_norm(&self) -> f64 {
        self.iter().map(|&w| f64::from(w) * f64::from(w)).sum::<f64>().sqrt()
    }

    /// Returns `true` if every parameter is finite.
    pub fn is_finite(&self) -> bool {
        self.iter().all(|w| w.is_finite())
    }

    /// Computes the weighted sum `Σ weight_i · model_i` of models with `len` parameters.
    ///
    /// # Errors
    /// Fails if any model does not have `len` parameters.
    pub fn weighted_sum<'a, I>(len: usize, models: I) -> Result<Model, ModelError>
    where
        I: IntoIterator<Item = (&'a Model, f64)>,
    {
        let mut acc = vec![0_f64; len];
        for (model, weight) in models {
            if model.len() != len {
                return Err(ModelError::LengthMismatch {
                    expected: len,
                    actual: model.len(),
                });
            }
            for (a, &w) in acc.iter_mut().zip(model.iter()) {
                *a += weight * f64::from(w);
            }
        }
        Ok(acc.into_iter().map(|a| a as f32).collect())
    }
}

impl FromIterator<f32> for Model {
    fn from_iter<I: IntoIterator<Item = f32>>(iter: I) -> Self {
        Model(iter.into_iter().collect())
    }
}

impl IntoIterator for Model {
    type Item = f32;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
