//! The model architecture seen by the simulator.
//!
//! The round engine treats models as flat parameter vectors. A [`Learner`]
//! knows how to interpret them: how to initialize them, how to compute a
//! loss gradient on a mini-batch and how to evaluate them on a dataset.

use std::fmt::Debug;

use ndarray::{Array1, ArrayView1, ArrayView2, Axis, ShapeError};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    data::Dataset,
    model::{Model, ModelError},
};

#[derive(Debug, Error)]
pub enum LearnerError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("batch has {actual} features, expected {expected}")]
    FeatureMismatch { expected: usize, actual: usize },
    #[error("invalid parameter shape: {0}")]
    Shape(#[from] ShapeError),
}

/// Loss and accuracy statistics of a forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Mean cross-entropy loss.
    pub loss: f64,
    /// Fraction of correctly classified samples.
    pub accuracy: f64,
    /// Number of evaluated samples.
    pub samples: usize,
}

impl Evaluation {
    fn from_sums(loss: f64, correct: usize, samples: usize) -> Self {
        if samples == 0 {
            return Self::default();
        }
        Self {
            loss: loss / samples as f64,
            accuracy: correct as f64 / samples as f64,
            samples,
        }
    }
}

/// A trainable model architecture.
pub trait Learner: Debug + Send + Sync {
    /// The number of parameters of a model.
    fn num_parameters(&self) -> usize;

    /// Creates randomly initialized model parameters.
    fn init_model(&self, rng: &mut dyn RngCore) -> Model;

    /// Computes the mean loss gradient of a mini-batch into `grad`, overwriting it.
    ///
    /// Returns the statistics of the forward pass. An empty batch yields a zero gradient.
    fn loss_and_gradient(
        &self,
        model: &Model,
        features: ArrayView2<f32>,
        labels: &[u32],
        grad: &mut Model,
    ) -> Result<Evaluation, LearnerError>;

    /// Evaluates a model on a whole dataset.
    fn evaluate(&self, model: &Model, dataset: &Dataset) -> Result<Evaluation, LearnerError>;
}

/// Multinomial logistic regression.
///
/// Parameters are laid out as the `classes x features` weight matrix in
/// row-major order, followed by one bias per class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxRegression {
    pub features: usize,
    pub classes: usize,
}

impl SoftmaxRegression {
    pub fn new(features: usize, classes: usize) -> Self {
        Self { features, classes }
    }

    /// Computes the class probabilities of a batch and the loss/accuracy sums.
    fn forward(
        &self,
        model: &Model,
        features: ArrayView2<f32>,
        labels: &[u32],
    ) -> Result<(ndarray::Array2<f32>, f64, usize), LearnerError> {
        if model.len() != self.num_parameters() {
            return Err(ModelError::LengthMismatch {
                expected: self.num_parameters(),
                actual: model.len(),
            }
            .into());
        }
        if features.ncols() != self.features {
            return Err(LearnerError::FeatureMismatch {
                expected: self.features,
                actual: features.ncols(),
            });
        }
        let split = self.classes * self.features;
        let weights =
            ArrayView2::from_shape((self.classes, self.features), &model.as_slice()[..split])?;
        let bias = ArrayView1::from(&model.as_slice()[split..]);

        let mut probs = features.dot(&weights.t()) + &bias;
        let mut loss = 0.0;
        let mut correct = 0;
        for (mut row, &label) in probs.outer_iter_mut().zip(labels) {
            let max = row.fold(f32::NEG_INFINITY, |a, &x| a.max(x));
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row /= sum;

            let predicted = argmax(row.view());
            if predicted == label as usize {
                correct += 1;
            }
            loss -= f64::from(row[label as usize].max(1e-12)).ln();
        }
        Ok((probs, loss, correct))
    }
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &x)| {
            if x > max {
                (i, x)
            } else {
                (best, max)
            }
        })
        .0
}

impl Learner for SoftmaxRegression {
    fn num_parameters(&self) -> usize {
        self.classes * (self.features + 1)
    }

    fn init_model(&self, rng: &mut dyn RngCore) -> Model {
        let std = (1.0 / self.features.max(1) as f32).sqrt();
        let split = self.classes * self.features;
        (0..self.num_parameters())
            .map(|i| {
                if i < split {
                    let z: f32 = StandardNormal.sample(rng);
                    std * z
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn loss_and_gradient(
        &self,
        model: &Model,
        features: ArrayView2<f32>,
        labels: &[u32],
        grad: &mut Model,
    ) -> Result<Evaluation, LearnerError> {
        model.check_len(grad)?;
        let n = features.nrows().min(labels.len());
        let features = features.slice(ndarray::s![..n, ..]);
        let (mut probs, loss, correct) = self.forward(model, features, &labels[..n])?;
        if n == 0 {
            grad.clear();
            return Ok(Evaluation::default());
        }

        for (mut row, &label) in probs.outer_iter_mut().zip(labels) {
            row[label as usize] -= 1.0;
        }
        probs /= n as f32;
        let grad_weights = probs.t().dot(&features);
        let grad_bias: Array1<f32> = probs.sum_axis(Axis(0));

        let split = self.classes * self.features;
        let (gw, gb) = grad.as_mut_slice().split_at_mut(split);
        for (g, v) in gw.iter_mut().zip(grad_weights.iter()) {
            *g = *v;
        }
        for (g, v) in gb.iter_mut().zip(grad_bias.iter()) {
            *g = *v;
        }
        Ok(Evaluation::from_sums(loss, correct, n))
    }

    fn evaluate(&self, model: &Model, dataset: &Dataset) -> Result<Evaluation, LearnerError> {
        let mut loss = 0.0;
        let mut correct = 0;
        for (features, labels) in dataset.chunks(1024) {
            let (_, l, c) = self.forward(model, features, labels)?;
            loss += l;
            correct += c;
        }
        Ok(Evaluation::from_sums(loss, correct, dataset.len()))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn toy() -> (SoftmaxRegression, Dataset) {
        let features = array![[1.0, 0.0], [0.9, 0.1], [0.0, 1.0], [0.1, 0.9]];
        let dataset = Dataset::new(features, vec![0, 0, 1, 1], 2).unwrap();
        (SoftmaxRegression::new(2, 2), dataset)
    }

    #[test]
    fn test_uniform_model() {
        let (learner, dataset) = toy();
        let eval = learner.evaluate(&Model::zeros(6), &dataset).unwrap();
        assert!((eval.loss - 2_f64.ln()).abs() < 1e-6);
        assert_eq!(eval.samples, 4);
    }

    #[test]
    fn test_gradient_descent_reduces_loss() {
        let (learner, dataset) = toy();
        let mut model = learner.init_model(&mut ChaCha20Rng::seed_from_u64(0));
        let mut grad = Model::zeros(learner.num_parameters());
        let before = learner.evaluate(&model, &dataset).unwrap();
        for _ in 0..100 {
            learner
                .loss_and_gradient(&model, dataset.features(), dataset.labels(), &mut grad)
                .unwrap();
            model.add_scaled(&grad, -0.5).unwrap();
        }
        let after = learner.evaluate(&model, &dataset).unwrap();
        assert!(after.loss < before.loss);
        assert!((after.accuracy - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let (learner, dataset) = toy();
        let model = learner.init_model(&mut ChaCha20Rng::seed_from_u64(1));
        let mut grad = Model::zeros(6);
        learner
            .loss_and_gradient(&model, dataset.features(), dataset.labels(), &mut grad)
            .unwrap();

        let eps = 1e-3;
        for i in 0..6 {
            let mut plus = model.clone();
            plus[i] += eps;
            let mut minus = model.clone();
            minus[i] -= eps;
            let numeric = (learner.evaluate(&plus, &dataset).unwrap().loss
                - learner.evaluate(&minus, &dataset).unwrap().loss)
                / (2.0 * f64::from(eps));
            assert!((numeric - f64::from(grad[i])).abs() < 1e-2);
        }
    }

    #[test]
    fn test_shape_errors() {
        let (learner, dataset) = toy();
        assert!(learner.evaluate(&Model::zeros(5), &dataset).is_err());
        let mut grad = Model::zeros(6);
        let wide = array![[1.0, 0.0, 0.0]];
        assert!(matches!(
            learner.loss_and_gradient(&Model::zeros(6), wide.view(), &[0], &mut grad),
            Err(LearnerError::FeatureMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_batch() {
        let (learner, _) = toy();
        let mut grad = Model::from(vec![1.0; 6]);
        let empty = ndarray::Array2::<f32>::zeros((0, 2));
        let eval = learner
            .loss_and_gradient(&Model::zeros(6), empty.view(), &[], &mut grad)
            .unwrap();
        assert_eq!(eval, Evaluation::default());
        assert_eq!(grad, Model::zeros(6));
    }
}
