use std::sync::Arc;

use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Dataset, DatasetPair, DatasetProvider};
use crate::{
    common::{RoundSeed, Stream},
    ConfigurationError,
};

/// Generates Gaussian class clusters ("blobs").
///
/// Each class gets a random mean in feature space; samples are the mean of
/// their class plus isotropic Gaussian noise. Train and validation halves
/// share the class means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticProvider {
    pub train_samples: usize,
    pub test_samples: usize,
    pub features: usize,
    pub classes: usize,
    /// Standard deviation of the per-sample noise.
    pub noise: f32,
}

impl SyntheticProvider {
    pub const NAME: &'static str = "blobs";

    fn sample<R: Rng>(
        &self,
        means: &Array2<f32>,
        len: usize,
        noise: &Normal<f32>,
        rng: &mut R,
    ) -> Result<Dataset, ConfigurationError> {
        let mut features = Array2::zeros((len, self.features));
        let mut labels = Vec::with_capacity(len);
        for (i, mut row) in features.outer_iter_mut().enumerate() {
            // round robin keeps the classes balanced
            let label = i % self.classes;
            for (x, mean) in row.iter_mut().zip(means.row(label)) {
                *x = mean + noise.sample(rng);
            }
            labels.push(label as u32);
        }
        Ok(Dataset::new(features, labels, self.classes)?)
    }
}

impl DatasetProvider for SyntheticProvider {
    fn fetch(&self, name: &str, seed: u64) -> Result<DatasetPair, ConfigurationError> {
        if name != Self::NAME {
            return Err(ConfigurationError::UnknownDataset(name.to_string()));
        }
        let setup = RoundSeed::setup(seed);
        let mut rng = setup.rng(Stream::Dataset, 0);
        let noise = Normal::new(0.0, self.noise.max(0.0))
            .map_err(|_| ConfigurationError::UnknownDataset(name.to_string()))?;

        let means = Array2::from_shape_simple_fn((self.classes, self.features), || {
            let x: f32 = StandardNormal.sample(&mut rng);
            2.0 * x
        });
        let train = self.sample(&means, self.train_samples, &noise, &mut rng)?;
        let mut rng = setup.rng(Stream::Dataset, 1);
        let test = self.sample(&means, self.test_samples, &noise, &mut rng)?;
        info!(
            "generated `{}` dataset: {} train / {} test samples, {} features, {} classes",
            name, self.train_samples, self.test_samples, self.features, self.classes
        );

        Ok(DatasetPair {
            train: Arc::new(train),
            test: Arc::new(test),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> SyntheticProvider {
        SyntheticProvider {
            train_samples: 60,
            test_samples: 20,
            features: 4,
            classes: 3,
            noise: 0.5,
        }
    }

    #[test]
    fn test_fetch_is_deterministic() {
        let a = provider().fetch("blobs", 3).unwrap();
        let b = provider().fetch("blobs", 3).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.test, b.test);
        assert_eq!(a.train.len(), 60);
        assert_eq!(a.test.len(), 20);
        assert_eq!(a.train.num_features(), 4);

        let c = provider().fetch("blobs", 4).unwrap();
        assert_ne!(a.train, c.train);
    }

    #[test]
    fn test_unknown_dataset() {
        assert!(matches!(
            provider().fetch("MNIST", 0),
            Err(ConfigurationError::UnknownDataset(name)) if name == "MNIST"
        ));
    }
}
