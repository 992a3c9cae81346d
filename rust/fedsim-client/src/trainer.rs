//! The local SGD loop shared by all client variants.

use rand::seq::SliceRandom;
use rand_chacha::ChaCha20Rng;

use fedsim_core::{
    data::Batch,
    generator::{ClassStatistics, GenerativeModel},
    message::LocalMetrics,
    model::Model,
    optimizer::Sgd,
};

use crate::client::{ClientError, TrainContext};

/// A modification of the local gradient.
pub(crate) enum Correction<'a> {
    None,
    Proximal {
        mu: f32,
        global: &'a Model,
    },
    ControlVariate {
        server: &'a Model,
        local: &'a Model,
    },
    Generative {
        generator: &'a GenerativeModel,
        alpha: f32,
    },
}

pub(crate) struct LocalRun<'a> {
    pub ctx: &'a TrainContext,
    pub indices: &'a [usize],
    pub steps: usize,
    pub lr: f64,
    pub correction: Correction<'a>,
}

impl<'a> LocalRun<'a> {
    /// Trains `model` in place for exactly `self.steps` mini-batch steps.
    pub fn train(&self, model: &mut Model, rng: &mut ChaCha20Rng) -> Result<LocalMetrics, ClientError> {
        let ctx = self.ctx;
        let batch_size = ctx.settings.batch_size.max(1);
        let mut sgd = Sgd::new(self.lr, ctx.settings.momentum, ctx.settings.weight_decay);
        let mut grad = Model::zeros(model.len());
        let mut batch = Batch::with_capacity(batch_size, ctx.train.num_features());
        let mut synthetic = match self.correction {
            Correction::Generative { .. } => Some((
                Batch::with_capacity(batch_size, ctx.train.num_features()),
                Model::zeros(model.len()),
            )),
            _ => None,
        };

        let mut order = self.indices.to_vec();
        order.shuffle(rng);
        let mut cursor = 0;
        let (mut loss, mut correct, mut seen) = (0.0, 0.0, 0);

        for _ in 0..self.steps {
            if cursor >= order.len() {
                order.shuffle(rng);
                cursor = 0;
            }
            let end = (cursor + batch_size).min(order.len());
            batch.fill(&ctx.train, &order[cursor..end])?;
            cursor = end;

            let eval =
                ctx.learner
                    .loss_and_gradient(model, batch.features(), batch.labels(), &mut grad)?;
            loss += eval.loss * eval.samples as f64;
            correct += eval.accuracy * eval.samples as f64;
            seen += eval.samples;

            match self.correction {
                Correction::None => {}
                Correction::Proximal { mu, global } => {
                    for ((g, w), wg) in grad.iter_mut().zip(model.iter()).zip(global.iter()) {
                        *g += mu * (w - wg);
                    }
                }
                Correction::ControlVariate { server, local } => {
                    grad.add_scaled(server, 1.0)?;
                    grad.add_scaled(local, -1.0)?;
                }
                Correction::Generative { generator, alpha } => {
                    if let Some((samples, aux)) = synthetic.as_mut() {
                        generator.sample_into(samples, rng);
                        if !samples.is_empty() {
                            ctx.learner.loss_and_gradient(
                                model,
                                samples.features(),
                                samples.labels(),
                                aux,
                            )?;
                            grad.add_scaled(aux, alpha)?;
                        }
                    }
                }
            }
            sgd.step(model, &grad)?;
        }

        if seen == 0 {
            return Ok(LocalMetrics {
                steps: self.steps,
                ..LocalMetrics::default()
            });
        }
        Ok(LocalMetrics {
            loss: loss / seen as f64,
            accuracy: correct / seen as f64,
            steps: self.steps,
        })
    }

    /// Collects the per-class feature statistics of the partition.
    pub fn class_statistics(&self, generator: &GenerativeModel) -> Result<ClassStatistics, ClientError> {
        let ctx = self.ctx;
        let batch_size = ctx.settings.batch_size.max(1);
        let mut stats = generator.empty_statistics();
        let mut batch = Batch::with_capacity(batch_size, ctx.train.num_features());
        for chunk in self.indices.chunks(batch_size) {
            batch.fill(&ctx.train, chunk)?;
            stats.observe(batch.features(), batch.labels());
        }
        Ok(stats)
    }
}
