//! Local SGD and the round-level learning-rate schedule.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::model::{Model, ModelError};

/// Stochastic gradient descent with momentum and weight decay.
///
/// A fresh optimizer is created for every local training run, so the
/// momentum buffer never leaks across rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Option<Model>,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            lr: lr as f32,
            momentum: momentum as f32,
            weight_decay: weight_decay as f32,
            velocity: None,
        }
    }

    pub fn lr(&self) -> f64 {
        f64::from(self.lr)
    }

    /// Updates `params` in place with the gradient `grad`.
    ///
    /// # Errors
    /// Fails if the gradient length differs from the parameter length.
    pub fn step(&mut self, params: &mut Model, grad: &Model) -> Result<(), ModelError> {
        params.check_len(grad)?;
        let (lr, momentum, weight_decay) = (self.lr, self.momentum, self.weight_decay);
        if momentum == 0.0 {
            for (p, g) in params.iter_mut().zip(grad.iter()) {
                *p -= lr * (g + weight_decay * *p);
            }
            return Ok(());
        }

        let len = params.len();
        let velocity = self.velocity.get_or_insert_with(|| Model::zeros(len));
        for ((p, g), v) in params.iter_mut().zip(grad.iter()).zip(velocity.iter_mut()) {
            *v = momentum * *v + g + weight_decay * *p;
            *p -= lr * *v;
        }
        Ok(())
    }
}

/// How the learning rate evolves over rounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    Constant,
    /// Multiplies the learning rate by `gamma` every `step_size` rounds.
    Step { step_size: u64, gamma: f64 },
    /// Cosine annealing towards zero over `total` rounds.
    Cosine { total: u64 },
}

impl Scheduler {
    /// The learning rate after `steps` completed rounds.
    pub fn lr(&self, base: f64, steps: u64) -> f64 {
        match *self {
            Self::Constant => base,
            Self::Step { step_size, gamma } => {
                base * gamma.powi((steps / step_size.max(1)).min(i32::MAX as u64) as i32)
            }
            Self::Cosine { total } => {
                let total = total.max(1);
                let t = steps.min(total) as f64 / total as f64;
                0.5 * base * (1.0 + (PI * t).cos())
            }
        }
    }
}

/// The round-level optimizer state persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub base_lr: f64,
    pub scheduler: Scheduler,
    /// The number of completed scheduler steps.
    pub steps: u64,
}

impl OptimizerState {
    pub fn new(base_lr: f64, scheduler: Scheduler) -> Self {
        Self {
            base_lr,
            scheduler,
            steps: 0,
        }
    }

    /// The learning rate of the current round.
    pub fn lr(&self) -> f64 {
        self.scheduler.lr(self.base_lr, self.steps)
    }

    /// Advances the schedule by one round.
    pub fn step(&mut self) {
        self.steps += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_sgd() {
        let mut sgd = Sgd::new(0.5, 0.0, 0.0);
        let mut params = Model::from(vec![1.0, 1.0]);
        sgd.step(&mut params, &Model::from(vec![1.0, -2.0])).unwrap();
        assert_eq!(params, Model::from(vec![0.5, 2.0]));
    }

    #[test]
    fn test_momentum() {
        let mut sgd = Sgd::new(1.0, 0.5, 0.0);
        let mut params = Model::zeros(1);
        let grad = Model::from(vec![1.0]);
        sgd.step(&mut params, &grad).unwrap();
        sgd.step(&mut params, &grad).unwrap();
        // v1 = 1, v2 = 1.5
        assert_eq!(params, Model::from(vec![-2.5]));
    }

    #[test]
    fn test_step_length_mismatch() {
        let mut sgd = Sgd::new(0.1, 0.9, 0.0);
        assert!(sgd.step(&mut Model::zeros(2), &Model::zeros(3)).is_err());
    }

    #[test]
    fn test_schedulers() {
        assert!((Scheduler::Constant.lr(0.1, 50) - 0.1).abs() < 1e-12);

        let step = Scheduler::Step {
            step_size: 10,
            gamma: 0.5,
        };
        assert!((step.lr(1.0, 9) - 1.0).abs() < 1e-12);
        assert!((step.lr(1.0, 10) - 0.5).abs() < 1e-12);
        assert!((step.lr(1.0, 25) - 0.25).abs() < 1e-12);

        let cosine = Scheduler::Cosine { total: 100 };
        assert!((cosine.lr(1.0, 0) - 1.0).abs() < 1e-12);
        assert!((cosine.lr(1.0, 50) - 0.5).abs() < 1e-12);
        assert!(cosine.lr(1.0, 200).abs() < 1e-12);
    }

    #[test]
    fn test_optimizer_state() {
        let mut state = OptimizerState::new(
            0.2,
            Scheduler::Step {
                step_size: 1,
                gamma: 0.5,
            },
        );
        assert!((state.lr() - 0.2).abs() < 1e-12);
        state.step();
        assert!((state.lr() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_schedule_survives_bincode() {
        for scheduler in [
            Scheduler::Constant,
            Scheduler::Step {
                step_size: 3,
                gamma: 0.5,
            },
            Scheduler::Cosine { total: 10 },
        ]
        .iter()
        {
            let mut state = OptimizerState::new(0.2, *scheduler);
            state.step();
            let bytes = bincode::serialize(&state).unwrap();
            let restored: OptimizerState = bincode::deserialize(&bytes).unwrap();
            assert_eq!(restored, state);
            assert!((restored.lr() - state.lr()).abs() < 1e-12);
        }
    }
}
