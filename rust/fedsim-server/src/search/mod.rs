//! Online selection of aggregation arms.
//!
//! The [`CombinationSearch`] treats the configured arms as a multi-armed
//! bandit. Every round it picks one arm among those the communication
//! metadata can serve, runs it and scores it by the validation reward of the
//! resulting global model.
//!
//! A round is split into [`CombinationSearch::execute`], which runs the
//! selected arm without changing any shared state, and
//! [`CombinationSearch::commit`], which applies the outcome. A round that is
//! never committed leaves no trace in the search, the global model or the
//! metadata.

use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::aggregation::{AggregationError, Arm, RoundContext, RoundOutcome};
use fedsim_client::ClientPopulation;
use fedsim_core::{
    common::{RoundParameters, Stream},
    learner::Evaluation,
    metadata::CommunicationMetadata,
    metrics::MetricSink,
    model::Model,
    ConfigurationError,
};

/// Errors of a search round.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// The quantity an arm is rewarded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reward {
    /// The validation accuracy of the new global model.
    Accuracy,
    /// The negated validation loss of the new global model.
    NegativeLoss,
}

impl Reward {
    pub fn of(&self, evaluation: &Evaluation) -> f64 {
        match self {
            Self::Accuracy => evaluation.accuracy,
            Self::NegativeLoss => -evaluation.loss,
        }
    }
}

/// How the next arm is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchPolicy {
    /// A random arm with probability `epsilon`, the best scoring arm otherwise.
    EpsilonGreedy { epsilon: f64 },
    /// Upper confidence bound with exploration constant `c`.
    Ucb { c: f64 },
}

/// The running statistics of an arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub arm: Arm,
    /// Exponentially smoothed reward.
    pub score: f64,
    /// The number of committed rounds the arm ran.
    pub count: u64,
}

/// An executed but uncommitted search round.
#[derive(Debug, Clone)]
pub struct PendingRound {
    index: usize,
    reward: f64,
    outcome: RoundOutcome,
}

impl PendingRound {
    pub fn arm(&self) -> Arm {
        self.outcome.arm
    }

    pub fn reward(&self) -> f64 {
        self.reward
    }

    pub fn outcome(&self) -> &RoundOutcome {
        &self.outcome
    }
}

/// What a committed round reports to the experiment log.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub arm: Arm,
    pub reward: f64,
    pub evaluation: Evaluation,
    pub train_metrics: MetricSink,
    pub participants: usize,
    pub responders: usize,
}

/// A bandit over a fixed, ordered list of aggregation arms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationSearch {
    arms: Vec<ArmStats>,
    policy: SearchPolicy,
    reward: Reward,
    decay: f64,
}

impl CombinationSearch {
    /// Creates a search over `arms`. Duplicate arms are dropped, the first
    /// occurrence keeps its position.
    ///
    /// # Errors
    /// Fails with [`ConfigurationError::NoSelectableArm`] if `arms` is empty.
    pub fn new(
        arms: impl IntoIterator<Item = Arm>,
        policy: SearchPolicy,
        reward: Reward,
        decay: f64,
    ) -> Result<Self, ConfigurationError> {
        let mut seen = BTreeSet::new();
        let arms: Vec<ArmStats> = arms
            .into_iter()
            .filter(|arm| seen.insert(arm.as_str()))
            .map(|arm| ArmStats {
                arm,
                score: 0.0,
                count: 0,
            })
            .collect();
        if arms.is_empty() {
            return Err(ConfigurationError::NoSelectableArm);
        }
        Ok(Self {
            arms,
            policy,
            reward,
            decay,
        })
    }

    pub fn arms(&self) -> &[ArmStats] {
        &self.arms
    }

    pub fn policy(&self) -> SearchPolicy {
        self.policy
    }

    /// Selects the arm of a round and returns its index.
    ///
    /// Only arms whose requirements `metadata` satisfies are candidates. Ties
    /// go to the lowest index. The choice only depends on the search
    /// statistics and the round seed.
    ///
    /// # Errors
    /// Fails with [`ConfigurationError::NoSelectableArm`] if there is no candidate.
    pub fn select(
        &self,
        metadata: &CommunicationMetadata,
        round: &RoundParameters,
    ) -> Result<usize, ConfigurationError> {
        let candidates: Vec<usize> = self
            .arms
            .iter()
            .enumerate()
            .filter(|(_, stats)| stats.arm.is_supported_by(metadata))
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return Err(ConfigurationError::NoSelectableArm);
        }

        let index = match self.policy {
            SearchPolicy::EpsilonGreedy { epsilon } => {
                let mut rng = round.seed.rng(Stream::Selection, 0);
                if rng.gen::<f64>() < epsilon {
                    candidates[rng.gen_range(0..candidates.len())]
                } else {
                    self.argmax(&candidates, |stats| stats.score)
                }
            }
            SearchPolicy::Ucb { c } => {
                match candidates.iter().find(|i| self.arms[**i].count == 0) {
                    Some(unvisited) => *unvisited,
                    None => {
                        let ln_round = (round.global_epoch.max(1) as f64).ln();
                        self.argmax(&candidates, |stats| {
                            stats.score + c * (ln_round / stats.count as f64).sqrt()
                        })
                    }
                }
            }
        };
        Ok(index)
    }

    fn argmax(&self, candidates: &[usize], value: impl Fn(&ArmStats) -> f64) -> usize {
        let mut best = candidates[0];
        let mut best_value = value(&self.arms[best]);
        for &index in candidates.iter().skip(1) {
            let v = value(&self.arms[index]);
            if v > best_value {
                best = index;
                best_value = v;
            }
        }
        best
    }

    /// Selects an arm and runs it, without committing anything.
    ///
    /// # Errors
    /// Fails if no arm is selectable or the selected arm fails.
    pub fn execute(
        &self,
        ctx: &RoundContext,
        clients: &mut ClientPopulation,
        global: &Model,
        metadata: &CommunicationMetadata,
    ) -> Result<PendingRound, RoundError> {
        let index = self.select(metadata, &ctx.round)?;
        let arm = self.arms[index].arm;
        debug!(%arm, "selected arm");
        let outcome = arm.apply_round(ctx, clients, global, metadata)?;
        let reward = self.reward.of(&outcome.evaluation);
        Ok(PendingRound {
            index,
            reward,
            outcome,
        })
    }

    /// Commits an executed round.
    ///
    /// The metadata update is applied first. If it fails, neither the
    /// metadata, the global model nor the arm statistics change.
    pub fn commit(
        &mut self,
        pending: PendingRound,
        global: &mut Model,
        metadata: &mut CommunicationMetadata,
    ) -> Result<RoundSummary, AggregationError> {
        let PendingRound {
            index,
            reward,
            outcome,
        } = pending;
        metadata.commit(outcome.metadata_update)?;
        *global = outcome.global;

        let decay = self.decay;
        let stats = &mut self.arms[index];
        stats.score = decay * stats.score + (1.0 - decay) * reward;
        stats.count += 1;
        info!(
            arm = %stats.arm,
            reward,
            score = stats.score,
            count = stats.count,
            "committed round"
        );

        Ok(RoundSummary {
            arm: outcome.arm,
            reward,
            evaluation: outcome.evaluation,
            train_metrics: outcome.train_metrics,
            participants: outcome.participants,
            responders: outcome.responders,
        })
    }
}
