//! Pairwise-ranking steps for training the scoring model.

use crate::{skip_or_abort, StepMetrics, StepOutcome, StepReport};
use anyhow::{Context, Result};
use prefopt_algorithm::{compute_pairwise_reward_loss, RewardLossConfig, ScoreGradient};
use prefopt_types::ScoredPair;
use tracing::info;

/// Applies score gradients to the external scoring model.
pub trait RewardModelOptimizer: Send {
    fn apply(&mut self, pairs: &[ScoredPair], gradients: &[ScoreGradient]) -> Result<()>;
}

/// Drives Bradley-Terry ranking steps. Holds no policy or reference state.
pub struct RewardModelTrainer {
    config: RewardLossConfig,
    optimizer: Box<dyn RewardModelOptimizer>,
    global_step: u64,
}

impl RewardModelTrainer {
    pub fn new(config: RewardLossConfig, optimizer: Box<dyn RewardModelOptimizer>) -> Result<Self> {
        config.validate().context("invalid reward loss configuration")?;
        Ok(Self {
            config,
            optimizer,
            global_step: 0,
        })
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Computes the ranking loss over scored pairs and applies one update.
    #[tracing::instrument(level = "debug", skip(self, pairs), fields(step = self.global_step, pairs = pairs.len()))]
    pub fn train_step(&mut self, pairs: &[ScoredPair]) -> Result<StepOutcome> {
        let breakdown = match compute_pairwise_reward_loss(&self.config, pairs) {
            Ok(breakdown) => breakdown,
            Err(error) => return skip_or_abort(error, Vec::new()),
        };
        self.optimizer
            .apply(pairs, &breakdown.gradients)
            .context("apply reward model update")?;

        self.global_step += 1;
        info!(
            global_step = self.global_step,
            loss = breakdown.loss,
            accuracy = breakdown.accuracy,
            mean_gap = breakdown.mean_gap,
            "applied reward model step"
        );
        Ok(StepOutcome::Applied(StepReport {
            global_step: self.global_step,
            loss: breakdown.loss,
            batch_size: pairs.len(),
            included: pairs.len(),
            excluded: Vec::new(),
            warnings: Vec::new(),
            metrics: StepMetrics::RewardModel(breakdown),
        }))
    }
}
