//! Bradley-Terry pairwise ranking loss for training a scoring model.
//!
//! Callers pair scores produced by the same model for the two responses to one
//! prompt; that pairing is not checked here.

use crate::numerics::{ensure_finite, log_sigmoid, sigmoid};
use prefopt_types::{EngineError, EngineResult, ScoredPair};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RewardLossConfig {
    /// Weight of the `mean((chosen + rejected)^2)` term that keeps scores centered.
    pub center_rewards_coefficient: Option<f64>,
}

impl RewardLossConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if let Some(coefficient) = self.center_rewards_coefficient {
            if !coefficient.is_finite() || coefficient < 0.0 {
                return Err(EngineError::configuration(format!(
                    "center_rewards_coefficient must be finite and >= 0.0, found {coefficient}"
                )));
            }
        }
        Ok(())
    }
}

/// `-log sigmoid(chosen_score - rejected_score)` for one pair.
pub fn pairwise_reward_loss(chosen_score: f64, rejected_score: f64) -> f64 {
    -log_sigmoid(chosen_score - rejected_score)
}

/// Gradient of the mean loss with respect to one pair's scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreGradient {
    pub chosen: f64,
    pub rejected: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardLossBreakdown {
    /// Ranking loss plus the centering term.
    pub loss: f64,
    pub ranking_loss: f64,
    pub centering_loss: f64,
    pub accuracy: f64,
    /// Mean `chosen_score - rejected_score`.
    pub mean_gap: f64,
    pub gradients: Vec<ScoreGradient>,
    pub pair_count: usize,
}

#[tracing::instrument(level = "debug", skip(pairs), fields(pairs = pairs.len()))]
pub fn compute_pairwise_reward_loss(
    config: &RewardLossConfig,
    pairs: &[ScoredPair],
) -> EngineResult<RewardLossBreakdown> {
    config.validate()?;
    if pairs.is_empty() {
        return Err(EngineError::EmptyBatch { excluded: 0 });
    }

    let count = pairs.len() as f64;
    let center = config.center_rewards_coefficient.unwrap_or(0.0);
    let mut ranking_sum = 0.0;
    let mut centering_sum = 0.0;
    let mut gap_sum = 0.0;
    let mut correct = 0usize;
    let mut gradients = Vec::with_capacity(pairs.len());
    for (index, pair) in pairs.iter().enumerate() {
        ensure_finite("chosen_score", index, pair.chosen_score)?;
        ensure_finite("rejected_score", index, pair.rejected_score)?;
        let margin = pair.margin.unwrap_or(0.0);
        ensure_finite("margin", index, margin)?;

        let gap = pair.chosen_score - pair.rejected_score;
        let z = gap - margin;
        ranking_sum += -log_sigmoid(z);
        let sum = pair.chosen_score + pair.rejected_score;
        centering_sum += sum * sum;
        gap_sum += gap;
        if gap > 0.0 {
            correct += 1;
        }

        let ranking_grad = sigmoid(-z) / count;
        let centering_grad = 2.0 * center * sum / count;
        gradients.push(ScoreGradient {
            chosen: -ranking_grad + centering_grad,
            rejected: ranking_grad + centering_grad,
        });
    }

    let ranking_loss = ranking_sum / count;
    let centering_loss = center * centering_sum / count;
    Ok(RewardLossBreakdown {
        loss: ranking_loss + centering_loss,
        ranking_loss,
        centering_loss,
        accuracy: correct as f64 / count,
        mean_gap: gap_sum / count,
        gradients,
        pair_count: pairs.len(),
    })
}
