//! Clipped surrogate policy objective with per-rollout validity filtering.

use crate::advantage::Advantage;
use crate::numerics::ensure_same_len;
use prefopt_types::{EngineError, EngineResult, EngineWarning, Rollout};
use tracing::warn;

/// Configuration for the clipped policy update.
#[derive(Debug, Clone, PartialEq)]
pub struct ClippedUpdateConfig {
    /// Surrogate clipping coefficient, usually around `0.2`.
    pub clip_epsilon: f64,
    /// Number of passes over the rollouts per optimization step.
    pub epochs: usize,
}

impl Default for ClippedUpdateConfig {
    fn default() -> Self {
        Self {
            clip_epsilon: 0.2,
            epochs: 1,
        }
    }
}

impl ClippedUpdateConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.clip_epsilon.is_finite() || self.clip_epsilon <= 0.0 {
            return Err(EngineError::configuration(format!(
                "clip_epsilon must be finite and > 0.0, found {}",
                self.clip_epsilon
            )));
        }
        if self.epochs == 0 {
            return Err(EngineError::configuration("ppo epochs must be greater than 0"));
        }
        Ok(())
    }
}

/// Per-token coefficients `d loss / d new_logprob`.
///
/// Excluded rollouts carry `None` and must not contribute to the parameter update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyGradient {
    pub token_coefficients: Vec<Option<Vec<f64>>>,
}

impl PolicyGradient {
    pub fn included(&self) -> impl Iterator<Item = (usize, &[f64])> {
        self.token_coefficients
            .iter()
            .enumerate()
            .filter_map(|(index, coefficients)| {
                coefficients
                    .as_deref()
                    .map(|coefficients| (index, coefficients))
            })
    }
}

/// Loss and diagnostics for one pass of the clipped update.
#[derive(Debug, Clone, PartialEq)]
pub struct ClippedPolicyLoss {
    /// Mean per-token surrogate loss over included rollouts.
    pub loss: f64,
    pub mean_ratio: f64,
    pub clipped_fraction: f64,
    pub approx_kl: f64,
    pub token_count: usize,
    pub included_rollouts: usize,
    /// Indices into the input slice of rollouts that were dropped.
    pub excluded_rollouts: Vec<usize>,
    pub warnings: Vec<EngineWarning>,
    pub gradient: PolicyGradient,
}

/// Aggregate over all epochs of one optimization step.
#[derive(Debug, Clone, PartialEq)]
pub struct ClippedUpdateSummary {
    pub epochs: usize,
    pub mean_loss: f64,
    pub final_loss: f64,
    pub mean_clipped_fraction: f64,
    pub observed_approx_kl: f64,
}

/// `-min(r * A, clip(r, 1 - eps, 1 + eps) * A)` for one token.
pub fn surrogate_token_loss(ratio: f64, advantage: f64, clip_epsilon: f64) -> f64 {
    let clipped_ratio = ratio.clamp(1.0 - clip_epsilon, 1.0 + clip_epsilon);
    -(ratio * advantage).min(clipped_ratio * advantage)
}

/// Computes the clipped surrogate loss over a batch of rollouts.
///
/// `new_logprobs[i]` holds the current policy's log-probabilities for the
/// tokens of `rollouts[i]`. Rollouts with a non-finite ratio or advantage are
/// excluded and reported; when nothing remains the step is an `EmptyBatch`.
#[tracing::instrument(level = "debug", skip(rollouts, advantages, new_logprobs), fields(rollouts = rollouts.len()))]
pub fn compute_clipped_policy_loss(
    config: &ClippedUpdateConfig,
    rollouts: &[Rollout],
    advantages: &[Advantage],
    new_logprobs: &[Vec<f64>],
) -> EngineResult<ClippedPolicyLoss> {
    config.validate()?;
    ensure_same_len("advantages", rollouts.len(), advantages.len())?;
    ensure_same_len("new_logprobs", rollouts.len(), new_logprobs.len())?;

    let clip_lower = 1.0 - config.clip_epsilon;
    let clip_upper = 1.0 + config.clip_epsilon;

    let mut loss_sum = 0.0;
    let mut ratio_sum = 0.0;
    let mut approx_kl_sum = 0.0;
    let mut clipped_count = 0usize;
    let mut token_count = 0usize;
    let mut excluded_rollouts = Vec::new();
    let mut warnings = Vec::new();
    // Raw `-r * A` on the unclipped branch; divided by the token count once known.
    let mut raw_gradients: Vec<Option<Vec<f64>>> = Vec::with_capacity(rollouts.len());

    for (index, ((rollout, advantage), logprobs)) in rollouts
        .iter()
        .zip(advantages)
        .zip(new_logprobs)
        .enumerate()
    {
        ensure_same_len(
            &format!("new_logprobs for rollout '{}'", rollout.rollout_id()),
            rollout.len(),
            logprobs.len(),
        )?;
        ensure_same_len(
            &format!("advantages for rollout '{}'", rollout.rollout_id()),
            rollout.len(),
            advantage.per_token.len(),
        )?;

        if advantage.per_token.iter().any(|value| !value.is_finite()) {
            warn!(
                reason_code = "non_finite_advantage",
                rollout_index = index,
                rollout_id = rollout.rollout_id(),
                "excluding rollout from clipped update"
            );
            excluded_rollouts.push(index);
            warnings.push(EngineWarning::NonFiniteAdvantage {
                rollout_index: index,
            });
            raw_gradients.push(None);
            continue;
        }

        let mut rollout_loss = 0.0;
        let mut rollout_ratio = 0.0;
        let mut rollout_kl = 0.0;
        let mut rollout_clipped = 0usize;
        let mut coefficients = Vec::with_capacity(rollout.len());
        let mut degenerate = false;
        for ((step, new_logprob), token_advantage) in rollout
            .steps()
            .iter()
            .zip(logprobs)
            .zip(&advantage.per_token)
        {
            let delta = new_logprob - step.old_logprob;
            let ratio = delta.exp();
            let token_loss = surrogate_token_loss(ratio, *token_advantage, config.clip_epsilon);
            if !ratio.is_finite() || !token_loss.is_finite() {
                degenerate = true;
                break;
            }
            let clipped_ratio = ratio.clamp(clip_lower, clip_upper);
            let unclipped = ratio * token_advantage;
            let clipped = clipped_ratio * token_advantage;
            if unclipped <= clipped {
                coefficients.push(-ratio * token_advantage);
            } else {
                coefficients.push(0.0);
                rollout_clipped += 1;
            }
            rollout_loss += token_loss;
            rollout_ratio += ratio;
            rollout_kl += 0.5 * delta * delta;
        }

        if degenerate {
            warn!(
                reason_code = "non_finite_ratio",
                rollout_index = index,
                rollout_id = rollout.rollout_id(),
                "excluding rollout from clipped update"
            );
            excluded_rollouts.push(index);
            warnings.push(EngineWarning::NonFiniteRatio {
                rollout_index: index,
            });
            raw_gradients.push(None);
            continue;
        }

        loss_sum += rollout_loss;
        ratio_sum += rollout_ratio;
        approx_kl_sum += rollout_kl;
        clipped_count += rollout_clipped;
        token_count += rollout.len();
        raw_gradients.push(Some(coefficients));
    }

    if token_count == 0 {
        return Err(EngineError::EmptyBatch {
            excluded: excluded_rollouts.len(),
        });
    }

    let tokens = token_count as f64;
    let token_coefficients = raw_gradients
        .into_iter()
        .map(|coefficients| {
            coefficients.map(|values| values.into_iter().map(|value| value / tokens).collect())
        })
        .collect();
    let included_rollouts = rollouts.len() - excluded_rollouts.len();
    Ok(ClippedPolicyLoss {
        loss: loss_sum / tokens,
        mean_ratio: ratio_sum / tokens,
        clipped_fraction: clipped_count as f64 / tokens,
        approx_kl: approx_kl_sum / tokens,
        token_count,
        included_rollouts,
        excluded_rollouts,
        warnings,
        gradient: PolicyGradient { token_coefficients },
    })
}

/// Folds the per-epoch losses of one optimization step into a summary.
pub fn summarize_epochs(losses: &[ClippedPolicyLoss]) -> Option<ClippedUpdateSummary> {
    let last = losses.last()?;
    let count = losses.len() as f64;
    Some(ClippedUpdateSummary {
        epochs: losses.len(),
        mean_loss: losses.iter().map(|loss| loss.loss).sum::<f64>() / count,
        final_loss: last.loss,
        mean_clipped_fraction: losses.iter().map(|loss| loss.clipped_fraction).sum::<f64>()
            / count,
        observed_approx_kl: losses.iter().map(|loss| loss.approx_kl).sum::<f64>() / count,
    })
}
