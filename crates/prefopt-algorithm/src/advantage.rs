//! KL-regularized advantage estimation.

use crate::divergence::{sequence_divergence, DivergenceEstimator};
use crate::gae::{compute_token_gae, GaeConfig};
use crate::numerics::{ensure_finite, ensure_same_len};
use prefopt_types::{EngineError, EngineResult, Reward, Rollout};
use tracing::debug;

/// How advantages are distributed over a response's tokens.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AdvantageMode {
    /// `reward - beta * P - baseline`, broadcast to every token.
    #[default]
    Sequence,
    /// Per-token rewards `-beta * d_t` plus the terminal reward, then GAE.
    TokenGae(GaeConfig),
}

/// Advantage estimation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvantageConfig {
    pub estimator: DivergenceEstimator,
    pub mode: AdvantageMode,
    /// Whiten advantages to zero mean and unit variance across the batch.
    pub whiten: bool,
    pub whiten_epsilon: f64,
}

impl Default for AdvantageConfig {
    fn default() -> Self {
        Self {
            estimator: DivergenceEstimator::Kl,
            mode: AdvantageMode::Sequence,
            whiten: false,
            whiten_epsilon: 1e-8,
        }
    }
}

impl AdvantageConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if let AdvantageMode::TokenGae(gae) = &self.mode {
            gae.validate()?;
        }
        if !self.whiten_epsilon.is_finite() || self.whiten_epsilon <= 0.0 {
            return Err(EngineError::configuration(format!(
                "whiten_epsilon must be finite and > 0.0, found {}",
                self.whiten_epsilon
            )));
        }
        Ok(())
    }
}

/// Optional value-head estimates supplied by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub enum ValueBaseline<'a> {
    #[default]
    None,
    /// One value estimate per rollout (sequence mode).
    PerSequence(&'a [f64]),
    /// One value estimate per token of each rollout (token mode).
    PerToken(&'a [Vec<f64>]),
}

/// Training signal for one rollout.
#[derive(Debug, Clone, PartialEq)]
pub struct Advantage {
    /// Advantage applied to each token in the clipped update.
    pub per_token: Vec<f64>,
    /// Sequence-level summary (the broadcast value, or the first token's advantage).
    pub sequence: f64,
    /// Value targets per token; empty in sequence mode without a baseline.
    pub returns: Vec<f64>,
    pub reward: f64,
    /// Unscaled summed divergence `P`.
    pub divergence: f64,
    /// `beta * P`.
    pub penalty: f64,
}

/// Advantages for a batch together with the divergence fed to the β controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvantageBatch {
    pub advantages: Vec<Advantage>,
    pub beta: f64,
    /// Mean of the per-sequence divergences in the batch.
    pub mean_divergence: f64,
}

/// Combines rewards and divergence penalties into advantages.
///
/// `rewards[i]` belongs to `rollouts[i]`. A rollout whose divergence is not
/// finite gets a non-finite advantage rather than failing the batch; the
/// clipped update excludes it.
#[tracing::instrument(level = "debug", skip(config, rollouts, rewards, baseline), fields(rollouts = rollouts.len()))]
pub fn estimate_advantages(
    config: &AdvantageConfig,
    rollouts: &[Rollout],
    rewards: &[Reward],
    beta: f64,
    baseline: ValueBaseline<'_>,
) -> EngineResult<AdvantageBatch> {
    config.validate()?;
    ensure_same_len("rewards", rollouts.len(), rewards.len())?;
    if !beta.is_finite() || beta < 0.0 {
        return Err(EngineError::invalid_input(format!(
            "beta must be finite and >= 0.0, found {beta}"
        )));
    }
    for (index, reward) in rewards.iter().enumerate() {
        ensure_finite("reward", index, reward.value)?;
    }

    let mut advantages = Vec::with_capacity(rollouts.len());
    for (index, (rollout, reward)) in rollouts.iter().zip(rewards).enumerate() {
        let divergence = sequence_divergence(rollout, config.estimator);
        let penalty = divergence.penalty(beta);
        let advantage = match config.mode {
            AdvantageMode::Sequence => {
                let value = match baseline {
                    ValueBaseline::None => 0.0,
                    ValueBaseline::PerSequence(values) => {
                        ensure_same_len("sequence baseline", rollouts.len(), values.len())?;
                        values[index]
                    }
                    ValueBaseline::PerToken(_) => {
                        return Err(EngineError::invalid_input(
                            "sequence advantage mode requires a per-sequence baseline",
                        ))
                    }
                };
                let sequence = reward.value - penalty - value;
                Advantage {
                    per_token: vec![sequence; rollout.len()],
                    sequence,
                    returns: Vec::new(),
                    reward: reward.value,
                    divergence: divergence.total,
                    penalty,
                }
            }
            AdvantageMode::TokenGae(gae) => {
                let values = match baseline {
                    ValueBaseline::None => vec![0.0; rollout.len()],
                    ValueBaseline::PerToken(values) => {
                        ensure_same_len("token baseline", rollouts.len(), values.len())?;
                        ensure_same_len(
                            &format!("token baseline for rollout '{}'", rollout.rollout_id()),
                            rollout.len(),
                            values[index].len(),
                        )?;
                        values[index].clone()
                    }
                    ValueBaseline::PerSequence(_) => {
                        return Err(EngineError::invalid_input(
                            "token advantage mode requires per-token value estimates",
                        ))
                    }
                };
                let mut token_rewards = divergence
                    .token_penalties(beta)
                    .into_iter()
                    .map(|penalty| -penalty)
                    .collect::<Vec<_>>();
                if let Some(last) = token_rewards.last_mut() {
                    *last += reward.value;
                }
                if token_rewards.iter().any(|value| !value.is_finite()) {
                    debug!(
                        rollout_index = index,
                        rollout_id = rollout.rollout_id(),
                        "token rewards are not finite; advantage left undefined"
                    );
                    Advantage {
                        per_token: vec![f64::NAN; rollout.len()],
                        sequence: f64::NAN,
                        returns: vec![f64::NAN; rollout.len()],
                        reward: reward.value,
                        divergence: divergence.total,
                        penalty,
                    }
                } else {
                    let output = compute_token_gae(&gae, &token_rewards, &values)?;
                    Advantage {
                        sequence: output.advantages.first().copied().unwrap_or(0.0),
                        per_token: output.advantages,
                        returns: output.returns,
                        reward: reward.value,
                        divergence: divergence.total,
                        penalty,
                    }
                }
            }
        };
        advantages.push(advantage);
    }

    if config.whiten {
        whiten(&mut advantages, config.mode, config.whiten_epsilon);
    }

    let (divergence_sum, finite_count) = advantages
        .iter()
        .map(|item| item.divergence)
        .filter(|value| value.is_finite())
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    let mean_divergence = if finite_count == 0 {
        0.0
    } else {
        divergence_sum / finite_count as f64
    };
    Ok(AdvantageBatch {
        advantages,
        beta,
        mean_divergence,
    })
}

fn whiten(advantages: &mut [Advantage], mode: AdvantageMode, epsilon: f64) {
    match mode {
        AdvantageMode::Sequence => {
            let values: Vec<f64> = advantages.iter().map(|item| item.sequence).collect();
            let Some((mean, std)) = moments(&values, epsilon) else {
                return;
            };
            for item in advantages.iter_mut() {
                item.sequence = (item.sequence - mean) / std;
                let sequence = item.sequence;
                item.per_token.iter_mut().for_each(|value| *value = sequence);
            }
        }
        AdvantageMode::TokenGae(_) => {
            let values: Vec<f64> = advantages
                .iter()
                .flat_map(|item| item.per_token.iter().copied())
                .collect();
            let Some((mean, std)) = moments(&values, epsilon) else {
                return;
            };
            for item in advantages.iter_mut() {
                item.per_token
                    .iter_mut()
                    .for_each(|value| *value = (*value - mean) / std);
                item.sequence = item.per_token.first().copied().unwrap_or(0.0);
            }
        }
    }
}

/// Mean and `sqrt(variance + epsilon)` over the finite values only.
///
/// Non-finite advantages stay non-finite after whitening.
fn moments(values: &[f64], epsilon: f64) -> Option<(f64, f64)> {
    let finite: Vec<f64> = values.iter().copied().filter(|value| value.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let count = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / count;
    let variance = finite
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum::<f64>()
        / count;
    Some((mean, (variance + epsilon).sqrt()))
}
