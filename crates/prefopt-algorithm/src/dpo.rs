//! Direct preference loss over chosen/rejected log-probabilities.
//!
//! `beta` only ever scales the log-ratio difference, so the loss stays
//! well-defined at `beta = 0`.

use crate::numerics::{ensure_finite, log_sigmoid, sigmoid};
use prefopt_types::{EngineError, EngineResult, PreferenceLogProbs};

/// Loss applied to the scaled log-ratio difference `z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferenceLossKind {
    /// `-log sigmoid(z)`, optionally label-smoothed.
    #[default]
    Sigmoid,
    /// `max(0, 1 - z)`.
    Hinge,
}

impl PreferenceLossKind {
    pub fn parse(label: &str) -> EngineResult<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "sigmoid" => Ok(Self::Sigmoid),
            "hinge" => Ok(Self::Hinge),
            other => Err(EngineError::configuration(format!(
                "unsupported preference loss_type '{other}' (expected sigmoid or hinge)"
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Sigmoid => "sigmoid",
            Self::Hinge => "hinge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceLossConfig {
    pub beta: f64,
    pub loss_kind: PreferenceLossKind,
    /// Probability that a preference label is flipped; sigmoid loss only.
    pub label_smoothing: f64,
    /// Treat reference log-probabilities as zero.
    pub reference_free: bool,
}

impl Default for PreferenceLossConfig {
    fn default() -> Self {
        Self {
            beta: 0.1,
            loss_kind: PreferenceLossKind::Sigmoid,
            label_smoothing: 0.0,
            reference_free: false,
        }
    }
}

impl PreferenceLossConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.beta.is_finite() || self.beta < 0.0 {
            return Err(EngineError::configuration(format!(
                "preference beta must be finite and >= 0.0, found {}",
                self.beta
            )));
        }
        if !self.label_smoothing.is_finite() || !(0.0..0.5).contains(&self.label_smoothing) {
            return Err(EngineError::configuration(format!(
                "label_smoothing must be within [0.0, 0.5), found {}",
                self.label_smoothing
            )));
        }
        if self.label_smoothing > 0.0 && self.loss_kind == PreferenceLossKind::Hinge {
            return Err(EngineError::configuration(
                "label_smoothing is not supported with hinge preference loss",
            ));
        }
        Ok(())
    }
}

/// `beta * (policy_logprob - reference_logprob)`.
pub fn implicit_reward(policy_logprob: f64, reference_logprob: f64, beta: f64) -> f64 {
    beta * (policy_logprob - reference_logprob)
}

/// Sigmoid preference loss for a single pair.
pub fn preference_loss(
    chosen_logprob_policy: f64,
    chosen_logprob_ref: f64,
    rejected_logprob_policy: f64,
    rejected_logprob_ref: f64,
    beta: f64,
) -> f64 {
    let chosen = implicit_reward(chosen_logprob_policy, chosen_logprob_ref, beta);
    let rejected = implicit_reward(rejected_logprob_policy, rejected_logprob_ref, beta);
    -log_sigmoid(chosen - rejected)
}

/// Gradient of the mean loss with respect to one pair's policy log-probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairGradient {
    pub chosen: f64,
    pub rejected: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceLossBreakdown {
    pub loss: f64,
    /// Mean implicit reward of the chosen responses.
    pub chosen_reward: f64,
    pub rejected_reward: f64,
    /// Fraction of pairs whose chosen implicit reward exceeds the rejected one.
    pub accuracy: f64,
    /// Mean of `chosen_reward - rejected_reward`.
    pub margin: f64,
    pub gradients: Vec<PairGradient>,
    pub pair_count: usize,
}

/// Mean preference loss and metrics over a batch of pairs.
#[tracing::instrument(level = "debug", skip(pairs), fields(pairs = pairs.len()))]
pub fn compute_preference_loss(
    config: &PreferenceLossConfig,
    pairs: &[PreferenceLogProbs],
) -> EngineResult<PreferenceLossBreakdown> {
    config.validate()?;
    if pairs.is_empty() {
        return Err(EngineError::EmptyBatch { excluded: 0 });
    }

    let count = pairs.len() as f64;
    let mut loss_sum = 0.0;
    let mut chosen_sum = 0.0;
    let mut rejected_sum = 0.0;
    let mut correct = 0usize;
    let mut gradients = Vec::with_capacity(pairs.len());
    for (index, pair) in pairs.iter().enumerate() {
        ensure_finite("chosen_policy", index, pair.chosen_policy)?;
        ensure_finite("rejected_policy", index, pair.rejected_policy)?;
        let (chosen_reference, rejected_reference) = if config.reference_free {
            (0.0, 0.0)
        } else {
            ensure_finite("chosen_reference", index, pair.chosen_reference)?;
            ensure_finite("rejected_reference", index, pair.rejected_reference)?;
            (pair.chosen_reference, pair.rejected_reference)
        };

        let chosen = implicit_reward(pair.chosen_policy, chosen_reference, config.beta);
        let rejected = implicit_reward(pair.rejected_policy, rejected_reference, config.beta);
        let z = chosen - rejected;
        let (loss, dloss_dz) = match config.loss_kind {
            PreferenceLossKind::Sigmoid => {
                let smoothing = config.label_smoothing;
                let loss = -(1.0 - smoothing) * log_sigmoid(z) - smoothing * log_sigmoid(-z);
                let dloss_dz = -(1.0 - smoothing) * sigmoid(-z) + smoothing * sigmoid(z);
                (loss, dloss_dz)
            }
            PreferenceLossKind::Hinge => {
                let loss = (1.0 - z).max(0.0);
                (loss, if z < 1.0 { -1.0 } else { 0.0 })
            }
        };

        loss_sum += loss;
        chosen_sum += chosen;
        rejected_sum += rejected;
        if chosen > rejected {
            correct += 1;
        }
        gradients.push(PairGradient {
            chosen: config.beta * dloss_dz / count,
            rejected: -config.beta * dloss_dz / count,
        });
    }

    let loss = loss_sum / count;
    if !loss.is_finite() {
        return Err(EngineError::invalid_input(format!(
            "preference loss is non-finite: {loss}"
        )));
    }
    Ok(PreferenceLossBreakdown {
        loss,
        chosen_reward: chosen_sum / count,
        rejected_reward: rejected_sum / count,
        accuracy: correct as f64 / count,
        margin: (chosen_sum - rejected_sum) / count,
        gradients,
        pair_count: pairs.len(),
    })
}
