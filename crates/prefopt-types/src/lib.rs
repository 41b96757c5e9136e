//! Shared data types for preference-optimization pipelines.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by the optimization engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The external scorer produced a non-finite or missing score.
    #[error("scoring failure: {reason} (sequences {indices:?})")]
    ScoringFailure { indices: Vec<usize>, reason: String },
    /// Invalid engine configuration detected at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Every rollout was excluded before the loss could be formed.
    #[error("empty batch: all {excluded} rollouts were excluded")]
    EmptyBatch { excluded: usize },
    /// Caller-supplied inputs are malformed (length mismatch, non-finite values).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Creates a configuration error from any displayable message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an invalid-input error from any displayable message.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Returns true when the error only invalidates the current batch.
    pub fn is_batch_local(&self) -> bool {
        matches!(self, Self::ScoringFailure { .. } | Self::EmptyBatch { .. })
    }

    /// Stable machine-readable code used in logs and step reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ScoringFailure { .. } => "scoring_failure",
            Self::Configuration(_) => "configuration_error",
            Self::EmptyBatch { .. } => "empty_batch",
            Self::InvalidInput(_) => "invalid_input",
        }
    }
}

/// Non-fatal condition surfaced alongside a successful or skipped step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineWarning {
    /// A rollout produced a non-finite probability ratio and was dropped.
    NonFiniteRatio { rollout_index: usize },
    /// A rollout carried a non-finite advantage into the clipped update and was dropped.
    NonFiniteAdvantage { rollout_index: usize },
    /// A preference pair had a non-finite sequence log-probability and was dropped.
    NonFinitePreferencePair { pair_index: usize },
    /// A generated sequence received a non-finite score and was dropped.
    UnscorableSequence { sequence_index: usize, raw_score: f64 },
    /// The KL coefficient is pinned at its ceiling and divergence is still far above target.
    DivergenceOverflow {
        beta: f64,
        observed_divergence: f64,
        target_divergence: f64,
    },
}

impl EngineWarning {
    /// Stable machine-readable code used in logs and step reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NonFiniteRatio { .. } => "non_finite_ratio",
            Self::NonFiniteAdvantage { .. } => "non_finite_advantage",
            Self::NonFinitePreferencePair { .. } => "non_finite_preference_pair",
            Self::UnscorableSequence { .. } => "unscorable_sequence",
            Self::DivergenceOverflow { .. } => "divergence_overflow",
        }
    }
}

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;

/// Output of the external generation service for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSequence {
    pub prompt: String,
    pub response: String,
    pub tokens: Vec<u32>,
    /// Per-token log-probabilities under the policy that sampled the response.
    pub logprobs: Vec<f64>,
}

/// One generated token with its behaviour-policy and reference log-probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenStep {
    pub token: u32,
    pub old_logprob: f64,
    pub ref_logprob: f64,
}

impl TokenStep {
    pub fn new(token: u32, old_logprob: f64, ref_logprob: f64) -> Self {
        Self {
            token,
            old_logprob,
            ref_logprob,
        }
    }
}

/// Immutable record of one generated response.
///
/// Rewards are carried in a parallel slice aligned by index; the rollout
/// itself never changes after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    rollout_id: String,
    prompt: String,
    response: String,
    steps: Vec<TokenStep>,
}

impl Rollout {
    /// Creates a rollout from its token trace.
    pub fn new(
        rollout_id: impl Into<String>,
        prompt: impl Into<String>,
        response: impl Into<String>,
        steps: Vec<TokenStep>,
    ) -> Self {
        Self {
            rollout_id: rollout_id.into(),
            prompt: prompt.into(),
            response: response.into(),
            steps,
        }
    }

    /// Pairs a generated sequence with reference log-probabilities.
    pub fn from_generation(
        rollout_id: impl Into<String>,
        sequence: GeneratedSequence,
        ref_logprobs: &[f64],
    ) -> EngineResult<Self> {
        let rollout_id = rollout_id.into();
        if sequence.tokens.len() != sequence.logprobs.len()
            || sequence.tokens.len() != ref_logprobs.len()
        {
            return Err(EngineError::invalid_input(format!(
                "rollout '{rollout_id}' length mismatch: tokens={}, logprobs={}, ref_logprobs={}",
                sequence.tokens.len(),
                sequence.logprobs.len(),
                ref_logprobs.len()
            )));
        }
        let steps = sequence
            .tokens
            .iter()
            .zip(sequence.logprobs.iter())
            .zip(ref_logprobs.iter())
            .map(|((token, old), reference)| TokenStep::new(*token, *old, *reference))
            .collect();
        Ok(Self {
            rollout_id,
            prompt: sequence.prompt,
            response: sequence.response,
            steps,
        })
    }

    pub fn rollout_id(&self) -> &str {
        &self.rollout_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn steps(&self) -> &[TokenStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Scalar reward for one sequence after the scoring pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    /// Value returned by the external scorer.
    pub raw: f64,
    /// Value after optional normalization and clipping.
    pub value: f64,
}

impl Reward {
    pub fn new(raw: f64, value: f64) -> Self {
        Self { raw, value }
    }
}

/// Rewards for the scorable subset of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredBatch {
    /// `(sequence_index, reward)` for every sequence that scored finitely.
    pub rewards: Vec<(usize, Reward)>,
    /// Sequences dropped because their raw score was not finite.
    pub excluded: Vec<usize>,
    pub warnings: Vec<EngineWarning>,
}

/// Immutable view of running reward statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RunningStatsSnapshot {
    pub count: u64,
    pub mean: f64,
    /// Population variance of every value observed so far.
    pub variance: f64,
}

/// Persistable state of the adaptive KL coefficient controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlControllerSnapshot {
    pub beta: f64,
    #[serde(default)]
    pub window: Vec<f64>,
    #[serde(default)]
    pub updates: u64,
}

/// Prompt with a preferred and a dispreferred response.
///
/// The same prompt may appear in many triples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreferenceTriple {
    pub prompt: String,
    pub chosen: String,
    pub rejected: String,
}

impl PreferenceTriple {
    pub fn new(
        prompt: impl Into<String>,
        chosen: impl Into<String>,
        rejected: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            chosen: chosen.into(),
            rejected: rejected.into(),
        }
    }
}

/// Sequence log-probabilities for one preference pair under policy and reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreferenceLogProbs {
    pub chosen_policy: f64,
    pub chosen_reference: f64,
    pub rejected_policy: f64,
    pub rejected_reference: f64,
}

impl PreferenceLogProbs {
    pub fn new(
        chosen_policy: f64,
        chosen_reference: f64,
        rejected_policy: f64,
        rejected_reference: f64,
    ) -> Self {
        Self {
            chosen_policy,
            chosen_reference,
            rejected_policy,
            rejected_reference,
        }
    }
}

/// Reward-model scores for the two responses of one preference pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredPair {
    pub chosen_score: f64,
    pub rejected_score: f64,
    /// Optional required score gap for this pair.
    #[serde(default)]
    pub margin: Option<f64>,
}

impl ScoredPair {
    pub fn new(chosen_score: f64, rejected_score: f64) -> Self {
        Self {
            chosen_score,
            rejected_score,
            margin: None,
        }
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = Some(margin);
        self
    }
}

/// Named block of model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterLayer {
    pub name: String,
    pub values: Vec<f64>,
}

impl ParameterLayer {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
