//! Reward scoring pipeline: external score, running normalization, clipping.

use crate::reward_stats::RunningStats;
use prefopt_types::{
    EngineError, EngineResult, EngineWarning, GeneratedSequence, Reward, Rollout,
    RunningStatsSnapshot, ScoredBatch,
};
use tracing::warn;

/// External scoring function supplied by the caller.
///
/// Returning `None` marks the score as missing, which is treated exactly like
/// a non-finite score.
pub trait ScoringFunction: Send + Sync {
    fn score(&self, prompt: &str, response: &str) -> Option<f64>;
}

impl<F> ScoringFunction for F
where
    F: Fn(&str, &str) -> f64 + Send + Sync,
{
    fn score(&self, prompt: &str, response: &str) -> Option<f64> {
        Some(self(prompt, response))
    }
}

/// Anything that carries the prompt/response pair a scorer needs.
pub trait Scorable {
    fn prompt(&self) -> &str;
    fn response(&self) -> &str;
}

impl Scorable for GeneratedSequence {
    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn response(&self) -> &str {
        &self.response
    }
}

impl Scorable for Rollout {
    fn prompt(&self) -> &str {
        Rollout::prompt(self)
    }

    fn response(&self) -> &str {
        Rollout::response(self)
    }
}

/// Score post-processing options.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreConfig {
    /// Divide scores by the running standard deviation.
    pub use_score_scaling: bool,
    /// Also subtract the running mean before scaling.
    pub use_score_norm: bool,
    /// Optional symmetric clip bound applied after normalization.
    pub score_clip: Option<f64>,
    /// Epsilon added to the running variance before the square root.
    pub epsilon: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            use_score_scaling: false,
            use_score_norm: false,
            score_clip: None,
            epsilon: 1e-8,
        }
    }
}

impl ScoreConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(EngineError::configuration(format!(
                "score epsilon must be finite and > 0.0, found {}",
                self.epsilon
            )));
        }
        if let Some(bound) = self.score_clip {
            if !bound.is_finite() || bound <= 0.0 {
                return Err(EngineError::configuration(format!(
                    "score_clip must be finite and > 0.0, found {bound}"
                )));
            }
        }
        Ok(())
    }

    /// True when running statistics take part in the transform.
    pub fn tracks_statistics(&self) -> bool {
        self.use_score_scaling || self.use_score_norm
    }
}

/// Clamps a reward to `[-bound, bound]`.
pub fn clip_reward(value: f64, bound: f64) -> f64 {
    value.clamp(-bound, bound)
}

/// Turns raw external scores into training rewards.
///
/// Owns the running statistics exclusively; they are mutated at most once per
/// scored batch.
#[derive(Debug, Clone)]
pub struct RewardScorer {
    config: ScoreConfig,
    stats: RunningStats,
}

impl RewardScorer {
    pub fn new(config: ScoreConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stats: RunningStats::new(),
        })
    }

    /// Creates a scorer that resumes from persisted statistics.
    pub fn with_stats(config: ScoreConfig, snapshot: RunningStatsSnapshot) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stats: RunningStats::from_snapshot(snapshot)?,
        })
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> RunningStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn restore_stats(&mut self, snapshot: RunningStatsSnapshot) -> EngineResult<()> {
        self.stats.restore(snapshot)
    }

    /// Folds a peer worker's statistics in at a synchronization point.
    pub fn merge_peer_stats(&mut self, peer: RunningStatsSnapshot) -> EngineResult<()> {
        self.stats.merge(peer)
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Scores a batch, failing the whole batch on any non-finite or missing score.
    #[tracing::instrument(level = "debug", skip(self, scorer, batch), fields(batch_len = batch.len()))]
    pub fn score<S: Scorable>(
        &mut self,
        scorer: &dyn ScoringFunction,
        batch: &[S],
    ) -> EngineResult<Vec<Reward>> {
        let raw = collect_raw_scores(scorer, batch);
        self.transform(&raw)
    }

    /// Scores a batch, dropping sequences whose score is non-finite or missing.
    #[tracing::instrument(level = "debug", skip(self, scorer, batch), fields(batch_len = batch.len()))]
    pub fn score_filtered<S: Scorable>(
        &mut self,
        scorer: &dyn ScoringFunction,
        batch: &[S],
    ) -> EngineResult<ScoredBatch> {
        let raw = collect_raw_scores(scorer, batch);
        self.transform_filtered(&raw)
    }

    /// Applies the pipeline to already-computed raw scores (strict).
    pub fn transform(&mut self, raw: &[f64]) -> EngineResult<Vec<Reward>> {
        let invalid = non_finite_indices(raw);
        if !invalid.is_empty() {
            return Err(EngineError::ScoringFailure {
                indices: invalid,
                reason: "scorer returned a non-finite or missing value".to_string(),
            });
        }

        if self.config.tracks_statistics() {
            self.stats.update(raw)?;
        }
        Ok(raw
            .iter()
            .map(|value| Reward::new(*value, self.post_process(*value)))
            .collect())
    }

    /// Applies the pipeline to the finite subset of raw scores.
    pub fn transform_filtered(&mut self, raw: &[f64]) -> EngineResult<ScoredBatch> {
        let excluded = non_finite_indices(raw);
        if !raw.is_empty() && excluded.len() == raw.len() {
            return Err(EngineError::ScoringFailure {
                indices: excluded,
                reason: "every sequence in the batch was unscorable".to_string(),
            });
        }

        let warnings = excluded
            .iter()
            .map(|index| {
                warn!(
                    reason_code = "unscorable_sequence",
                    sequence_index = index,
                    raw_score = raw[*index],
                    "excluding sequence with non-finite score"
                );
                EngineWarning::UnscorableSequence {
                    sequence_index: *index,
                    raw_score: raw[*index],
                }
            })
            .collect();

        let finite: Vec<(usize, f64)> = raw
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, value)| value.is_finite())
            .collect();
        if self.config.tracks_statistics() {
            let values: Vec<f64> = finite.iter().map(|(_, value)| *value).collect();
            self.stats.update(&values)?;
        }

        Ok(ScoredBatch {
            rewards: finite
                .into_iter()
                .map(|(index, value)| (index, Reward::new(value, self.post_process(value))))
                .collect(),
            excluded,
            warnings,
        })
    }

    fn post_process(&self, raw: f64) -> f64 {
        let mut value = raw;
        if self.config.tracks_statistics() {
            let scale = self.stats.std(self.config.epsilon);
            if self.config.use_score_norm {
                value = (value - self.stats.mean()) / scale;
            } else {
                value /= scale;
            }
        }
        if let Some(bound) = self.config.score_clip {
            value = clip_reward(value, bound);
        }
        value
    }
}

fn collect_raw_scores<S: Scorable>(scorer: &dyn ScoringFunction, batch: &[S]) -> Vec<f64> {
    batch
        .iter()
        .map(|item| {
            scorer
                .score(item.prompt(), item.response())
                .unwrap_or(f64::NAN)
        })
        .collect()
}

fn non_finite_indices(values: &[f64]) -> Vec<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, value)| !value.is_finite())
        .map(|(index, _)| index)
        .collect()
}
