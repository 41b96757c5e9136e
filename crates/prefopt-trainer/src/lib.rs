//! Step orchestration for reward-conditioned policy optimization.
//!
//! The trainer owns the policy, the reference model, the reward scorer and the
//! KL controller, and drives one synchronous optimization step at a time.
//! Collaborators that live outside the engine (generation, log-probability
//! evaluation, parameter updates) are injected as trait objects.

mod reward_model;
mod state_store;

pub use reward_model::{RewardModelOptimizer, RewardModelTrainer};
pub use state_store::{
    EngineStateCheckpoint, EngineStateStore, RestoredEngineState, StateGeneration,
    CURRENT_CHECKPOINT_VERSION,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use prefopt_algorithm::{
    build_reference_model, compute_clipped_policy_loss, compute_preference_loss,
    estimate_advantages, summarize_epochs, AdaptiveKlController, ClippedUpdateSummary,
    EngineConfig, KlUpdate, PairGradient, PolicyGradient, PolicyParameters,
    PreferenceLossBreakdown, ReferenceModel, RewardLossBreakdown, RewardScorer, ScoringFunction,
    ValueBaseline,
};
use prefopt_types::{
    EngineError, EngineWarning, GeneratedSequence, ParameterLayer, PreferenceLogProbs,
    PreferenceTriple, Reward, Rollout, RunningStatsSnapshot, ScoredBatch,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// External service that samples responses from the current policy.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Returns one sequence per prompt with per-token log-probabilities.
    async fn generate(&self, prompts: &[String]) -> Result<Vec<GeneratedSequence>>;
}

/// Evaluates per-token log-probabilities of a response under a layer stack.
///
/// Called with the policy's layers for new log-probabilities and with a
/// resolved reference view for reference log-probabilities.
pub trait LogProbEvaluator: Send + Sync {
    fn token_logprobs(
        &self,
        layers: &[&ParameterLayer],
        prompt: &str,
        response: &str,
    ) -> Result<Vec<f64>>;
}

/// Gradient signal handed to the policy optimizer.
#[derive(Debug, Clone, Copy)]
pub enum PolicyUpdate<'a> {
    /// Per-token coefficients of the clipped surrogate for each rollout.
    Clipped {
        rollouts: &'a [Rollout],
        gradient: &'a PolicyGradient,
    },
    /// Per-pair coefficients of the preference loss. `pairs[i]` matches `gradients[i]`.
    Preference {
        pairs: &'a [&'a PreferenceTriple],
        gradients: &'a [PairGradient],
    },
}

/// Turns a gradient signal into a parameter update on the policy.
pub trait PolicyOptimizer: Send {
    fn apply(&mut self, policy: &mut PolicyParameters, update: PolicyUpdate<'_>) -> Result<()>;
}

/// One optimization step's input, tagged by training paradigm.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectiveBatch {
    /// Generate from these prompts, score, and take a clipped policy step.
    Rl { prompts: Vec<String> },
    /// Take a direct preference step over these triples.
    Preference { triples: Vec<PreferenceTriple> },
}

/// Paradigm-specific metrics of an applied step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepMetrics {
    Rl(RlStepMetrics),
    Preference(PreferenceLossBreakdown),
    RewardModel(RewardLossBreakdown),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RlStepMetrics {
    pub update: ClippedUpdateSummary,
    pub mean_reward: f64,
    /// Mean per-sequence divergence of the rollouts that took part in the update.
    pub mean_divergence: f64,
    pub kl: KlUpdate,
}

/// Summary of an applied optimization step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub global_step: u64,
    pub loss: f64,
    pub batch_size: usize,
    pub included: usize,
    /// Batch indices dropped by scoring or ratio filtering.
    pub excluded: Vec<usize>,
    pub warnings: Vec<EngineWarning>,
    pub metrics: StepMetrics,
}

/// Result of one call to a trainer step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Applied(StepReport),
    /// No parameter update was made; the run can continue.
    Skipped {
        reason: EngineError,
        warnings: Vec<EngineWarning>,
    },
}

impl StepOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn report(&self) -> Option<&StepReport> {
        match self {
            Self::Applied(report) => Some(report),
            Self::Skipped { .. } => None,
        }
    }
}

/// Runtime settings for the alignment trainer.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub engine: EngineConfig,
    pub rollout_id_prefix: String,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            rollout_id_prefix: "rollout".to_string(),
        }
    }
}

/// External collaborators injected into the trainer.
pub struct TrainerCollaborators {
    pub generator: Arc<dyn GenerationService>,
    pub scoring: Arc<dyn ScoringFunction>,
    pub evaluator: Arc<dyn LogProbEvaluator>,
    pub optimizer: Box<dyn PolicyOptimizer>,
}

/// Drives RL and direct-preference optimization steps over one policy.
pub struct AlignmentTrainer {
    config: TrainerConfig,
    policy: PolicyParameters,
    reference: ReferenceModel,
    scorer: RewardScorer,
    kl: AdaptiveKlController,
    generator: Arc<dyn GenerationService>,
    scoring: Arc<dyn ScoringFunction>,
    evaluator: Arc<dyn LogProbEvaluator>,
    optimizer: Box<dyn PolicyOptimizer>,
    global_step: u64,
    phase: Option<String>,
}

impl AlignmentTrainer {
    /// Builds the reference model and engine state; configuration errors abort here.
    pub fn new(
        config: TrainerConfig,
        policy: PolicyParameters,
        collaborators: TrainerCollaborators,
    ) -> Result<Self> {
        config
            .engine
            .validate()
            .context("invalid engine configuration")?;
        let reference = build_reference_model(&policy, config.engine.shared_prefix_layer_count)
            .context("build reference model")?;
        let scorer =
            RewardScorer::new(config.engine.score.clone()).context("build reward scorer")?;
        let kl = AdaptiveKlController::new(config.engine.kl.clone())
            .context("build kl controller")?;
        info!(
            policy_parameters = policy.parameter_count(),
            shared_reference_parameters = reference.shared_parameter_count(),
            owned_reference_parameters = reference.owned_parameter_count(),
            beta = kl.beta(),
            "alignment trainer initialized"
        );
        Ok(Self {
            config,
            policy,
            reference,
            scorer,
            kl,
            generator: collaborators.generator,
            scoring: collaborators.scoring,
            evaluator: collaborators.evaluator,
            optimizer: collaborators.optimizer,
            global_step: 0,
            phase: None,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn policy(&self) -> &PolicyParameters {
        &self.policy
    }

    pub fn reference(&self) -> &ReferenceModel {
        &self.reference
    }

    pub fn beta(&self) -> f64 {
        self.kl.beta()
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    pub fn reward_stats(&self) -> RunningStatsSnapshot {
        self.scorer.stats_snapshot()
    }

    /// Folds a peer worker's reward statistics in before the next step.
    pub fn merge_peer_reward_stats(&mut self, peer: RunningStatsSnapshot) -> Result<()> {
        self.scorer
            .merge_peer_stats(peer)
            .context("merge peer reward statistics")
    }

    /// Starts a named training phase.
    ///
    /// Returns true when reward normalization statistics were cleared.
    pub fn begin_phase(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        let reset = self.config.engine.reset_stats_on_phase_change;
        if reset {
            self.scorer.reset_stats();
        }
        info!(phase = %name, reset_reward_stats = reset, "training phase started");
        self.phase = Some(name);
        reset
    }

    /// Replaces the policy layers and rebinds shared reference layers by name.
    pub fn replace_policy_layers(&mut self, layers: Vec<ParameterLayer>) -> Result<()> {
        self.policy
            .replace_layers(layers)
            .context("replace policy layers")?;
        self.reference
            .rebind(&self.policy)
            .context("rebind reference model")
    }

    /// Rebuilds the reference model from the current policy.
    pub fn refresh_reference(&mut self) -> Result<()> {
        self.reference = build_reference_model(
            &self.policy,
            self.config.engine.shared_prefix_layer_count,
        )
        .context("rebuild reference model")?;
        Ok(())
    }

    /// Captures the engine's resumable state.
    pub fn engine_state(&self, run_id: impl Into<String>) -> EngineStateCheckpoint {
        EngineStateCheckpoint::capture(
            run_id,
            self.global_step,
            self.scorer.stats_snapshot(),
            self.kl.snapshot(),
        )
    }

    /// Restores reward statistics, β and the step counter from a checkpoint.
    pub fn restore_engine_state(&mut self, checkpoint: &EngineStateCheckpoint) -> Result<()> {
        self.scorer
            .restore_stats(checkpoint.reward_stats)
            .context("restore reward statistics")?;
        self.kl = AdaptiveKlController::from_snapshot(
            self.config.engine.kl.clone(),
            &checkpoint.kl_controller,
        )
        .context("restore kl controller")?;
        self.global_step = checkpoint.global_step;
        Ok(())
    }

    /// Runs one optimization step for the tagged objective.
    pub async fn train_step(&mut self, batch: ObjectiveBatch) -> Result<StepOutcome> {
        match batch {
            ObjectiveBatch::Rl { prompts } => {
                let sequences = self
                    .generator
                    .generate(&prompts)
                    .await
                    .context("generate rollouts")?;
                self.rl_step(sequences)
            }
            ObjectiveBatch::Preference { triples } => self.preference_step(&triples),
        }
    }

    /// Runs RL steps over prompt batches, generating batch n+1 while batch n is
    /// scored and optimized.
    ///
    /// Each batch is fully scored before its advantages are estimated. A
    /// generated batch may come from the policy one step behind the one it
    /// updates; the recorded behaviour log-probabilities keep the ratio correct.
    pub async fn run_pipelined(&mut self, prompt_batches: Vec<Vec<String>>) -> Result<Vec<StepOutcome>> {
        let mut outcomes = Vec::with_capacity(prompt_batches.len());
        let mut batches = prompt_batches.into_iter();
        let mut pending = batches.next().map(|prompts| self.spawn_generation(prompts));
        while let Some(handle) = pending.take() {
            let sequences = handle
                .await
                .context("generation task failed to complete")?
                .context("generate rollouts")?;
            pending = batches.next().map(|prompts| self.spawn_generation(prompts));
            match self.rl_step(sequences) {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    if let Some(handle) = pending.take() {
                        handle.abort();
                    }
                    return Err(error);
                }
            }
        }
        Ok(outcomes)
    }

    fn spawn_generation(&self, prompts: Vec<String>) -> JoinHandle<Result<Vec<GeneratedSequence>>> {
        let generator = Arc::clone(&self.generator);
        tokio::spawn(async move { generator.generate(&prompts).await })
    }

    /// Scores generated sequences and applies the clipped policy update.
    #[tracing::instrument(level = "debug", skip(self, sequences), fields(step = self.global_step, sequences = sequences.len()))]
    pub fn rl_step(&mut self, sequences: Vec<GeneratedSequence>) -> Result<StepOutcome> {
        let batch_size = sequences.len();
        if sequences.is_empty() {
            return skip_or_abort(EngineError::EmptyBatch { excluded: 0 }, Vec::new());
        }

        let scored = match self.score_sequences(&sequences) {
            Ok(scored) => scored,
            Err(error) => return skip_or_abort(error, Vec::new()),
        };
        let mut warnings = scored.warnings;
        let mut excluded: BTreeSet<usize> = scored.excluded.into_iter().collect();
        let (sequence_indices, rewards): (Vec<usize>, Vec<Reward>) =
            scored.rewards.into_iter().unzip();

        let rollouts = self.build_rollouts(sequences, &sequence_indices)?;
        let advantage_batch = match estimate_advantages(
            &self.config.engine.advantage,
            &rollouts,
            &rewards,
            self.kl.beta(),
            ValueBaseline::None,
        ) {
            Ok(batch) => batch,
            Err(error) => return skip_or_abort(error, warnings),
        };

        let update_config = self.config.engine.clipped_update.clone();
        let mut epoch_losses = Vec::with_capacity(update_config.epochs);
        for epoch in 0..update_config.epochs {
            let new_logprobs = {
                let policy_layers: Vec<&ParameterLayer> = self.policy.layers().iter().collect();
                rollouts
                    .iter()
                    .map(|rollout| {
                        self.evaluator
                            .token_logprobs(&policy_layers, rollout.prompt(), rollout.response())
                            .with_context(|| {
                                format!("evaluate policy log-probabilities for '{}'", rollout.rollout_id())
                            })
                    })
                    .collect::<Result<Vec<_>>>()?
            };

            let loss = match compute_clipped_policy_loss(
                &update_config,
                &rollouts,
                &advantage_batch.advantages,
                &new_logprobs,
            ) {
                Ok(loss) => loss,
                Err(EngineError::EmptyBatch { excluded: dropped }) if epoch > 0 => {
                    warn!(
                        reason_code = "empty_batch",
                        epoch,
                        excluded = dropped,
                        "stopping update epochs early; every rollout became invalid"
                    );
                    break;
                }
                Err(error) => return skip_or_abort(error, warnings),
            };

            for warning in &loss.warnings {
                let warning = remap_rollout_warning(warning, &sequence_indices);
                if !warnings.contains(&warning) {
                    warnings.push(warning);
                }
            }
            excluded.extend(
                loss.excluded_rollouts
                    .iter()
                    .map(|index| sequence_indices[*index]),
            );

            self.optimizer
                .apply(
                    &mut self.policy,
                    PolicyUpdate::Clipped {
                        rollouts: &rollouts,
                        gradient: &loss.gradient,
                    },
                )
                .context("apply clipped policy update")?;
            epoch_losses.push(loss);
        }

        let (Some(summary), Some(last)) = (summarize_epochs(&epoch_losses), epoch_losses.last())
        else {
            bail!("clipped update produced no epochs");
        };

        let included: Vec<usize> = last.gradient.included().map(|(index, _)| index).collect();
        let mean_divergence = mean(
            included
                .iter()
                .map(|index| advantage_batch.advantages[*index].divergence),
        );
        let mean_reward = mean(included.iter().map(|index| rewards[*index].value));
        let kl = self
            .kl
            .observe(mean_divergence)
            .context("update kl controller")?;
        if let Some(warning) = &kl.warning {
            warnings.push(warning.clone());
        }

        self.global_step += 1;
        let excluded: Vec<usize> = excluded.into_iter().collect();
        info!(
            global_step = self.global_step,
            loss = summary.final_loss,
            beta = kl.beta,
            mean_reward,
            mean_divergence,
            included = batch_size - excluded.len(),
            excluded = excluded.len(),
            "applied rl step"
        );
        Ok(StepOutcome::Applied(StepReport {
            global_step: self.global_step,
            loss: summary.final_loss,
            batch_size,
            included: batch_size - excluded.len(),
            excluded,
            warnings,
            metrics: StepMetrics::Rl(RlStepMetrics {
                update: summary,
                mean_reward,
                mean_divergence,
                kl,
            }),
        }))
    }

    /// Applies one direct preference step.
    ///
    /// β comes from the preference configuration and is not adapted.
    #[tracing::instrument(level = "debug", skip(self, triples), fields(step = self.global_step, pairs = triples.len()))]
    pub fn preference_step(&mut self, triples: &[PreferenceTriple]) -> Result<StepOutcome> {
        let config = self.config.engine.preference.clone();
        let mut warnings = Vec::new();
        let mut excluded = Vec::new();
        let mut kept = Vec::with_capacity(triples.len());
        let mut pairs = Vec::with_capacity(triples.len());
        {
            let policy_layers: Vec<&ParameterLayer> = self.policy.layers().iter().collect();
            let reference = self
                .reference
                .resolve(&self.policy)
                .context("resolve reference model")?;
            for (index, triple) in triples.iter().enumerate() {
                let evaluator = self.evaluator.as_ref();
                let chosen_policy =
                    sequence_logprob(evaluator, &policy_layers, &triple.prompt, &triple.chosen)?;
                let rejected_policy =
                    sequence_logprob(evaluator, &policy_layers, &triple.prompt, &triple.rejected)?;
                let (chosen_reference, rejected_reference) = if config.reference_free {
                    (0.0, 0.0)
                } else {
                    (
                        sequence_logprob(
                            evaluator,
                            reference.layers(),
                            &triple.prompt,
                            &triple.chosen,
                        )?,
                        sequence_logprob(
                            evaluator,
                            reference.layers(),
                            &triple.prompt,
                            &triple.rejected,
                        )?,
                    )
                };
                let pair = PreferenceLogProbs::new(
                    chosen_policy,
                    chosen_reference,
                    rejected_policy,
                    rejected_reference,
                );
                if [
                    pair.chosen_policy,
                    pair.chosen_reference,
                    pair.rejected_policy,
                    pair.rejected_reference,
                ]
                .iter()
                .any(|value| !value.is_finite())
                {
                    warn!(
                        reason_code = "non_finite_preference_pair",
                        pair_index = index,
                        "excluding preference pair with non-finite log-probability"
                    );
                    warnings.push(EngineWarning::NonFinitePreferencePair { pair_index: index });
                    excluded.push(index);
                    continue;
                }
                kept.push(triple);
                pairs.push(pair);
            }
        }

        if pairs.is_empty() {
            return skip_or_abort(
                EngineError::EmptyBatch {
                    excluded: excluded.len(),
                },
                warnings,
            );
        }
        let breakdown = match compute_preference_loss(&config, &pairs) {
            Ok(breakdown) => breakdown,
            Err(error) => return skip_or_abort(error, warnings),
        };

        self.optimizer
            .apply(
                &mut self.policy,
                PolicyUpdate::Preference {
                    pairs: &kept,
                    gradients: &breakdown.gradients,
                },
            )
            .context("apply preference policy update")?;

        self.global_step += 1;
        info!(
            global_step = self.global_step,
            loss = breakdown.loss,
            accuracy = breakdown.accuracy,
            margin = breakdown.margin,
            included = pairs.len(),
            excluded = excluded.len(),
            "applied preference step"
        );
        Ok(StepOutcome::Applied(StepReport {
            global_step: self.global_step,
            loss: breakdown.loss,
            batch_size: triples.len(),
            included: pairs.len(),
            excluded,
            warnings,
            metrics: StepMetrics::Preference(breakdown),
        }))
    }

    fn score_sequences(&mut self, sequences: &[GeneratedSequence]) -> Result<ScoredBatch, EngineError> {
        if self.config.engine.exclude_unscorable {
            return self.scorer.score_filtered(self.scoring.as_ref(), sequences);
        }
        let rewards = self.scorer.score(self.scoring.as_ref(), sequences)?;
        Ok(ScoredBatch {
            rewards: rewards.into_iter().enumerate().collect(),
            excluded: Vec::new(),
            warnings: Vec::new(),
        })
    }

    /// Pairs each scored sequence with reference log-probabilities.
    fn build_rollouts(
        &self,
        sequences: Vec<GeneratedSequence>,
        sequence_indices: &[usize],
    ) -> Result<Vec<Rollout>> {
        let reference = self
            .reference
            .resolve(&self.policy)
            .context("resolve reference model")?;
        let mut slots: Vec<Option<GeneratedSequence>> = sequences.into_iter().map(Some).collect();
        let mut rollouts = Vec::with_capacity(sequence_indices.len());
        for index in sequence_indices {
            let sequence = slots
                .get_mut(*index)
                .and_then(Option::take)
                .with_context(|| format!("scored sequence index {index} is out of range"))?;
            let ref_logprobs = self
                .evaluator
                .token_logprobs(reference.layers(), &sequence.prompt, &sequence.response)
                .with_context(|| format!("evaluate reference log-probabilities for sequence {index}"))?;
            let rollout_id = format!(
                "{}-{}-{}",
                self.config.rollout_id_prefix,
                self.global_step + 1,
                index
            );
            rollouts.push(
                Rollout::from_generation(rollout_id, sequence, &ref_logprobs)
                    .context("assemble rollout")?,
            );
        }
        Ok(rollouts)
    }
}

fn sequence_logprob(
    evaluator: &dyn LogProbEvaluator,
    layers: &[&ParameterLayer],
    prompt: &str,
    response: &str,
) -> Result<f64> {
    let logprobs = evaluator
        .token_logprobs(layers, prompt, response)
        .context("evaluate sequence log-probability")?;
    Ok(logprobs.iter().sum())
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Maps rollout positions in a filtered batch back to positions in the generated batch.
fn remap_rollout_warning(warning: &EngineWarning, sequence_indices: &[usize]) -> EngineWarning {
    let remap = |index: usize| sequence_indices.get(index).copied().unwrap_or(index);
    match warning {
        EngineWarning::NonFiniteRatio { rollout_index } => EngineWarning::NonFiniteRatio {
            rollout_index: remap(*rollout_index),
        },
        EngineWarning::NonFiniteAdvantage { rollout_index } => EngineWarning::NonFiniteAdvantage {
            rollout_index: remap(*rollout_index),
        },
        other => other.clone(),
    }
}

/// Batch-local failures skip the step; anything else aborts the run.
pub(crate) fn skip_or_abort(error: EngineError, warnings: Vec<EngineWarning>) -> Result<StepOutcome> {
    if error.is_batch_local() {
        warn!(
            reason_code = error.reason_code(),
            error = %error,
            "skipping optimization step"
        );
        return Ok(StepOutcome::Skipped {
            reason: error,
            warnings,
        });
    }
    Err(anyhow::Error::new(error).context("optimization step failed"))
}

#[cfg(test)]
mod tests {
    use super::{
        AlignmentTrainer, GenerationService, LogProbEvaluator, ObjectiveBatch, PolicyOptimizer,
        PolicyUpdate, StepMetrics, StepOutcome, TrainerCollaborators, TrainerConfig,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use prefopt_algorithm::{EngineConfig, PolicyParameters};
    use prefopt_types::{
        EngineError, EngineWarning, GeneratedSequence, ParameterLayer, PreferenceTriple,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct WordGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationService for WordGenerator {
        async fn generate(&self, prompts: &[String]) -> Result<Vec<GeneratedSequence>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(prompts
                .iter()
                .map(|prompt| {
                    let response = format!("{prompt} answer");
                    let tokens: Vec<u32> = (0..response.split_whitespace().count() as u32).collect();
                    GeneratedSequence {
                        prompt: prompt.clone(),
                        response,
                        logprobs: vec![-1.0; tokens.len()],
                        tokens,
                    }
                })
                .collect())
        }
    }

    /// Every token's log-probability is `-1 + 0.1 * (first value of the last layer)`.
    struct LastLayerEvaluator;

    impl LogProbEvaluator for LastLayerEvaluator {
        fn token_logprobs(
            &self,
            layers: &[&ParameterLayer],
            _prompt: &str,
            response: &str,
        ) -> Result<Vec<f64>> {
            let shift = layers
                .last()
                .and_then(|layer| layer.values.first())
                .copied()
                .unwrap_or(0.0);
            let logprob = if response.contains("degenerate") {
                f64::NAN
            } else {
                -1.0 + 0.1 * shift
            };
            Ok(vec![logprob; response.split_whitespace().count()])
        }
    }

    #[derive(Default)]
    struct RecordingOptimizer {
        applied: Arc<Mutex<Vec<usize>>>,
    }

    impl PolicyOptimizer for RecordingOptimizer {
        fn apply(&mut self, policy: &mut PolicyParameters, update: PolicyUpdate<'_>) -> Result<()> {
            let (count, total) = match update {
                PolicyUpdate::Clipped { gradient, .. } => {
                    let included: Vec<&[f64]> =
                        gradient.included().map(|(_, coefficients)| coefficients).collect();
                    let total: f64 = included.iter().flat_map(|values| values.iter()).sum();
                    (included.len(), total)
                }
                PolicyUpdate::Preference { gradients, .. } => (
                    gradients.len(),
                    gradients.iter().map(|pair| pair.chosen).sum::<f64>(),
                ),
            };
            self.applied.lock().expect("optimizer log").push(count);
            let last = policy.layer_count() - 1;
            let width = policy.layers()[last].len();
            policy.apply_update(last, &vec![-0.5 * total; width])?;
            Ok(())
        }
    }

    fn policy() -> PolicyParameters {
        PolicyParameters::new(vec![
            ParameterLayer::new("embed", vec![0.0, 0.0]),
            ParameterLayer::new("head", vec![0.0, 0.0]),
        ])
        .expect("policy")
    }

    fn trainer_with(
        engine: EngineConfig,
        scoring: Arc<dyn prefopt_algorithm::ScoringFunction>,
    ) -> (AlignmentTrainer, Arc<Mutex<Vec<usize>>>, Arc<WordGenerator>) {
        let optimizer = RecordingOptimizer::default();
        let applied = optimizer.applied.clone();
        let generator = Arc::new(WordGenerator {
            calls: AtomicUsize::new(0),
        });
        let trainer = AlignmentTrainer::new(
            TrainerConfig {
                engine,
                ..TrainerConfig::default()
            },
            policy(),
            TrainerCollaborators {
                generator: generator.clone(),
                scoring,
                evaluator: Arc::new(LastLayerEvaluator),
                optimizer: Box::new(optimizer),
            },
        )
        .expect("trainer");
        (trainer, applied, generator)
    }

    fn nan_for_bad_prompts() -> Arc<dyn prefopt_algorithm::ScoringFunction> {
        Arc::new(|prompt: &str, _response: &str| {
            if prompt.contains("bad") {
                f64::NAN
            } else {
                prompt.len() as f64 / 10.0
            }
        })
    }

    #[tokio::test]
    async fn contract_c01_unscorable_rollout_is_excluded_not_fatal() {
        let (mut trainer, applied, _) = trainer_with(EngineConfig::default(), nan_for_bad_prompts());
        let outcome = trainer
            .train_step(ObjectiveBatch::Rl {
                prompts: vec![
                    "alpha".to_string(),
                    "bad prompt".to_string(),
                    "gamma".to_string(),
                    "delta".to_string(),
                ],
            })
            .await
            .expect("step");

        let report = outcome.report().expect("applied step");
        assert_eq!(report.batch_size, 4);
        assert_eq!(report.included, 3);
        assert_eq!(report.excluded, vec![1]);
        assert!(matches!(
            report.warnings.as_slice(),
            [EngineWarning::UnscorableSequence {
                sequence_index: 1,
                ..
            }]
        ));
        assert_eq!(applied.lock().expect("log").as_slice(), &[3]);
        assert_eq!(trainer.global_step(), 1);
    }

    #[tokio::test]
    async fn functional_strict_scoring_skips_the_whole_batch() {
        let engine = EngineConfig {
            exclude_unscorable: false,
            ..EngineConfig::default()
        };
        let (mut trainer, applied, _) = trainer_with(engine, nan_for_bad_prompts());
        let outcome = trainer
            .train_step(ObjectiveBatch::Rl {
                prompts: vec!["alpha".to_string(), "bad prompt".to_string()],
            })
            .await
            .expect("skipped step is not an error");

        match outcome {
            StepOutcome::Skipped { reason, .. } => {
                assert!(matches!(reason, EngineError::ScoringFailure { ref indices, .. } if indices == &vec![1]));
            }
            StepOutcome::Applied(_) => panic!("expected skipped step"),
        }
        assert!(applied.lock().expect("log").is_empty());
        assert_eq!(trainer.global_step(), 0);
        assert_eq!(trainer.reward_stats().count, 0);
    }

    #[tokio::test]
    async fn functional_degenerate_log_probabilities_exclude_rollout_and_keep_step() {
        let (mut trainer, applied, _) = trainer_with(
            EngineConfig::default(),
            Arc::new(|_: &str, _: &str| 1.0),
        );
        let outcome = trainer
            .rl_step(vec![
                GeneratedSequence {
                    prompt: "p0".to_string(),
                    response: "fine words".to_string(),
                    tokens: vec![1, 2],
                    logprobs: vec![-1.0, -1.0],
                },
                GeneratedSequence {
                    prompt: "p1".to_string(),
                    response: "degenerate words".to_string(),
                    tokens: vec![3, 4],
                    logprobs: vec![-1.0, -1.0],
                },
            ])
            .expect("step");

        let report = outcome.report().expect("applied");
        assert_eq!(report.excluded, vec![1]);
        assert!(report
            .warnings
            .iter()
            .any(|warning| warning.reason_code() == "non_finite_advantage"
                || warning.reason_code() == "non_finite_ratio"));
        assert_eq!(applied.lock().expect("log").as_slice(), &[1]);
    }

    async fn step_with_one_degenerate_prompt(engine: EngineConfig) -> (StepOutcome, Vec<usize>) {
        let (mut trainer, applied, _) = trainer_with(engine, Arc::new(|_: &str, _: &str| 1.0));
        let outcome = trainer
            .train_step(ObjectiveBatch::Rl {
                prompts: ["alpha", "beta", "degenerate", "gamma"]
                    .iter()
                    .map(|prompt| prompt.to_string())
                    .collect(),
            })
            .await
            .expect("a degenerate rollout must not abort the run");
        let applied = applied.lock().expect("log").clone();
        (outcome, applied)
    }

    #[tokio::test]
    async fn regression_token_gae_mode_excludes_degenerate_rollout() {
        let engine = EngineConfig::from_json(&serde_json::json!({
            "advantage_mode": "token_gae"
        }))
        .expect("config");
        let (outcome, applied) = step_with_one_degenerate_prompt(engine).await;

        let report = outcome.report().expect("applied");
        assert_eq!(report.included, 3);
        assert_eq!(report.excluded, vec![2]);
        assert!(report
            .warnings
            .contains(&EngineWarning::NonFiniteAdvantage { rollout_index: 2 }));
        assert!(report.loss.is_finite());
        assert_eq!(applied, vec![3]);
    }

    #[tokio::test]
    async fn regression_whitened_advantages_survive_degenerate_rollout() {
        for mode in ["sequence", "token_gae"] {
            let engine = EngineConfig::from_json(&serde_json::json!({
                "advantage_mode": mode,
                "whiten_advantages": true
            }))
            .expect("config");
            let (outcome, applied) = step_with_one_degenerate_prompt(engine).await;

            let report = outcome.report().expect("applied");
            assert_eq!(report.excluded, vec![2], "mode {mode}");
            assert_eq!(applied, vec![3], "mode {mode}");
            match &report.metrics {
                StepMetrics::Rl(metrics) => assert!(metrics.mean_divergence.is_finite()),
                other => panic!("unexpected metrics {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn functional_all_rollouts_degenerate_skips_with_empty_batch() {
        let (mut trainer, applied, _) = trainer_with(
            EngineConfig::default(),
            Arc::new(|_: &str, _: &str| 1.0),
        );
        let outcome = trainer
            .rl_step(vec![GeneratedSequence {
                prompt: "p".to_string(),
                response: "degenerate".to_string(),
                tokens: vec![1],
                logprobs: vec![-1.0],
            }])
            .expect("step");
        assert!(matches!(
            outcome,
            StepOutcome::Skipped {
                reason: EngineError::EmptyBatch { excluded: 1 },
                ..
            }
        ));
        assert!(applied.lock().expect("log").is_empty());
    }

    #[tokio::test]
    async fn functional_kl_controller_updates_once_per_step_across_epochs() {
        let engine = EngineConfig::from_json(&serde_json::json!({ "ppo_epochs": 3 }))
            .expect("config");
        let (mut trainer, applied, _) =
            trainer_with(engine, Arc::new(|_: &str, _: &str| 1.0));
        let outcome = trainer
            .train_step(ObjectiveBatch::Rl {
                prompts: vec!["one".to_string(), "two".to_string()],
            })
            .await
            .expect("step");
        let report = outcome.report().expect("applied");
        match &report.metrics {
            StepMetrics::Rl(metrics) => {
                assert_eq!(metrics.update.epochs, 3);
                assert_eq!(metrics.kl.previous_beta, 0.2);
            }
            other => panic!("unexpected metrics {other:?}"),
        }
        assert_eq!(applied.lock().expect("log").len(), 3);
        assert_eq!(trainer.kl.updates(), 1);
    }

    #[tokio::test]
    async fn functional_preference_step_reports_metrics_and_updates_policy() {
        let engine = EngineConfig::from_json(&serde_json::json!({
            "shared_prefix_layer_count": 0,
            "preference": { "beta": 0.0 }
        }))
        .expect("config");
        let (mut trainer, applied, _) = trainer_with(engine, Arc::new(|_: &str, _: &str| 0.0));
        let outcome = trainer
            .train_step(ObjectiveBatch::Preference {
                triples: vec![
                    PreferenceTriple::new("q", "long good answer", "bad"),
                    PreferenceTriple::new("q", "ok", "degenerate"),
                ],
            })
            .await
            .expect("step");

        let report = outcome.report().expect("applied");
        assert_eq!(report.included, 1);
        assert_eq!(report.excluded, vec![1]);
        assert_eq!(
            report.warnings,
            vec![EngineWarning::NonFinitePreferencePair { pair_index: 1 }]
        );
        match &report.metrics {
            StepMetrics::Preference(breakdown) => {
                assert!((breakdown.loss - std::f64::consts::LN_2).abs() < 1e-12);
            }
            other => panic!("unexpected metrics {other:?}"),
        }
        assert_eq!(applied.lock().expect("log").as_slice(), &[1]);
    }

    #[tokio::test]
    async fn functional_pipelined_run_generates_every_batch_once() {
        let (mut trainer, applied, generator) =
            trainer_with(EngineConfig::default(), nan_for_bad_prompts());
        let outcomes = trainer
            .run_pipelined(vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["bad".to_string()],
                vec!["c".to_string()],
            ])
            .await
            .expect("pipelined run");

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_applied());
        assert!(matches!(
            outcomes[1],
            StepOutcome::Skipped {
                reason: EngineError::ScoringFailure { .. },
                ..
            }
        ));
        assert!(outcomes[2].is_applied());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(applied.lock().expect("log").len(), 2);
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn functional_begin_phase_resets_stats_only_when_configured() {
        let engine = EngineConfig::from_json(&serde_json::json!({ "use_score_norm": true }))
            .expect("config");
        let (mut trainer, _, _) = trainer_with(engine, Arc::new(|_: &str, _: &str| 1.0));
        trainer
            .merge_peer_reward_stats(prefopt_types::RunningStatsSnapshot {
                count: 10,
                mean: 1.0,
                variance: 0.5,
            })
            .expect("merge");
        assert!(!trainer.begin_phase("warmup"));
        assert_eq!(trainer.reward_stats().count, 10);
        assert_eq!(trainer.phase(), Some("warmup"));

        let engine = EngineConfig::from_json(&serde_json::json!({
            "use_score_norm": true,
            "reset_stats_on_phase_change": true
        }))
        .expect("config");
        let (mut trainer, _, _) = trainer_with(engine, Arc::new(|_: &str, _: &str| 1.0));
        trainer
            .merge_peer_reward_stats(prefopt_types::RunningStatsSnapshot {
                count: 10,
                mean: 1.0,
                variance: 0.5,
            })
            .expect("merge");
        assert!(trainer.begin_phase("main"));
        assert_eq!(trainer.reward_stats().count, 0);
    }

    struct SlowAfterFirstGenerator {
        calls: AtomicUsize,
        completed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GenerationService for SlowAfterFirstGenerator {
        async fn generate(&self, prompts: &[String]) -> Result<Vec<GeneratedSequence>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            let sequences = WordGenerator {
                calls: AtomicUsize::new(0),
            }
            .generate(prompts)
            .await?;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(sequences)
        }
    }

    struct FailingOptimizer;

    impl PolicyOptimizer for FailingOptimizer {
        fn apply(&mut self, _policy: &mut PolicyParameters, _update: PolicyUpdate<'_>) -> Result<()> {
            anyhow::bail!("optimizer device lost")
        }
    }

    #[tokio::test]
    async fn regression_aborted_run_cancels_pending_generation() {
        let completed = Arc::new(AtomicUsize::new(0));
        let mut trainer = AlignmentTrainer::new(
            TrainerConfig::default(),
            policy(),
            TrainerCollaborators {
                generator: Arc::new(SlowAfterFirstGenerator {
                    calls: AtomicUsize::new(0),
                    completed: completed.clone(),
                }),
                scoring: Arc::new(|_: &str, _: &str| 1.0),
                evaluator: Arc::new(LastLayerEvaluator),
                optimizer: Box::new(FailingOptimizer),
            },
        )
        .expect("trainer");

        let error = trainer
            .run_pipelined(vec![vec!["first".to_string()], vec!["second".to_string()]])
            .await
            .expect_err("optimizer failure aborts the run");
        assert!(format!("{error:#}").contains("optimizer device lost"));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(trainer.global_step(), 0);
    }

    #[test]
    fn regression_shared_prefix_beyond_policy_depth_fails_construction() {
        let engine = EngineConfig {
            shared_prefix_layer_count: 5,
            ..EngineConfig::default()
        };
        let result = AlignmentTrainer::new(
            TrainerConfig {
                engine,
                ..TrainerConfig::default()
            },
            policy(),
            TrainerCollaborators {
                generator: Arc::new(WordGenerator {
                    calls: AtomicUsize::new(0),
                }),
                scoring: Arc::new(|_: &str, _: &str| 1.0),
                evaluator: Arc::new(LastLayerEvaluator),
                optimizer: Box::new(RecordingOptimizer::default()),
            },
        );
        let error = result.err().expect("construction must fail");
        assert!(format!("{error:#}").contains("configuration error"));
    }

    #[test]
    fn functional_engine_state_round_trips_through_restore() {
        let (mut trainer, _, _) = trainer_with(EngineConfig::default(), nan_for_bad_prompts());
        let mut checkpoint = trainer.engine_state("run-7");
        checkpoint.global_step = 9;
        checkpoint.kl_controller.beta = 0.8;
        trainer.restore_engine_state(&checkpoint).expect("restore");
        assert_eq!(trainer.global_step(), 9);
        assert_eq!(trainer.beta(), 0.8);
    }
}
