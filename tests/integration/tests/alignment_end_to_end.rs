use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use async_trait::async_trait;
use prefopt_algorithm::{EngineConfig, PolicyParameters, ScoringFunction};
use prefopt_trainer::{
    AlignmentTrainer, EngineStateStore, GenerationService, LogProbEvaluator, ObjectiveBatch,
    PolicyOptimizer, PolicyUpdate, StateGeneration, StepMetrics, StepOutcome,
    TrainerCollaborators, TrainerConfig,
};
use prefopt_types::{EngineWarning, GeneratedSequence, ParameterLayer, PreferenceTriple};
use serde_json::json;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init();
}

/// Emits `"<prompt> answer"` with a fixed behaviour log-probability per token.
struct FixedGenerator {
    logprob: f64,
}

#[async_trait]
impl GenerationService for FixedGenerator {
    async fn generate(&self, prompts: &[String]) -> Result<Vec<GeneratedSequence>> {
        Ok(prompts
            .iter()
            .map(|prompt| {
                let response = format!("{prompt} answer");
                let count = response.split_whitespace().count();
                GeneratedSequence {
                    prompt: prompt.clone(),
                    response,
                    tokens: (0..count as u32).collect(),
                    logprobs: vec![self.logprob; count],
                }
            })
            .collect())
    }
}

/// Token log-probability is `-1 + 0.1 * head[0]`, so only the last layer moves it.
/// Responses containing "glitch" evaluate to NaN under every layer stack.
struct HeadEvaluator;

impl LogProbEvaluator for HeadEvaluator {
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
        let logprob = if response.contains("glitch") {
            f64::NAN
        } else {
            -1.0 + 0.1 * shift
        };
        Ok(vec![logprob; response.split_whitespace().count()])
    }
}

/// Adds a constant to every parameter on each update, regardless of the gradient.
struct ShiftOptimizer {
    shift: f64,
}

impl PolicyOptimizer for ShiftOptimizer {
    fn apply(&mut self, policy: &mut PolicyParameters, _update: PolicyUpdate<'_>) -> Result<()> {
        for index in 0..policy.layer_count() {
            let width = policy.layers()[index].len();
            policy.apply_update(index, &vec![self.shift; width])?;
        }
        Ok(())
    }
}

fn policy() -> PolicyParameters {
    PolicyParameters::new(vec![
        ParameterLayer::new("embed", vec![0.5, -0.5, 0.25]),
        ParameterLayer::new("block", vec![1.0, 2.0]),
        ParameterLayer::new("head", vec![0.0, 0.0]),
    ])
    .expect("policy")
}

fn build_trainer(
    engine: EngineConfig,
    scoring: Arc<dyn ScoringFunction>,
    generator_logprob: f64,
    shift: f64,
) -> AlignmentTrainer {
    AlignmentTrainer::new(
        TrainerConfig {
            engine,
            ..TrainerConfig::default()
        },
        policy(),
        TrainerCollaborators {
            generator: Arc::new(FixedGenerator {
                logprob: generator_logprob,
            }),
            scoring,
            evaluator: Arc::new(HeadEvaluator),
            optimizer: Box::new(ShiftOptimizer { shift }),
        },
    )
    .expect("trainer")
}

fn prompts(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn unique_temp_dir(label: &str) -> PathBuf {
    let tick = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after unix epoch")
        .as_nanos();
    let counter = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "prefopt-integration-{label}-{}-{tick}-{counter}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[tokio::test]
async fn integration_batch_with_one_non_finite_reward_takes_a_three_rollout_step() {
    init_tracing();
    let engine = EngineConfig::from_json(&json!({
        "use_score_norm": true,
        "score_clip": 5.0
    }))
    .expect("config");
    let scoring: Arc<dyn ScoringFunction> = Arc::new(|prompt: &str, _: &str| {
        if prompt == "broken" {
            f64::INFINITY
        } else {
            prompt.len() as f64
        }
    });
    let mut trainer = build_trainer(engine, scoring, -1.0, 0.0);

    let outcome = trainer
        .train_step(ObjectiveBatch::Rl {
            prompts: prompts(&["a", "bb", "broken", "dddd"]),
        })
        .await
        .expect("run must continue");

    let report = outcome.report().expect("step applied");
    assert_eq!(report.included, 3);
    assert_eq!(report.excluded, vec![2]);
    assert_eq!(trainer.reward_stats().count, 3);
    assert!(report.warnings.iter().any(|warning| matches!(
        warning,
        EngineWarning::UnscorableSequence {
            sequence_index: 2,
            ..
        }
    )));
    match &report.metrics {
        StepMetrics::Rl(metrics) => {
            // Normalized rewards of a, bb, dddd are centered on the batch mean.
            assert!(metrics.mean_reward.abs() < 1e-6);
            assert_eq!(metrics.update.epochs, 1);
        }
        other => panic!("unexpected metrics {other:?}"),
    }
}

#[tokio::test]
async fn integration_degenerate_rollout_is_dropped_in_every_advantage_mode() {
    init_tracing();
    let modes = [
        json!({ "advantage_mode": "token_gae", "gamma": 0.99, "lambda": 0.95 }),
        json!({ "advantage_mode": "token_gae", "whiten_advantages": true }),
        json!({ "advantage_mode": "sequence", "whiten_advantages": true }),
    ];
    for mode in modes {
        let mut settings = mode.clone();
        settings["use_score_norm"] = json!(true);
        let engine = EngineConfig::from_json(&settings).expect("config");
        let scoring: Arc<dyn ScoringFunction> =
            Arc::new(|prompt: &str, _: &str| prompt.len() as f64);
        let mut trainer = build_trainer(engine, scoring, -1.0, 0.01);

        let outcome = trainer
            .train_step(ObjectiveBatch::Rl {
                prompts: prompts(&["a", "glitch", "ccc", "dddd"]),
            })
            .await
            .expect("run must continue");

        let report = outcome.report().expect("step applied");
        assert_eq!(report.included, 3, "{mode}");
        assert_eq!(report.excluded, vec![1], "{mode}");
        assert!(
            report
                .warnings
                .contains(&EngineWarning::NonFiniteAdvantage { rollout_index: 1 }),
            "{mode}"
        );
        assert!(report.loss.is_finite(), "{mode}");
        match &report.metrics {
            StepMetrics::Rl(metrics) => {
                assert!(metrics.mean_divergence.is_finite(), "{mode}");
                assert!(metrics.kl.beta.is_finite(), "{mode}");
            }
            other => panic!("unexpected metrics {other:?}"),
        }
        assert_eq!(trainer.global_step(), 1);
    }
}

#[tokio::test]
async fn integration_shared_reference_layers_track_policy_updates() {
    init_tracing();
    let engine =
        EngineConfig::from_json(&json!({ "shared_prefix_layer_count": 2 })).expect("config");
    let mut trainer = build_trainer(engine, Arc::new(|_: &str, _: &str| 1.0), -1.0, 0.25);

    let outcome = trainer
        .train_step(ObjectiveBatch::Rl {
            prompts: prompts(&["x", "y"]),
        })
        .await
        .expect("step");
    assert!(outcome.is_applied());

    let policy = trainer.policy();
    let reference = trainer.reference();
    for index in 0..2 {
        assert!(reference.is_shared(index));
        assert_eq!(
            reference.layer(policy, index).expect("shared layer").values,
            policy.layers()[index].values
        );
    }
    assert!(!reference.is_shared(2));
    assert_eq!(
        reference.layer(policy, 2).expect("frozen layer").values,
        vec![0.0, 0.0]
    );
    assert_eq!(policy.layers()[2].values, vec![0.25, 0.25]);
}

#[tokio::test]
async fn integration_adaptive_beta_rises_to_ceiling_then_holds() {
    init_tracing();
    let engine = EngineConfig::from_json(&json!({
        "target_kl": 0.1,
        "beta_init": 0.1,
        "beta_min": 0.01,
        "beta_max": 1.0
    }))
    .expect("config");
    // Behaviour log-probs sit 0.5 above the reference on each of two tokens.
    let mut trainer = build_trainer(engine, Arc::new(|_: &str, _: &str| 1.0), -0.5, 0.0);

    let mut betas = Vec::new();
    let mut overflow_steps = 0;
    for _ in 0..10 {
        let outcome = trainer
            .train_step(ObjectiveBatch::Rl {
                prompts: prompts(&["x"]),
            })
            .await
            .expect("step");
        let report = outcome.report().expect("applied");
        match &report.metrics {
            StepMetrics::Rl(metrics) => assert!((metrics.mean_divergence - 1.0).abs() < 1e-12),
            other => panic!("unexpected metrics {other:?}"),
        }
        if report
            .warnings
            .iter()
            .any(|warning| matches!(warning, EngineWarning::DivergenceOverflow { .. }))
        {
            overflow_steps += 1;
        }
        betas.push(trainer.beta());
    }

    let ceiling = betas
        .iter()
        .position(|beta| *beta == 1.0)
        .expect("beta reaches its ceiling");
    for pair in betas[..=ceiling].windows(2) {
        assert!(pair[1] > pair[0], "beta must strictly increase: {betas:?}");
    }
    assert!(betas[ceiling..].iter().all(|beta| *beta == 1.0));
    assert_eq!(ceiling, 5);
    assert_eq!(overflow_steps, 10 - ceiling);
}

#[tokio::test]
async fn integration_engine_state_survives_checkpoint_and_resume() {
    init_tracing();
    let engine = EngineConfig::from_json(&json!({
        "use_score_norm": true,
        "target_kl": 0.1,
        "beta_init": 0.1,
        "beta_min": 0.01,
        "beta_max": 1.0
    }))
    .expect("config");
    let scoring: Arc<dyn ScoringFunction> = Arc::new(|prompt: &str, _: &str| prompt.len() as f64);
    let mut trainer = build_trainer(engine.clone(), scoring.clone(), -0.5, 0.0);
    for batch in [&["a", "bbb"][..], &["cc", "dddd"][..]] {
        trainer
            .train_step(ObjectiveBatch::Rl {
                prompts: prompts(batch),
            })
            .await
            .expect("step");
    }

    let dir = unique_temp_dir("resume");
    let store = EngineStateStore::new(dir.clone());
    store.save(&trainer.engine_state("run-e2e")).expect("save");
    let restored = store.resume().expect("resume").expect("saved state");
    assert_eq!(restored.generation, StateGeneration::Current);
    let checkpoint = restored.checkpoint;

    let mut resumed = build_trainer(engine, scoring, -0.5, 0.0);
    resumed.restore_engine_state(&checkpoint).expect("restore");
    assert_eq!(resumed.global_step(), 2);
    assert_eq!(resumed.beta(), trainer.beta());
    assert_eq!(resumed.reward_stats(), trainer.reward_stats());
    std::fs::remove_dir_all(dir).expect("cleanup temp dir");
}

#[tokio::test]
async fn integration_preference_and_rl_steps_share_one_policy() {
    init_tracing();
    let engine = EngineConfig::from_json(&json!({
        "preference": { "beta": 0.1, "loss_type": "sigmoid", "label_smoothing": 0.05 }
    }))
    .expect("config");
    let mut trainer = build_trainer(engine, Arc::new(|_: &str, _: &str| 1.0), -1.0, 0.1);

    let preference = trainer
        .train_step(ObjectiveBatch::Preference {
            triples: vec![
                PreferenceTriple::new("q1", "short", "a much longer answer"),
                PreferenceTriple::new("q2", "two words", "one"),
            ],
        })
        .await
        .expect("preference step");
    let report = preference.report().expect("applied");
    match &report.metrics {
        StepMetrics::Preference(breakdown) => {
            assert_eq!(breakdown.pair_count, 2);
            assert!(breakdown.loss.is_finite());
        }
        other => panic!("unexpected metrics {other:?}"),
    }

    let rl = trainer
        .train_step(ObjectiveBatch::Rl {
            prompts: prompts(&["x"]),
        })
        .await
        .expect("rl step");
    assert!(rl.is_applied());
    assert_eq!(trainer.global_step(), 2);
}

#[tokio::test]
async fn integration_pipelined_run_survives_a_failed_scoring_batch() {
    init_tracing();
    let scoring: Arc<dyn ScoringFunction> = Arc::new(|prompt: &str, _: &str| {
        if prompt.starts_with("nan") {
            f64::NAN
        } else {
            1.0
        }
    });
    let mut trainer = build_trainer(EngineConfig::default(), scoring, -1.0, 0.0);

    let outcomes = trainer
        .run_pipelined(vec![
            prompts(&["one", "two"]),
            prompts(&["nan-a", "nan-b"]),
            prompts(&["three"]),
        ])
        .await
        .expect("pipelined run");

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].is_applied());
    assert!(matches!(outcomes[1], StepOutcome::Skipped { .. }));
    assert!(outcomes[2].is_applied());
    assert_eq!(trainer.global_step(), 2);
}
