//! Engine-wide configuration parsed from a flat JSON object.

use crate::advantage::{AdvantageConfig, AdvantageMode};
use crate::divergence::{DivergenceEstimator, KlControllerConfig};
use crate::dpo::{PreferenceLossConfig, PreferenceLossKind};
use crate::gae::GaeConfig;
use crate::ppo::ClippedUpdateConfig;
use crate::reward_loss::RewardLossConfig;
use crate::reward_scorer::ScoreConfig;
use prefopt_types::{EngineError, EngineResult};
use serde_json::{Map, Value};

/// Every recognized engine option, grouped by the component that consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub score: ScoreConfig,
    pub kl: KlControllerConfig,
    pub advantage: AdvantageConfig,
    pub clipped_update: ClippedUpdateConfig,
    pub preference: PreferenceLossConfig,
    pub reward_loss: RewardLossConfig,
    /// Leading policy layers the reference model reads live from the policy.
    pub shared_prefix_layer_count: usize,
    /// Clear reward normalization statistics when a new training phase begins.
    pub reset_stats_on_phase_change: bool,
    /// Drop unscorable sequences from a batch instead of failing the batch.
    pub exclude_unscorable: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            score: ScoreConfig::default(),
            kl: KlControllerConfig::default(),
            advantage: AdvantageConfig::default(),
            clipped_update: ClippedUpdateConfig::default(),
            preference: PreferenceLossConfig::default(),
            reward_loss: RewardLossConfig::default(),
            shared_prefix_layer_count: 0,
            reset_stats_on_phase_change: false,
            exclude_unscorable: true,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a configuration object.
    ///
    /// Missing keys keep their defaults and unknown keys are ignored.
    pub fn from_json(value: &Value) -> EngineResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| EngineError::configuration("engine config JSON payload must be an object"))?;
        let mut config = Self::default();

        if let Some(value) = read_bool(object, &["use_score_scaling"])? {
            config.score.use_score_scaling = value;
        }
        if let Some(value) = read_bool(object, &["use_score_norm"])? {
            config.score.use_score_norm = value;
        }
        if let Some(value) = lookup(object, &["score_clip"]) {
            config.score.score_clip = if value.is_null() {
                None
            } else {
                Some(as_f64("score_clip", value)?)
            };
        }
        if let Some(value) = read_f64(object, &["score_epsilon"])? {
            config.score.epsilon = value;
        }

        if let Some(value) = read_f64(object, &["target_kl"])? {
            config.kl.target_kl = value;
        }
        if let Some(value) = read_f64(object, &["beta_init", "β_init"])? {
            config.kl.beta_init = value;
        }
        if let Some(value) = read_f64(object, &["beta_min", "β_min"])? {
            config.kl.beta_min = value;
        }
        if let Some(value) = read_f64(object, &["beta_max", "β_max"])? {
            config.kl.beta_max = value;
        }
        if let Some(value) = read_bool(object, &["adaptive_kl"])? {
            config.kl.adaptive = value;
        }
        if let Some(value) = read_f64(object, &["kl_tolerance"])? {
            config.kl.tolerance = value;
        }
        if let Some(value) = read_f64(object, &["kl_adaptation_factor"])? {
            config.kl.adaptation_factor = value;
        }
        if let Some(value) = read_usize(object, &["kl_window"])? {
            config.kl.window = value;
        }
        if let Some(value) = read_f64(object, &["kl_overflow_factor"])? {
            config.kl.overflow_factor = value;
        }

        if let Some(value) = read_str(object, &["divergence_estimator"])? {
            config.advantage.estimator = DivergenceEstimator::parse(value)?;
        }
        if let Some(value) = read_bool(object, &["whiten_advantages"])? {
            config.advantage.whiten = value;
        }
        let mode = read_str(object, &["advantage_mode"])?.unwrap_or("sequence");
        config.advantage.mode = match mode.trim().to_ascii_lowercase().as_str() {
            "sequence" => AdvantageMode::Sequence,
            "token_gae" => {
                let mut gae = GaeConfig::default();
                if let Some(value) = read_f64(object, &["gamma"])? {
                    gae.gamma = value;
                }
                if let Some(value) = read_f64(object, &["lambda"])? {
                    gae.lambda = value;
                }
                AdvantageMode::TokenGae(gae)
            }
            other => {
                return Err(EngineError::configuration(format!(
                    "unsupported advantage_mode '{other}' (expected sequence or token_gae)"
                )))
            }
        };

        if let Some(value) = read_f64(object, &["clip_epsilon"])? {
            config.clipped_update.clip_epsilon = value;
        }
        if let Some(value) = read_usize(object, &["ppo_epochs"])? {
            config.clipped_update.epochs = value;
        }
        if let Some(value) = read_usize(object, &["shared_prefix_layer_count"])? {
            config.shared_prefix_layer_count = value;
        }

        if let Some(preference) = lookup(object, &["preference"]) {
            let preference = preference.as_object().ok_or_else(|| {
                EngineError::configuration("engine config field 'preference' must be an object")
            })?;
            if let Some(value) = read_f64(preference, &["beta", "β"])? {
                config.preference.beta = value;
            }
            if let Some(value) = read_str(preference, &["loss_type"])? {
                config.preference.loss_kind = PreferenceLossKind::parse(value)?;
            }
            if let Some(value) = read_f64(preference, &["label_smoothing"])? {
                config.preference.label_smoothing = value;
            }
            if let Some(value) = read_bool(preference, &["reference_free"])? {
                config.preference.reference_free = value;
            }
        }

        if let Some(value) = lookup(object, &["center_rewards_coefficient"]) {
            config.reward_loss.center_rewards_coefficient = if value.is_null() {
                None
            } else {
                Some(as_f64("center_rewards_coefficient", value)?)
            };
        }
        if let Some(value) = read_bool(object, &["reset_stats_on_phase_change"])? {
            config.reset_stats_on_phase_change = value;
        }
        if let Some(value) = read_bool(object, &["exclude_unscorable"])? {
            config.exclude_unscorable = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.score.validate()?;
        self.kl.validate()?;
        self.advantage.validate()?;
        self.clipped_update.validate()?;
        self.preference.validate()?;
        self.reward_loss.validate()
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

fn as_f64(key: &str, value: &Value) -> EngineResult<f64> {
    value.as_f64().ok_or_else(|| {
        EngineError::configuration(format!("engine config field '{key}' must be numeric"))
    })
}

fn read_f64(object: &Map<String, Value>, keys: &[&str]) -> EngineResult<Option<f64>> {
    lookup(object, keys)
        .map(|value| as_f64(keys[0], value))
        .transpose()
}

fn read_bool(object: &Map<String, Value>, keys: &[&str]) -> EngineResult<Option<bool>> {
    lookup(object, keys)
        .map(|value| {
            value.as_bool().ok_or_else(|| {
                EngineError::configuration(format!(
                    "engine config field '{}' must be boolean",
                    keys[0]
                ))
            })
        })
        .transpose()
}

fn read_usize(object: &Map<String, Value>, keys: &[&str]) -> EngineResult<Option<usize>> {
    lookup(object, keys)
        .map(|value| {
            value
                .as_u64()
                .and_then(|value| usize::try_from(value).ok())
                .ok_or_else(|| {
                    EngineError::configuration(format!(
                        "engine config field '{}' must be a non-negative integer",
                        keys[0]
                    ))
                })
        })
        .transpose()
}

fn read_str<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> EngineResult<Option<&'a str>> {
    lookup(object, keys)
        .map(|value| {
            value.as_str().ok_or_else(|| {
                EngineError::configuration(format!(
                    "engine config field '{}' must be a string",
                    keys[0]
                ))
            })
        })
        .transpose()
}
