//! Reward-conditioned policy optimization math.
//!
//! Every loss in this crate is a pure function over explicit inputs. Callers
//! pick the objective at the call site; the only mutable state lives in
//! [`RunningStats`] and [`AdaptiveKlController`], both owned by the caller.

mod advantage;
mod config;
mod divergence;
mod dpo;
mod gae;
mod numerics;
mod ppo;
mod reference_model;
mod reward_loss;
mod reward_scorer;
mod reward_stats;

pub use advantage::{
    estimate_advantages, Advantage, AdvantageBatch, AdvantageConfig, AdvantageMode, ValueBaseline,
};
pub use config::EngineConfig;
pub use divergence::{
    sequence_divergence, AdaptiveKlController, BetaAdjustment, DivergenceEstimator,
    KlControllerConfig, KlUpdate, SequenceDivergence,
};
pub use dpo::{
    compute_preference_loss, implicit_reward, preference_loss, PairGradient,
    PreferenceLossBreakdown, PreferenceLossConfig, PreferenceLossKind,
};
pub use gae::{compute_token_gae, GaeConfig, TokenAdvantages};
pub use numerics::{log_sigmoid, sigmoid};
pub use ppo::{
    compute_clipped_policy_loss, summarize_epochs, surrogate_token_loss, ClippedPolicyLoss,
    ClippedUpdateConfig, ClippedUpdateSummary, PolicyGradient,
};
pub use reference_model::{
    build_reference_model, LayerBinding, PolicyParameters, ReferenceModel, ReferenceView,
};
pub use reward_loss::{
    compute_pairwise_reward_loss, pairwise_reward_loss, RewardLossBreakdown, RewardLossConfig,
    ScoreGradient,
};
pub use reward_scorer::{clip_reward, RewardScorer, Scorable, ScoreConfig, ScoringFunction};
pub use reward_stats::RunningStats;
