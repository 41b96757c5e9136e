//! Policy/reference divergence penalties and the adaptive KL coefficient.

use prefopt_types::{EngineError, EngineResult, EngineWarning, KlControllerSnapshot, Rollout};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Per-token divergence estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DivergenceEstimator {
    /// Signed log-ratio `logp - logp_ref`.
    #[default]
    Kl,
    /// Absolute log-ratio.
    Abs,
    /// Half squared log-ratio.
    Mse,
}

impl DivergenceEstimator {
    pub fn parse(label: &str) -> EngineResult<Self> {
        match label {
            "kl" => Ok(Self::Kl),
            "abs" => Ok(Self::Abs),
            "mse" => Ok(Self::Mse),
            other => Err(EngineError::configuration(format!(
                "unknown divergence estimator '{other}' (expected kl, abs or mse)"
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Kl => "kl",
            Self::Abs => "abs",
            Self::Mse => "mse",
        }
    }

    pub fn token(self, policy_logprob: f64, ref_logprob: f64) -> f64 {
        let log_ratio = policy_logprob - ref_logprob;
        match self {
            Self::Kl => log_ratio,
            Self::Abs => log_ratio.abs(),
            Self::Mse => 0.5 * log_ratio * log_ratio,
        }
    }
}

/// Divergence of one rollout from the reference model.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDivergence {
    pub per_token: Vec<f64>,
    /// Sum of per-token divergences (unscaled).
    pub total: f64,
}

impl SequenceDivergence {
    /// Sequence penalty `beta * total`.
    pub fn penalty(&self, beta: f64) -> f64 {
        beta * self.total
    }

    /// Per-token penalties `beta * d_t`.
    pub fn token_penalties(&self, beta: f64) -> Vec<f64> {
        self.per_token.iter().map(|value| beta * value).collect()
    }
}

/// Computes per-token and summed divergence for one rollout.
pub fn sequence_divergence(rollout: &Rollout, estimator: DivergenceEstimator) -> SequenceDivergence {
    let per_token: Vec<f64> = rollout
        .steps()
        .iter()
        .map(|step| estimator.token(step.old_logprob, step.ref_logprob))
        .collect();
    let total = per_token.iter().sum();
    SequenceDivergence { per_token, total }
}

/// Settings for the target-divergence controller.
#[derive(Debug, Clone, PartialEq)]
pub struct KlControllerConfig {
    pub target_kl: f64,
    pub beta_init: f64,
    pub beta_min: f64,
    pub beta_max: f64,
    /// When false β stays at `beta_init`.
    pub adaptive: bool,
    /// Relative dead band around the target: `[target/(1+tol), target*(1+tol)]`.
    pub tolerance: f64,
    /// Multiplicative step applied per adjustment; must be > 1.
    pub adaptation_factor: f64,
    /// Number of most recent step divergences averaged for each decision.
    pub window: usize,
    /// Divergence above `target * overflow_factor` with β at its ceiling is reported.
    pub overflow_factor: f64,
}

impl Default for KlControllerConfig {
    fn default() -> Self {
        Self {
            target_kl: 6.0,
            beta_init: 0.2,
            beta_min: 1e-4,
            beta_max: 10.0,
            adaptive: true,
            tolerance: 0.5,
            adaptation_factor: 1.5,
            window: 1,
            overflow_factor: 2.0,
        }
    }
}

impl KlControllerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.target_kl.is_finite() || self.target_kl <= 0.0 {
            return Err(EngineError::configuration(format!(
                "target_kl must be finite and > 0.0, found {}",
                self.target_kl
            )));
        }
        for (label, value) in [
            ("beta_init", self.beta_init),
            ("beta_min", self.beta_min),
            ("beta_max", self.beta_max),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::configuration(format!(
                    "{label} must be finite and >= 0.0, found {value}"
                )));
            }
        }
        if self.beta_min > self.beta_max {
            return Err(EngineError::configuration(format!(
                "beta_min {} must be <= beta_max {}",
                self.beta_min, self.beta_max
            )));
        }
        if !(self.beta_min..=self.beta_max).contains(&self.beta_init) {
            return Err(EngineError::configuration(format!(
                "beta_init {} must lie within [beta_min, beta_max] = [{}, {}]",
                self.beta_init, self.beta_min, self.beta_max
            )));
        }
        if self.adaptive && self.beta_min == 0.0 {
            return Err(EngineError::configuration(
                "beta_min must be > 0.0 when the adaptive controller is enabled",
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(EngineError::configuration(format!(
                "kl_tolerance must be finite and >= 0.0, found {}",
                self.tolerance
            )));
        }
        if !self.adaptation_factor.is_finite() || self.adaptation_factor <= 1.0 {
            return Err(EngineError::configuration(format!(
                "kl_adaptation_factor must be finite and > 1.0, found {}",
                self.adaptation_factor
            )));
        }
        if self.window == 0 {
            return Err(EngineError::configuration("kl_window must be > 0"));
        }
        if !self.overflow_factor.is_finite() || self.overflow_factor < 1.0 {
            return Err(EngineError::configuration(format!(
                "kl_overflow_factor must be finite and >= 1.0, found {}",
                self.overflow_factor
            )));
        }
        Ok(())
    }
}

/// Direction of a β transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaAdjustment {
    Increased,
    Decreased,
    Held,
}

/// Result of one controller transition.
#[derive(Debug, Clone, PartialEq)]
pub struct KlUpdate {
    pub previous_beta: f64,
    pub beta: f64,
    pub window_mean: f64,
    pub adjustment: BetaAdjustment,
    pub warning: Option<EngineWarning>,
}

/// Closed-form β state machine: one transition per optimization step.
#[derive(Debug, Clone)]
pub struct AdaptiveKlController {
    config: KlControllerConfig,
    beta: f64,
    window: VecDeque<f64>,
    updates: u64,
}

impl AdaptiveKlController {
    pub fn new(config: KlControllerConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            beta: config.beta_init,
            window: VecDeque::with_capacity(config.window),
            updates: 0,
            config,
        })
    }

    /// Resumes a controller; the restored β is clamped into the configured bounds.
    pub fn from_snapshot(
        config: KlControllerConfig,
        snapshot: &KlControllerSnapshot,
    ) -> EngineResult<Self> {
        let mut controller = Self::new(config)?;
        if !snapshot.beta.is_finite() || snapshot.window.iter().any(|value| !value.is_finite()) {
            return Err(EngineError::invalid_input(
                "kl controller snapshot contains non-finite values",
            ));
        }
        controller.beta = snapshot
            .beta
            .clamp(controller.config.beta_min, controller.config.beta_max);
        let keep = controller.config.window;
        let skip = snapshot.window.len().saturating_sub(keep);
        controller.window = snapshot.window.iter().skip(skip).copied().collect();
        controller.updates = snapshot.updates;
        Ok(controller)
    }

    pub fn config(&self) -> &KlControllerConfig {
        &self.config
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn snapshot(&self) -> KlControllerSnapshot {
        KlControllerSnapshot {
            beta: self.beta,
            window: self.window.iter().copied().collect(),
            updates: self.updates,
        }
    }

    /// Returns β to its initial value and forgets the observation window.
    pub fn reset(&mut self) {
        self.beta = self.config.beta_init;
        self.window.clear();
    }

    /// Records the mean divergence of one completed step and adapts β.
    #[tracing::instrument(level = "debug", skip(self), fields(beta = self.beta))]
    pub fn observe(&mut self, step_divergence: f64) -> EngineResult<KlUpdate> {
        if !step_divergence.is_finite() {
            return Err(EngineError::invalid_input(format!(
                "observed divergence must be finite, found {step_divergence}"
            )));
        }

        if self.window.len() == self.config.window {
            self.window.pop_front();
        }
        self.window.push_back(step_divergence);
        self.updates += 1;

        let window_mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        let previous_beta = self.beta;
        let target = self.config.target_kl;
        let upper = target * (1.0 + self.config.tolerance);
        let lower = target / (1.0 + self.config.tolerance);

        if self.config.adaptive {
            if window_mean > upper {
                self.beta = (self.beta * self.config.adaptation_factor).min(self.config.beta_max);
            } else if window_mean < lower {
                self.beta = (self.beta / self.config.adaptation_factor).max(self.config.beta_min);
            }
        }

        let adjustment = if self.beta > previous_beta {
            BetaAdjustment::Increased
        } else if self.beta < previous_beta {
            BetaAdjustment::Decreased
        } else {
            BetaAdjustment::Held
        };

        let warning = if self.beta >= self.config.beta_max
            && window_mean > target * self.config.overflow_factor
        {
            warn!(
                reason_code = "divergence_overflow",
                beta = self.beta,
                observed_divergence = window_mean,
                target_divergence = target,
                "kl coefficient is at its ceiling and divergence remains far above target"
            );
            Some(EngineWarning::DivergenceOverflow {
                beta: self.beta,
                observed_divergence: window_mean,
                target_divergence: target,
            })
        } else {
            None
        };

        debug!(
            previous_beta,
            beta = self.beta,
            window_mean,
            adjustment = ?adjustment,
            "kl controller transition"
        );
        Ok(KlUpdate {
            previous_beta,
            beta: self.beta,
            window_mean,
            adjustment,
            warning,
        })
    }
}
