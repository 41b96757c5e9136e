//! Generalized Advantage Estimation over per-token rewards of one response.

use prefopt_types::{EngineError, EngineResult};

/// Discount settings for token-level advantage estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaeConfig {
    /// Reward discount factor.
    pub gamma: f64,
    /// GAE trace decay coefficient.
    pub lambda: f64,
}

impl Default for GaeConfig {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            lambda: 0.95,
        }
    }
}

impl GaeConfig {
    pub fn validate(&self) -> EngineResult<()> {
        validate_probability("gamma", self.gamma)?;
        validate_probability("lambda", self.lambda)
    }
}

/// Per-token advantages and value targets for one response.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenAdvantages {
    pub advantages: Vec<f64>,
    pub returns: Vec<f64>,
}

/// Runs GAE backwards over a single response.
///
/// The response ends the episode, so nothing is bootstrapped past the last token.
pub fn compute_token_gae(
    config: &GaeConfig,
    token_rewards: &[f64],
    values: &[f64],
) -> EngineResult<TokenAdvantages> {
    config.validate()?;
    if token_rewards.len() != values.len() {
        return Err(EngineError::invalid_input(format!(
            "gae input length mismatch: rewards={}, values={}",
            token_rewards.len(),
            values.len()
        )));
    }
    ensure_finite_slice("token_rewards", token_rewards)?;
    ensure_finite_slice("values", values)?;

    let mut advantages = vec![0.0; token_rewards.len()];
    let mut gae = 0.0;
    let mut next_value = 0.0;
    for index in (0..token_rewards.len()).rev() {
        let delta = token_rewards[index] + (config.gamma * next_value) - values[index];
        gae = delta + (config.gamma * config.lambda * gae);
        advantages[index] = gae;
        next_value = values[index];
    }
    ensure_finite_slice("advantages", &advantages)?;

    let returns = advantages
        .iter()
        .zip(values.iter())
        .map(|(advantage, value)| advantage + value)
        .collect::<Vec<_>>();
    Ok(TokenAdvantages {
        advantages,
        returns,
    })
}

fn validate_probability(label: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(EngineError::configuration(format!(
            "gae config field '{label}' must be finite and within [0.0, 1.0]"
        )));
    }
    Ok(())
}

fn ensure_finite_slice(field: &str, values: &[f64]) -> EngineResult<()> {
    if values.iter().any(|value| !value.is_finite()) {
        return Err(EngineError::invalid_input(format!(
            "non-finite values detected in '{field}'"
        )));
    }
    Ok(())
}
