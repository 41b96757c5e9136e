//! Numerically stable scalar helpers shared by the loss modules.

use prefopt_types::{EngineError, EngineResult};

/// Logistic sigmoid without overflow for large-magnitude inputs.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp = x.exp();
        exp / (1.0 + exp)
    }
}

/// `ln(sigmoid(x))` evaluated as `-softplus(-x)`.
pub fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

pub(crate) fn ensure_finite(field: &str, index: usize, value: f64) -> EngineResult<()> {
    if value.is_finite() {
        return Ok(());
    }
    Err(EngineError::invalid_input(format!(
        "non-finite field '{field}' at index {index}"
    )))
}

pub(crate) fn ensure_same_len(label: &str, expected: usize, actual: usize) -> EngineResult<()> {
    if expected == actual {
        return Ok(());
    }
    Err(EngineError::invalid_input(format!(
        "{label} length mismatch: expected {expected}, found {actual}"
    )))
}
