//! Running reward statistics for score normalization.
//!
//! Batches are folded in with the pairwise (Chan et al.) moment merge, which
//! agrees with sample-by-sample Welford accumulation up to rounding and makes
//! the result independent of how observations are grouped into batches.

use crate::numerics::ensure_finite;
use prefopt_types::{EngineError, EngineResult, RunningStatsSnapshot};

/// Accumulator for count, mean and population variance of observed rewards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    /// Sum of squared deviations from the current mean.
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an accumulator from a persisted snapshot.
    pub fn from_snapshot(snapshot: RunningStatsSnapshot) -> EngineResult<Self> {
        validate_snapshot(&snapshot)?;
        Ok(Self {
            count: snapshot.count,
            mean: snapshot.mean,
            m2: snapshot.variance * snapshot.count as f64,
        })
    }

    /// Folds one batch of raw values into the statistics.
    ///
    /// The batch is validated before anything is mutated, so a rejected batch
    /// leaves the accumulator untouched.
    #[tracing::instrument(level = "debug", skip(batch), fields(batch_len = batch.len()))]
    pub fn update(&mut self, batch: &[f64]) -> EngineResult<RunningStatsSnapshot> {
        for (index, value) in batch.iter().enumerate() {
            ensure_finite("reward", index, *value)?;
        }
        if batch.is_empty() {
            return Ok(self.snapshot());
        }

        let mut batch_count = 0u64;
        let mut batch_mean = 0.0;
        let mut batch_m2 = 0.0;
        for value in batch {
            batch_count += 1;
            let delta = value - batch_mean;
            batch_mean += delta / batch_count as f64;
            batch_m2 += delta * (value - batch_mean);
        }

        self.merge_moments(batch_count, batch_mean, batch_m2);
        Ok(self.snapshot())
    }

    /// Combines statistics gathered by a peer worker into this accumulator.
    pub fn merge(&mut self, peer: RunningStatsSnapshot) -> EngineResult<()> {
        validate_snapshot(&peer)?;
        self.merge_moments(peer.count, peer.mean, peer.variance * peer.count as f64);
        Ok(())
    }

    /// Replaces the statistics with a persisted snapshot.
    pub fn restore(&mut self, snapshot: RunningStatsSnapshot) -> EngineResult<()> {
        *self = Self::from_snapshot(snapshot)?;
        Ok(())
    }

    /// Clears all statistics. Only called on explicit request.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> RunningStatsSnapshot {
        RunningStatsSnapshot {
            count: self.count,
            mean: self.mean,
            variance: self.variance(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance; zero before any observation.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    /// Standard deviation with a stabilizing epsilon inside the square root.
    pub fn std(&self, epsilon: f64) -> f64 {
        (self.variance() + epsilon).sqrt()
    }

    fn merge_moments(&mut self, count: u64, mean: f64, m2: f64) {
        if count == 0 {
            return;
        }
        if self.count == 0 {
            self.count = count;
            self.mean = mean;
            self.m2 = m2;
            return;
        }

        let own = self.count as f64;
        let other = count as f64;
        let total = own + other;
        let delta = mean - self.mean;
        self.mean += delta * other / total;
        self.m2 += m2 + delta * delta * own * other / total;
        self.count += count;
    }
}

fn validate_snapshot(snapshot: &RunningStatsSnapshot) -> EngineResult<()> {
    if !snapshot.mean.is_finite() || !snapshot.variance.is_finite() || snapshot.variance < 0.0 {
        return Err(EngineError::invalid_input(format!(
            "running stats snapshot must have finite mean and non-negative variance, found mean={} variance={}",
            snapshot.mean, snapshot.variance
        )));
    }
    Ok(())
}
