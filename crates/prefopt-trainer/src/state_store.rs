//! Durable engine state: reward normalization statistics and the KL controller.
//!
//! Policy and reference parameters are persisted by the surrounding framework.
//! The store keeps two generations in one directory so a torn or corrupted
//! write of the current state can still resume from the one before it.

use anyhow::{bail, Context, Result};
use prefopt_types::{KlControllerSnapshot, RunningStatsSnapshot};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

pub const CURRENT_CHECKPOINT_VERSION: u32 = 1;

const CURRENT_FILE: &str = "engine-state.json";
const PREVIOUS_FILE: &str = "engine-state.previous.json";
const STAGING_FILE: &str = "engine-state.json.staging";

/// Resumable engine state at the end of a global step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStateCheckpoint {
    pub checkpoint_version: u32,
    pub run_id: String,
    pub global_step: u64,
    pub reward_stats: RunningStatsSnapshot,
    pub kl_controller: KlControllerSnapshot,
    pub saved_at_unix_seconds: u64,
}

impl EngineStateCheckpoint {
    /// Captures the given state stamped with the current wall-clock time.
    pub fn capture(
        run_id: impl Into<String>,
        global_step: u64,
        reward_stats: RunningStatsSnapshot,
        kl_controller: KlControllerSnapshot,
    ) -> Self {
        Self {
            checkpoint_version: CURRENT_CHECKPOINT_VERSION,
            run_id: run_id.into(),
            global_step,
            reward_stats,
            kl_controller,
            saved_at_unix_seconds: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0),
        }
    }

    /// Rejects state that could not have come from a healthy engine.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_version != CURRENT_CHECKPOINT_VERSION {
            bail!(
                "unsupported checkpoint_version {}; expected {CURRENT_CHECKPOINT_VERSION}",
                self.checkpoint_version
            );
        }
        if self.run_id.trim().is_empty() {
            bail!("run_id must not be empty");
        }
        let stats = &self.reward_stats;
        if !stats.mean.is_finite() || !stats.variance.is_finite() || stats.variance < 0.0 {
            bail!("reward_stats must hold a finite mean and a finite non-negative variance");
        }
        let controller = &self.kl_controller;
        if !controller.beta.is_finite()
            || controller.beta < 0.0
            || controller.window.iter().any(|value| !value.is_finite())
        {
            bail!("kl_controller must hold a finite non-negative beta and a finite window");
        }
        Ok(())
    }
}

/// Which stored generation a resume came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateGeneration {
    Current,
    Previous,
}

/// Engine state recovered by [`EngineStateStore::resume`].
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredEngineState {
    pub checkpoint: EngineStateCheckpoint,
    pub generation: StateGeneration,
    /// Why the current generation was passed over, when it was.
    pub current_error: Option<String>,
}

impl RestoredEngineState {
    /// One-line operator summary of what was restored.
    pub fn summary(&self) -> String {
        let generation = match self.generation {
            StateGeneration::Current => "current",
            StateGeneration::Previous => "previous",
        };
        let mut line = format!(
            "engine_state_resume generation={generation} run_id={} global_step={} beta={} reward_count={}",
            self.checkpoint.run_id,
            self.checkpoint.global_step,
            self.checkpoint.kl_controller.beta,
            self.checkpoint.reward_stats.count
        );
        if let Some(error) = &self.current_error {
            line.push_str(&format!(" current_error=\"{error}\""));
        }
        line
    }
}

/// Directory holding the current and previous engine-state generations.
#[derive(Debug, Clone)]
pub struct EngineStateStore {
    dir: PathBuf,
}

impl EngineStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_FILE)
    }

    pub fn previous_path(&self) -> PathBuf {
        self.dir.join(PREVIOUS_FILE)
    }

    /// Writes a new current generation and keeps the old one as previous.
    ///
    /// The staged file is synced before it is renamed over the current one,
    /// so a crash leaves either generation readable.
    #[instrument(skip(self, checkpoint), fields(dir = %self.dir.display(), step = checkpoint.global_step))]
    pub fn save(&self, checkpoint: &EngineStateCheckpoint) -> Result<()> {
        checkpoint.validate().context("refusing to save engine state")?;
        let bytes = serde_json::to_vec_pretty(checkpoint).context("serialize engine state")?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create engine state directory {}", self.dir.display()))?;

        let staging = self.dir.join(STAGING_FILE);
        let mut file = File::create(&staging)
            .with_context(|| format!("create staged engine state {}", staging.display()))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("write staged engine state {}", staging.display()))?;
        drop(file);

        let current = self.current_path();
        if current.exists() {
            std::fs::copy(&current, self.previous_path())
                .with_context(|| format!("keep previous engine state from {}", current.display()))?;
        }
        std::fs::rename(&staging, &current)
            .with_context(|| format!("publish engine state {}", current.display()))?;
        info!(
            run_id = %checkpoint.run_id,
            global_step = checkpoint.global_step,
            beta = checkpoint.kl_controller.beta,
            "engine state saved"
        );
        Ok(())
    }

    /// Reads the current generation only.
    pub fn load_current(&self) -> Result<EngineStateCheckpoint> {
        read_checkpoint(&self.current_path())
    }

    /// Loads the newest readable generation.
    ///
    /// Returns `Ok(None)` for a fresh directory with nothing saved yet.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub fn resume(&self) -> Result<Option<RestoredEngineState>> {
        let current = self.current_path();
        let previous = self.previous_path();
        if !current.exists() && !previous.exists() {
            return Ok(None);
        }
        let current_error = match read_checkpoint(&current) {
            Ok(checkpoint) => {
                return Ok(Some(RestoredEngineState {
                    checkpoint,
                    generation: StateGeneration::Current,
                    current_error: None,
                }))
            }
            Err(error) => format!("{error:#}"),
        };
        warn!(
            reason_code = "engine_state_fallback",
            error = %current_error,
            "current engine state unreadable; trying previous generation"
        );
        let checkpoint = read_checkpoint(&previous).with_context(|| {
            format!("no readable engine state generation (current: {current_error})")
        })?;
        Ok(Some(RestoredEngineState {
            checkpoint,
            generation: StateGeneration::Previous,
            current_error: Some(current_error),
        }))
    }
}

fn read_checkpoint(path: &Path) -> Result<EngineStateCheckpoint> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read engine state {}", path.display()))?;
    let checkpoint: EngineStateCheckpoint = serde_json::from_slice(&bytes)
        .with_context(|| format!("decode engine state {}", path.display()))?;
    checkpoint
        .validate()
        .with_context(|| format!("validate engine state {}", path.display()))?;
    Ok(checkpoint)
}
