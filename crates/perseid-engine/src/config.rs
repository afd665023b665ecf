//! Engine configuration.
//!
//! Every numeric knob is validated before any computation starts; a bad
//! configuration is fatal up front, never discovered mid-run.

use std::path::PathBuf;

use perseid_pce::legendre::MAX_ORDER;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported basis order {0} (maximum {MAX_ORDER})")]
    UnsupportedOrder(u32),

    #[error("maximum noise-group size must be at least 1")]
    EmptyGroups,

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("{name} must be {constraint}, got {value}")]
    InvalidKnob {
        name: &'static str,
        constraint: &'static str,
        value: f64,
    },
}

/// Numeric knobs of the propagation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Polynomial-chaos expansion order (0–10).
    pub order: u32,
    /// Largest number of noise sources injected into one propagation.
    pub max_group_size: usize,
    /// Minimum subdomain weight before forks are decided by majority.
    pub j_lim: f64,
    /// ME-gPC smoothness split threshold.
    pub theta_1: f64,
    /// ME-gPC split-variable selection threshold.
    pub theta_2: f64,
    /// ME-gPC energy-fraction damping exponent.
    pub alpha: f64,
    /// Worker threads in the propagation pool.
    pub workers: usize,
    /// Seed for every randomized phase; fixing it makes partition layouts,
    /// and therefore checkpoint keys, reproducible across runs.
    pub seed: u64,
    /// Directory for persisted partial solutions; in-memory only when
    /// absent.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order: 2,
            max_group_size: 4,
            j_lim: 0.1,
            theta_1: 0.01,
            theta_2: 0.75,
            alpha: 0.5,
            workers: 4,
            seed: 1,
            checkpoint_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.order > MAX_ORDER {
            return Err(ConfigError::UnsupportedOrder(self.order));
        }
        if self.max_group_size == 0 {
            return Err(ConfigError::EmptyGroups);
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let positive: [(&'static str, f64); 2] =
            [("theta_1", self.theta_1), ("alpha", self.alpha)];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(ConfigError::InvalidKnob {
                    name,
                    constraint: "positive",
                    value,
                });
            }
        }
        let unit: [(&'static str, f64); 2] = [("j_lim", self.j_lim), ("theta_2", self.theta_2)];
        for (name, value) in unit {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidKnob {
                    name,
                    constraint: "in (0, 1]",
                    value,
                });
            }
        }
        Ok(())
    }
}
