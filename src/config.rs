use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceConfig;
use crate::engine::Args;
use crate::ops::PhiEstimator;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("topic count must be positive")]
    ZeroTopics,
    #[error("{name} must be positive and finite, got {value}")]
    InvalidPrior { name: &'static str, value: f32 },
    #[error("augmentation factor must be positive")]
    ZeroAugmentation,
    #[error("buffer size must be positive")]
    ZeroBufferSize,
    #[error("no input corpus given")]
    MissingInput,
    #[error("alias tolerance must be non-negative and finite, got {0}")]
    InvalidTolerance(f32),
    #[error("document {doc} has {tokens} tokens, more than the buffer size {buffer_size}")]
    DocumentTooLong {
        doc: usize,
        tokens: usize,
        buffer_size: usize,
    },
}

/// Training run settings, read from a JSON file and/or the command line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub alpha: f32,
    pub beta: f32,
    /// Topic count K.
    pub topics: u32,
    /// Gibbs iterations.
    pub n_mc: u32,
    pub seed: u64,
    /// Token capacity of one document buffer.
    pub buffer_size: usize,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    /// Poisson virtual copies per token (L).
    pub augmentation: u32,
    pub phi_estimator: PhiEstimator,
    pub alias_tolerance: f32,
    pub alias_full_rebuild_every: u32,
    pub threads: Option<usize>,
    pub device_memory_mb: Option<usize>,
    /// Log the likelihood every this many iterations; 0 only at the end.
    pub eval_every: u32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        let args = Args::default();
        Self {
            alpha: args.alpha,
            beta: args.beta,
            topics: args.k,
            n_mc: 100,
            seed: args.seed,
            buffer_size: 1 << 20,
            input: None,
            output: None,
            augmentation: args.l,
            phi_estimator: args.phi_estimator,
            alias_tolerance: args.alias_tolerance,
            alias_full_rebuild_every: args.alias_full_rebuild_every,
            threads: None,
            device_memory_mb: None,
            eval_every: 10,
        }
    }
}

impl TrainConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: TrainConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.topics == 0 {
            return Err(ConfigError::ZeroTopics);
        }
        for (name, value) in [("alpha", self.alpha), ("beta", self.beta)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidPrior { name, value });
            }
        }
        if self.augmentation == 0 {
            return Err(ConfigError::ZeroAugmentation);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.input.is_none() {
            return Err(ConfigError::MissingInput);
        }
        if !(self.alias_tolerance.is_finite() && self.alias_tolerance >= 0.0) {
            return Err(ConfigError::InvalidTolerance(self.alias_tolerance));
        }
        Ok(())
    }

    pub fn to_args(&self, vocab_size: Option<usize>) -> Args {
        Args {
            alpha: self.alpha,
            beta: self.beta,
            k: self.topics,
            l: self.augmentation,
            seed: self.seed,
            vocab_size,
            phi_estimator: self.phi_estimator,
            alias_tolerance: self.alias_tolerance,
            alias_full_rebuild_every: self.alias_full_rebuild_every,
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            threads: self.threads,
            memory_limit: self.device_memory_mb.map(|mb| mb.saturating_mul(1 << 20)),
        }
    }
}
