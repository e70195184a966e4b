//! Session configuration.
//!
//! [`LlamaConfig`] is supplied at load time and optionally overridden per
//! generation call. The engine-facing views ([`ModelParams`],
//! [`ContextParams`]) and the sampler view ([`SamplingParams`]) are derived
//! from it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Tokens held back from the context window when checking prompt length:
/// room for at least one generated token plus bookkeeping.
pub const PROMPT_MARGIN: usize = 4;

/// Full session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaConfig {
    /// Context window size in tokens (prompt + generated).
    pub context_size: u32,
    /// Maximum tokens the engine accepts in one decode call.
    pub batch_size: u32,
    /// Threads used for single-token decode.
    pub threads: u32,
    /// Threads used for prompt (batch) decode.
    pub threads_batch: u32,
    /// Layers offloaded to the GPU. 0 = CPU only.
    pub gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Upper bound on generated tokens per call.
    pub max_tokens: usize,
    /// Logit temperature. 0.0 disables the temperature stage.
    pub temperature: f32,
    /// Top-K cutoff. 0 disables the stage.
    pub top_k: u32,
    /// Nucleus cutoff. 1.0 disables the stage.
    pub top_p: f32,
    /// Repetition penalty over the last 64 tokens. 1.0 disables the stage.
    pub repeat_penalty: f32,
    /// Sampling seed. `None` derives one from wall-clock time.
    pub seed: Option<u32>,
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self {
            context_size: 2048,
            batch_size: 512,
            threads: 4,
            threads_batch: 4,
            gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            max_tokens: 512,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.1,
            seed: None,
        }
    }
}

impl LlamaConfig {
    /// Load a configuration from a JSON file. Missing fields take their
    /// default values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: LlamaConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if (self.context_size as usize) <= PROMPT_MARGIN {
            return Err(SessionError::Config(format!(
                "context_size must exceed {} (got {})",
                PROMPT_MARGIN, self.context_size
            )));
        }
        if self.batch_size == 0 {
            return Err(SessionError::Config("batch_size must be at least 1".to_string()));
        }
        if self.threads == 0 || self.threads_batch == 0 {
            return Err(SessionError::Config(
                "threads and threads_batch must be at least 1".to_string(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SessionError::Config(format!(
                "temperature must be a finite value >= 0 (got {})",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SessionError::Config(format!(
                "top_p must be in (0, 1] (got {})",
                self.top_p
            )));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(SessionError::Config(format!(
                "repeat_penalty must be > 0 (got {})",
                self.repeat_penalty
            )));
        }
        Ok(())
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            gpu_layers: self.gpu_layers,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
        }
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            context_size: self.context_size,
            batch_size: self.batch_size,
            threads: self.threads,
            threads_batch: self.threads_batch,
        }
    }

    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
            seed: self.seed,
        }
    }
}

/// Model-load parameters handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelParams {
    pub gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

/// Context-creation parameters handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub threads_batch: u32,
}

/// The subset of [`LlamaConfig`] that shapes the sampler chain. Two configs
/// with equal `SamplingParams` share a chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub seed: Option<u32>,
}
