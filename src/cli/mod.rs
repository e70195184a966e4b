//! Shared CLI utilities for llama-session binary tools.

use std::io::Read;
use std::path::Path;

use crate::config::LlamaConfig;

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read the prompt from one of: prompt string, file path, or stdin.
pub fn read_input(
    prompt: Option<&str>,
    file: Option<&Path>,
    use_stdin: bool,
) -> Result<String, String> {
    if let Some(text) = prompt {
        return Ok(text.to_string());
    }

    if let Some(path) = file {
        return std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e));
    }

    if use_stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("Failed to read stdin: {}", e))?;
        return Ok(buf);
    }

    Err("No input provided. Use --prompt, --file, or --stdin".to_string())
}

/// Command-line settings layered over a base [`LlamaConfig`]. `None` keeps
/// the base value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Negative means "until end-of-generation or the context window fills".
    pub max_tokens: Option<i64>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub seed: Option<u32>,
    pub context_size: Option<u32>,
    pub threads: Option<u32>,
}

impl ConfigOverrides {
    pub fn apply(&self, mut config: LlamaConfig) -> LlamaConfig {
        if let Some(ctx) = self.context_size {
            config.context_size = ctx;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
            config.threads_batch = threads;
        }
        if let Some(n) = self.max_tokens {
            config.max_tokens = if n < 0 { config.context_size as usize } else { n as usize };
        }
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(k) = self.top_k {
            config.top_k = k;
        }
        if let Some(p) = self.top_p {
            config.top_p = p;
        }
        if let Some(r) = self.repeat_penalty {
            config.repeat_penalty = r;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config
    }
}
