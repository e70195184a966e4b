//! The session manager.
//!
//! A [`Session`] owns at most one loaded model together with its inference
//! context and sampler chain, and runs generations on it. Load, unload and
//! generate serialize on one lock. Cancellation and status queries go through
//! atomics so they never wait behind a running generation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::runtime::RuntimeLease;
use crate::backend::{InferenceBackend, TokenId};
use crate::config::LlamaConfig;
use crate::engine::generate::{run_generation, GenerationOutput};
use crate::engine::{build_sampler_chain, LoadedModel};
use crate::error::{Result, SessionError};
use crate::tokenizer;

/// Cloneable handle that requests cancellation of the running generation.
///
/// Obtained from [`Session::cancel_handle`]; usable from any thread without
/// touching the session lock.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct SessionState<B: InferenceBackend> {
    loaded: Option<LoadedModel<B>>,
    /// Defaults for generation calls without an override.
    config: LlamaConfig,
}

/// Clears the generating flag on every exit path of a generation.
struct GeneratingGuard<'a>(&'a AtomicBool);

impl<'a> GeneratingGuard<'a> {
    fn start(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A model session over backend `B`.
pub struct Session<B: InferenceBackend> {
    state: Mutex<SessionState<B>>,
    last_error: Mutex<Option<String>>,
    generating: AtomicBool,
    cancel: Arc<AtomicBool>,
    /// Mirrors `state.loaded.is_some()` for lock-free reads.
    loaded: AtomicBool,
    // Declared last: the backend runtime must outlive every handle above.
    runtime: RuntimeLease<B>,
}

impl<B: InferenceBackend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self::with_backend(Arc::new(backend))
    }

    /// Create a session over a backend shared with other sessions.
    pub fn with_backend(backend: Arc<B>) -> Self {
        let runtime = RuntimeLease::acquire(backend);
        info!(backend = B::NAME, "Session created");
        Self {
            state: Mutex::new(SessionState {
                loaded: None,
                config: LlamaConfig::default(),
            }),
            last_error: Mutex::new(None),
            generating: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
            loaded: AtomicBool::new(false),
            runtime,
        }
    }

    pub fn backend(&self) -> &B {
        self.runtime.backend()
    }

    /// Load the model at `path`, replacing any model already loaded.
    ///
    /// On failure nothing stays allocated and the session is unloaded.
    pub fn load_model(&self, path: impl AsRef<Path>, config: &LlamaConfig) -> Result<()> {
        let path = path.as_ref();
        let mut state = self.state.lock();
        self.clear_error();
        let result = self.load_locked(&mut state, path, config);
        self.record(result)
    }

    fn load_locked(&self, state: &mut SessionState<B>, path: &Path, config: &LlamaConfig) -> Result<()> {
        config.validate()?;

        if state.loaded.is_some() {
            info!("Unloading current model before reload");
            self.unload_locked(state);
        }

        let backend = self.backend();
        let model_params = config.model_params();
        info!(
            path = %path.display(),
            gpu_layers = model_params.gpu_layers,
            use_mmap = model_params.use_mmap,
            use_mlock = model_params.use_mlock,
            "Loading model"
        );
        let model = backend.load_model(path, &model_params).map_err(|source| {
            error!(path = %path.display(), error = %source, "Model load failed");
            SessionError::ModelLoad { path: path.to_path_buf(), source }
        })?;

        let context_params = config.context_params();
        info!(
            context_size = context_params.context_size,
            batch_size = context_params.batch_size,
            threads = context_params.threads,
            threads_batch = context_params.threads_batch,
            "Creating context"
        );
        // A failure here drops `model` on return.
        let context = backend.new_context(&model, &context_params).map_err(|e| {
            error!(error = %e, "Context creation failed");
            SessionError::ContextCreate(e)
        })?;

        let sampling = config.sampling_params();
        let sampler = build_sampler_chain(backend, &model, &sampling)?;

        let n_ctx = backend.context_size(&context);
        state.loaded = Some(LoadedModel::new(model, context, sampler, sampling));
        state.config = config.clone();
        self.loaded.store(true, Ordering::SeqCst);
        info!(path = %path.display(), n_ctx, "Model loaded");
        Ok(())
    }

    /// Release the model, context and sampler chain. Does nothing when no
    /// model is loaded.
    pub fn unload_model(&self) {
        let mut state = self.state.lock();
        self.clear_error();
        self.unload_locked(&mut state);
    }

    fn unload_locked(&self, state: &mut SessionState<B>) {
        if let Some(loaded) = state.loaded.take() {
            self.loaded.store(false, Ordering::SeqCst);
            loaded.release();
            info!("Model unloaded");
        }
    }

    /// Whether a model and context are live. Never blocks.
    pub fn is_model_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Generate a complete reply to `prompt`.
    ///
    /// `overrides` replaces the session's configuration for this call only.
    /// If a token fails to decode partway through, the text produced so far
    /// is returned and the failure is available from [`Session::last_error`].
    pub fn generate(&self, prompt: &str, overrides: Option<&LlamaConfig>) -> Result<String> {
        let mut text = String::new();
        self.generate_stream(prompt, |piece| text.push_str(piece), overrides)?;
        Ok(text)
    }

    /// Generate a reply to `prompt`, passing each token's text to `on_token`
    /// in order, on the calling thread, as soon as it is sampled.
    pub fn generate_stream(
        &self,
        prompt: &str,
        mut on_token: impl FnMut(&str),
        overrides: Option<&LlamaConfig>,
    ) -> Result<GenerationOutput> {
        let mut state = self.state.lock();
        self.clear_error();
        let result = self.generate_locked(&mut state, prompt, &mut on_token, overrides);
        if let Ok(GenerationOutput { error: Some(err), .. }) = &result {
            self.set_error(err.to_string());
        }
        self.record(result)
    }

    fn generate_locked(
        &self,
        state: &mut SessionState<B>,
        prompt: &str,
        on_token: &mut dyn FnMut(&str),
        overrides: Option<&LlamaConfig>,
    ) -> Result<GenerationOutput> {
        let SessionState { loaded, config } = state;
        let loaded = match loaded.as_mut() {
            Some(loaded) => loaded,
            None => {
                warn!("Generation requested with no model loaded");
                return Err(SessionError::NotLoaded);
            }
        };
        let effective = match overrides {
            Some(overrides) => {
                overrides.validate().map_err(|e| match e {
                    SessionError::Config(reason) => {
                        warn!(%reason, "Rejected generation settings");
                        SessionError::InvalidOverride(reason)
                    }
                    other => other,
                })?;
                overrides
            }
            None => &*config,
        };

        let _generating = GeneratingGuard::start(&self.generating);
        self.cancel.store(false, Ordering::SeqCst);

        let backend = self.backend();
        if loaded.apply_sampling(backend, &effective.sampling_params())? {
            debug!(overridden = overrides.is_some(), "Sampler chain rebuilt for this call");
        }

        info!(prompt_bytes = prompt.len(), max_tokens = effective.max_tokens, "Generation started");
        let output = run_generation(backend, loaded, prompt, effective.max_tokens, &self.cancel, on_token)?;
        info!(
            prompt_tokens = output.prompt_tokens,
            generated_tokens = output.generated_tokens,
            stop_reason = %output.stop_reason,
            "Generation finished"
        );
        Ok(output)
    }

    /// Ask the running generation to stop before its next token. Safe to call
    /// from any thread; a no-op when nothing is running.
    pub fn cancel_generation(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        info!("Generation cancellation requested");
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { flag: Arc::clone(&self.cancel) }
    }

    /// Whether a generation call is in progress. Never blocks.
    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Message of the most recent failure, if the last operation failed.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Crate version with the backend name, e.g. `0.1.0 (stub)`.
    pub fn version(&self) -> String {
        format!("{} ({})", crate::VERSION, B::NAME)
    }

    /// Encode `text` with the loaded model's vocabulary.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let state = self.state.lock();
        self.clear_error();
        let result = match state.loaded.as_ref() {
            Some(loaded) => tokenizer::tokenize(self.backend(), &loaded.model, text, add_bos)
                .map_err(|e| SessionError::Tokenization(e.to_string())),
            None => Err(SessionError::NotLoaded),
        };
        self.record(result)
    }

    /// Render `tokens` as text with the loaded model's vocabulary.
    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        let state = self.state.lock();
        self.clear_error();
        let result = match state.loaded.as_ref() {
            Some(loaded) => Ok(tokenizer::detokenize(self.backend(), &loaded.model, tokens)),
            None => Err(SessionError::NotLoaded),
        };
        self.record(result)
    }

    /// The configuration of the last successful load.
    pub fn config(&self) -> LlamaConfig {
        self.state.lock().config.clone()
    }

    fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    fn set_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.set_error(e.to_string());
        }
        result
    }
}

impl<B: InferenceBackend> Drop for Session<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(loaded) = state.loaded.take() {
            self.loaded.store(false, Ordering::SeqCst);
            loaded.release();
        }
        info!(backend = B::NAME, "Session dropped");
    }
}
