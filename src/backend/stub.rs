//! Deterministic stand-in engine.
//!
//! [`StubBackend`] implements [`InferenceBackend`] without any model weights:
//! a word-level vocabulary, a KV cache that only tracks positions, and
//! scripted logits. Words spelled `<0xNN>` are byte-fallback tokens whose
//! piece is that single raw byte, so one character can span several tokens.
//! It enforces the same decode rules a real engine does
//! (contiguous positions, batch and window limits) and counts every handle it
//! hands out so leaks and double-lives are observable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{Batch, InferenceBackend, PieceError, TokenId, TokenizeError};
use crate::config::{ContextParams, ModelParams};
use crate::engine::sampler::{CpuSamplerChain, SamplerStage};
use crate::error::EngineError;

pub const BOS_TOKEN: TokenId = 0;
pub const EOS_TOKEN: TokenId = 1;

const BOS_TEXT: &str = "<s>";
const EOS_TEXT: &str = "</s>";

/// Opening of every canned reply. The prompt echo follows it.
pub const CANNED_REPLY: &str = "Hello! This is a test response from llama-session. \
The library is working but no inference engine is compiled in.";

/// Characters of the prompt echoed back at the end of a canned reply.
const PROMPT_ECHO_CHARS: usize = 50;

/// Logit given to the scripted next word.
const SCRIPT_LOGIT: f32 = 30.0;

/// How the stub picks its logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StubScript {
    /// A fixed reply ending with an echo of the prompt, then end-of-generation.
    #[default]
    Canned,
    /// Position-seeded pseudo-random logits over the whole vocabulary. Never
    /// produces end-of-generation.
    Babble,
}

#[derive(Debug, Clone)]
pub struct StubOptions {
    pub script: StubScript,
    /// Refuse model paths that do not name an existing file.
    pub require_model_file: bool,
    pub fail_model_load: bool,
    pub fail_context: bool,
    pub fail_sampler: bool,
    /// Reject any batch containing a token at or beyond this absolute position.
    pub fail_decode_at: Option<usize>,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            script: StubScript::Canned,
            require_model_file: true,
            fail_model_load: false,
            fail_context: false,
            fail_sampler: false,
            fail_decode_at: None,
        }
    }
}

/// Paired alloc/free accounting for stub handles.
#[derive(Debug, Default)]
pub struct StubCounters {
    process_inits: AtomicUsize,
    process_frees: AtomicUsize,
    models: LiveCount,
    contexts: LiveCount,
    samplers: LiveCount,
    decode_calls: AtomicUsize,
}

#[derive(Debug, Default)]
struct LiveCount {
    live: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl LiveCount {
    fn acquire(&self) {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubCounters {
    pub fn process_inits(&self) -> usize {
        self.process_inits.load(Ordering::SeqCst)
    }
    pub fn process_frees(&self) -> usize {
        self.process_frees.load(Ordering::SeqCst)
    }
    pub fn live_models(&self) -> usize {
        self.models.live.load(Ordering::SeqCst)
    }
    pub fn peak_models(&self) -> usize {
        self.models.peak.load(Ordering::SeqCst)
    }
    pub fn total_models(&self) -> usize {
        self.models.total.load(Ordering::SeqCst)
    }
    pub fn live_contexts(&self) -> usize {
        self.contexts.live.load(Ordering::SeqCst)
    }
    pub fn peak_contexts(&self) -> usize {
        self.contexts.peak.load(Ordering::SeqCst)
    }
    pub fn live_samplers(&self) -> usize {
        self.samplers.live.load(Ordering::SeqCst)
    }
    pub fn peak_samplers(&self) -> usize {
        self.samplers.peak.load(Ordering::SeqCst)
    }
    pub fn total_samplers(&self) -> usize {
        self.samplers.total.load(Ordering::SeqCst)
    }
    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Vocab {
    words: Vec<String>,
    ids: HashMap<String, TokenId>,
}

impl Vocab {
    fn new() -> Self {
        let mut vocab = Self { words: Vec::new(), ids: HashMap::new() };
        vocab.intern(BOS_TEXT);
        vocab.intern(EOS_TEXT);
        for word in CANNED_REPLY.split_whitespace() {
            vocab.intern(word);
        }
        vocab
    }

    fn intern(&mut self, word: &str) -> TokenId {
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let id = self.words.len() as TokenId;
        self.words.push(word.to_string());
        self.ids.insert(word.to_string(), id);
        id
    }

    fn len(&self) -> usize {
        self.words.len()
    }

    /// Special tokens render bare, byte tokens as their byte; words carry
    /// their trailing separator.
    fn piece(&self, token: TokenId) -> Option<Vec<u8>> {
        let word = self.words.get(usize::try_from(token).ok()?)?;
        if token == BOS_TOKEN || token == EOS_TOKEN {
            Some(word.clone().into_bytes())
        } else if let Some(byte) = byte_token(word) {
            Some(vec![byte])
        } else {
            Some(format!("{} ", word).into_bytes())
        }
    }
}

/// The raw byte of a `<0xNN>` token.
fn byte_token(word: &str) -> Option<u8> {
    let hex = word.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

pub struct StubModel {
    vocab: Arc<RwLock<Vocab>>,
    counters: Arc<StubCounters>,
}

impl StubModel {
    pub fn vocab_size(&self) -> usize {
        self.vocab.read().len()
    }
}

impl Drop for StubModel {
    fn drop(&mut self) {
        self.counters.models.release();
    }
}

pub struct StubContext {
    vocab: Arc<RwLock<Vocab>>,
    n_ctx: usize,
    n_batch: usize,
    script: StubScript,
    fail_decode_at: Option<usize>,
    /// Tokens held in the cache, by position.
    cached: Vec<TokenId>,
    prompt_len: usize,
    reply: Vec<TokenId>,
    logits: Option<Vec<f32>>,
    counters: Arc<StubCounters>,
}

impl StubContext {
    /// Number of positions currently cached.
    pub fn cached_len(&self) -> usize {
        self.cached.len()
    }

    fn build_reply(&mut self) {
        let mut vocab = self.vocab.write();
        let prompt: Vec<&str> = self.cached[..self.prompt_len]
            .iter()
            .filter(|&&t| t != BOS_TOKEN && t != EOS_TOKEN)
            .filter_map(|&t| vocab.words.get(t as usize).map(String::as_str))
            .collect();
        let echo: String = prompt.join(" ").chars().take(PROMPT_ECHO_CHARS).collect();
        let text = format!("{} Your prompt was: {}...", CANNED_REPLY, echo);
        let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        self.reply = words.iter().map(|w| vocab.intern(w)).collect();
    }

    fn next_logits(&self) -> Vec<f32> {
        let vocab_size = self.vocab.read().len();
        let position = self.cached.len();
        let mut logits = match self.script {
            StubScript::Canned => {
                let step = position - self.prompt_len;
                let target = self.reply.get(step).copied().unwrap_or(EOS_TOKEN);
                let mut logits = vec![0.0f32; vocab_size];
                logits[target as usize] = SCRIPT_LOGIT;
                logits
            }
            StubScript::Babble => {
                let mut logits: Vec<f32> = (0..vocab_size)
                    .map(|t| (mix(position as u64, t as u64) % 1000) as f32 / 250.0)
                    .collect();
                logits[EOS_TOKEN as usize] = f32::NEG_INFINITY;
                logits
            }
        };
        logits[BOS_TOKEN as usize] = f32::NEG_INFINITY;
        logits
    }
}

impl Drop for StubContext {
    fn drop(&mut self) {
        self.counters.contexts.release();
    }
}

/// SplitMix64 over (position, token).
fn mix(position: u64, token: u64) -> u64 {
    let mut z = position
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(token.wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

pub struct StubSampler {
    chain: CpuSamplerChain,
    counters: Arc<StubCounters>,
}

impl StubSampler {
    pub fn stages(&self) -> &[SamplerStage] {
        self.chain.stages()
    }
}

impl Drop for StubSampler {
    fn drop(&mut self) {
        self.counters.samplers.release();
    }
}

/// Engine stand-in used when no inference engine is compiled in.
#[derive(Debug, Default)]
pub struct StubBackend {
    options: StubOptions,
    counters: Arc<StubCounters>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: StubOptions) -> Self {
        Self { options, counters: Arc::default() }
    }

    pub fn with_script(script: StubScript) -> Self {
        Self::with_options(StubOptions { script, ..Default::default() })
    }

    /// Shared handle to the allocation counters.
    pub fn counters(&self) -> Arc<StubCounters> {
        Arc::clone(&self.counters)
    }
}

fn decode_error(code: i32, reason: impl Into<String>) -> EngineError {
    EngineError::Decode { code, reason: reason.into() }
}

impl InferenceBackend for StubBackend {
    const NAME: &'static str = "stub";

    type Model = StubModel;
    type Context = StubContext;
    type Sampler = StubSampler;

    fn init_process(&self) {
        self.counters.process_inits.fetch_add(1, Ordering::SeqCst);
    }

    fn free_process(&self) {
        self.counters.process_frees.fetch_add(1, Ordering::SeqCst);
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<StubModel, EngineError> {
        debug!(
            path = %path.display(),
            gpu_layers = params.gpu_layers,
            use_mmap = params.use_mmap,
            use_mlock = params.use_mlock,
            "Stub model load"
        );
        if self.options.fail_model_load {
            return Err(EngineError::ModelRejected("injected load failure".to_string()));
        }
        if self.options.require_model_file && !path.is_file() {
            return Err(EngineError::ModelRejected(format!(
                "no such file: {}",
                path.display()
            )));
        }
        self.counters.models.acquire();
        Ok(StubModel {
            vocab: Arc::new(RwLock::new(Vocab::new())),
            counters: self.counters(),
        })
    }

    fn new_context(
        &self,
        model: &StubModel,
        params: &ContextParams,
    ) -> Result<StubContext, EngineError> {
        if self.options.fail_context {
            return Err(EngineError::ContextRejected("injected context failure".to_string()));
        }
        if params.context_size == 0 || params.batch_size == 0 {
            return Err(EngineError::ContextRejected(
                "context and batch size must be non-zero".to_string(),
            ));
        }
        self.counters.contexts.acquire();
        Ok(StubContext {
            vocab: Arc::clone(&model.vocab),
            n_ctx: params.context_size as usize,
            n_batch: params.batch_size as usize,
            script: self.options.script,
            fail_decode_at: self.options.fail_decode_at,
            cached: Vec::new(),
            prompt_len: 0,
            reply: Vec::new(),
            logits: None,
            counters: self.counters(),
        })
    }

    fn context_size(&self, ctx: &StubContext) -> usize {
        ctx.n_ctx
    }

    fn tokenize(
        &self,
        model: &StubModel,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
        out: &mut [TokenId],
    ) -> Result<usize, TokenizeError> {
        if text.contains('\0') {
            return Err(TokenizeError::Failed("embedded NUL in input".to_string()));
        }
        let mut vocab = model.vocab.write();
        let mut ids = Vec::with_capacity(out.len());
        if add_bos {
            ids.push(BOS_TOKEN);
        }
        ids.extend(text.split_whitespace().map(|w| vocab.intern(w)));

        if ids.len() > out.len() {
            return Err(TokenizeError::InsufficientSpace { required: ids.len() });
        }
        out[..ids.len()].copy_from_slice(&ids);
        Ok(ids.len())
    }

    fn token_to_piece(
        &self,
        model: &StubModel,
        token: TokenId,
        buf: &mut [u8],
    ) -> Result<usize, PieceError> {
        let bytes = model.vocab.read().piece(token).ok_or(PieceError::Invalid)?;
        if bytes.len() > buf.len() {
            return Err(PieceError::BufferTooSmall { required: bytes.len() });
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn is_end_of_generation(&self, _model: &StubModel, token: TokenId) -> bool {
        token == EOS_TOKEN
    }

    fn clear_kv_cache(&self, ctx: &mut StubContext) {
        ctx.cached.clear();
        ctx.prompt_len = 0;
        ctx.reply.clear();
        ctx.logits = None;
    }

    fn decode(&self, ctx: &mut StubContext, batch: &Batch) -> Result<(), EngineError> {
        self.counters.decode_calls.fetch_add(1, Ordering::SeqCst);

        if batch.is_empty() {
            return Err(decode_error(-1, "empty batch"));
        }
        if batch.len() > ctx.n_batch {
            return Err(decode_error(
                -1,
                format!("batch of {} tokens exceeds n_batch {}", batch.len(), ctx.n_batch),
            ));
        }
        if ctx.cached.len() + batch.len() > ctx.n_ctx {
            return Err(decode_error(1, "no free KV slot"));
        }

        let vocab_size = ctx.vocab.read().len();
        let start = ctx.cached.len();
        for (i, entry) in batch.tokens().iter().enumerate() {
            if entry.position != start + i {
                return Err(decode_error(
                    -1,
                    format!("position {} is not contiguous (expected {})", entry.position, start + i),
                ));
            }
            if !entry.seq_ids.contains(&0) {
                return Err(decode_error(-1, "stub only supports sequence 0"));
            }
            if entry.token < 0 || entry.token as usize >= vocab_size {
                return Err(decode_error(-1, format!("invalid token {}", entry.token)));
            }
            if let Some(limit) = ctx.fail_decode_at {
                if entry.position >= limit {
                    return Err(decode_error(2, "injected decode failure"));
                }
            }
        }

        let first_batch = ctx.cached.is_empty();
        ctx.cached.extend(batch.tokens().iter().map(|t| t.token));
        if first_batch {
            ctx.prompt_len = batch.len();
            ctx.build_reply();
        }

        // Only logits for the final position are kept.
        ctx.logits = match batch.logits_index() {
            Some(i) if i + 1 == batch.len() => Some(ctx.next_logits()),
            _ => None,
        };
        Ok(())
    }

    fn sampler_chain(&self, _model: &StubModel) -> Result<StubSampler, EngineError> {
        if self.options.fail_sampler {
            return Err(EngineError::SamplerRejected("injected sampler failure".to_string()));
        }
        self.counters.samplers.acquire();
        Ok(StubSampler {
            chain: CpuSamplerChain::new(),
            counters: self.counters(),
        })
    }

    fn sampler_chain_add(&self, chain: &mut StubSampler, stage: SamplerStage) {
        chain.chain.add(stage);
    }

    fn reset_sampler(&self, chain: &mut StubSampler) {
        chain.chain.reset();
    }

    fn sample(&self, chain: &mut StubSampler, ctx: &StubContext) -> TokenId {
        match ctx.logits.as_deref() {
            Some(logits) => chain.chain.sample(logits),
            None => {
                warn!("Sample requested without logits; returning end-of-generation");
                EOS_TOKEN
            }
        }
    }
}
