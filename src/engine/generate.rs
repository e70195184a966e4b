//! Generation loop: prompt → batch → decode, then one token at a time.
//!
//! [`run_generation`] drives a [`LoadedModel`] through the prompt decode and
//! the incremental token loop. It emits text through a callback as soon as a
//! sampled token completes it and stops on end-of-generation, the token limit,
//! cancellation, or a decode failure. Bytes of a character split across
//! tokens are held back until the character is whole.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::{Batch, InferenceBackend};
use crate::config::PROMPT_MARGIN;
use crate::error::{EngineError, Result, SessionError};
use crate::tokenizer::{self, PieceDecoder};

use super::LoadedModel;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced an end-of-generation token.
    EndOfGeneration,
    /// Reached the `max_tokens` limit.
    MaxTokens,
    /// Cancellation was requested.
    Cancelled,
    /// The engine rejected a generated token's batch.
    DecodeFailed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndOfGeneration => write!(f, "eos"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::DecodeFailed => write!(f, "decode_error"),
        }
    }
}

/// Output from a generation call, including metadata.
#[derive(Debug)]
pub struct GenerationOutput {
    /// Number of tokens sampled and accepted, excluding end-of-generation.
    pub generated_tokens: usize,
    /// Number of prompt tokens, including the beginning-of-sequence marker.
    pub prompt_tokens: usize,
    /// Bytes of text passed to the callback.
    pub text_len: usize,
    pub stop_reason: StopReason,
    /// Set when `stop_reason` is [`StopReason::DecodeFailed`]. Output emitted
    /// before the failure is still valid.
    pub error: Option<SessionError>,
    /// Time spent decoding the prompt batch.
    pub prefill_duration: Duration,
    /// Time spent in the token loop.
    pub decode_duration: Duration,
}

impl GenerationOutput {
    pub fn decode_tokens_per_second(&self) -> f64 {
        let secs = self.decode_duration.as_secs_f64();
        if secs > 0.0 {
            self.generated_tokens as f64 / secs
        } else {
            0.0
        }
    }

    pub fn prefill_tokens_per_second(&self) -> f64 {
        let secs = self.prefill_duration.as_secs_f64();
        if secs > 0.0 {
            self.prompt_tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Run one generation on `loaded`.
///
/// The KV cache is cleared and the sampler chain reset first, so every call
/// starts at position 0 with a freshly seeded chain. `cancel` is read once
/// per token, before sampling. `on_token` only ever sees non-empty, whole
/// UTF-8 text; bytes still held back when the loop ends are flushed, with an
/// unfinished character rendered as U+FFFD.
pub(crate) fn run_generation<B: InferenceBackend>(
    backend: &B,
    loaded: &mut LoadedModel<B>,
    prompt: &str,
    max_tokens: usize,
    cancel: &AtomicBool,
    on_token: &mut dyn FnMut(&str),
) -> Result<GenerationOutput> {
    let LoadedModel { sampler, context, model, .. } = loaded;
    let sampler = sampler.as_mut().ok_or_else(|| {
        error!("No sampler chain; a previous rebuild failed");
        SessionError::SamplerInit(EngineError::SamplerRejected("sampler chain missing".to_string()))
    })?;

    backend.clear_kv_cache(context);
    backend.reset_sampler(sampler);

    let prompt_ids = tokenizer::tokenize(backend, model, prompt, true)
        .map_err(|e| SessionError::Tokenization(e.to_string()))?;
    if prompt_ids.is_empty() {
        warn!("Prompt produced no tokens");
        return Err(SessionError::Tokenization("prompt produced no tokens".to_string()));
    }
    let prompt_tokens = prompt_ids.len();

    let n_ctx = backend.context_size(context);
    let limit = n_ctx.saturating_sub(PROMPT_MARGIN);
    if prompt_tokens > limit {
        error!(prompt_tokens, n_ctx, "Prompt too long for context size");
        return Err(SessionError::PromptTooLong { tokens: prompt_tokens, limit });
    }

    // Prefill: all prompt tokens in one batch, logits for the last only.
    let prefill_start = Instant::now();
    let batch = Batch::for_prompt(&prompt_ids);
    backend.decode(context, &batch).map_err(|e| {
        error!(prompt_tokens, error = %e, "Prompt decode failed");
        SessionError::PromptDecode(e)
    })?;
    let prefill_duration = prefill_start.elapsed();
    debug!(prompt_tokens, prefill_ms = prefill_duration.as_secs_f64() * 1000.0, "Prefill complete");

    let decode_start = Instant::now();
    let mut batch = Batch::with_capacity(1);
    let mut decoder = PieceDecoder::new();
    let mut n_cur = prompt_tokens;
    let mut generated_tokens = 0;
    let mut text_len = 0;
    let mut stop_reason = StopReason::MaxTokens;
    let mut failure = None;

    while generated_tokens < max_tokens {
        if cancel.load(Ordering::SeqCst) {
            info!(generated_tokens, "Generation cancelled");
            stop_reason = StopReason::Cancelled;
            break;
        }

        let token = backend.sample(sampler, context);
        if backend.is_end_of_generation(model, token) {
            debug!(token, generated_tokens, "End of generation");
            stop_reason = StopReason::EndOfGeneration;
            break;
        }

        let piece = decoder.push(backend, model, token);
        if !piece.is_empty() {
            text_len += piece.len();
            on_token(&piece);
        }
        generated_tokens += 1;

        batch.clear();
        batch.add(token, n_cur, &[0], true);
        if let Err(source) = backend.decode(context, &batch) {
            error!(position = n_cur, error = %source, "Token decode failed");
            stop_reason = StopReason::DecodeFailed;
            failure = Some(SessionError::TokenDecode { position: n_cur, source });
            break;
        }
        n_cur += 1;
    }

    if decoder.pending_len() > 0 {
        warn!(bytes = decoder.pending_len(), "Generation ended inside a multi-byte character");
        let tail = decoder.finish();
        text_len += tail.len();
        on_token(&tail);
    }

    Ok(GenerationOutput {
        generated_tokens,
        prompt_tokens,
        text_len,
        stop_reason,
        error: failure,
        prefill_duration,
        decode_duration: decode_start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::CANNED_REPLY;
    use crate::backend::{StubBackend, StubOptions, StubScript};
    use crate::config::LlamaConfig;
    use crate::engine::build_sampler_chain;
    use crate::error::ErrorKind;

    struct Fixture {
        backend: StubBackend,
        loaded: LoadedModel<StubBackend>,
        _file: tempfile::NamedTempFile,
    }

    fn fixture(options: StubOptions, config: LlamaConfig) -> Fixture {
        let backend = StubBackend::with_options(options);
        let file = tempfile::NamedTempFile::new().unwrap();
        let model = backend.load_model(file.path(), &config.model_params()).unwrap();
        let context = backend.new_context(&model, &config.context_params()).unwrap();
        let sampling = config.sampling_params();
        let sampler = build_sampler_chain(&backend, &model, &sampling).unwrap();
        Fixture {
            loaded: LoadedModel::new(model, context, sampler, sampling),
            backend,
            _file: file,
        }
    }

    fn seeded() -> LlamaConfig {
        LlamaConfig { seed: Some(42), ..Default::default() }
    }

    fn run(fx: &mut Fixture, prompt: &str, max_tokens: usize) -> (Vec<String>, Result<GenerationOutput>) {
        let cancel = AtomicBool::new(false);
        let mut pieces = Vec::new();
        let result = run_generation(
            &fx.backend,
            &mut fx.loaded,
            prompt,
            max_tokens,
            &cancel,
            &mut |p: &str| pieces.push(p.to_string()),
        );
        (pieces, result)
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::EndOfGeneration.to_string(), "eos");
        assert_eq!(StopReason::MaxTokens.to_string(), "max_tokens");
        assert_eq!(StopReason::Cancelled.to_string(), "cancelled");
        assert_eq!(StopReason::DecodeFailed.to_string(), "decode_error");
    }

    #[test]
    fn test_canned_reply_streams_word_by_word() {
        let mut fx = fixture(StubOptions::default(), seeded());
        let (pieces, result) = run(&mut fx, "tell me something", 512);
        let output = result.unwrap();

        assert_eq!(output.stop_reason, StopReason::EndOfGeneration);
        assert_eq!(output.prompt_tokens, 4);
        assert_eq!(output.generated_tokens, pieces.len());
        assert!(pieces.len() > 10);
        assert_eq!(pieces[0], "Hello! ");
        let text: String = pieces.concat();
        assert!(text.starts_with(CANNED_REPLY));
        assert!(text.contains("Your prompt was: tell me something..."));
        assert_eq!(output.text_len, text.len());
        assert!(output.error.is_none());
    }

    #[test]
    fn test_max_tokens_limits_output() {
        let mut fx = fixture(StubOptions::default(), seeded());
        let (pieces, result) = run(&mut fx, "hi", 3);
        let output = result.unwrap();
        assert_eq!(output.stop_reason, StopReason::MaxTokens);
        assert_eq!(pieces, vec!["Hello! ", "This ", "is "]);
        // One prefill plus one decode per accepted token.
        assert_eq!(fx.backend.counters().decode_calls(), 4);
    }

    #[test]
    fn test_max_tokens_zero_emits_nothing() {
        let mut fx = fixture(StubOptions::default(), seeded());
        let (pieces, result) = run(&mut fx, "hi", 0);
        let output = result.unwrap();
        assert!(pieces.is_empty());
        assert_eq!(output.generated_tokens, 0);
        assert_eq!(output.stop_reason, StopReason::MaxTokens);
        assert_eq!(fx.backend.counters().decode_calls(), 1);
    }

    #[test]
    fn test_cancel_before_first_token() {
        let mut fx = fixture(StubOptions::default(), seeded());
        let cancel = AtomicBool::new(true);
        let mut count = 0;
        let output = run_generation(&fx.backend, &mut fx.loaded, "hi", 100, &cancel, &mut |_: &str| {
            count += 1
        })
        .unwrap();
        assert_eq!(output.stop_reason, StopReason::Cancelled);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_cancel_from_callback_stops_at_next_step() {
        let mut fx = fixture(StubOptions::default(), seeded());
        let cancel = AtomicBool::new(false);
        let mut count = 0;
        let output = run_generation(&fx.backend, &mut fx.loaded, "hi", 100, &cancel, &mut |_: &str| {
            count += 1;
            if count == 2 {
                cancel.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
        assert_eq!(output.stop_reason, StopReason::Cancelled);
        assert_eq!(output.generated_tokens, 2);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_prompt_too_long() {
        let config = LlamaConfig { context_size: 8, ..seeded() };
        let mut fx = fixture(StubOptions::default(), config);
        // BOS + 4 words = 5 tokens > 8 - 4.
        let (pieces, result) = run(&mut fx, "one two three four", 10);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert!(err.to_string().contains("prompt too long for context size"));
        assert!(pieces.is_empty());
    }

    #[test]
    fn test_prompt_at_limit_is_accepted() {
        let config = LlamaConfig { context_size: 8, ..seeded() };
        let mut fx = fixture(StubOptions::default(), config);
        // BOS + 3 words = 4 tokens == limit.
        let (_, result) = run(&mut fx, "one two three", 2);
        assert_eq!(result.unwrap().generated_tokens, 2);
    }

    #[test]
    fn test_tokenization_failure() {
        let mut fx = fixture(StubOptions::default(), seeded());
        let (pieces, result) = run(&mut fx, "nul\0byte", 10);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Tokenization);
        assert!(pieces.is_empty());
    }

    #[test]
    fn test_prompt_decode_failure() {
        let options = StubOptions { fail_decode_at: Some(0), ..Default::default() };
        let mut fx = fixture(options, seeded());
        let (_, result) = run(&mut fx, "hi", 10);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(err.to_string().starts_with("failed to process prompt"));
    }

    #[test]
    fn test_token_decode_failure_keeps_partial_output() {
        // Prompt occupies positions 0..2; the third generated token lands on 4.
        let options = StubOptions { fail_decode_at: Some(4), ..Default::default() };
        let mut fx = fixture(options, seeded());
        let (pieces, result) = run(&mut fx, "hi", 10);
        let output = result.unwrap();
        assert_eq!(output.stop_reason, StopReason::DecodeFailed);
        assert_eq!(pieces.len(), 3);
        let err = output.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(matches!(err, SessionError::TokenDecode { position: 4, .. }));
    }

    #[test]
    fn test_each_call_starts_from_position_zero() {
        let mut fx = fixture(StubOptions::default(), seeded());
        let (first, _) = run(&mut fx, "same prompt", 512);
        let (second, _) = run(&mut fx, "same prompt", 512);
        assert_eq!(first, second);
    }

    #[test]
    fn test_babble_is_deterministic_for_fixed_seed() {
        let options = StubOptions { script: StubScript::Babble, ..Default::default() };
        let mut fx = fixture(options, seeded());
        let (first, r1) = run(&mut fx, "once upon a time", 40);
        let (second, r2) = run(&mut fx, "once upon a time", 40);
        assert_eq!(r1.unwrap().stop_reason, StopReason::MaxTokens);
        assert_eq!(r2.unwrap().generated_tokens, 40);
        assert_eq!(first, second);
    }

    #[test]
    fn test_runs_past_window_end_report_decode_failure() {
        let options = StubOptions { script: StubScript::Babble, ..Default::default() };
        let config = LlamaConfig { context_size: 16, ..seeded() };
        let mut fx = fixture(options, config);
        let (pieces, result) = run(&mut fx, "go", 100);
        let output = result.unwrap();
        assert_eq!(output.stop_reason, StopReason::DecodeFailed);
        // Positions 2..16 decode; the token sampled at 16 is emitted, then rejected.
        assert_eq!(pieces.len(), 15);
    }

    #[test]
    fn test_split_character_is_streamed_whole() {
        let mut fx = fixture(StubOptions::default(), seeded());
        // The echo replays U+00E9 as two byte tokens.
        let (pieces, result) = run(&mut fx, "caf <0xC3> <0xA9> ok", 512);
        let output = result.unwrap();
        assert_eq!(output.stop_reason, StopReason::EndOfGeneration);
        assert!(pieces.iter().all(|p| !p.is_empty() && !p.contains('\u{fffd}')), "{:?}", pieces);
        assert!(pieces.iter().any(|p| p == "\u{e9}"), "{:?}", pieces);
        let text = pieces.concat();
        assert!(text.ends_with("Your prompt was: caf \u{e9}ok... "), "{}", text);
        assert_eq!(output.text_len, text.len());
        assert!(output.generated_tokens > pieces.len());
    }

    #[test]
    fn test_dangling_byte_is_flushed_at_stop() {
        let mut fx = fixture(StubOptions::default(), seeded());
        // Reply words, then "Your prompt was:", then the lead byte of U+00E9.
        let through_lead_byte = CANNED_REPLY.split_whitespace().count() + 4;
        let (pieces, result) = run(&mut fx, "<0xC3> <0xA9> ok", through_lead_byte);
        let output = result.unwrap();
        assert_eq!(output.stop_reason, StopReason::MaxTokens);
        assert_eq!(pieces.last().map(String::as_str), Some("\u{fffd}"));
        assert_eq!(pieces[pieces.len() - 2], "was: ");
        assert_eq!(output.text_len, pieces.concat().len());
    }

    #[test]
    fn test_missing_sampler_chain_is_reported() {
        let mut fx = fixture(StubOptions::default(), seeded());
        fx.loaded.sampler = None;
        let (pieces, result) = run(&mut fx, "hi", 10);
        let err = result.unwrap_err();
        assert!(matches!(err, SessionError::SamplerInit(EngineError::SamplerRejected(_))));
        assert!(pieces.is_empty());
        assert_eq!(fx.backend.counters().decode_calls(), 0);
    }
}
