//! Text to token-id conversion through the engine vocabulary.
//!
//! The engine writes into caller-provided buffers and reports the size it
//! needed when they are too small. [`tokenize`] and [`detokenize`] own the
//! buffer sizing so callers deal only in `Vec<TokenId>` and `String`.
//! [`PieceDecoder`] does the same one token at a time for streaming.

use tracing::{error, warn};

use crate::backend::{InferenceBackend, PieceError, TokenId, TokenizeError};

/// Fast-path buffer size for a single token piece.
pub const PIECE_BUFFER_BYTES: usize = 256;

/// Initial token buffer for `text`: a quarter of its byte length plus slack.
fn initial_capacity(text: &str) -> usize {
    text.len() / 4 + 16
}

/// Encode `text`, prefixing the beginning-of-sequence marker when `add_bos`
/// is set. Special tokens written inline are parsed.
///
/// `Ok` with an empty vector means the input was valid and produced no
/// tokens; an `Err` means the engine failed to encode it.
pub fn tokenize<B: InferenceBackend>(
    backend: &B,
    model: &B::Model,
    text: &str,
    add_bos: bool,
) -> Result<Vec<TokenId>, TokenizeError> {
    let mut tokens: Vec<TokenId> = vec![0; initial_capacity(text)];

    let written = match backend.tokenize(model, text, add_bos, true, &mut tokens) {
        Ok(n) => n,
        Err(TokenizeError::InsufficientSpace { required }) => {
            tokens.resize(required, 0);
            backend
                .tokenize(model, text, add_bos, true, &mut tokens)
                .map_err(|e| {
                    error!(text_len = text.len(), required, error = %e, "Tokenization failed after resize");
                    e
                })?
        }
        Err(e) => {
            error!(text_len = text.len(), error = %e, "Tokenization failed");
            return Err(e);
        }
    };

    tokens.truncate(written);
    Ok(tokens)
}

/// Convert `tokens` back to text. Tokens the engine cannot render are logged
/// and skipped. Pieces are joined as bytes before UTF-8 conversion, so a
/// character split across tokens survives.
pub fn detokenize<B: InferenceBackend>(backend: &B, model: &B::Model, tokens: &[TokenId]) -> String {
    let mut bytes = Vec::with_capacity(tokens.len() * 4);
    let mut buf = vec![0u8; PIECE_BUFFER_BYTES];

    for &token in tokens {
        match piece_into(backend, model, token, &mut buf) {
            Ok(n) => bytes.extend_from_slice(&buf[..n]),
            Err(e) => warn!(token, error = %e, "Skipping token without a piece"),
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

/// Incremental detokenizer for streaming.
///
/// A token's piece may end partway through a multi-byte character. Bytes
/// are held back until they complete a character, so every string handed
/// out is whole UTF-8 and the concatenation of all of them equals
/// [`detokenize`] over the same tokens.
#[derive(Debug)]
pub struct PieceDecoder {
    pending: Vec<u8>,
    buf: Vec<u8>,
}

impl Default for PieceDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceDecoder {
    pub fn new() -> Self {
        Self { pending: Vec::new(), buf: vec![0u8; PIECE_BUFFER_BYTES] }
    }

    /// Append the piece of `token` and return whatever text is now complete.
    /// The result is empty while a character is still incomplete.
    pub fn push<B: InferenceBackend>(&mut self, backend: &B, model: &B::Model, token: TokenId) -> String {
        match piece_into(backend, model, token, &mut self.buf) {
            Ok(n) => self.pending.extend_from_slice(&self.buf[..n]),
            Err(e) => warn!(token, error = %e, "Skipping token without a piece"),
        }
        self.drain_complete()
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flush held-back bytes. An unfinished character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }

    fn drain_complete(&mut self) -> String {
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        // Malformed sequence: replace it and keep going.
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + bad);
                        }
                        // Truncated character: wait for the next piece.
                        None => {
                            self.pending.drain(..valid_up_to);
                            return text;
                        }
                    }
                }
            }
        }
    }
}

/// Write the piece of `token` into `buf`, growing it once if the engine asks
/// for more room.
fn piece_into<B: InferenceBackend>(
    backend: &B,
    model: &B::Model,
    token: TokenId,
    buf: &mut Vec<u8>,
) -> Result<usize, PieceError> {
    match backend.token_to_piece(model, token, buf) {
        Err(PieceError::BufferTooSmall { required }) => {
            buf.resize(required, 0);
            backend.token_to_piece(model, token, buf)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::{StubModel, BOS_TOKEN};
    use crate::backend::StubBackend;
    use crate::config::LlamaConfig;

    fn load() -> (StubBackend, tempfile::NamedTempFile, StubModel) {
        let backend = StubBackend::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        let model = backend
            .load_model(file.path(), &LlamaConfig::default().model_params())
            .unwrap();
        (backend, file, model)
    }

    #[test]
    fn test_tokenize_adds_bos() {
        let (backend, _file, model) = load();
        let ids = tokenize(&backend, &model, "hello world", true).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], BOS_TOKEN);
        let ids = tokenize(&backend, &model, "hello world", false).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_tokenize_empty_input_is_not_an_error() {
        let (backend, _file, model) = load();
        assert_eq!(tokenize(&backend, &model, "", false).unwrap(), Vec::<TokenId>::new());
    }

    #[test]
    fn test_tokenize_retries_with_required_capacity() {
        let (backend, _file, model) = load();
        // 300 one-letter words: far more tokens than len/4 + 16.
        let text = vec!["x"; 300].join(" ");
        assert!(initial_capacity(&text) < 301);
        let ids = tokenize(&backend, &model, &text, true).unwrap();
        assert_eq!(ids.len(), 301);
    }

    #[test]
    fn test_tokenize_engine_failure() {
        let (backend, _file, model) = load();
        let err = tokenize(&backend, &model, "bad\0input", true).unwrap_err();
        assert!(matches!(err, TokenizeError::Failed(_)));
    }

    #[test]
    fn test_detokenize_roundtrip_words() {
        let (backend, _file, model) = load();
        let ids = tokenize(&backend, &model, "the quick fox", false).unwrap();
        assert_eq!(detokenize(&backend, &model, &ids), "the quick fox ");
    }

    #[test]
    fn test_detokenize_grows_buffer_for_long_piece() {
        let (backend, _file, model) = load();
        let long_word = "z".repeat(PIECE_BUFFER_BYTES + 44);
        let ids = tokenize(&backend, &model, &long_word, false).unwrap();
        let text = detokenize(&backend, &model, &ids);
        assert_eq!(text, format!("{} ", long_word));
    }

    #[test]
    fn test_detokenize_skips_invalid_tokens() {
        let (backend, _file, model) = load();
        let ids = tokenize(&backend, &model, "alpha beta", false).unwrap();
        let text = detokenize(&backend, &model, &[ids[0], 99_999, ids[1]]);
        assert_eq!(text, "alpha beta ");
    }

    #[test]
    fn test_detokenize_empty() {
        let (backend, _file, model) = load();
        assert_eq!(detokenize(&backend, &model, &[]), "");
    }

    #[test]
    fn test_piece_decoder_holds_split_character() {
        let (backend, _file, model) = load();
        let ids = tokenize(&backend, &model, "<0xC3> <0xA9> ok", false).unwrap();
        let mut decoder = PieceDecoder::new();
        assert_eq!(decoder.push(&backend, &model, ids[0]), "");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.push(&backend, &model, ids[1]), "\u{e9}");
        assert_eq!(decoder.push(&backend, &model, ids[2]), "ok ");
        assert_eq!(decoder.finish(), "");
        assert_eq!(detokenize(&backend, &model, &ids), "\u{e9}ok ");
    }

    #[test]
    fn test_piece_decoder_replaces_malformed_and_dangling_bytes() {
        let (backend, _file, model) = load();
        // A lone continuation byte, then a lead byte that never completes.
        let ids = tokenize(&backend, &model, "<0xA9> a <0xE2>", false).unwrap();
        let mut decoder = PieceDecoder::new();
        let mut text = String::new();
        for &id in &ids {
            text.push_str(&decoder.push(&backend, &model, id));
        }
        assert_eq!(text, "\u{fffd}a ");
        assert_eq!(decoder.finish(), "\u{fffd}");
        assert_eq!(decoder.pending_len(), 0);
    }
}
