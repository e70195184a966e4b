//! Inference backend trait and engine-facing types.
//!
//! Defines the [`InferenceBackend`] trait with every operation the session
//! needs from the underlying engine: model load, context creation,
//! vocabulary access, batch decode and the sampler chain. Model, context and
//! sampler handles are owned values that release their engine resources on
//! drop.

pub mod batch;
pub(crate) mod runtime;
pub mod stub;

use std::path::Path;

use crate::config::{ContextParams, ModelParams};
use crate::engine::sampler::SamplerStage;
use crate::error::EngineError;
use thiserror::Error;

pub use batch::{Batch, BatchToken};
pub use runtime::active_sessions;
pub use stub::{StubBackend, StubCounters, StubOptions, StubScript};

/// Token ID type (i32 to match engine vocabularies; logically non-negative).
pub type TokenId = i32;

/// Tokenizer failures reported by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizeError {
    /// The output buffer was too small; `required` slots are needed.
    #[error("token buffer too small ({required} slots required)")]
    InsufficientSpace { required: usize },
    /// The engine could not encode the text.
    #[error("{0}")]
    Failed(String),
}

/// Piece-conversion failures reported by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PieceError {
    /// The piece needs `required` bytes.
    #[error("piece buffer too small ({required} bytes required)")]
    BufferTooSmall { required: usize },
    /// The token has no textual piece (unknown id, control token).
    #[error("token has no piece")]
    Invalid,
}

/// The engine a [`Session`](crate::Session) drives.
///
/// Handles are exclusively owned by the session. `Sampler` depends on
/// `Context`, which depends on `Model`; the session drops them in that order.
pub trait InferenceBackend: Send + Sync + 'static {
    /// Short backend name, used as the suffix of the session version string.
    const NAME: &'static str;

    type Model: Send;
    type Context: Send;
    type Sampler: Send;

    /// Process-wide setup. Called once before the first session of this
    /// backend type becomes live.
    fn init_process(&self) {}

    /// Process-wide teardown. Called once after the last session of this
    /// backend type is dropped.
    fn free_process(&self) {}

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, EngineError>;

    fn new_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, EngineError>;

    /// Context window size in tokens, as allocated by the engine.
    fn context_size(&self, ctx: &Self::Context) -> usize;

    /// Encode `text` into `out`, returning the number of tokens written.
    fn tokenize(
        &self,
        model: &Self::Model,
        text: &str,
        add_bos: bool,
        parse_special: bool,
        out: &mut [TokenId],
    ) -> Result<usize, TokenizeError>;

    /// Write the textual piece of `token` into `buf`, returning its length.
    fn token_to_piece(
        &self,
        model: &Self::Model,
        token: TokenId,
        buf: &mut [u8],
    ) -> Result<usize, PieceError>;

    /// Whether `token` ends generation (EOS, EOT, ...).
    fn is_end_of_generation(&self, model: &Self::Model, token: TokenId) -> bool;

    /// Drop all cached positions so the next decode starts at position 0.
    fn clear_kv_cache(&self, ctx: &mut Self::Context);

    /// Run the model over `batch`.
    fn decode(&self, ctx: &mut Self::Context, batch: &Batch) -> Result<(), EngineError>;

    /// Create an empty sampler chain.
    fn sampler_chain(&self, model: &Self::Model) -> Result<Self::Sampler, EngineError>;

    /// Append a stage to the end of `chain`.
    fn sampler_chain_add(&self, chain: &mut Self::Sampler, stage: SamplerStage);

    /// Reseed the chain and clear its token history.
    fn reset_sampler(&self, chain: &mut Self::Sampler);

    /// Draw the next token from the logits of the last decoded batch and
    /// record it in the chain's history.
    fn sample(&self, chain: &mut Self::Sampler, ctx: &Self::Context) -> TokenId;
}
