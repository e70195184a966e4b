pub mod error;
pub mod config;
pub mod backend;
pub mod tokenizer;
pub mod engine;
pub mod session;
pub mod cli;

/// Crate version reported by [`Session::version`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use error::{EngineError, ErrorKind, SessionError};
pub use config::LlamaConfig;
pub use backend::{InferenceBackend, StubBackend, TokenId};
pub use engine::{GenerationOutput, StopReason};
pub use session::{CancelHandle, Session};
