use std::path::PathBuf;

use thiserror::Error;

/// Failure classes reported across the public session boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad path, engine rejected the model, context creation failed, or
    /// the configuration was invalid.
    Load,
    /// Operation attempted with no active model.
    NotLoaded,
    /// The prompt could not be encoded.
    Tokenization,
    /// The prompt does not fit into the context window.
    Capacity,
    /// The engine rejected the prompt batch or a token batch.
    Decode,
    /// Per-call generation settings were out of range. The loaded model is
    /// untouched.
    InvalidArgument,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to load model from: {}", .path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: EngineError,
    },

    #[error("failed to create inference context: {0}")]
    ContextCreate(#[source] EngineError),

    #[error("failed to build sampler chain: {0}")]
    SamplerInit(#[source] EngineError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid generation settings: {0}")]
    InvalidOverride(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model not loaded")]
    NotLoaded,

    #[error("failed to tokenize prompt: {0}")]
    Tokenization(String),

    #[error("prompt too long for context size ({tokens} tokens, limit {limit})")]
    PromptTooLong { tokens: usize, limit: usize },

    #[error("failed to process prompt: {0}")]
    PromptDecode(#[source] EngineError),

    #[error("failed to decode token at position {position}: {source}")]
    TokenDecode {
        position: usize,
        #[source]
        source: EngineError,
    },
}

impl SessionError {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::ModelLoad { .. }
            | SessionError::ContextCreate(_)
            | SessionError::SamplerInit(_)
            | SessionError::Config(_)
            | SessionError::Io(_)
            | SessionError::Json(_) => ErrorKind::Load,
            SessionError::NotLoaded => ErrorKind::NotLoaded,
            SessionError::Tokenization(_) => ErrorKind::Tokenization,
            SessionError::PromptTooLong { .. } => ErrorKind::Capacity,
            SessionError::PromptDecode(_) | SessionError::TokenDecode { .. } => ErrorKind::Decode,
            SessionError::InvalidOverride(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// Errors surfaced by an [`InferenceBackend`](crate::backend::InferenceBackend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("model rejected: {0}")]
    ModelRejected(String),

    #[error("context rejected: {0}")]
    ContextRejected(String),

    #[error("sampler rejected: {0}")]
    SamplerRejected(String),

    #[error("decode returned status {code}: {reason}")]
    Decode { code: i32, reason: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let load = SessionError::ModelLoad {
            path: PathBuf::from("/models/a.gguf"),
            source: EngineError::ModelRejected("bad magic".into()),
        };
        assert_eq!(load.kind(), ErrorKind::Load);
        assert_eq!(SessionError::NotLoaded.kind(), ErrorKind::NotLoaded);
        assert_eq!(
            SessionError::PromptTooLong { tokens: 10, limit: 4 }.kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            SessionError::PromptDecode(EngineError::Decode { code: 1, reason: "x".into() }).kind(),
            ErrorKind::Decode
        );
        assert_eq!(SessionError::Config("x".into()).kind(), ErrorKind::Load);
        let bad = SessionError::InvalidOverride("top_p must be in (0, 1]".into());
        assert_eq!(bad.kind(), ErrorKind::InvalidArgument);
        assert!(bad.to_string().starts_with("invalid generation settings"));
    }

    #[test]
    fn test_messages_name_the_failure() {
        let load = SessionError::ModelLoad {
            path: PathBuf::from("/models/a.gguf"),
            source: EngineError::ModelRejected("bad magic".into()),
        };
        assert_eq!(load.to_string(), "failed to load model from: /models/a.gguf");
        assert_eq!(SessionError::NotLoaded.to_string(), "model not loaded");

        let msg = SessionError::PromptTooLong { tokens: 30, limit: 12 }.to_string();
        assert!(msg.starts_with("prompt too long for context size"), "{}", msg);
        assert!(msg.contains("30"));

        let msg = SessionError::Tokenization("engine refused input".into()).to_string();
        assert!(msg.starts_with("failed to tokenize prompt"), "{}", msg);
    }

    #[test]
    fn test_token_decode_includes_position_and_status() {
        let err = SessionError::TokenDecode {
            position: 17,
            source: EngineError::Decode { code: 2, reason: "kv cache full".into() },
        };
        let msg = err.to_string();
        assert!(msg.contains("17"));
        assert!(msg.contains("status 2"));
        assert!(msg.contains("kv cache full"));
    }
}
