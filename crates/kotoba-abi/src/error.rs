use thiserror::Error;

/// Failures reported by a [`TokenSource`](crate::backend::TokenSource).
///
/// Variants map one-to-one onto the engine's error taxonomy so that the core
/// can tell a tokenizer failure from a decode failure without parsing strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("context init failed: {0}")]
    ContextInit(String),

    #[error("tokenize failed: {0}")]
    Tokenize(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("token conversion failed: {0}")]
    Conversion(String),

    /// Logits were requested for a batch entry that did not ask for them.
    #[error("no logits for batch index {0}")]
    Logits(usize),
}

pub type Result<T> = std::result::Result<T, SourceError>;
