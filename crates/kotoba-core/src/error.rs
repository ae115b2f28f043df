//! Error taxonomy for the generation engine.

use kotoba_abi::{BatchError, SourceError};
use thiserror::Error;

use crate::grammar::GrammarError;
use crate::sampling::SamplingError;
use crate::utf8::UndecodableOutput;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Fatal to `initialize`.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Fatal to `initialize`.
    #[error("context init failed: {0}")]
    ContextInit(String),

    /// Fatal to `start`.
    #[error("tokenize failed: {0}")]
    Tokenize(String),

    #[error("context overflow: {used} used + {batch} batched > {capacity}")]
    ContextOverflow {
        used: usize,
        batch: usize,
        capacity: usize,
    },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("token conversion failed: {0}")]
    Conversion(String),

    #[error(transparent)]
    UndecodableOutput(#[from] UndecodableOutput),

    #[error("no viable token: every candidate was masked")]
    NoViableToken,

    #[error("batch overflow: {0}")]
    BatchOverflow(#[from] BatchError),

    #[error(transparent)]
    Grammar(#[from] GrammarError),

    /// A previous generation failed; call `reset` before reusing the session.
    #[error("session is in the errored state; reset it first")]
    SessionErrored,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<SourceError> for EngineError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::ModelLoad(m) => EngineError::ModelLoad(m),
            SourceError::ContextInit(m) => EngineError::ContextInit(m),
            SourceError::Tokenize(m) => EngineError::Tokenize(m),
            SourceError::Decode(m) => EngineError::Decode(m),
            SourceError::Conversion(m) => EngineError::Conversion(m),
            SourceError::Logits(i) => EngineError::Decode(format!("no logits for batch index {i}")),
        }
    }
}

impl From<SamplingError> for EngineError {
    fn from(e: SamplingError) -> Self {
        match e {
            SamplingError::NoViableToken => EngineError::NoViableToken,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_errors_keep_their_kind() {
        assert_eq!(
            EngineError::from(SourceError::Tokenize("nul byte".into())),
            EngineError::Tokenize("nul byte".into())
        );
        assert!(matches!(
            EngineError::from(SourceError::Logits(3)),
            EngineError::Decode(_)
        ));
    }

    #[test]
    fn overflow_message_names_the_numbers() {
        let e = EngineError::ContextOverflow {
            used: 8,
            batch: 1,
            capacity: 8,
        };
        assert_eq!(e.to_string(), "context overflow: 8 used + 1 batched > 8");
    }
}
