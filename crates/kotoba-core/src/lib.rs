//! Kotoba core: grammar-constrained streaming text generation over a
//! [`TokenSource`](kotoba_abi::TokenSource).

pub mod config;
pub mod engine;
pub mod error;
pub mod grammar;
#[cfg(feature = "llama")]
pub mod llama;
pub mod mock;
pub mod sampling;
pub mod stream;
pub mod transcript;
pub mod utf8;
pub mod utils;

pub use config::{EngineConfig, GrammarSource};
pub use engine::{Generation, GenerationResult, GenerationSession, SessionState, StopHandle};
pub use error::{EngineError, Result};
pub use grammar::{GrammarConstraint, GrammarDefinition, GrammarError, GrammarState, Vocabulary};
pub use mock::ScriptedSource;
pub use sampling::{ConstrainedSampler, SamplerPolicy, SamplingError};
pub use stream::{AsyncSession, GenerationStream};
pub use transcript::{SharedTranscript, Transcript};
pub use utf8::{ByteAccumulator, UndecodableOutput};
