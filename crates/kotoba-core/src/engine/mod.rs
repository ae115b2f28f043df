//! Kotoba core engine: generation session orchestration around a token source.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use kotoba_abi::{Batch, TokenSource};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::grammar::{GrammarConstraint, GrammarState, Vocabulary};
use crate::sampling::ConstrainedSampler;
use crate::transcript::SharedTranscript;
use crate::utf8::ByteAccumulator;

// Child modules (private to this crate). They can access private fields here.
mod decode;
mod prefill;

pub use decode::Generation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Generating,
    Cancelling,
    /// A step failed; only `reset` leaves this state.
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    /// Text decoded this step; empty while a code point is still incomplete.
    TextChunk(String),
    EndOfGeneration,
}

/// Cooperative cancellation flag shared with other threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request a stop; honoured before the next decode.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Session = {token source} + {sampler} + {optional grammar} + {batch/cursor}.
/// One `GenerationSession` runs at most one generation at a time.
pub struct GenerationSession<S: TokenSource> {
    source: S,
    config: EngineConfig,
    sampler: ConstrainedSampler,
    grammar: Option<GrammarConstraint>,
    grammar_state: Option<GrammarState>,
    batch: Batch,
    accumulator: ByteAccumulator,
    transcript: SharedTranscript,
    // ========== generation bookkeeping ==========
    cursor: i32,
    state: SessionState,
    stop: StopHandle,
}

impl<S: TokenSource> GenerationSession<S> {
    /// Compile the configured grammar against `source`'s vocabulary and
    /// allocate the batch.
    pub fn initialize(source: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let grammar = match &config.grammar {
            Some(src) => {
                let definition = src.load()?;
                let vocab = Vocabulary::from_source(&source)?;
                Some(GrammarConstraint::new(definition, Arc::new(vocab)))
            }
            None => None,
        };

        tracing::info!(
            "[init] n_vocab={} n_ctx={} batch_capacity={} grammar={} policy={:?}",
            source.n_vocab(),
            source.context_capacity(),
            config.batch_capacity,
            grammar.is_some(),
            config.policy
        );

        Ok(Self {
            sampler: ConstrainedSampler::new(&config.sampling, config.policy),
            batch: Batch::new(config.batch_capacity),
            accumulator: ByteAccumulator::new(config.max_stalled_steps),
            source,
            grammar,
            grammar_state: None,
            transcript: SharedTranscript::default(),
            cursor: 0,
            state: SessionState::Idle,
            stop: StopHandle::default(),
            config,
        })
    }

    /// Start a generation and return its stream.
    pub fn send(&mut self, prompt: &str) -> Result<Generation<'_, S>> {
        self.start(prompt)?;
        Ok(self.run())
    }

    /// Stream for the generation set up by `start`.
    pub fn run(&mut self) -> Generation<'_, S> {
        Generation::new(self)
    }

    /// Stop any active generation and clear the backend context.
    pub fn abort(&mut self) {
        self.stop.cancel();
        match self.state {
            SessionState::Generating | SessionState::Cancelling => {
                tracing::info!("[abort] cancelling generation at cursor {}", self.cursor);
                self.state = SessionState::Cancelling;
                self.finish(SessionState::Idle);
            }
            SessionState::Idle | SessionState::Errored => self.source.clear_context(),
        }
    }

    /// Abort, discard the transcript and leave the errored state.
    pub fn reset(&mut self) {
        self.abort();
        self.transcript.clear();
        self.state = SessionState::Idle;
        tracing::info!("[reset] session cleared");
    }

    /// Reset, then rebuild the backend context from scratch.
    pub fn reinitialize(&mut self) -> Result<()> {
        self.reset();
        if let Err(e) = self.source.reinitialize() {
            self.state = SessionState::Errored;
            return Err(e.into());
        }
        tracing::info!("[reset] backend context reinitialized");
        Ok(())
    }

    /// Handle you can keep and flip to cancel decoding from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// All text emitted since the last reset.
    pub fn transcript(&self) -> String {
        self.transcript.text()
    }

    /// Handle for reading the transcript while this session is borrowed
    /// elsewhere, e.g. by a generation running on another thread.
    pub fn shared_transcript(&self) -> SharedTranscript {
        self.transcript.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Position the next sampled token will occupy.
    pub fn cursor(&self) -> i32 {
        self.cursor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Tear down the current generation: context, batch, pending bytes and
    /// parse cursor all go, and the cursor returns to 0.
    fn finish(&mut self, next: SessionState) {
        self.source.clear_context();
        self.batch.clear();
        if !self.accumulator.is_empty() {
            tracing::warn!(
                "[finish] dropping {} pending bytes",
                self.accumulator.pending().len()
            );
        }
        self.accumulator.clear();
        self.grammar_state = None;
        self.cursor = 0;
        self.state = next;
    }
}

// NOTE: The per-generation work lives in child modules as
// `impl GenerationSession<S>`:
//
// - prefill.rs:    start(...)
// - decode.rs:     step(...) and the `Generation` stream
