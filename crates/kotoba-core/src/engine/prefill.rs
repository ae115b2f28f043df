use kotoba_abi::{BatchError, TokenSource};

use super::{GenerationSession, SessionState};
use crate::error::{EngineError, Result};

impl<S: TokenSource> GenerationSession<S> {
    /// Tokenize `prompt`, fill the batch with it and enter `Generating`.
    ///
    /// An active generation is aborted first. The backend context is cleared
    /// whenever it still holds cells, so the cursor restarts at the prompt
    /// length together with an empty cache.
    pub fn start(&mut self, prompt: &str) -> Result<()> {
        match self.state {
            SessionState::Errored => return Err(EngineError::SessionErrored),
            SessionState::Generating | SessionState::Cancelling => {
                tracing::warn!("[start] aborting the active generation first");
                self.abort();
            }
            SessionState::Idle => {}
        }
        self.stop.reset();

        let tokens = self.source.tokenize(prompt, self.config.add_bos)?;
        if tokens.is_empty() {
            return Err(EngineError::Tokenize("prompt produced no tokens".into()));
        }
        if tokens.len() > self.batch.capacity() {
            return Err(EngineError::BatchOverflow(BatchError::Full {
                capacity: self.batch.capacity(),
            }));
        }
        tracing::debug!("[start] prompt tokenized ({} tokens)", tokens.len());

        if self.source.used_context_slots() > 0 {
            tracing::debug!(
                "[start] clearing {} stale context cells",
                self.source.used_context_slots()
            );
            self.source.clear_context();
        }

        self.batch.clear();
        for (pos, &token) in tokens.iter().enumerate() {
            self.batch.add(token, pos as i32, false)?;
        }
        self.batch.mark_last_for_logits();

        self.cursor = tokens.len() as i32;
        self.grammar_state = self.grammar.as_ref().map(|g| g.new_state());
        self.accumulator.clear();
        self.sampler.reseed();
        self.transcript.begin_generation();
        self.state = SessionState::Generating;

        tracing::info!("[start] generating; cursor = {}", self.cursor);
        Ok(())
    }
}
