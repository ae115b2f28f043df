use kotoba_abi::TokenSource;

use super::{GenerationResult, GenerationSession, SessionState};
use crate::error::{EngineError, Result};
use crate::utils::debug::dump_str;

impl<S: TokenSource> GenerationSession<S> {
    /// One decode → sample → detokenize step. `None` once the generation is
    /// over (finished, cancelled, failed, or never started).
    pub(super) fn step(&mut self) -> Option<Result<GenerationResult>> {
        if self.state != SessionState::Generating {
            return None;
        }

        if self.stop.is_cancelled() {
            tracing::info!("[step] STOP requested at cursor {}", self.cursor);
            self.state = SessionState::Cancelling;
            self.finish(SessionState::Idle);
            return None;
        }

        match self.advance() {
            Ok(result) => Some(Ok(result)),
            Err(e) => {
                tracing::warn!("[step] generation failed at cursor {}: {e}", self.cursor);
                self.finish(SessionState::Errored);
                Some(Err(e))
            }
        }
    }

    fn advance(&mut self) -> Result<GenerationResult> {
        let used = self.source.used_context_slots();
        let capacity = self.source.context_capacity();
        if used + self.batch.len() > capacity {
            return Err(EngineError::ContextOverflow {
                used,
                batch: self.batch.len(),
                capacity,
            });
        }

        self.source.decode(&self.batch)?;
        let index = self
            .batch
            .last_index()
            .ok_or_else(|| EngineError::Decode("decoded an empty batch".into()))?;

        let token = {
            let logits = self.source.logits(index)?;
            self.sampler.select(logits, self.grammar_state.as_ref())?
        };
        tracing::debug!("[step] cursor={} sampled {:?}", self.cursor, token);

        if let Some(grammar) = self.grammar_state.as_mut() {
            grammar.accept(token)?;
        }

        if self.source.is_end_of_generation(token) {
            tracing::info!("[step] end of generation at cursor {}", self.cursor);
            self.finish(SessionState::Idle);
            return Ok(GenerationResult::EndOfGeneration);
        }

        let bytes = self.source.detokenize(token)?;
        let chunk = self.accumulator.push(&bytes)?;
        dump_str("[step] chunk", &chunk);
        self.transcript.push_chunk(&chunk);

        self.batch.clear();
        self.batch.add(token, self.cursor, true)?;
        self.cursor += 1;

        Ok(GenerationResult::TextChunk(chunk))
    }
}

/// Lazy stream over one generation. Each `next` performs exactly one step.
///
/// Holds the session mutably, so a session never runs two generations at
/// once. Dropping the stream before it ends aborts the generation.
pub struct Generation<'s, S: TokenSource> {
    session: &'s mut GenerationSession<S>,
    done: bool,
}

impl<'s, S: TokenSource> Generation<'s, S> {
    pub(super) fn new(session: &'s mut GenerationSession<S>) -> Self {
        let done = session.state != SessionState::Generating;
        Self { session, done }
    }

    /// Drain the stream, concatenating chunks. The first error is returned.
    pub fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        for item in &mut self {
            match item? {
                GenerationResult::TextChunk(chunk) => text.push_str(&chunk),
                GenerationResult::EndOfGeneration => break,
            }
        }
        Ok(text)
    }
}

impl<S: TokenSource> Iterator for Generation<'_, S> {
    type Item = Result<GenerationResult>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.session.step();
        self.done = matches!(
            item,
            None | Some(Err(_)) | Some(Ok(GenerationResult::EndOfGeneration))
        );
        item
    }
}

impl<S: TokenSource> Drop for Generation<'_, S> {
    fn drop(&mut self) {
        if matches!(
            self.session.state,
            SessionState::Generating | SessionState::Cancelling
        ) {
            tracing::warn!(
                "[abort] generation dropped at cursor {}; aborting",
                self.session.cursor
            );
            self.session.abort();
        }
    }
}
