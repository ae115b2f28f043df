//! Rolling per-session record of generated text.
//! Only `reset` discards it; aborting or finishing a generation keeps it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default, Debug, Clone)]
pub struct Transcript {
    text: String,
    generations: usize,
}

impl Transcript {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted since the last reset, oldest first.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of generations started since the last reset.
    #[inline]
    pub fn generations(&self) -> usize {
        self.generations
    }

    #[inline]
    pub(crate) fn begin_generation(&mut self) {
        self.generations += 1;
    }

    #[inline]
    pub(crate) fn push_chunk(&mut self, chunk: &str) {
        self.text.push_str(chunk);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Remove all history.
    #[inline]
    pub fn clear(&mut self) {
        self.text.clear();
        self.generations = 0;
    }
}

/// Transcript shared between a session and its readers. The lock is held
/// only for one append or read, never across a step.
#[derive(Default, Debug, Clone)]
pub struct SharedTranscript(Arc<Mutex<Transcript>>);

impl SharedTranscript {
    fn lock(&self) -> MutexGuard<'_, Transcript> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the text emitted so far.
    pub fn text(&self) -> String {
        self.lock().as_str().to_owned()
    }

    pub fn generations(&self) -> usize {
        self.lock().generations()
    }

    pub(crate) fn begin_generation(&self) {
        self.lock().begin_generation();
    }

    pub(crate) fn push_chunk(&self, chunk: &str) {
        self.lock().push_chunk(chunk);
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}
