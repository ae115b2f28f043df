//! Incremental byte → text reassembly across token boundaries.
//!
//! A detokenized token is a raw byte fragment that may stop in the middle of a
//! multi-byte code point. The accumulator stages such fragments until they
//! decode, and emits one (possibly empty) chunk per step.

use thiserror::Error;

use crate::utils::debug::dump_bytes;

/// Default bound on consecutive steps that end with undecodable bytes.
pub const DEFAULT_MAX_STALLED_STEPS: usize = 8;

/// The staging buffer failed to converge to valid UTF-8.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("undecodable output after {steps} steps: {} pending bytes", pending.len())]
pub struct UndecodableOutput {
    pub pending: Vec<u8>,
    pub steps: usize,
}

#[derive(Debug, Clone)]
pub struct ByteAccumulator {
    pending: Vec<u8>,
    stalled: usize,
    max_stalled: usize,
}

impl Default for ByteAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STALLED_STEPS)
    }
}

impl ByteAccumulator {
    pub fn new(max_stalled_steps: usize) -> Self {
        Self {
            pending: Vec::with_capacity(8),
            stalled: 0,
            max_stalled: max_stalled_steps.max(1),
        }
    }

    /// Feed one token's bytes; returns the text chunk for this step.
    pub fn push(&mut self, fragment: &[u8]) -> Result<String, UndecodableOutput> {
        self.pending.extend_from_slice(fragment);
        dump_bytes("accumulator", &self.pending);

        if let Ok(text) = std::str::from_utf8(&self.pending) {
            let text = text.to_owned();
            self.clear();
            return Ok(text);
        }

        // Longest non-empty suffix that decodes on its own. Whatever precedes
        // it is malformed output, not a split code point, and is dropped.
        if let Some((start, text)) = (1..self.pending.len()).find_map(|start| {
            std::str::from_utf8(&self.pending[start..])
                .ok()
                .map(|text| (start, text.to_owned()))
        }) {
            tracing::warn!(
                "[utf8] dropping {} malformed bytes before a valid suffix",
                start
            );
            self.clear();
            return Ok(text);
        }

        self.stalled += 1;
        if self.stalled > self.max_stalled {
            let err = UndecodableOutput {
                pending: std::mem::take(&mut self.pending),
                steps: self.stalled,
            };
            self.stalled = 0;
            return Err(err);
        }
        Ok(String::new())
    }

    /// Bytes held back for the next step.
    #[inline]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.stalled = 0;
    }
}
