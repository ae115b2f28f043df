// Owned token batch submitted to a backend in one decode call.
//
// - Capacity is fixed at construction; `add` refuses to grow past it
// - Entries must be appended with strictly increasing positions
// - Safe to reuse with `clear()`

use thiserror::Error;

use crate::token::Token;

/// One entry of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: Token,
    pub pos: i32,
    pub seq_id: i32,
    pub logits: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch full: capacity {capacity}")]
    Full { capacity: usize },

    #[error("position {pos} does not follow previous position {prev}")]
    NonIncreasingPosition { prev: i32, pos: i32 },
}

#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    /// Create an empty token batch holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append one token on sequence 0.
    /// - `pos` must be greater than the position of the previous entry.
    /// - set `logits = true` only for entries whose logits you will read.
    pub fn add(&mut self, token: Token, pos: i32, logits: bool) -> Result<(), BatchError> {
        if self.entries.len() >= self.capacity {
            return Err(BatchError::Full {
                capacity: self.capacity,
            });
        }
        if let Some(prev) = self.entries.last() {
            if pos <= prev.pos {
                return Err(BatchError::NonIncreasingPosition {
                    prev: prev.pos,
                    pos,
                });
            }
        }
        self.entries.push(BatchEntry {
            token,
            pos,
            seq_id: 0,
            logits,
        });
        Ok(())
    }

    /// Ensure only the last entry is marked for logits.
    pub fn mark_last_for_logits(&mut self) {
        let n = self.entries.len();
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.logits = i + 1 == n;
        }
    }

    /// Reset the batch so its storage can be reused.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Index of the last entry, which is where the next token's logits live.
    #[inline]
    pub fn last_index(&self) -> Option<usize> {
        self.entries.len().checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_exceed_capacity() {
        let mut batch = Batch::new(2);
        batch.add(Token(1), 0, false).unwrap();
        batch.add(Token(2), 1, false).unwrap();
        assert_eq!(
            batch.add(Token(3), 2, true),
            Err(BatchError::Full { capacity: 2 })
        );
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn positions_must_increase() {
        let mut batch = Batch::new(4);
        batch.add(Token(1), 5, false).unwrap();
        assert_eq!(
            batch.add(Token(2), 5, false),
            Err(BatchError::NonIncreasingPosition { prev: 5, pos: 5 })
        );
    }

    #[test]
    fn only_last_entry_wants_logits() {
        let mut batch = Batch::new(3);
        for (i, t) in [10, 11, 12].into_iter().enumerate() {
            batch.add(Token(t), i as i32, true).unwrap();
        }
        batch.mark_last_for_logits();
        let flags: Vec<bool> = batch.entries().iter().map(|e| e.logits).collect();
        assert_eq!(flags, vec![false, false, true]);
        assert_eq!(batch.last_index(), Some(2));
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut batch = Batch::new(1);
        batch.add(Token(1), 0, true).unwrap();
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.last_index(), None);
        batch.add(Token(2), 0, true).unwrap();
        assert_eq!(batch.capacity(), 1);
    }
}
