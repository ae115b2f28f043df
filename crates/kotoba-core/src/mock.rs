//! Deterministic in-memory token source.
//!
//! Vocabulary layout:
//! - ids 0..=255: one raw byte each
//! - [`ScriptedSource::EOG`]: end of generation, empty piece
//! - [`ScriptedSource::BOS`]: beginning of sequence, empty piece
//! - ids from 258: multi-byte pieces registered with `with_pieces`
//!
//! After the prompt, decode call *n* puts a high logit on the *n*-th scripted
//! token, then on EOG once the script runs out. Tokenization is greedy
//! longest-match, so multi-byte UTF-8 text without a registered piece ends up
//! as one token per byte.

use std::collections::HashSet;

use kotoba_abi::{Batch, SourceError, Token, TokenSource};

const SCRIPTED_LOGIT: f32 = 30.0;

#[derive(Debug, Clone)]
pub struct ScriptedSource {
    pieces: Vec<Vec<u8>>,
    capacity: usize,
    used: usize,
    script: Vec<Token>,
    eog_after_script: bool,
    logits: Vec<f32>,
    logits_index: Option<usize>,
    /// Decodes since the last clear; selects the scripted token.
    steps: usize,
    decode_calls: usize,
    clear_calls: usize,
    reinit_calls: usize,
    fail_decode_at: Option<usize>,
    broken: HashSet<Token>,
    positions: Vec<Vec<i32>>,
}

impl ScriptedSource {
    pub const EOG: Token = Token(256);
    pub const BOS: Token = Token(257);
    const FIRST_PIECE: usize = 258;

    /// Byte vocabulary with a context window of `capacity` cells.
    pub fn new(capacity: usize) -> Self {
        let mut pieces: Vec<Vec<u8>> = (0..=255u8).map(|b| vec![b]).collect();
        pieces.push(Vec::new()); // EOG
        pieces.push(Vec::new()); // BOS
        Self {
            pieces,
            capacity,
            used: 0,
            script: Vec::new(),
            eog_after_script: true,
            logits: Vec::new(),
            logits_index: None,
            steps: 0,
            decode_calls: 0,
            clear_calls: 0,
            reinit_calls: 0,
            fail_decode_at: None,
            broken: HashSet::new(),
            positions: Vec::new(),
        }
    }

    /// Register multi-byte pieces; duplicates and empty strings are skipped.
    pub fn with_pieces<I, P>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        for p in pieces {
            let bytes = p.as_ref().as_bytes();
            if bytes.len() > 1 && !self.pieces[Self::FIRST_PIECE..].iter().any(|x| x == bytes) {
                self.pieces.push(bytes.to_vec());
            }
        }
        self
    }

    pub fn with_script(mut self, script: Vec<Token>) -> Self {
        self.script = script;
        self
    }

    /// Script the tokens that spell `text`.
    pub fn with_text(self, text: &str) -> Self {
        let script = self.encode(text.as_bytes());
        self.with_script(script)
    }

    /// Keep repeating the last scripted token instead of ending.
    pub fn without_eog(mut self) -> Self {
        self.eog_after_script = false;
        self
    }

    /// Make the `n`-th decode call (1-based, counted over the source's life) fail.
    pub fn fail_decode_at(mut self, n: usize) -> Self {
        self.fail_decode_at = Some(n);
        self
    }

    /// Make `detokenize(token)` fail.
    pub fn fail_detokenize(mut self, token: Token) -> Self {
        self.broken.insert(token);
        self
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls
    }

    pub fn reinit_calls(&self) -> usize {
        self.reinit_calls
    }

    /// Positions of every decoded batch, in call order.
    pub fn decoded_positions(&self) -> &[Vec<i32>] {
        &self.positions
    }

    pub fn script(&self) -> &[Token] {
        &self.script
    }

    fn encode(&self, bytes: &[u8]) -> Vec<Token> {
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            let best = self.pieces[Self::FIRST_PIECE..]
                .iter()
                .enumerate()
                .filter(|(_, p)| bytes[i..].starts_with(p.as_slice()))
                .max_by_key(|(_, p)| p.len());
            match best {
                Some((k, p)) => {
                    out.push(Token((Self::FIRST_PIECE + k) as i32));
                    i += p.len();
                }
                None => {
                    out.push(Token(i32::from(bytes[i])));
                    i += 1;
                }
            }
        }
        out
    }

    fn scripted_token(&self) -> Token {
        match self.script.get(self.steps) {
            Some(&t) => t,
            None if self.eog_after_script => Self::EOG,
            None => self.script.last().copied().unwrap_or(Self::EOG),
        }
    }
}

impl TokenSource for ScriptedSource {
    fn tokenize(&self, text: &str, add_bos: bool) -> kotoba_abi::Result<Vec<Token>> {
        if text.contains('\0') {
            return Err(SourceError::Tokenize("NUL byte in prompt".into()));
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(Self::BOS);
        }
        tokens.extend(self.encode(text.as_bytes()));
        Ok(tokens)
    }

    fn decode(&mut self, batch: &Batch) -> kotoba_abi::Result<()> {
        self.decode_calls += 1;
        self.positions
            .push(batch.entries().iter().map(|e| e.pos).collect());

        if self.fail_decode_at == Some(self.decode_calls) {
            return Err(SourceError::Decode("injected failure".into()));
        }
        if batch.is_empty() {
            return Err(SourceError::Decode("empty batch".into()));
        }
        for (i, entry) in batch.entries().iter().enumerate() {
            if entry.pos as usize != self.used + i {
                return Err(SourceError::Decode(format!(
                    "position {} does not continue the cache ({} cells used)",
                    entry.pos, self.used
                )));
            }
        }
        if self.used + batch.len() > self.capacity {
            return Err(SourceError::Decode("context full".into()));
        }
        self.used += batch.len();

        self.logits = vec![0.0; self.pieces.len()];
        let target = self.scripted_token();
        if let Some(slot) = target.index().and_then(|i| self.logits.get_mut(i)) {
            *slot = SCRIPTED_LOGIT;
        }
        self.logits_index = batch
            .entries()
            .iter()
            .rposition(|e| e.logits);
        self.steps += 1;
        Ok(())
    }

    fn logits(&self, index: usize) -> kotoba_abi::Result<&[f32]> {
        if self.logits_index == Some(index) {
            Ok(&self.logits)
        } else {
            Err(SourceError::Logits(index))
        }
    }

    fn detokenize(&self, token: Token) -> kotoba_abi::Result<Vec<u8>> {
        if self.broken.contains(&token) {
            return Err(SourceError::Conversion(format!("{token:?} has no piece")));
        }
        token
            .index()
            .and_then(|i| self.pieces.get(i))
            .cloned()
            .ok_or_else(|| SourceError::Conversion(format!("{token:?} out of vocabulary")))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == Self::EOG
    }

    fn n_vocab(&self) -> usize {
        self.pieces.len()
    }

    fn context_capacity(&self) -> usize {
        self.capacity
    }

    fn used_context_slots(&self) -> usize {
        self.used
    }

    fn clear_context(&mut self) {
        self.clear_calls += 1;
        self.used = 0;
        self.steps = 0;
        self.logits_index = None;
    }

    fn reinitialize(&mut self) -> kotoba_abi::Result<()> {
        self.reinit_calls += 1;
        self.clear_context();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_longest_match_with_byte_fallback() {
        let src = ScriptedSource::new(64).with_pieces(["he", "hello", "あ"]);
        let toks = src.tokenize("hello hey", false).unwrap();
        assert_eq!(toks[0], Token(259)); // "hello"
        assert_eq!(toks[1], Token(i32::from(b' ')));
        assert_eq!(toks[2], Token(258)); // "he"
        assert_eq!(toks[3], Token(i32::from(b'y')));

        let toks = src.tokenize("い", true).unwrap();
        assert_eq!(toks.len(), 4);
        assert_eq!(toks[0], ScriptedSource::BOS);
    }

    #[test]
    fn scripted_token_wins_each_decode() {
        let mut src = ScriptedSource::new(8).with_script(vec![Token(65), Token(66)]);
        let mut batch = Batch::new(4);
        batch.add(Token(1), 0, true).unwrap();
        src.decode(&batch).unwrap();
        assert_eq!(src.logits(0).unwrap()[65], SCRIPTED_LOGIT);
        assert!(src.logits(1).is_err());

        batch.clear();
        batch.add(Token(65), 1, true).unwrap();
        src.decode(&batch).unwrap();
        assert_eq!(src.logits(0).unwrap()[66], SCRIPTED_LOGIT);

        batch.clear();
        batch.add(Token(66), 2, true).unwrap();
        src.decode(&batch).unwrap();
        assert_eq!(src.logits(0).unwrap()[256], SCRIPTED_LOGIT);
    }

    #[test]
    fn decode_rejects_position_gaps_and_overflow() {
        let mut src = ScriptedSource::new(2);
        let mut batch = Batch::new(4);
        batch.add(Token(1), 1, true).unwrap();
        assert!(src.decode(&batch).is_err());

        batch.clear();
        for pos in 0..3 {
            batch.add(Token(1), pos, pos == 2).unwrap();
        }
        assert!(src.decode(&batch).is_err());
        assert_eq!(src.used_context_slots(), 0);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut src = ScriptedSource::new(4);
        let mut batch = Batch::new(1);
        batch.add(Token(1), 0, true).unwrap();
        src.decode(&batch).unwrap();
        src.clear_context();
        src.clear_context();
        assert_eq!(src.used_context_slots(), 0);
        assert_eq!(src.clear_calls(), 2);
    }
}
