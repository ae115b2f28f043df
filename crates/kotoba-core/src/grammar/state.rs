//! Pushdown matcher over a compiled grammar.
//!
//! The parse cursor is a set of stacks of rule positions. Every stack's top
//! points at a terminal element; an empty stack means `root` has been fully
//! matched. Token pieces are raw bytes, so a piece may end inside a code
//! point; the unfinished prefix is carried in [`PartialUtf8`].

use std::collections::HashMap;
use std::sync::Arc;

use kotoba_abi::Token;

use super::{Element, GrammarDefinition, GrammarError, Vocabulary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Pos {
    rule: usize,
    idx: usize,
}

type Stack = Vec<Pos>;
type Rules = [Vec<Element>];

/// Code point prefix left over from a previous piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PartialUtf8 {
    value: u32,
    n_remain: u8,
}

/// Decode `bytes` on top of `partial`. Returns the complete code points and
/// the new partial state, or `None` for bytes that can never be valid UTF-8.
pub(crate) fn decode_utf8(bytes: &[u8], partial: PartialUtf8) -> Option<(Vec<u32>, PartialUtf8)> {
    const LOOKUP: [u8; 16] = [1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 2, 2, 3, 4];

    let mut cps = Vec::with_capacity(bytes.len() + 1);
    let mut value = partial.value;
    let mut n_remain = partial.n_remain;
    let mut i = 0;

    while i < bytes.len() && n_remain > 0 {
        let b = bytes[i];
        if b >> 6 != 0b10 {
            return None;
        }
        value = (value << 6) | u32::from(b & 0x3F);
        i += 1;
        n_remain -= 1;
    }
    if partial.n_remain > 0 && n_remain == 0 {
        cps.push(value);
    }

    while i < bytes.len() {
        let first = bytes[i];
        let len = LOOKUP[usize::from(first >> 4)];
        if len == 0 {
            return None;
        }
        n_remain = len - 1;
        let mask = (1u8 << (7 - n_remain)) - 1;
        value = u32::from(first & mask);
        i += 1;
        while i < bytes.len() && n_remain > 0 {
            let b = bytes[i];
            if b >> 6 != 0b10 {
                return None;
            }
            value = (value << 6) | u32::from(b & 0x3F);
            i += 1;
            n_remain -= 1;
        }
        if n_remain == 0 {
            cps.push(value);
        }
    }

    let partial = if n_remain == 0 {
        PartialUtf8::default()
    } else {
        PartialUtf8 { value, n_remain }
    };
    Some((cps, partial))
}

/// Does the character class at `pos` match `chr`? Also returns the index just
/// past the class.
fn match_char(rules: &Rules, pos: Pos, chr: u32) -> (bool, usize) {
    let rule = &rules[pos.rule];
    let mut i = pos.idx;
    let positive = matches!(rule[i], Element::Char(_) | Element::CharAny);
    let mut found = false;

    loop {
        match (rule[i], rule.get(i + 1)) {
            (el, Some(&Element::CharRngUpper(hi))) => {
                found |= el.char_value() <= chr && chr <= hi;
                i += 2;
            }
            (Element::CharAny, _) => {
                found = true;
                i += 1;
            }
            (el, _) => {
                found |= el.char_value() == chr;
                i += 1;
            }
        }
        if !matches!(rule.get(i), Some(Element::CharAlt(_))) {
            break;
        }
    }
    (found == positive, i)
}

/// Could some completion of `partial` satisfy the class at `pos`?
fn match_partial_char(rules: &Rules, pos: Pos, partial: PartialUtf8) -> bool {
    let rule = &rules[pos.rule];
    let mut i = pos.idx;
    let positive = matches!(rule[i], Element::Char(_) | Element::CharAny);

    let n = u32::from(partial.n_remain);
    // Overlong two-byte sequence (C0/C1 lead).
    if n == 1 && partial.value < 2 {
        return false;
    }
    let mut low = partial.value << (n * 6);
    let high = low | ((1 << (n * 6)) - 1);
    if low == 0 {
        if n == 2 {
            low = 1 << 11;
        } else if n == 3 {
            low = 1 << 16;
        }
    }

    loop {
        match (rule[i], rule.get(i + 1)) {
            (el, Some(&Element::CharRngUpper(hi))) => {
                if el.char_value() <= high && low <= hi {
                    return positive;
                }
                i += 2;
            }
            (Element::CharAny, _) => return true,
            (el, _) => {
                let v = el.char_value();
                if low <= v && v <= high {
                    return positive;
                }
                i += 1;
            }
        }
        if !matches!(rule.get(i), Some(Element::CharAlt(_))) {
            break;
        }
    }
    !positive
}

/// Expand rule references on top of `stack` until every resulting stack
/// rests on a terminal (or is empty), appending them to `out` without
/// duplicates.
fn advance_stack(rules: &Rules, stack: Stack, out: &mut Vec<Stack>) {
    let Some(&top) = stack.last() else {
        if !out.contains(&stack) {
            out.push(stack);
        }
        return;
    };

    match rules[top.rule][top.idx] {
        Element::RuleRef(sub) => {
            let mut sub_idx = 0;
            loop {
                let mut next: Stack = stack[..stack.len() - 1].to_vec();
                if !rules[top.rule][top.idx + 1].is_end_of_sequence() {
                    next.push(Pos {
                        rule: top.rule,
                        idx: top.idx + 1,
                    });
                }
                if !rules[sub][sub_idx].is_end_of_sequence() {
                    next.push(Pos {
                        rule: sub,
                        idx: sub_idx,
                    });
                }
                advance_stack(rules, next, out);

                while !rules[sub][sub_idx].is_end_of_sequence() {
                    sub_idx += 1;
                }
                if rules[sub][sub_idx] == Element::Alt {
                    sub_idx += 1;
                } else {
                    break;
                }
            }
        }
        Element::Char(_) | Element::CharNot(_) | Element::CharAny => {
            if !out.contains(&stack) {
                out.push(stack);
            }
        }
        // Positions never rest on alternation markers or class tails.
        _ => {}
    }
}

/// Stacks reachable after consuming `chr` from any of `stacks`.
fn accept_char(rules: &Rules, stacks: &[Stack], chr: u32) -> Vec<Stack> {
    let mut out = Vec::new();
    for stack in stacks {
        let Some(&top) = stack.last() else {
            continue;
        };
        let (matched, next_idx) = match_char(rules, top, chr);
        if !matched {
            continue;
        }
        let mut next: Stack = stack[..stack.len() - 1].to_vec();
        if !rules[top.rule][next_idx].is_end_of_sequence() {
            next.push(Pos {
                rule: top.rule,
                idx: next_idx,
            });
        }
        advance_stack(rules, next, &mut out);
    }
    out
}

enum Consumed {
    Unchanged,
    Advanced(Vec<Stack>),
}

/// Feed decoded code points, then check that the trailing partial sequence
/// can still be completed. `None` means every parse died.
fn consume(rules: &Rules, base: &[Stack], cps: &[u32], partial: PartialUtf8) -> Option<Consumed> {
    let mut next: Option<Vec<Stack>> = None;
    for &cp in cps {
        let stacks = accept_char(rules, next.as_deref().unwrap_or(base), cp);
        if stacks.is_empty() {
            return None;
        }
        next = Some(stacks);
    }

    if partial.n_remain > 0 {
        let current = next.as_deref().unwrap_or(base);
        let alive = current.iter().any(|stack| {
            stack
                .last()
                .is_some_and(|&top| match_partial_char(rules, top, partial))
        });
        if !alive {
            return None;
        }
    }

    Some(match next {
        Some(stacks) => Consumed::Advanced(stacks),
        None => Consumed::Unchanged,
    })
}

/// Per-generation parse cursor.
#[derive(Debug, Clone)]
pub struct GrammarState {
    definition: Arc<GrammarDefinition>,
    vocab: Arc<Vocabulary>,
    stacks: Vec<Stack>,
    partial: PartialUtf8,
}

impl GrammarState {
    pub(crate) fn new(definition: Arc<GrammarDefinition>, vocab: Arc<Vocabulary>) -> Self {
        let rules = definition.rules();
        let root = definition.root();
        let mut stacks = Vec::new();

        let mut idx = 0;
        loop {
            let mut stack = Vec::new();
            if !rules[root][idx].is_end_of_sequence() {
                stack.push(Pos { rule: root, idx });
            }
            advance_stack(rules, stack, &mut stacks);
            while !rules[root][idx].is_end_of_sequence() {
                idx += 1;
            }
            if rules[root][idx] == Element::Alt {
                idx += 1;
            } else {
                break;
            }
        }

        Self {
            definition,
            vocab,
            stacks,
            partial: PartialUtf8::default(),
        }
    }

    /// True once some parse has matched all of `root`.
    pub fn is_complete(&self) -> bool {
        self.stacks.iter().any(Vec::is_empty)
    }

    /// Set every logit whose token would kill all parses to −∞.
    ///
    /// End-of-generation tokens survive only when the grammar is complete.
    /// Empty pieces never survive.
    pub fn mask(&self, logits: &mut [f32]) {
        let complete = self.is_complete();
        let mut first_char: HashMap<u32, Vec<Stack>> = HashMap::new();

        for (id, logit) in logits.iter_mut().enumerate() {
            if *logit == f32::NEG_INFINITY {
                continue;
            }
            let token = Token(id as i32);
            let allowed = if self.vocab.is_eog(token) {
                complete
            } else {
                match self.vocab.piece(token) {
                    Some(piece) if !piece.is_empty() => self.admits_piece(piece, &mut first_char),
                    _ => false,
                }
            };
            if !allowed {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    /// Would `mask` keep `token`?
    pub fn admits(&self, token: Token) -> bool {
        if self.vocab.is_eog(token) {
            return self.is_complete();
        }
        match self.vocab.piece(token) {
            Some(piece) if !piece.is_empty() => self.admits_piece(piece, &mut HashMap::new()),
            _ => false,
        }
    }

    /// Advance past `token`. Fails only for tokens `mask` would have removed.
    pub fn accept(&mut self, token: Token) -> Result<(), GrammarError> {
        if self.vocab.is_eog(token) {
            return if self.is_complete() {
                Ok(())
            } else {
                Err(GrammarError::Rejected(token))
            };
        }

        let piece = match self.vocab.piece(token) {
            Some(piece) if !piece.is_empty() => piece,
            _ => return Err(GrammarError::Rejected(token)),
        };
        let (cps, partial) =
            decode_utf8(piece, self.partial).ok_or(GrammarError::Rejected(token))?;

        match consume(self.definition.rules(), &self.stacks, &cps, partial) {
            Some(Consumed::Advanced(stacks)) => self.stacks = stacks,
            Some(Consumed::Unchanged) => {}
            None => return Err(GrammarError::Rejected(token)),
        }
        self.partial = partial;
        Ok(())
    }

    /// Same verdict as `accept` without mutating; stacks reached after the
    /// first code point are memoized across a single `mask` pass.
    fn admits_piece(&self, piece: &[u8], first_char: &mut HashMap<u32, Vec<Stack>>) -> bool {
        let Some((cps, partial)) = decode_utf8(piece, self.partial) else {
            return false;
        };
        let rules = self.definition.rules();

        if self.partial.n_remain == 0 {
            if let Some((&first, rest)) = cps.split_first() {
                let base = first_char
                    .entry(first)
                    .or_insert_with(|| accept_char(rules, &self.stacks, first));
                if base.is_empty() {
                    return false;
                }
                return consume(rules, base, rest, partial).is_some();
            }
        }
        consume(rules, &self.stacks, &cps, partial).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_for(src: &str, pieces: &[&[u8]], eog: i32) -> GrammarState {
        let def = GrammarDefinition::parse(src).unwrap();
        let vocab = Vocabulary::from_pieces(
            pieces.iter().map(|p| p.to_vec()).collect(),
            [Token(eog)],
        );
        GrammarState::new(Arc::new(def), Arc::new(vocab))
    }

    #[test]
    fn decode_utf8_carries_partial_sequences() {
        // "あ" = E3 81 82
        let (cps, partial) = decode_utf8(&[b'a', 0xE3], PartialUtf8::default()).unwrap();
        assert_eq!(cps, vec!['a' as u32]);
        assert_eq!(partial.n_remain, 2);
        let (cps, partial) = decode_utf8(&[0x81, 0x82], partial).unwrap();
        assert_eq!(cps, vec![0x3042]);
        assert_eq!(partial, PartialUtf8::default());
    }

    #[test]
    fn decode_utf8_rejects_stray_continuation() {
        assert!(decode_utf8(&[0x80], PartialUtf8::default()).is_none());
        let (_, partial) = decode_utf8(&[0xE3], PartialUtf8::default()).unwrap();
        assert!(decode_utf8(b"a", partial).is_none());
    }

    #[test]
    fn decode_utf8_rejects_ascii_inside_a_sequence() {
        // A lead byte followed by ASCII in the same piece is not "ぁ".
        assert!(decode_utf8(&[0xE3, 0x41, 0x41], PartialUtf8::default()).is_none());
        assert!(decode_utf8(&[b'x', 0xE3, 0x81, b'x'], PartialUtf8::default()).is_none());
    }

    #[test]
    fn malformed_piece_is_masked_out() {
        // 0: E3 41 41  1:"ぁ"  2:eog
        let pieces: &[&[u8]] = &[&[0xE3, 0x41, 0x41], "ぁ".as_bytes(), b""];
        let mut st = state_for(r#"root ::= [ぁ-ゟ]+"#, pieces, 2);
        let mut logits = vec![0.0; 3];
        st.mask(&mut logits);
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert!(logits[1].is_finite());
        assert_eq!(st.accept(Token(0)), Err(GrammarError::Rejected(Token(0))));
        st.accept(Token(1)).unwrap();
    }

    #[test]
    fn mask_keeps_only_viable_tokens() {
        // 0:"a" 1:"b" 2:"ab" 3:eog 4:""
        let state = state_for(r#"root ::= "a" "b""#, &[b"a", b"b", b"ab", b"", b""], 3);
        let mut logits = vec![0.0; 5];
        state.mask(&mut logits);
        assert_eq!(logits[0], 0.0);
        assert_eq!(logits[1], f32::NEG_INFINITY);
        assert_eq!(logits[2], 0.0);
        assert_eq!(logits[3], f32::NEG_INFINITY);
        assert_eq!(logits[4], f32::NEG_INFINITY);
    }

    #[test]
    fn eog_allowed_once_complete() {
        let mut state = state_for(r#"root ::= "a" "b""#, &[b"a", b"b", b""], 2);
        assert!(!state.admits(Token(2)));
        state.accept(Token(0)).unwrap();
        state.accept(Token(1)).unwrap();
        assert!(state.is_complete());
        assert!(state.admits(Token(2)));
        assert!(!state.admits(Token(0)));
        state.accept(Token(2)).unwrap();
    }

    #[test]
    fn accept_rejects_what_mask_removes() {
        let mut state = state_for(r#"root ::= [0-9]+"#, &[b"1", b"x", b""], 2);
        assert_eq!(state.accept(Token(1)), Err(GrammarError::Rejected(Token(1))));
        assert_eq!(state.accept(Token(2)), Err(GrammarError::Rejected(Token(2))));
        state.accept(Token(0)).unwrap();
        assert!(state.is_complete());
    }

    #[test]
    fn multibyte_characters_split_across_tokens() {
        // Byte-level pieces for "あ" (E3 81 82) and "a".
        let pieces: &[&[u8]] = &[&[0xE3], &[0x81], &[0x82], b"a", b""];
        let mut state = state_for(r#"root ::= [ぁ-ゖ]+"#, pieces, 4);
        assert!(!state.admits(Token(1)));
        assert!(!state.admits(Token(3)));
        state.accept(Token(0)).unwrap();
        assert!(state.admits(Token(1)));
        state.accept(Token(1)).unwrap();
        state.accept(Token(2)).unwrap();
        assert!(state.is_complete());
        assert!(state.admits(Token(0)));
    }

    #[test]
    fn partial_lead_byte_outside_class_is_masked() {
        // 0xF0 starts a 4-byte sequence, which cannot land in the BMP range.
        let pieces: &[&[u8]] = &[&[0xF0], &[0xE3], b""];
        let state = state_for(r#"root ::= [ぁ-ゖ]"#, pieces, 2);
        let mut logits = vec![0.0; 3];
        state.mask(&mut logits);
        assert_eq!(logits, vec![f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY]);
    }

    #[test]
    fn negated_class_and_any() {
        let mut state = state_for(r#"root ::= [^"] ."#, &[b"\"", b"x", b"\""], 9);
        assert!(!state.admits(Token(0)));
        state.accept(Token(1)).unwrap();
        state.accept(Token(2)).unwrap();
        assert!(state.is_complete());
    }
}
