use kotoba_abi::{SourceError, Token, TokenSource};

/// Byte piece and end-of-generation flag for every vocabulary id, read once
/// from the backend so masking never calls back into it.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    pieces: Vec<Vec<u8>>,
    eog: Vec<bool>,
}

impl Vocabulary {
    pub fn from_source<S: TokenSource + ?Sized>(source: &S) -> Result<Self, SourceError> {
        let n = source.n_vocab();
        let mut pieces = Vec::with_capacity(n);
        let mut eog = Vec::with_capacity(n);
        for id in 0..n {
            let token = Token(id as i32);
            let is_eog = source.is_end_of_generation(token);
            // End-of-generation pieces are never matched against the grammar.
            pieces.push(if is_eog {
                Vec::new()
            } else {
                source.detokenize(token)?
            });
            eog.push(is_eog);
        }
        tracing::debug!("[grammar] vocabulary table built ({n} pieces)");
        Ok(Self { pieces, eog })
    }

    /// Build from explicit pieces; ids in `eog` outside the table are ignored.
    pub fn from_pieces(pieces: Vec<Vec<u8>>, eog: impl IntoIterator<Item = Token>) -> Self {
        let mut flags = vec![false; pieces.len()];
        for token in eog {
            if let Some(flag) = token.index().and_then(|i| flags.get_mut(i)) {
                *flag = true;
            }
        }
        Self {
            pieces,
            eog: flags,
        }
    }

    #[inline]
    pub fn piece(&self, token: Token) -> Option<&[u8]> {
        token
            .index()
            .and_then(|i| self.pieces.get(i))
            .map(Vec::as_slice)
    }

    #[inline]
    pub fn is_eog(&self, token: Token) -> bool {
        token
            .index()
            .and_then(|i| self.eog.get(i).copied())
            .unwrap_or(false)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_ids_are_absent() {
        let vocab = Vocabulary::from_pieces(vec![b"a".to_vec(), Vec::new()], [Token(1), Token(7)]);
        assert_eq!(vocab.piece(Token(0)), Some(&b"a"[..]));
        assert_eq!(vocab.piece(Token(2)), None);
        assert_eq!(vocab.piece(Token(-1)), None);
        assert!(vocab.is_eog(Token(1)));
        assert!(!vocab.is_eog(Token(7)));
        assert_eq!(vocab.len(), 2);
    }
}
