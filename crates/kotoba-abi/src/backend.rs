use crate::batch::Batch;
use crate::error::Result;
use crate::token::Token;

/// Backend-agnostic adapter over an inference context.
///
/// One implementor wraps one backend context (KV cache + logits buffer).
/// The context is not safe for concurrent decodes, hence `&mut self` on
/// everything that touches it.
pub trait TokenSource {
    /// Tokenize `text`, optionally prepending the model's BOS token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>>;

    /// Run the model over `batch`, filling logits for entries that asked for them.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Logits produced by the last `decode` for batch entry `index`.
    /// Length == `n_vocab()`.
    fn logits(&self, index: usize) -> Result<&[f32]>;

    /// Raw bytes of one token. May end in the middle of a UTF-8 sequence.
    fn detokenize(&self, token: Token) -> Result<Vec<u8>>;

    /// True for EOS/EOT and any other end-of-generation token.
    fn is_end_of_generation(&self, token: Token) -> bool;

    /// Vocabulary size.
    fn n_vocab(&self) -> usize;

    /// Active context window (n_ctx).
    fn context_capacity(&self) -> usize;

    /// Cells currently occupied in the KV cache.
    fn used_context_slots(&self) -> usize;

    /// Clear any cached sequence/KV state while keeping the model loaded.
    /// Must be idempotent.
    fn clear_context(&mut self);

    /// Rebuild the context from scratch. Backends that cannot do better than
    /// clearing keep the default.
    fn reinitialize(&mut self) -> Result<()> {
        self.clear_context();
        Ok(())
    }
}

/// Lending a source: the caller keeps ownership and must outlive the session.
impl<T: TokenSource + ?Sized> TokenSource for &mut T {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        (**self).tokenize(text, add_bos)
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        (**self).decode(batch)
    }

    fn logits(&self, index: usize) -> Result<&[f32]> {
        (**self).logits(index)
    }

    fn detokenize(&self, token: Token) -> Result<Vec<u8>> {
        (**self).detokenize(token)
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        (**self).is_end_of_generation(token)
    }

    fn n_vocab(&self) -> usize {
        (**self).n_vocab()
    }

    fn context_capacity(&self) -> usize {
        (**self).context_capacity()
    }

    fn used_context_slots(&self) -> usize {
        (**self).used_context_slots()
    }

    fn clear_context(&mut self) {
        (**self).clear_context()
    }

    fn reinitialize(&mut self) -> Result<()> {
        (**self).reinitialize()
    }
}
