//! llama.cpp [`TokenSource`] via `llama-cpp-2` (feature `llama`).
//!
//! Ownership is model → context → batch; the context borrows the model, so
//! a [`LlamaSource`] can never outlive its [`LlamaModelHandle`], and the
//! native handles drop in reverse order.

use std::num::NonZeroU32;
use std::path::Path;

use kotoba_abi::{Batch, SourceError, Token, TokenSource};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::TokenToStringError;
use once_cell::sync::OnceCell;

use crate::config::DEFAULT_BATCH_CAPACITY;

/// First-try size for a detokenized piece.
const PIECE_BUFFER: usize = 32;

/// Global llama.cpp backend (can only be initialized once).
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> kotoba_abi::Result<&'static LlamaBackend> {
    BACKEND.get_or_try_init(|| {
        let mut backend = LlamaBackend::init()
            .map_err(|e| SourceError::ModelLoad(format!("llama backend init: {e}")))?;
        backend.void_logs();
        Ok(backend)
    })
}

/// Context parameters. `n_batch` must be at least the session's
/// `batch_capacity`, or long prompts fail in `decode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlamaSourceParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: i32,
}

impl Default for LlamaSourceParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: DEFAULT_BATCH_CAPACITY as u32,
            n_threads: 8,
        }
    }
}

impl LlamaSourceParams {
    fn context_params(&self) -> kotoba_abi::Result<LlamaContextParams> {
        let n_ctx = NonZeroU32::new(self.n_ctx)
            .ok_or_else(|| SourceError::ContextInit("n_ctx must be non-zero".into()))?;
        Ok(LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(self.n_batch)
            .with_n_threads(self.n_threads)
            .with_n_threads_batch(self.n_threads))
    }
}

/// Loaded weights.
pub struct LlamaModelHandle {
    model: LlamaModel,
}

impl LlamaModelHandle {
    pub fn load(path: impl AsRef<Path>, params: &LlamaModelParams) -> kotoba_abi::Result<Self> {
        let path = path.as_ref();
        let model = LlamaModel::load_from_file(backend()?, path, params)
            .map_err(|e| SourceError::ModelLoad(format!("{}: {e}", path.display())))?;
        tracing::info!("[llama] loaded {}", path.display());
        Ok(Self { model })
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }
}

pub struct LlamaSource<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    batch: LlamaBatch,
    params: LlamaSourceParams,
    /// Cells written since the last clear.
    used: usize,
    /// Batch entries of the last decode that carry logits.
    with_logits: Vec<bool>,
}

impl<'m> LlamaSource<'m> {
    pub fn new(model: &'m LlamaModelHandle, params: LlamaSourceParams) -> kotoba_abi::Result<Self> {
        let ctx = Self::new_context(&model.model, &params)?;
        tracing::info!(
            "[llama] context ready: n_ctx={} n_batch={} threads={}",
            ctx.n_ctx(),
            params.n_batch,
            params.n_threads
        );
        Ok(Self {
            model: &model.model,
            ctx,
            batch: LlamaBatch::new(params.n_batch as usize, 1),
            params,
            used: 0,
            with_logits: Vec::new(),
        })
    }

    fn new_context(
        model: &'m LlamaModel,
        params: &LlamaSourceParams,
    ) -> kotoba_abi::Result<LlamaContext<'m>> {
        model
            .new_context(backend()?, params.context_params()?)
            .map_err(|e| SourceError::ContextInit(e.to_string()))
    }

    fn piece(&self, token: LlamaToken, size: usize) -> Result<Vec<u8>, TokenToStringError> {
        self.model
            .token_to_bytes_with_size(token, size, Special::Plaintext, None)
    }
}

/// llama.cpp aborts on rows it computed no logits for; check first.
fn logits_row(with_logits: &[bool], index: usize) -> kotoba_abi::Result<i32> {
    match with_logits.get(index) {
        Some(true) => i32::try_from(index).map_err(|_| SourceError::Logits(index)),
        _ => Err(SourceError::Logits(index)),
    }
}

impl TokenSource for LlamaSource<'_> {
    fn tokenize(&self, text: &str, add_bos: bool) -> kotoba_abi::Result<Vec<Token>> {
        let bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, bos)
            .map_err(|e| SourceError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn decode(&mut self, batch: &Batch) -> kotoba_abi::Result<()> {
        if batch.len() > self.params.n_batch as usize {
            return Err(SourceError::Decode(format!(
                "batch of {} tokens exceeds n_batch {}",
                batch.len(),
                self.params.n_batch
            )));
        }
        self.batch.clear();
        self.with_logits.clear();
        for entry in batch.entries() {
            self.batch
                .add(LlamaToken(entry.token.0), entry.pos, &[entry.seq_id], entry.logits)
                .map_err(|e| SourceError::Decode(e.to_string()))?;
            self.with_logits.push(entry.logits);
        }
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        self.used += batch.len();
        Ok(())
    }

    fn logits(&self, index: usize) -> kotoba_abi::Result<&[f32]> {
        let i = logits_row(&self.with_logits, index)?;
        Ok(self.ctx.get_logits_ith(i))
    }

    fn detokenize(&self, token: Token) -> kotoba_abi::Result<Vec<u8>> {
        let token = LlamaToken(token.0);
        match self.piece(token, PIECE_BUFFER) {
            Ok(bytes) => Ok(bytes),
            Err(TokenToStringError::InsufficientBufferSpace(needed)) => self
                .piece(token, needed.unsigned_abs() as usize)
                .map_err(|e| SourceError::Conversion(e.to_string())),
            Err(e) => Err(SourceError::Conversion(e.to_string())),
        }
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token.0))
    }

    fn n_vocab(&self) -> usize {
        usize::try_from(self.model.n_vocab()).unwrap_or(0)
    }

    fn context_capacity(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn used_context_slots(&self) -> usize {
        self.used
    }

    fn clear_context(&mut self) {
        self.ctx.clear_kv_cache();
        self.batch.clear();
        self.with_logits.clear();
        self.used = 0;
    }

    fn reinitialize(&mut self) -> kotoba_abi::Result<()> {
        self.batch.clear();
        self.with_logits.clear();
        self.ctx = Self::new_context(self.model, &self.params)?;
        self.used = 0;
        tracing::info!("[llama] context rebuilt");
        Ok(())
    }
}
