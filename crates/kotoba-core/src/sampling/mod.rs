//! Token selection: stochastic chain combined with grammar masking.

use kotoba_abi::{SamplingParams, Token};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grammar::GrammarState;

mod chain;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SamplingError {
    #[error("no viable token: every candidate was masked")]
    NoViableToken,
}

/// Where the grammar sits relative to the stochastic chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerPolicy {
    /// Mask every disallowed token, then sample among the survivors.
    #[default]
    GrammarFirst,
    /// Sample unconstrained and check only the drawn token; fall back to
    /// `GrammarFirst` for the step if it is rejected.
    VerifyAfter,
}

#[derive(Debug, Clone)]
pub struct ConstrainedSampler {
    params: SamplingParams,
    policy: SamplerPolicy,
    rng: StdRng,
}

impl ConstrainedSampler {
    pub fn new(params: &SamplingParams, policy: SamplerPolicy) -> Self {
        let params = params.normalized();
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            policy,
            rng,
        }
    }

    /// Restart the draw sequence from the configured seed.
    pub fn reseed(&mut self) {
        self.rng = StdRng::seed_from_u64(self.params.seed);
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn policy(&self) -> SamplerPolicy {
        self.policy
    }

    /// Pick the next token from `logits`. The grammar is only consulted; the
    /// caller advances it with the returned token.
    pub fn select(
        &mut self,
        logits: &[f32],
        grammar: Option<&GrammarState>,
    ) -> Result<Token, SamplingError> {
        let Some(grammar) = grammar else {
            return self.sample(logits);
        };

        match self.policy {
            SamplerPolicy::GrammarFirst => self.sample_masked(logits, grammar),
            SamplerPolicy::VerifyAfter => match self.sample(logits) {
                Ok(token) if grammar.admits(token) => Ok(token),
                Ok(token) => {
                    tracing::debug!("[sample] {token:?} rejected by grammar; resampling masked");
                    self.sample_masked(logits, grammar)
                }
                Err(e) => Err(e),
            },
        }
    }

    fn sample_masked(
        &mut self,
        logits: &[f32],
        grammar: &GrammarState,
    ) -> Result<Token, SamplingError> {
        let mut masked = logits.to_vec();
        grammar.mask(&mut masked);
        self.sample(&masked)
    }

    fn sample(&mut self, logits: &[f32]) -> Result<Token, SamplingError> {
        let mut cands = chain::candidates(logits);
        if cands.is_empty() {
            return Err(SamplingError::NoViableToken);
        }

        if self.params.greedy {
            return chain::argmax(&cands).ok_or(SamplingError::NoViableToken);
        }

        if let Some(t) = self.params.temperature {
            chain::temperature(&mut cands, t);
        }
        chain::softmax(&mut cands);
        if let Some(p) = self.params.top_p {
            chain::top_p(&mut cands, p, self.params.min_keep);
        }
        if let Some(p) = self.params.min_p {
            chain::min_p(&mut cands, p, self.params.min_keep);
        }

        // Terminal selector
        chain::draw(&cands, &mut self.rng).ok_or(SamplingError::NoViableToken)
    }
}
