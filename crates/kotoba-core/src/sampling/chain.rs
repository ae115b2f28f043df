//! Candidate-list stages of the sampler chain.
//!
//! Order: temperature → softmax → top-p → min-p → terminal selector
//! (seeded draw, or argmax when greedy).

use kotoba_abi::Token;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub token: Token,
    pub logit: f32,
    pub p: f32,
}

/// Finite logits only, in id order.
pub(crate) fn candidates(logits: &[f32]) -> Vec<Candidate> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .map(|(id, &logit)| Candidate {
            token: Token(id as i32),
            logit,
            p: 0.0,
        })
        .collect()
}

/// Highest logit; ties go to the lowest id.
pub(crate) fn argmax(cands: &[Candidate]) -> Option<Token> {
    let mut best: Option<&Candidate> = None;
    for c in cands {
        if best.map_or(true, |b| c.logit > b.logit) {
            best = Some(c);
        }
    }
    best.map(|c| c.token)
}

pub(crate) fn temperature(cands: &mut [Candidate], t: f32) {
    for c in cands {
        c.logit /= t;
    }
}

/// Sort by logit (descending, stable on id) and fill in probabilities.
pub(crate) fn softmax(cands: &mut [Candidate]) {
    cands.sort_by(|a, b| b.logit.total_cmp(&a.logit));
    let Some(max) = cands.first().map(|c| c.logit) else {
        return;
    };
    let mut sum = 0.0;
    for c in cands.iter_mut() {
        c.p = (c.logit - max).exp();
        sum += c.p;
    }
    for c in cands.iter_mut() {
        c.p /= sum;
    }
}

/// Keep the smallest prefix whose mass reaches `p`, and at least `min_keep`.
/// Expects softmaxed input.
pub(crate) fn top_p(cands: &mut Vec<Candidate>, p: f32, min_keep: usize) {
    let mut cum = 0.0;
    let mut keep = cands.len();
    for (i, c) in cands.iter().enumerate() {
        cum += c.p;
        if cum >= p && i + 1 >= min_keep {
            keep = i + 1;
            break;
        }
    }
    cands.truncate(keep);
}

/// Drop candidates below `min_p` times the top probability, keeping at least
/// `min_keep`. Expects softmaxed input.
pub(crate) fn min_p(cands: &mut Vec<Candidate>, min_p: f32, min_keep: usize) {
    let Some(threshold) = cands.first().map(|c| c.p * min_p) else {
        return;
    };
    let keep = cands
        .iter()
        .take_while(|c| c.p >= threshold)
        .count()
        .max(min_keep)
        .min(cands.len());
    cands.truncate(keep);
}

/// Categorical draw proportional to `p` (need not be normalized).
pub(crate) fn draw<R: Rng + ?Sized>(cands: &[Candidate], rng: &mut R) -> Option<Token> {
    let total: f32 = cands.iter().map(|c| c.p).sum();
    let last = cands.last()?;
    if !total.is_finite() || total <= 0.0 {
        return Some(cands[0].token);
    }
    let r = rng.gen::<f32>() * total;
    let mut cum = 0.0;
    for c in cands {
        cum += c.p;
        if r < cum {
            return Some(c.token);
        }
    }
    Some(last.token)
}
