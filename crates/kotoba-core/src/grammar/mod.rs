//! GBNF grammar constraints.
//!
//! A [`GrammarDefinition`] is parsed once and shared. Each generation gets its
//! own [`GrammarState`] from [`GrammarConstraint::new_state`]; the state masks
//! logits before sampling and advances exactly once per emitted token.

use std::sync::Arc;

use kotoba_abi::{Token, TokenSource};
use thiserror::Error;

pub mod builtin;
mod parse;
mod state;
mod vocab;

pub use parse::GrammarDefinition;
pub use state::GrammarState;
pub use vocab::Vocabulary;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GrammarError {
    #[error("grammar parse error at {line}:{column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("undefined rule `{0}`")]
    UndefinedRule(String),

    #[error("grammar has no `root` rule")]
    MissingRoot,

    #[error("left recursion in rule `{0}`")]
    LeftRecursion(String),

    #[error("token {0:?} rejected by grammar")]
    Rejected(Token),

    #[error("unknown builtin grammar `{0}`")]
    UnknownBuiltin(String),
}

/// One element of a compiled rule. Rules are flat element lists; `Alt`
/// separates alternatives and `End` terminates the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Element {
    End,
    Alt,
    RuleRef(usize),
    Char(u32),
    CharNot(u32),
    /// Upper bound of a range whose lower bound is the preceding element.
    CharRngUpper(u32),
    /// Additional member of the preceding character class.
    CharAlt(u32),
    CharAny,
}

impl Element {
    #[inline]
    pub(crate) fn is_end_of_sequence(self) -> bool {
        matches!(self, Element::End | Element::Alt)
    }

    #[inline]
    pub(crate) fn char_value(self) -> u32 {
        match self {
            Element::Char(c)
            | Element::CharNot(c)
            | Element::CharRngUpper(c)
            | Element::CharAlt(c) => c,
            _ => 0,
        }
    }
}

/// A compiled grammar bound to a vocabulary.
#[derive(Debug, Clone)]
pub struct GrammarConstraint {
    definition: Arc<GrammarDefinition>,
    vocab: Arc<Vocabulary>,
}

impl GrammarConstraint {
    pub fn new(definition: Arc<GrammarDefinition>, vocab: Arc<Vocabulary>) -> Self {
        Self { definition, vocab }
    }

    /// Parse `src` and read the vocabulary table out of `source`.
    pub fn compile<S: TokenSource + ?Sized>(
        src: &str,
        source: &S,
    ) -> Result<Self, crate::error::EngineError> {
        let definition = GrammarDefinition::parse(src)?;
        let vocab = Vocabulary::from_source(source)?;
        Ok(Self::new(Arc::new(definition), Arc::new(vocab)))
    }

    /// Fresh parse cursor positioned at the start of `root`.
    pub fn new_state(&self) -> GrammarState {
        GrammarState::new(self.definition.clone(), self.vocab.clone())
    }

    pub fn definition(&self) -> &GrammarDefinition {
        &self.definition
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }
}
