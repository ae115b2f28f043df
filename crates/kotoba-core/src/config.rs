//! Session configuration: serde-friendly, with presets and env overrides.
//!
//! Env overrides (applied by [`EngineConfig::with_env_overrides`]):
//! - `KOTOBA_SEED` (u64)
//! - `KOTOBA_TEMPERATURE` (f32)
//! - `KOTOBA_BATCH_CAPACITY` (usize)
//!
//! Values that fail to parse are ignored with a warning.

use std::str::FromStr;
use std::sync::Arc;

use kotoba_abi::SamplingParams;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::grammar::{builtin, GrammarDefinition, GrammarError};
use crate::sampling::SamplerPolicy;
use crate::utf8::DEFAULT_MAX_STALLED_STEPS;

pub const DEFAULT_BATCH_CAPACITY: usize = 2048;

/// Where a session's grammar comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarSource {
    /// Name understood by [`builtin::by_name`].
    Builtin(String),
    /// GBNF text.
    Inline(String),
}

impl GrammarSource {
    pub fn builtin(name: impl Into<String>) -> Self {
        GrammarSource::Builtin(name.into())
    }

    pub fn inline(src: impl Into<String>) -> Self {
        GrammarSource::Inline(src.into())
    }

    pub fn load(&self) -> std::result::Result<Arc<GrammarDefinition>, GrammarError> {
        match self {
            GrammarSource::Builtin(name) => builtin::by_name(name),
            GrammarSource::Inline(src) => GrammarDefinition::parse(src).map(Arc::new),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sampling: SamplingParams,
    pub policy: SamplerPolicy,
    /// Maximum tokens per decode call; also bounds prompt length.
    pub batch_capacity: usize,
    /// Consecutive steps the UTF-8 accumulator may hold undecodable bytes.
    pub max_stalled_steps: usize,
    pub add_bos: bool,
    pub grammar: Option<GrammarSource>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingParams::default(),
            policy: SamplerPolicy::default(),
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            max_stalled_steps: DEFAULT_MAX_STALLED_STEPS,
            add_bos: true,
            grammar: None,
        }
    }
}

impl EngineConfig {
    /// Japanese question answering.
    pub fn chat() -> Self {
        Self {
            sampling: SamplingParams {
                temperature: Some(0.5),
                ..Default::default()
            },
            grammar: Some(GrammarSource::builtin("japanese")),
            ..Default::default()
        }
    }

    /// Prefecture/capital listing as a JSON array.
    pub fn japanese_prefectures() -> Self {
        Self {
            sampling: SamplingParams {
                temperature: Some(0.1),
                ..Default::default()
            },
            grammar: Some(GrammarSource::builtin("prefectures")),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_capacity == 0 {
            return Err(EngineError::Config("batch_capacity must be at least 1".into()));
        }
        if self.max_stalled_steps == 0 {
            return Err(EngineError::Config(
                "max_stalled_steps must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key → value lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(seed) = parse_override::<u64, _>(&lookup, "KOTOBA_SEED") {
            self.sampling.seed = seed;
        }
        if let Some(t) = parse_override::<f32, _>(&lookup, "KOTOBA_TEMPERATURE") {
            self.sampling.temperature = Some(t);
        }
        if let Some(n) = parse_override::<usize, _>(&lookup, "KOTOBA_BATCH_CAPACITY") {
            self.batch_capacity = n.max(1);
        }
        self
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => {
            tracing::info!("[config] {key} override = {raw}");
            Some(v)
        }
        Err(_) => {
            tracing::warn!("[config] ignoring unparsable {key}={raw:?}");
            None
        }
    }
}
