use serde::{Deserialize, Serialize};

/// Sampling parameters fixed for the lifetime of a session.
///
/// The seed is explicit (never derived from the clock) so that two sessions
/// built from the same parameters, prompt and backend produce the same text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// If true, pick argmax and ignore other stochastic knobs.
    pub greedy: bool,

    pub temperature: Option<f32>, // > 0.0 enables temperature scaling
    pub top_p: Option<f32>,       // (0, 1] nucleus sampling
    pub min_p: Option<f32>,       // (0, 1] drop tokens below min_p * p(max)

    /// Lower bound on survivors of the top-p / min-p filters.
    pub min_keep: usize,

    /// Seed for the categorical draw.
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            greedy: false,
            temperature: Some(0.8),
            top_p: Some(0.95),
            min_p: Some(0.05),
            min_keep: 2,
            seed: 1234,
        }
    }
}

impl SamplingParams {
    /// Returns a conflict-free, clamped version of these parameters.
    ///
    /// Precedence:
    /// - `greedy=true` disables temperature/top_p/min_p.
    ///
    /// Clamps:
    /// - temperature <= 0 or non-finite → disabled
    /// - top_p / min_p ∉ (0, 1] → disabled
    /// - min_keep < 1 → 1
    pub fn normalized(&self) -> Self {
        let mut p = self.clone();
        p.min_keep = p.min_keep.max(1);

        if p.greedy {
            p.temperature = None;
            p.top_p = None;
            p.min_p = None;
            return p;
        }

        if let Some(t) = p.temperature {
            if !t.is_finite() || t <= 0.0 {
                p.temperature = None;
            }
        }
        p.top_p = p.top_p.filter(|v| *v > 0.0 && *v <= 1.0);
        p.min_p = p.min_p.filter(|v| *v > 0.0 && *v <= 1.0);
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_short_circuits() {
        let p = SamplingParams {
            greedy: true,
            ..Default::default()
        }
        .normalized();
        assert_eq!(p.temperature, None);
        assert_eq!(p.top_p, None);
        assert_eq!(p.min_p, None);
        assert_eq!(p.seed, 1234);
    }

    #[test]
    fn out_of_range_knobs_are_disabled() {
        let p = SamplingParams {
            temperature: Some(0.0),
            top_p: Some(1.5),
            min_p: Some(0.0),
            min_keep: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(p.temperature, None);
        assert_eq!(p.top_p, None);
        assert_eq!(p.min_p, None);
        assert_eq!(p.min_keep, 1);
    }

    #[test]
    fn missing_json_fields_take_defaults() {
        let p: SamplingParams = serde_json::from_str(r#"{"seed": 7, "temperature": 0.1}"#).unwrap();
        assert_eq!(p.seed, 7);
        assert_eq!(p.temperature, Some(0.1));
        assert_eq!(p.top_p, Some(0.95));
    }
}
