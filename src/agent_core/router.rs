//! Router — turns a complexity score plus caller overrides into a tier.
//!
//! Priority: explicit `use_thinking_mode`, then `force_model`, then the
//! score against the configured threshold.

use serde::{Deserialize, Serialize};

use crate::inference::types::ModelTier;
use crate::stream::frames::RoutingInfo;

use super::complexity::ComplexityAnalysis;
use super::errors::AgentError;

pub const REASON_BELOW_THRESHOLD: &str = "below complexity threshold";
pub const REASON_AT_OR_ABOVE_THRESHOLD: &str = "at or above complexity threshold";

/// Caller's tier override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForceModel {
    #[default]
    Auto,
    Simple,
    Complex,
}

impl ForceModel {
    pub fn parse(s: &str) -> Result<Self, AgentError> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(ForceModel::Auto),
            "simple" => Ok(ForceModel::Simple),
            "complex" => Ok(ForceModel::Complex),
            other => Err(AgentError::validation(format!(
                "force_model must be one of auto, simple, complex (got '{other}')"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub tier: ModelTier,
    pub use_thinking: bool,
    pub reason: String,
}

impl RoutingDecision {
    pub fn use_complex_model(&self) -> bool {
        self.tier == ModelTier::Complex
    }

    /// Outward shape for `done` frames and the response envelope.
    pub fn info(&self) -> RoutingInfo {
        RoutingInfo {
            selected_agent: self.tier.as_str().to_string(),
            reason: self.reason.clone(),
            use_thinking: self.use_thinking,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Router {
    threshold: f64,
}

impl Router {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn route(
        &self,
        analysis: &ComplexityAnalysis,
        force_model: ForceModel,
        use_thinking_mode: Option<bool>,
    ) -> RoutingDecision {
        if use_thinking_mode == Some(true) {
            return RoutingDecision {
                tier: ModelTier::Complex,
                use_thinking: true,
                reason: "extended reasoning requested".to_string(),
            };
        }

        let (tier, reason) = match force_model {
            ForceModel::Simple => (ModelTier::Simple, "forced simple model".to_string()),
            ForceModel::Complex => (ModelTier::Complex, "forced complex model".to_string()),
            ForceModel::Auto if analysis.score >= self.threshold => {
                (ModelTier::Complex, REASON_AT_OR_ABOVE_THRESHOLD.to_string())
            }
            ForceModel::Auto => (ModelTier::Simple, REASON_BELOW_THRESHOLD.to_string()),
        };

        // Explicit `false` turns reasoning off whatever the tier.
        let use_thinking = use_thinking_mode.unwrap_or(tier == ModelTier::Complex);

        RoutingDecision {
            tier,
            use_thinking,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(score: f64) -> ComplexityAnalysis {
        ComplexityAnalysis {
            score,
            token_count: 1,
            signals: Vec::new(),
            recommended_tier: ModelTier::Simple,
        }
    }

    #[test]
    fn test_monotone_in_score() {
        let router = Router::new(0.5);
        let scores: Vec<f64> = (0..=100).map(|i| i as f64 / 100.0).collect();
        for pair in scores.windows(2) {
            let low = router.route(&analysis(pair[0]), ForceModel::Auto, None);
            let high = router.route(&analysis(pair[1]), ForceModel::Auto, None);
            assert!(low.tier <= high.tier, "{} vs {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_threshold_reasons() {
        let router = Router::new(0.5);
        let below = router.route(&analysis(0.2), ForceModel::Auto, None);
        assert_eq!(below.reason, REASON_BELOW_THRESHOLD);
        assert!(!below.use_thinking);

        let at = router.route(&analysis(0.5), ForceModel::Auto, None);
        assert!(at.use_complex_model());
        assert!(at.use_thinking);
        assert_eq!(at.reason, REASON_AT_OR_ABOVE_THRESHOLD);
    }

    #[test]
    fn test_forced_simple_for_every_score() {
        let router = Router::new(0.5);
        for i in 0..=10 {
            let d = router.route(&analysis(i as f64 / 10.0), ForceModel::Simple, None);
            assert!(!d.use_complex_model());
        }
    }

    #[test]
    fn test_thinking_true_wins() {
        let router = Router::new(0.5);
        let d = router.route(&analysis(0.0), ForceModel::Simple, Some(true));
        assert!(d.use_complex_model());
        assert!(d.use_thinking);
    }

    #[test]
    fn test_thinking_false_keeps_computed_tier() {
        let router = Router::new(0.5);
        let d = router.route(&analysis(0.9), ForceModel::Auto, Some(false));
        assert!(d.use_complex_model());
        assert!(!d.use_thinking);
    }

    #[test]
    fn test_force_model_parse() {
        assert_eq!(ForceModel::parse("Complex").unwrap(), ForceModel::Complex);
        assert_eq!(ForceModel::parse("").unwrap(), ForceModel::Auto);
        assert!(ForceModel::parse("turbo").is_err());
    }

    #[test]
    fn test_info_shape() {
        let d = Router::new(0.5).route(&analysis(0.1), ForceModel::Auto, None);
        let json = serde_json::to_value(d.info()).unwrap();
        assert_eq!(json["selectedAgent"], "simple");
        assert_eq!(json["useThinking"], false);
    }
}
