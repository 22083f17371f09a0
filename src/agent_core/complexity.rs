//! Complexity analysis — scores a natural-language query's structural difficulty.
//!
//! Pure and deterministic. The score is the sum of a length band and one
//! weight per detected signal, clamped to [0, 1].

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::inference::types::ModelTier;

// ─── Weights ────────────────────────────────────────────────────────────────

const JOIN_WEIGHT: f64 = 0.25;
const AGGREGATION_WEIGHT: f64 = 0.2;
const SUBQUERY_WEIGHT: f64 = 0.2;
const MULTI_TABLE_WEIGHT: f64 = 0.15;
const RANKING_WEIGHT: f64 = 0.2;

/// (max words, weight) bands; anything longer gets `LONG_QUERY_WEIGHT`.
const LENGTH_BANDS: &[(usize, f64)] = &[(12, 0.0), (25, 0.1), (50, 0.2)];
const LONG_QUERY_WEIGHT: f64 = 0.3;

pub const DEFAULT_THRESHOLD: f64 = 0.5;

// ─── Types ──────────────────────────────────────────────────────────────────

/// A structural feature that made the query harder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexitySignal {
    Join,
    Aggregation,
    Subquery,
    MultiTable,
    Ranking,
}

impl ComplexitySignal {
    fn weight(&self) -> f64 {
        match self {
            ComplexitySignal::Join => JOIN_WEIGHT,
            ComplexitySignal::Aggregation => AGGREGATION_WEIGHT,
            ComplexitySignal::Subquery => SUBQUERY_WEIGHT,
            ComplexitySignal::MultiTable => MULTI_TABLE_WEIGHT,
            ComplexitySignal::Ranking => RANKING_WEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    /// In [0, 1].
    pub score: f64,
    pub token_count: usize,
    pub signals: Vec<ComplexitySignal>,
    pub recommended_tier: ModelTier,
}

// ─── Patterns ───────────────────────────────────────────────────────────────

fn join_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(join|joined|joining|combine[ds]?|along with|together with|matched with|cross[- ]reference[ds]?)\b",
        )
        .expect("static regex")
    })
}

fn aggregation_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(sum|count|counts|average|avg|mean|median|total|totals|group(ed)? by|per|how many|maximum|minimum|max|min|aggregate[ds]?|breakdown)\b",
        )
        .expect("static regex")
    })
}

fn subquery_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(subquery|subqueries|nested|(who|which|that) (have|has|had) (never|not|no|more|less|at least)|not in|exists|than the average|above average|below average)\b",
        )
        .expect("static regex")
    })
}

fn ranking_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(top \d+|top|bottom \d+|rank|ranked|ranking|highest|lowest|best|worst|compare|compared|comparison|versus|vs\.?|trend|trends|growth|year over year|month over month|percentile|percentage)\b",
        )
        .expect("static regex")
    })
}

fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+").expect("static regex"))
}

// ─── Analyzer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ComplexityAnalyzer {
    threshold: f64,
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl ComplexityAnalyzer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Score `query`, counting `tables` (the request's table context) as
    /// mentioned when they appear in the text.
    pub fn analyze(&self, query: &str, tables: &[String]) -> ComplexityAnalysis {
        let words: Vec<&str> = word_pattern()
            .find_iter(query)
            .map(|m| m.as_str())
            .collect();

        if words.is_empty() {
            return ComplexityAnalysis {
                score: 0.0,
                token_count: 0,
                signals: Vec::new(),
                recommended_tier: ModelTier::Simple,
            };
        }

        let mut signals = Vec::new();
        if join_pattern().is_match(query) {
            signals.push(ComplexitySignal::Join);
        }
        if aggregation_pattern().is_match(query) {
            signals.push(ComplexitySignal::Aggregation);
        }
        if subquery_pattern().is_match(query) {
            signals.push(ComplexitySignal::Subquery);
        }
        if mentioned_tables(&words, tables) >= 2 {
            signals.push(ComplexitySignal::MultiTable);
        }
        if ranking_pattern().is_match(query) {
            signals.push(ComplexitySignal::Ranking);
        }

        let raw = length_weight(words.len()) + signals.iter().map(|s| s.weight()).sum::<f64>();
        let score = (raw * 100.0).round() / 100.0;
        let score = score.clamp(0.0, 1.0);

        let recommended_tier = if score >= self.threshold {
            ModelTier::Complex
        } else {
            ModelTier::Simple
        };

        tracing::debug!(
            score,
            words = words.len(),
            signals = ?signals,
            tier = recommended_tier.as_str(),
            "complexity analyzed"
        );

        ComplexityAnalysis {
            score,
            token_count: words.len(),
            signals,
            recommended_tier,
        }
    }
}

fn length_weight(words: usize) -> f64 {
    LENGTH_BANDS
        .iter()
        .find(|(max, _)| words <= *max)
        .map(|(_, w)| *w)
        .unwrap_or(LONG_QUERY_WEIGHT)
}

/// Distinct context tables named in the query (singular or plural form).
fn mentioned_tables(words: &[&str], tables: &[String]) -> usize {
    let lowered: BTreeSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
    tables
        .iter()
        .map(|t| t.rsplit('.').next().unwrap_or(t).to_lowercase())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|t| {
            let singular = t.strip_suffix('s').unwrap_or(t);
            lowered.contains(t.as_str())
                || lowered.contains(singular)
                || lowered.contains(&format!("{t}s"))
        })
        .count()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
