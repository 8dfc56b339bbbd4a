//! Score fusion: rule score + judgment (or its absence) → `FusedScore`.
//!
//! Available judgment:
//!   value      = α·rule + (1−α)·judgment
//!   confidence = provider confidence, × penalty when |rule − judgment| > threshold
//! Unavailable judgment:
//!   value      = rule
//!   confidence = min(0.5 + 0.5·rule, rule_only_ceiling)
//!
//! Suggestions: provider ones when present, otherwise one hint per unmatched weighted
//! category (fixed order), or the "complete" hint when nothing is missing.

use serde::{Deserialize, Serialize};

use super::ai_adapter::Judgment;
use super::matcher::CategoryTable;
use super::scale::ScaleMapper;
use super::scoring::RuleScore;
use crate::config::FusionSection;

/// Which signals produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Hybrid,
    RuleOnly,
}

/// Final engine result for one normalized input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedScore {
    pub value: f64,
    pub confidence: f64,
    /// 1..=5
    pub band: u8,
    pub suggestions: Vec<String>,
    pub source: ScoreSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionPolicy {
    pub alpha: f64,
    pub disagreement_threshold: f64,
    pub disagreement_penalty: f64,
    pub rule_only_ceiling: f64,
    pub max_suggestions: usize,
    pub complete_hint: String,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self::from_config(&FusionSection::default())
    }
}

impl FusionPolicy {
    pub fn from_config(cfg: &FusionSection) -> Self {
        Self {
            alpha: cfg.alpha,
            disagreement_threshold: cfg.disagreement_threshold,
            disagreement_penalty: cfg.disagreement_penalty,
            rule_only_ceiling: cfg.rule_only_ceiling,
            max_suggestions: cfg.max_suggestions.max(1),
            complete_hint: cfg.complete_hint.clone(),
        }
    }

    pub fn fuse(
        &self,
        rule: &RuleScore,
        judgment: &Judgment,
        table: &CategoryTable,
        scale: &ScaleMapper,
    ) -> FusedScore {
        let r = unit(rule.normalized_score);

        let (value, confidence, provided, source) = match judgment {
            Judgment::Available(j) => {
                let js = unit(j.estimated_score);
                let value = self.alpha * r + (1.0 - self.alpha) * js;
                let mut confidence = unit(j.provider_confidence);
                if (r - js).abs() > self.disagreement_threshold {
                    confidence *= self.disagreement_penalty;
                }
                (value, confidence, j.suggestions.as_slice(), ScoreSource::Hybrid)
            }
            Judgment::Unavailable(_) => {
                let confidence = (0.5 + 0.5 * r).min(self.rule_only_ceiling);
                (r, confidence, &[][..], ScoreSource::RuleOnly)
            }
        };

        let suggestions = if provided.is_empty() {
            self.fallback_suggestions(rule, table)
        } else {
            self.cap(provided.iter().cloned())
        };

        let value = unit(value);
        FusedScore {
            value,
            confidence: unit(confidence),
            band: scale.band(value),
            suggestions,
            source,
        }
    }

    fn fallback_suggestions(&self, rule: &RuleScore, table: &CategoryTable) -> Vec<String> {
        let hints: Vec<String> = rule
            .missing
            .iter()
            .map(|id| table.missing_hint(*id).to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if hints.is_empty() {
            vec![self.complete_hint.clone()]
        } else {
            self.cap(hints.into_iter())
        }
    }

    /// Dedup (first wins) and cap.
    fn cap(&self, items: impl Iterator<Item = String>) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.max_suggestions);
        for s in items {
            if out.len() >= self.max_suggestions {
                break;
            }
            if !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }
}

fn unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}
