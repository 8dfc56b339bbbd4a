//! Rule-score normalization.
//!
//! Each category contributes `min(1, hits/threshold) * weight`; the rule score is
//! the sum of contributions over the sum of weights. Zero-weight categories drop
//! out of both sums. Output is always a finite value in [0,1].

use serde::Serialize;

use super::matcher::{CategoryId, CategoryScore};

/// Saturating per-category contribution.
pub fn contribution(hit_count: u32, threshold: u32, weight: f64) -> f64 {
    if weight <= 0.0 || !weight.is_finite() {
        return 0.0;
    }
    let t = f64::from(threshold.max(1));
    (f64::from(hit_count) / t).min(1.0) * weight
}

/// Aggregated rule-path result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleScore {
    /// In [0,1].
    pub normalized_score: f64,
    /// Weighted categories with at least one hit, in fixed order.
    pub matched: Vec<CategoryId>,
    /// Weighted categories with no hit, in fixed order.
    pub missing: Vec<CategoryId>,
    pub categories: Vec<CategoryScore>,
}

/// Total function over any category-score list.
pub fn normalize(categories: Vec<CategoryScore>) -> RuleScore {
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    let mut matched = Vec::new();
    let mut missing = Vec::new();

    for c in categories.iter().filter(|c| c.weight > 0.0 && c.weight.is_finite()) {
        weight_sum += c.weight;
        sum += c.contribution;
        if c.hit_count > 0 {
            matched.push(c.category);
        } else {
            missing.push(c.category);
        }
    }

    let normalized_score = if weight_sum > 0.0 {
        (sum / weight_sum).clamp(0.0, 1.0)
    } else {
        0.0
    };

    RuleScore {
        normalized_score,
        matched,
        missing,
        categories,
    }
}
