// src/analyze/matcher.rs
//! Category matcher: folded text → one `CategoryScore` per fixed category.
//!
//! Table rows come from `EngineConfig::categories` and are compiled once:
//! - non-ASCII keywords (Japanese terms) are plain substring probes,
//! - ASCII keywords only match on ASCII word edges (`app` does not fire in `happy`),
//! - `patterns` are regexes evaluated on the folded text.
//!
//! `hit_count` counts distinct probes that fire at least once; repeated occurrences
//! of the same probe never add up. A keyword only fires outside the matches of
//! longer keywords of the same row that contain it (`市場規模` is one hit, not two).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::analyze::scoring::contribution;
use crate::config::CategoryConfig;
use crate::error::EngineError;

/// The six structural dimensions of a plan, in fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryId {
    Product,
    Target,
    Budget,
    Schedule,
    Objective,
    Market,
}

impl CategoryId {
    pub const ALL: [CategoryId; 6] = [
        CategoryId::Product,
        CategoryId::Target,
        CategoryId::Budget,
        CategoryId::Schedule,
        CategoryId::Objective,
        CategoryId::Market,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CategoryId::Product => "product",
            CategoryId::Target => "target",
            CategoryId::Budget => "budget",
            CategoryId::Schedule => "schedule",
            CategoryId::Objective => "objective",
            CategoryId::Market => "market",
        }
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-category result of one matcher pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryScore {
    pub category: CategoryId,
    pub hit_count: u32,
    pub weight: f64,
    pub threshold: u32,
    /// `min(1, hit_count / threshold) * weight`
    pub contribution: f64,
}

impl CategoryScore {
    pub fn new(category: CategoryId, hit_count: u32, weight: f64, threshold: u32) -> Self {
        Self {
            category,
            hit_count,
            weight,
            threshold,
            contribution: contribution(hit_count, threshold, weight),
        }
    }
}

#[derive(Debug)]
enum Probe {
    /// `within`: longer literals of the same row containing `needle`.
    Literal { needle: String, within: Vec<String> },
    Bounded(Regex),
    Pattern(Regex),
}

impl Probe {
    fn fires(&self, text: &str) -> bool {
        match self {
            Probe::Literal { needle, within } if within.is_empty() => text.contains(needle.as_str()),
            Probe::Literal { needle, within } => {
                let mut rest = text.to_string();
                for w in within {
                    rest = rest.replace(w.as_str(), "\u{1}");
                }
                rest.contains(needle.as_str())
            }
            Probe::Bounded(re) | Probe::Pattern(re) => re.is_match(text),
        }
    }
}

#[derive(Debug)]
struct CompiledCategory {
    id: CategoryId,
    weight: f64,
    threshold: u32,
    missing_hint: String,
    probes: Vec<Probe>,
}

/// Immutable compiled category table. Rows are kept in `CategoryId::ALL` order.
#[derive(Debug)]
pub struct CategoryTable {
    rows: Vec<CompiledCategory>,
}

impl CategoryTable {
    /// Compile keyword/pattern rows. Bad regexes and missing categories are config errors.
    pub fn compile(categories: &[CategoryConfig]) -> Result<Self, EngineError> {
        let mut rows = Vec::with_capacity(CategoryId::ALL.len());
        for id in CategoryId::ALL {
            let cfg = categories
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| EngineError::config(format!("category `{id}` missing from table")))?;

            let folded: Vec<String> = cfg
                .keywords
                .iter()
                .map(|kw| fold_text(kw))
                .filter(|kw| !kw.is_empty())
                .collect();
            let mut probes = Vec::with_capacity(folded.len() + cfg.patterns.len());
            for kw in &folded {
                probes.push(keyword_probe(id, kw, &folded)?);
            }
            for pat in &cfg.patterns {
                let re = Regex::new(pat).map_err(|e| {
                    EngineError::config(format!("category `{id}` pattern `{pat}` error: {e}"))
                })?;
                probes.push(Probe::Pattern(re));
            }

            rows.push(CompiledCategory {
                id,
                weight: cfg.weight,
                threshold: cfg.threshold.max(1),
                missing_hint: cfg.missing_hint.clone(),
                probes,
            });
        }
        Ok(Self { rows })
    }

    /// Improvement hint shown when the category has no detected content.
    pub fn missing_hint(&self, id: CategoryId) -> &str {
        self.rows
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.missing_hint.as_str())
            .unwrap_or_default()
    }
}

fn keyword_probe(id: CategoryId, folded: &str, row: &[String]) -> Result<Probe, EngineError> {
    if folded.chars().all(|c| c.is_ascii_alphanumeric()) {
        let re = Regex::new(&format!(
            r"(?:^|[^a-z0-9]){}(?:$|[^a-z0-9])",
            regex::escape(folded)
        ))
        .map_err(|e| EngineError::config(format!("category `{id}` keyword `{folded}`: {e}")))?;
        Ok(Probe::Bounded(re))
    } else {
        let mut within: Vec<String> = row
            .iter()
            .filter(|other| other.len() > folded.len() && other.contains(folded))
            .cloned()
            .collect();
        within.sort_by_key(|w| std::cmp::Reverse(w.len()));
        within.dedup();
        Ok(Probe::Literal {
            needle: folded.to_string(),
            within,
        })
    }
}

/// Deterministic rule-path scanner over a compiled table.
#[derive(Debug)]
pub struct CategoryMatcher {
    table: CategoryTable,
}

impl CategoryMatcher {
    pub fn new(table: CategoryTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CategoryTable {
        &self.table
    }

    /// Score `text` against every category, in fixed category order.
    pub fn score(&self, text: &str) -> Vec<CategoryScore> {
        let folded = fold_text(text);
        self.table
            .rows
            .iter()
            .map(|row| {
                let hits = row.probes.iter().filter(|p| p.fires(&folded)).count();
                CategoryScore::new(
                    row.id,
                    u32::try_from(hits).unwrap_or(u32::MAX),
                    row.weight,
                    row.threshold,
                )
            })
            .collect()
    }
}

/// Locale-independent folding: full-width ASCII → ASCII, Unicode lowercase,
/// whitespace runs (incl. ideographic space) → one space, trimmed.
pub fn fold_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        let ch = match ch {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(ch as u32 - 0xFEE0).unwrap_or(ch),
            '\u{3000}' => ' ',
            c => c,
        };
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
            continue;
        }
        for lc in ch.to_lowercase() {
            out.push(lc);
        }
        last_space = false;
    }
    out.trim().to_string()
}
