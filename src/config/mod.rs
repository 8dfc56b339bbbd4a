// src/config/mod.rs
//! Engine configuration: TOML file + env overrides + invariant checks.
//!
//! Resolution order:
//! 1) `$ENGINE_CONFIG_PATH`, else `config/engine.toml`
//! 2) built-in defaults when the file does not exist
//! 3) env overrides (`CACHE_TTL_SECS`, `CACHE_TTL_MS`, `CACHE_MAX_ENTRIES`, `FUSION_ALPHA`)
//!
//! A present but unparsable file is an error. `validate()` is the gate that keeps
//! a broken table or boundary list from ever reaching request handling.

pub mod ai;

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::analyze::matcher::CategoryId;
use crate::analyze::scale::ScaleMapper;
use crate::error::EngineError;

// --- env defaults & names ---
pub const DEFAULT_ENGINE_CONFIG_PATH: &str = "config/engine.toml";
pub const ENV_ENGINE_CONFIG_PATH: &str = "ENGINE_CONFIG_PATH";
pub const ENV_CACHE_TTL_SECS: &str = "CACHE_TTL_SECS";
pub const ENV_CACHE_TTL_MS: &str = "CACHE_TTL_MS";
pub const ENV_CACHE_MAX_ENTRIES: &str = "CACHE_MAX_ENTRIES";
pub const ENV_FUSION_ALPHA: &str = "FUSION_ALPHA";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub fusion: FusionSection,
    #[serde(default)]
    pub scale: ScaleSection,
    #[serde(default)]
    pub input: InputSection,
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Millisecond TTL; wins over `ttl_secs` when set (short TTLs in tests).
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// 0 disables the background sweep (expiry is still checked on read).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FusionSection {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_disagreement_threshold")]
    pub disagreement_threshold: f64,
    #[serde(default = "default_disagreement_penalty")]
    pub disagreement_penalty: f64,
    #[serde(default = "default_rule_only_ceiling")]
    pub rule_only_ceiling: f64,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    #[serde(default = "default_complete_hint")]
    pub complete_hint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScaleSection {
    #[serde(default = "default_boundaries")]
    pub boundaries: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputSection {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

/// One row of the category table.
#[derive(Debug, Clone, Deserialize)]
pub struct CategoryConfig {
    pub id: CategoryId,
    pub weight: f64,
    /// Distinct hits at which the category saturates.
    pub threshold: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regexes evaluated on folded text.
    #[serde(default)]
    pub patterns: Vec<String>,
    pub missing_hint: String,
}

fn default_ttl_secs() -> u64 {
    3600
}
fn default_max_entries() -> usize {
    10_000
}
fn default_store_timeout_ms() -> u64 {
    200
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_alpha() -> f64 {
    0.5
}
fn default_disagreement_threshold() -> f64 {
    0.3
}
fn default_disagreement_penalty() -> f64 {
    0.5
}
fn default_rule_only_ceiling() -> f64 {
    0.5
}
fn default_max_suggestions() -> usize {
    5
}
fn default_complete_hint() -> String {
    "全体的に充実した内容です".to_string()
}
fn default_boundaries() -> Vec<f64> {
    vec![0.2, 0.4, 0.6, 0.8]
}
fn default_max_chars() -> usize {
    6000
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            ttl_ms: None,
            max_entries: default_max_entries(),
            store_timeout_ms: default_store_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheSection {
    pub fn ttl(&self) -> Duration {
        match self.ttl_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.ttl_secs),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for FusionSection {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            disagreement_threshold: default_disagreement_threshold(),
            disagreement_penalty: default_disagreement_penalty(),
            rule_only_ceiling: default_rule_only_ceiling(),
            max_suggestions: default_max_suggestions(),
            complete_hint: default_complete_hint(),
        }
    }
}

impl Default for ScaleSection {
    fn default() -> Self {
        Self {
            boundaries: default_boundaries(),
        }
    }
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheSection::default(),
            fusion: FusionSection::default(),
            scale: ScaleSection::default(),
            input: InputSection::default(),
            categories: default_categories(),
        }
    }
}

impl EngineConfig {
    /// Parse from a TOML string (no env overrides, no validation).
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let cfg: EngineConfig = toml::from_str(toml_str).context("parsing engine config TOML")?;
        Ok(cfg)
    }

    /// Resolve path, read the file (or fall back to defaults), apply env overrides and validate.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(ENV_ENGINE_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ENGINE_CONFIG_PATH));

        let mut cfg = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading engine config at {}", path.display()))?;
            let cfg = Self::from_toml_str(&content)
                .with_context(|| format!("engine config at {}", path.display()))?;
            info!(target: "completeness", path = %path.display(), "engine config loaded");
            cfg
        } else {
            warn!(
                target: "completeness",
                path = %path.display(),
                "engine config not found, using built-in defaults"
            );
            Self::default()
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply env overrides. Unparsable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(secs) = parse_env::<u64>(ENV_CACHE_TTL_SECS) {
            self.cache.ttl_secs = secs;
            self.cache.ttl_ms = None;
        }
        if let Some(ms) = parse_env::<u64>(ENV_CACHE_TTL_MS) {
            self.cache.ttl_ms = Some(ms);
        }
        if let Some(n) = parse_env::<usize>(ENV_CACHE_MAX_ENTRIES) {
            self.cache.max_entries = n;
        }
        if let Some(alpha) = parse_env::<f64>(ENV_FUSION_ALPHA).filter(|a| a.is_finite()) {
            self.fusion.alpha = alpha.clamp(0.0, 1.0);
        }
    }

    /// Check every configuration-time invariant.
    pub fn validate(&self) -> Result<(), EngineError> {
        // categories: exactly the six fixed ids, once each
        let mut seen = HashSet::new();
        for c in &self.categories {
            if !seen.insert(c.id) {
                return Err(EngineError::config(format!(
                    "category `{}` defined more than once",
                    c.id
                )));
            }
            if !c.weight.is_finite() || c.weight < 0.0 {
                return Err(EngineError::config(format!(
                    "category `{}` has invalid weight {}",
                    c.id, c.weight
                )));
            }
            if c.threshold == 0 {
                return Err(EngineError::config(format!(
                    "category `{}` threshold must be >= 1",
                    c.id
                )));
            }
            if c.weight > 0.0 && c.keywords.is_empty() && c.patterns.is_empty() {
                return Err(EngineError::config(format!(
                    "category `{}` is weighted but has no keywords or patterns",
                    c.id
                )));
            }
        }
        if let Some(missing) = CategoryId::ALL.iter().find(|id| !seen.contains(*id)) {
            return Err(EngineError::config(format!(
                "category `{missing}` missing from table"
            )));
        }
        let weight_sum: f64 = self.categories.iter().map(|c| c.weight).sum();
        if weight_sum <= 0.0 {
            return Err(EngineError::config("category weights sum to zero"));
        }

        // fusion
        let f = &self.fusion;
        for (name, v) in [
            ("alpha", f.alpha),
            ("disagreement_threshold", f.disagreement_threshold),
            ("disagreement_penalty", f.disagreement_penalty),
            ("rule_only_ceiling", f.rule_only_ceiling),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::config(format!(
                    "fusion.{name} must be within [0,1], got {v}"
                )));
            }
        }
        if f.max_suggestions == 0 {
            return Err(EngineError::config("fusion.max_suggestions must be >= 1"));
        }

        ScaleMapper::new(&self.scale.boundaries)?;

        // cache / input
        if self.cache.max_entries == 0 {
            return Err(EngineError::config("cache.max_entries must be >= 1"));
        }
        if self.cache.ttl().is_zero() {
            return Err(EngineError::config("cache TTL must be > 0"));
        }
        if self.input.max_chars == 0 {
            return Err(EngineError::config("input.max_chars must be >= 1"));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Built-in category table. Mirrors `config/engine.toml`.
pub fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig {
            id: CategoryId::Product,
            weight: 1.0,
            threshold: 2,
            keywords: strings(&[
                "商品", "サービス", "製品", "プロダクト", "アプリ", "機能", "ブランド",
                "メニュー", "開発", "product", "service", "app",
            ]),
            patterns: Vec::new(),
            missing_hint: "商品・サービスの内容が見当たりません。何を提供するのかを具体的に記載してください"
                .to_string(),
        },
        CategoryConfig {
            id: CategoryId::Target,
            weight: 1.0,
            threshold: 1,
            keywords: strings(&[
                "ターゲット", "顧客", "ユーザー", "利用者", "消費者", "向け", "学生", "主婦",
                "会社員", "ファミリー", "シニア", "法人", "target", "customer", "persona",
            ]),
            patterns: strings(&[r"\d+\s*(代|歳)", r"(男性|女性)", r"(若年|中高年|高齢)層"]),
            missing_hint: "ターゲット顧客が明確ではありません。年代・属性などを記載してください"
                .to_string(),
        },
        CategoryConfig {
            id: CategoryId::Budget,
            weight: 1.0,
            threshold: 1,
            keywords: strings(&[
                "予算", "費用", "コスト", "投資", "資金", "原価", "budget", "cost",
            ]),
            patterns: strings(&[
                r"\d[\d,.]*\s*(万|億|千)?\s*円",
                r"\d[\d,.]*\s*(万|億)",
                r"[¥￥$]\s*\d",
                r"\d[\d,.]*\s*(k|m)?\s*(yen|usd|dollars?)",
            ]),
            missing_hint: "予算・費用感の記載がありません。金額の目安を記載してください".to_string(),
        },
        CategoryConfig {
            id: CategoryId::Schedule,
            weight: 1.0,
            threshold: 1,
            keywords: strings(&[
                "スケジュール", "期間", "時期", "開始", "予定", "締切", "期限", "リリース",
                "発売", "ローンチ", "納期", "マイルストーン", "schedule", "deadline", "launch",
                "timeline",
            ]),
            patterns: strings(&[
                r"\d{1,2}\s*月",
                r"[一二三四五六七八九十]+月",
                r"\d{4}\s*年",
                r"\d+\s*(週間|ヶ月|か月|カ月|ケ月|日間|年間)",
                r"(上期|下期|上半期|下半期|第[1-4一二三四]四半期)",
                r"(来月|来年|今年|年内|年度内|今期|来期)",
            ]),
            missing_hint:
                "スケジュール・実施時期の記載がありません。開始時期や期間を記載してください"
                    .to_string(),
        },
        CategoryConfig {
            id: CategoryId::Objective,
            weight: 1.0,
            threshold: 2,
            keywords: strings(&[
                "目的", "目標", "狙い", "ねらい", "ゴール", "目指", "kpi", "獲得", "新規",
                "向上", "拡大", "増加", "認知", "達成", "改善", "goal", "objective",
            ]),
            patterns: strings(&[r"\d+(\.\d+)?\s*(%|パーセント)", r"\d+\s*(件|人|名|社)"]),
            missing_hint: "目的・目標が明確ではありません。達成したい成果やKPIを記載してください"
                .to_string(),
        },
        CategoryConfig {
            id: CategoryId::Market,
            weight: 1.0,
            threshold: 2,
            keywords: strings(&[
                "市場", "競合", "トレンド", "需要", "シェア", "業界", "ニーズ", "市場規模",
                "成長率", "差別化", "market", "competitor", "competition",
            ]),
            patterns: Vec::new(),
            missing_hint: "市場・競合の分析が見当たりません。市場規模や競合状況を記載してください"
                .to_string(),
        },
    ]
}
