// src/analyze/mod.rs
//! Hybrid completeness engine: input → cache → (matcher + judgment) → fusion → band.

pub mod ai_adapter;
pub mod fusion;
pub mod input;
pub mod matcher;
pub mod scale;
pub mod scoring;

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheStatus, ResultCache};
use crate::config::ai::JudgmentConfig;
use crate::config::EngineConfig;
use crate::error::EngineError;

pub use ai_adapter::{DynProvider, Judgment, JudgmentAdapter, JudgmentProvider, JudgmentResult};
pub use fusion::{FusedScore, FusionPolicy, ScoreSource};
pub use input::AnalysisInput;
pub use matcher::{CategoryId, CategoryMatcher, CategoryScore, CategoryTable};
pub use scale::ScaleMapper;
pub use scoring::RuleScore;

/// Result of one `analyze` call.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub score: FusedScore,
    pub cache: CacheStatus,
    pub key: CacheKey,
}

/// Public output shape: `{ completeness, suggestions, confidence }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResponse {
    pub completeness: u8,
    pub suggestions: Vec<String>,
    pub confidence: f64,
}

impl From<&FusedScore> for AnalysisResponse {
    fn from(s: &FusedScore) -> Self {
        Self {
            completeness: s.band,
            suggestions: s.suggestions.clone(),
            confidence: s.confidence,
        }
    }
}

struct EngineInner {
    matcher: CategoryMatcher,
    fusion: FusionPolicy,
    scale: ScaleMapper,
    adapter: JudgmentAdapter,
    cache: ResultCache,
    max_chars: usize,
}

/// Shared engine handle. Cheap to clone; safe to use from many tasks.
#[derive(Clone)]
pub struct CompletenessEngine {
    inner: Arc<EngineInner>,
}

impl CompletenessEngine {
    /// Validate config, compile the category table and wire the parts together.
    pub fn new(
        cfg: &EngineConfig,
        adapter: JudgmentAdapter,
        cache: ResultCache,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        let table = CategoryTable::compile(&cfg.categories)?;
        let scale = ScaleMapper::new(&cfg.scale.boundaries)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                matcher: CategoryMatcher::new(table),
                fusion: FusionPolicy::from_config(&cfg.fusion),
                scale,
                adapter,
                cache,
                max_chars: cfg.input.max_chars,
            }),
        })
    }

    /// Engine with the default in-memory cache.
    pub fn from_config(
        cfg: &EngineConfig,
        provider: DynProvider,
        judgment: &JudgmentConfig,
    ) -> Result<Self, EngineError> {
        let adapter = JudgmentAdapter::from_config(provider, judgment);
        Self::new(cfg, adapter, ResultCache::in_memory(&cfg.cache))
    }

    pub fn provider_name(&self) -> &'static str {
        self.inner.adapter.provider_name()
    }

    pub fn cache_store_name(&self) -> &'static str {
        self.inner.cache.store_name()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    /// Deterministic rule path only (no provider, no cache).
    pub fn rule_score(&self, text: &str) -> RuleScore {
        scoring::normalize(self.inner.matcher.score(text))
    }

    /// Rule breakdown for exactly the text `analyze` would score (clipped).
    pub fn explain(&self, input: &AnalysisInput) -> RuleScore {
        self.rule_score(&input.analysis_text(self.inner.max_chars))
    }

    /// Validate raw fields, then analyze.
    pub async fn analyze_text(
        &self,
        text: &str,
        doc_text: Option<String>,
    ) -> Result<Analysis, EngineError> {
        let input = AnalysisInput::new(text, doc_text)?;
        self.analyze(&input).await
    }

    /// Cached, deduplicated analysis. Provider and store failures degrade the
    /// result; only a dead shared computation is an error here.
    pub async fn analyze(&self, input: &AnalysisInput) -> Result<Analysis, EngineError> {
        let started = Instant::now();
        let key = CacheKey::for_input(input);
        let text = input.analysis_text(self.inner.max_chars);

        let engine = self.clone();
        let (score, cache) = self
            .inner
            .cache
            .compute_once(key, move || async move { engine.compute(key, text).await })
            .await?;

        let ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("completeness_analyze_duration_ms").record(ms);
        info!(
            target: "completeness",
            key = %key.fingerprint(),
            band = score.band,
            confidence = score.confidence,
            source = ?score.source,
            cache = cache.as_str(),
            elapsed_ms = ms,
            "analysis done"
        );
        Ok(Analysis { score, cache, key })
    }

    async fn compute(&self, key: CacheKey, text: String) -> FusedScore {
        let rule = self.rule_score(&text);
        debug!(
            target: "completeness",
            key = %key.fingerprint(),
            rule_score = rule.normalized_score,
            matched = ?rule.matched,
            "rule path"
        );
        let judgment = self.inner.adapter.judge(&text).await;
        let inner = &self.inner;
        inner
            .fusion
            .fuse(&rule, &judgment, inner.matcher.table(), &inner.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::ai_adapter::{DisabledProvider, MockProvider};
    use std::time::Duration;

    fn engine_with(provider: DynProvider) -> CompletenessEngine {
        let adapter =
            JudgmentAdapter::new(provider, Duration::from_millis(500), Duration::from_millis(1));
        let cfg = EngineConfig::default();
        CompletenessEngine::new(&cfg, adapter, ResultCache::in_memory(&cfg.cache)).unwrap()
    }

    #[tokio::test]
    async fn rule_only_example() {
        let engine = engine_with(Arc::new(DisabledProvider));
        let a = engine
            .analyze_text("予算1000万円で20代をターゲットに8月から新規獲得を目指す", None)
            .await
            .unwrap();
        assert_eq!(a.cache, CacheStatus::Miss);
        assert_eq!(a.score.band, 4);
        assert_eq!(a.score.source, ScoreSource::RuleOnly);
        assert!((a.score.value - 4.0 / 6.0).abs() < 1e-9);
        assert!(a.score.confidence <= 0.5);
        assert_eq!(a.score.suggestions.len(), 2);
        assert!(a.score.suggestions[0].contains("商品"));
        assert!(a.score.suggestions[1].contains("市場"));
    }

    #[tokio::test]
    async fn repeated_input_hits_cache_without_provider() {
        let mock = MockProvider::new(JudgmentResult {
            estimated_score: 0.5,
            suggestions: vec!["もう少し具体的に".into()],
            provider_confidence: 0.9,
        });
        let calls = mock.call_counter();
        let engine = engine_with(Arc::new(mock));

        let first = engine.analyze_text("新商品の販促", None).await.unwrap();
        let second = engine.analyze_text("新商品の販促", None).await.unwrap();
        assert_eq!(first.cache, CacheStatus::Miss);
        assert_eq!(second.cache, CacheStatus::Hit);
        assert_eq!(first.score, second.score);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn explain_scores_the_clipped_text() {
        let mut cfg = EngineConfig::default();
        cfg.input.max_chars = 10;
        let adapter = JudgmentAdapter::new(
            Arc::new(DisabledProvider),
            Duration::from_millis(500),
            Duration::ZERO,
        );
        let engine = CompletenessEngine::new(&cfg, adapter, ResultCache::uncached()).unwrap();
        let input = AnalysisInput::new("あいうえおかきくけこ市場と競合", None).unwrap();

        let market = |r: &RuleScore| {
            r.categories
                .iter()
                .find(|c| c.category == CategoryId::Market)
                .map(|c| c.hit_count)
        };
        assert_eq!(market(&engine.rule_score(&input.normalized())), Some(2));
        assert_eq!(market(&engine.explain(&input)), Some(0));
    }

    #[tokio::test]
    async fn empty_text_is_rejected_and_not_cached() {
        let engine = engine_with(Arc::new(DisabledProvider));
        let err = engine
            .analyze_text("  ", Some("資料".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(engine.cache().get(&CacheKey::for_normalized("")).await.is_none());
    }

    #[test]
    fn response_shape() {
        let s = FusedScore {
            value: 0.3,
            confidence: 0.4,
            band: 2,
            suggestions: vec!["a".into()],
            source: ScoreSource::Hybrid,
        };
        let json = serde_json::to_value(AnalysisResponse::from(&s)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"completeness": 2, "suggestions": ["a"], "confidence": 0.4})
        );
    }
}
