//! Judgment provider boundary: provider abstraction + timeout/retry adapter.
//!
//! Providers do the remote call and may fail in any way. `JudgmentAdapter` bounds
//! every attempt with a deadline, retries once on transient errors, validates the
//! response and turns every failure into `Judgment::Unavailable`. Callers never see
//! a provider error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ai::JudgmentConfig;
use crate::error::ProviderError;

/// Max length (chars) of a single provider suggestion after sanitizing.
pub const MAX_SUGGESTION_CHARS: usize = 160;
const MAX_ATTEMPTS: u32 = 2;

// ------------------------------------------------------------
// Public surface
// ------------------------------------------------------------

/// Structured answer from a judgment provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentResult {
    /// 0.0–1.0
    pub estimated_score: f64,
    pub suggestions: Vec<String>,
    /// 0.0–1.0
    pub provider_confidence: f64,
}

/// Why the provider could not contribute to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    Disabled,
    Timeout,
    Transport,
    Rejected,
    Malformed,
}

impl UnavailableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Rejected => "rejected",
            Self::Malformed => "malformed",
        }
    }
}

impl From<&ProviderError> for UnavailableReason {
    fn from(e: &ProviderError) -> Self {
        match e {
            ProviderError::Timeout(_) => Self::Timeout,
            ProviderError::Transport(_) => Self::Transport,
            ProviderError::Status { .. } if e.is_transient() => Self::Transport,
            ProviderError::Status { .. } | ProviderError::Rejected(_) => Self::Rejected,
            ProviderError::Malformed(_) => Self::Malformed,
            ProviderError::Disabled => Self::Disabled,
        }
    }
}

/// Outcome of one adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum Judgment {
    Available(JudgmentResult),
    Unavailable(UnavailableReason),
}

impl Judgment {
    pub fn is_available(&self) -> bool {
        matches!(self, Judgment::Available(_))
    }
}

/// Low-level provider: does the real remote call.
#[async_trait]
pub trait JudgmentProvider: Send + Sync {
    async fn judge(&self, text: &str) -> Result<JudgmentResult, ProviderError>;
    /// Provider name for diagnostics/health.
    fn name(&self) -> &'static str;
}

pub type DynProvider = Arc<dyn JudgmentProvider>;

// ------------------------------------------------------------
// Adapter
// ------------------------------------------------------------

/// Wraps a provider with a per-attempt deadline and one retry on transient failure.
#[derive(Clone)]
pub struct JudgmentAdapter {
    provider: DynProvider,
    timeout: Duration,
    retry_backoff: Duration,
}

impl JudgmentAdapter {
    pub fn new(provider: DynProvider, timeout: Duration, retry_backoff: Duration) -> Self {
        Self {
            provider,
            timeout,
            retry_backoff,
        }
    }

    pub fn from_config(provider: DynProvider, cfg: &JudgmentConfig) -> Self {
        Self::new(provider, cfg.timeout(), cfg.retry_backoff())
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Never fails: errors end up as `Judgment::Unavailable`.
    pub async fn judge(&self, text: &str) -> Judgment {
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, self.provider.judge(text)).await
            {
                Ok(res) => res.and_then(validate),
                Err(_) => Err(ProviderError::Timeout(self.timeout)),
            };

            match outcome {
                Ok(result) => return Judgment::Available(result),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    debug!(
                        target: "completeness",
                        provider = self.provider.name(),
                        attempt,
                        error = %e,
                        "judgment attempt failed, retrying"
                    );
                    counter!("completeness_provider_retries_total", "error" => e.code()).increment(1);
                    if !self.retry_backoff.is_zero() {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    let reason = UnavailableReason::from(&e);
                    if reason == UnavailableReason::Disabled {
                        debug!(target: "completeness", "judgment provider disabled, rule-only");
                    } else {
                        warn!(
                            target: "completeness",
                            provider = self.provider.name(),
                            attempt,
                            reason = reason.as_str(),
                            error = %e,
                            "judgment provider unavailable"
                        );
                    }
                    counter!("completeness_provider_unavailable_total", "reason" => reason.as_str())
                        .increment(1);
                    return Judgment::Unavailable(reason);
                }
            }
        }
    }
}

/// Range-check scores and sanitize suggestions.
fn validate(mut r: JudgmentResult) -> Result<JudgmentResult, ProviderError> {
    let in_unit = |x: f64| x.is_finite() && (0.0..=1.0).contains(&x);
    if !in_unit(r.estimated_score) {
        return Err(ProviderError::Malformed(format!(
            "estimated_score out of range: {}",
            r.estimated_score
        )));
    }
    if !in_unit(r.provider_confidence) {
        return Err(ProviderError::Malformed(format!(
            "provider_confidence out of range: {}",
            r.provider_confidence
        )));
    }
    r.suggestions = r
        .suggestions
        .iter()
        .map(|s| sanitize_suggestion(s))
        .filter(|s| !s.is_empty())
        .collect();
    Ok(r)
}

/// Single line, collapsed whitespace, at most `MAX_SUGGESTION_CHARS` chars.
pub fn sanitize_suggestion(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_SUGGESTION_CHARS * 4));
    let mut count = 0usize;
    let mut prev_space = false;
    for ch in input.chars() {
        let c = if ch.is_whitespace() || ch.is_control() {
            ' '
        } else {
            ch
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
                count += 1;
            }
            prev_space = true;
        } else {
            out.push(c);
            count += 1;
            prev_space = false;
        }
        if count >= MAX_SUGGESTION_CHARS {
            break;
        }
    }
    out.trim().to_string()
}

// ------------------------------------------------------------
// Factory
// ------------------------------------------------------------

/// Pick a provider from config:
/// * `enabled == false` or provider "disabled" → `DisabledProvider`
/// * "mock" → `MockProvider::neutral()`
/// * "openai" → `OpenAiProvider` (falls back to disabled if it cannot be built)
pub fn build_provider_from_config(cfg: &JudgmentConfig) -> DynProvider {
    if !cfg.enabled {
        return Arc::new(DisabledProvider);
    }
    match cfg.provider.as_str() {
        "mock" => Arc::new(MockProvider::neutral()),
        "openai" => match OpenAiProvider::new(cfg) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!(target: "completeness", error = %e, "openai provider unavailable, rule-only mode");
                Arc::new(DisabledProvider)
            }
        },
        other => {
            warn!(target: "completeness", provider = other, "unknown judgment provider, rule-only mode");
            Arc::new(DisabledProvider)
        }
    }
}

// ------------------------------------------------------------
// Concrete providers
// ------------------------------------------------------------

/// Always unavailable; the engine runs rule-only.
pub struct DisabledProvider;

#[async_trait]
impl JudgmentProvider for DisabledProvider {
    async fn judge(&self, _text: &str) -> Result<JudgmentResult, ProviderError> {
        Err(ProviderError::Disabled)
    }
    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic provider for tests/local runs. Counts invocations.
#[derive(Clone)]
pub struct MockProvider {
    fixed: JudgmentResult,
    delay: Duration,
    fail_first: usize,
    calls: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(fixed: JudgmentResult) -> Self {
        Self {
            fixed,
            delay: Duration::ZERO,
            fail_first: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Used for `AI_TEST_MODE=mock`.
    pub fn neutral() -> Self {
        Self::new(JudgmentResult {
            estimated_score: 0.5,
            suggestions: vec!["(mock) 計画の具体性をさらに高めてください".to_string()],
            provider_confidence: 0.8,
        })
    }

    /// Sleep before answering (simulates a slow provider).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// First `n` calls fail with a transport error.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Shared counter, still readable after the provider moved into an engine.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl JudgmentProvider for MockProvider {
    async fn judge(&self, _text: &str) -> Result<JudgmentResult, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if n < self.fail_first {
            return Err(ProviderError::Transport("mock: connection reset".to_string()));
        }
        Ok(self.fixed.clone())
    }
    fn name(&self) -> &'static str {
        "mock"
    }
}

/// OpenAI chat-completions provider. Requires an API key (config or `OPENAI_API_KEY`).
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
/// Used when the model omits `confidence`.
const DEFAULT_PROVIDER_CONFIDENCE: f64 = 0.8;
/// The model rates completeness on 0..=2.
const PROVIDER_SCALE_MAX: f64 = 2.0;

const SYSTEM_PROMPT: &str = "あなたは事業計画・販促企画の審査担当です。入力された企画内容が、商品・サービス、ターゲット、予算、スケジュール、目的、市場の観点でどれだけ具体的に記載されているかを評価してください。\
出力は次のJSONのみ: {\"completeness\": 0〜2の数値 (0=不十分, 1=一部不足, 2=十分), \"suggestions\": [改善提案の文字列, 最大5件], \"reasoning\": \"短い根拠\", \"confidence\": 0.0〜1.0}";

impl OpenAiProvider {
    pub fn new(cfg: &JudgmentConfig) -> Result<Self, ProviderError> {
        let api_key = if cfg.api_key.trim().is_empty() {
            std::env::var("OPENAI_API_KEY").unwrap_or_default()
        } else {
            cfg.api_key.clone()
        };
        if api_key.is_empty() {
            return Err(ProviderError::Rejected("missing OpenAI API key".to_string()));
        }
        // Adapter owns the deadline; this is only a backstop.
        let http = reqwest::Client::builder()
            .user_agent("plan-completeness-analyzer/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(cfg.timeout() * 2)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_key,
            model: cfg.model.clone(),
            endpoint: OPENAI_ENDPOINT.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    completeness: f64,
    #[serde(default)]
    suggestions: Vec<String>,
    confidence: Option<f64>,
}

/// Parse the model's JSON content into a result on the 0–1 scale.
fn parse_verdict(content: &str) -> Result<JudgmentResult, ProviderError> {
    let v: Verdict = serde_json::from_str(content.trim())
        .map_err(|e| ProviderError::Malformed(format!("verdict json: {e}")))?;
    Ok(JudgmentResult {
        estimated_score: v.completeness / PROVIDER_SCALE_MAX,
        suggestions: v.suggestions,
        provider_confidence: v.confidence.unwrap_or(DEFAULT_PROVIDER_CONFIDENCE),
    })
}

#[async_trait]
impl JudgmentProvider for OpenAiProvider {
    async fn judge(&self, text: &str) -> Result<JudgmentResult, ProviderError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
            response_format: ResponseFormat,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: text,
                },
            ],
            temperature: 0.2,
            max_tokens: 600,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::Rejected(format!("auth failed ({status})")));
        }
        if !status.is_success() {
            return Err(ProviderError::Status {
                code: status.as_u16(),
            });
        }

        let body: Resp = resp.json().await?;
        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| ProviderError::Malformed("empty choices".to_string()))?;
        parse_verdict(content)
    }
    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(score: f64) -> JudgmentResult {
        JudgmentResult {
            estimated_score: score,
            suggestions: vec!["市場規模を追記してください".into()],
            provider_confidence: 0.9,
        }
    }

    fn adapter(p: impl JudgmentProvider + 'static, timeout_ms: u64) -> JudgmentAdapter {
        JudgmentAdapter::new(
            Arc::new(p),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
        )
    }

    struct Refusing(Arc<AtomicUsize>);

    #[async_trait]
    impl JudgmentProvider for Refusing {
        async fn judge(&self, _text: &str) -> Result<JudgmentResult, ProviderError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Rejected("content policy".into()))
        }
        fn name(&self) -> &'static str {
            "refusing"
        }
    }

    #[tokio::test]
    async fn available_result_passes_through() {
        let a = adapter(MockProvider::new(result(0.7)), 1_000);
        assert_eq!(a.judge("x").await, Judgment::Available(result(0.7)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_retry_is_unavailable() {
        let mock = MockProvider::new(result(0.7)).with_delay(Duration::from_secs(60));
        let calls = mock.call_counter();
        let a = adapter(mock, 100);
        assert_eq!(
            a.judge("x").await,
            Judgment::Unavailable(UnavailableReason::Timeout)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2, "one retry");
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let mock = MockProvider::new(result(0.4)).failing_first(1);
        let calls = mock.call_counter();
        let a = adapter(mock, 1_000);
        assert!(a.judge("x").await.is_available());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let mock = MockProvider::new(result(0.4)).failing_first(5);
        let calls = mock.call_counter();
        let a = adapter(mock, 1_000);
        assert_eq!(
            a.judge("x").await,
            Judgment::Unavailable(UnavailableReason::Transport)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let a = adapter(Refusing(Arc::clone(&calls)), 1_000);
        assert_eq!(
            a.judge("x").await,
            Judgment::Unavailable(UnavailableReason::Rejected)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn out_of_range_score_is_malformed() {
        let mock = MockProvider::new(result(1.7));
        let calls = mock.call_counter();
        let a = adapter(mock, 1_000);
        assert_eq!(
            a.judge("x").await,
            Judgment::Unavailable(UnavailableReason::Malformed)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let a = adapter(MockProvider::new(result(f64::NAN)), 1_000);
        assert!(!a.judge("x").await.is_available());
    }

    #[tokio::test]
    async fn disabled_provider_is_unavailable() {
        let a = adapter(DisabledProvider, 1_000);
        assert_eq!(
            a.judge("x").await,
            Judgment::Unavailable(UnavailableReason::Disabled)
        );
        assert_eq!(a.provider_name(), "disabled");
    }

    #[tokio::test]
    async fn suggestions_are_sanitized() {
        let mut r = result(0.5);
        r.suggestions = vec![
            "  予算の\n内訳を\t追加  ".into(),
            "   ".into(),
            "x".repeat(500),
        ];
        let a = adapter(MockProvider::new(r), 1_000);
        let Judgment::Available(out) = a.judge("x").await else {
            panic!("expected available");
        };
        assert_eq!(out.suggestions.len(), 2);
        assert_eq!(out.suggestions[0], "予算の 内訳を 追加");
        assert_eq!(out.suggestions[1].chars().count(), MAX_SUGGESTION_CHARS);
    }

    #[test]
    fn verdict_scaling_and_default_confidence() {
        let r = parse_verdict(r#"{"completeness": 1, "suggestions": ["a"], "reasoning": "r"}"#)
            .unwrap();
        assert!((r.estimated_score - 0.5).abs() < 1e-12);
        assert!((r.provider_confidence - 0.8).abs() < 1e-12);

        let r = parse_verdict(r#"{"completeness": 2, "confidence": 0.35}"#).unwrap();
        assert!((r.estimated_score - 1.0).abs() < 1e-12);
        assert!(r.suggestions.is_empty());

        assert!(matches!(
            parse_verdict("not json"),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn factory_picks_provider() {
        let cfg = JudgmentConfig::default();
        assert_eq!(build_provider_from_config(&cfg).name(), "disabled");

        let cfg = JudgmentConfig {
            enabled: true,
            provider: "mock".into(),
            ..JudgmentConfig::default()
        };
        assert_eq!(build_provider_from_config(&cfg).name(), "mock");

        let cfg = JudgmentConfig {
            enabled: true,
            provider: "acme".into(),
            ..JudgmentConfig::default()
        };
        assert_eq!(build_provider_from_config(&cfg).name(), "disabled");
    }
}
