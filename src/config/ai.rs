// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::warn;

pub const DEFAULT_AI_CONFIG_PATH: &str = "config/ai.json";
pub const ENV_PROVIDER_TIMEOUT_MS: &str = "PROVIDER_TIMEOUT_MS";
pub const ENV_AI_TEST_MODE: &str = "AI_TEST_MODE";

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_retry_backoff_ms() -> u64 {
    250
}

/// Judgment provider settings, loaded from `config/ai.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentConfig {
    pub enabled: bool,
    /// "openai" | "mock" | "disabled" (case-insensitive)
    pub provider: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-attempt deadline; the adapter retries once on transient failures.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for JudgmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "disabled".to_string(),
            api_key: String::new(),
            model: default_model(),
            timeout_ms: default_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl JudgmentConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut cfg: JudgmentConfig = serde_json::from_str(&data)?;

        // Normalize provider
        cfg.provider = cfg.provider.trim().to_lowercase();

        // Resolve api key if "ENV". A missing key leaves it empty; the provider
        // factory then degrades to rule-only.
        if cfg.enabled && cfg.api_key.trim().eq_ignore_ascii_case("env") {
            cfg.api_key = match cfg.provider.as_str() {
                "openai" => env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
                    warn!(target: "completeness", "OPENAI_API_KEY not set, judgment provider unavailable");
                    String::new()
                }),
                "mock" | "disabled" => String::new(),
                other => {
                    warn!(target: "completeness", provider = other, "unsupported judgment provider in config");
                    String::new()
                }
            };
        }

        if cfg.timeout_ms == 0 {
            cfg.timeout_ms = default_timeout_ms();
        }

        Ok(cfg)
    }

    /// Load `config/ai.json` if present (defaults otherwise), then apply env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = Path::new(DEFAULT_AI_CONFIG_PATH);
        let mut cfg = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// `AI_TEST_MODE=mock` forces the deterministic mock; `PROVIDER_TIMEOUT_MS` overrides the deadline.
    pub fn apply_env_overrides(&mut self) {
        if env::var(ENV_AI_TEST_MODE).is_ok_and(|v| v == "mock") {
            self.enabled = true;
            self.provider = "mock".to_string();
        }
        if let Some(ms) = env::var(ENV_PROVIDER_TIMEOUT_MS)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            self.timeout_ms = ms;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
