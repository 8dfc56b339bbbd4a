// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod analyze;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use analyze::ai_adapter;
pub use analyze::{Analysis, AnalysisInput, AnalysisResponse, CompletenessEngine, FusedScore};
pub use api::router;
pub use cache::{CacheKey, CacheStatus, ResultCache};
pub use error::{EngineError, ProviderError, StoreError};

use anyhow::Context;
use shuttle_axum::axum::Router;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::ai_adapter::build_provider_from_config;
use crate::config::ai::JudgmentConfig;
use crate::config::EngineConfig;
use crate::metrics::Metrics;

/// Load `config/engine.toml` + `config/ai.json` (with env overrides) and build the engine.
pub fn build_engine() -> anyhow::Result<CompletenessEngine> {
    let cfg = EngineConfig::load()?;
    let judgment = JudgmentConfig::load().context("loading judgment provider config")?;
    let provider = build_provider_from_config(&judgment);
    let engine = CompletenessEngine::from_config(&cfg, provider, &judgment)
        .context("building completeness engine")?;
    info!(
        target: "completeness",
        provider = engine.provider_name(),
        cache_store = engine.cache_store_name(),
        ttl_ms = cfg.cache.ttl().as_millis() as u64,
        "engine ready"
    );
    Ok(engine)
}

/// Full in-process app: API routes, plus `/metrics` when `DEBUG_ROUTES=1`.
pub async fn app() -> anyhow::Result<Router> {
    let engine = build_engine()?;
    let ttl_ms = engine.cache().ttl().as_millis() as u64;
    let mut router = api::router(engine);

    let debug_routes = std::env::var("DEBUG_ROUTES").is_ok_and(|v| v == "1");
    if debug_routes {
        if let Some(m) = Metrics::global(ttl_ms) {
            router = router.merge(m.router());
        }
    }
    Ok(router)
}

/// Install the tracing subscriber once. `RUST_LOG` wins over the default filter;
/// `LOG_FORMAT=json` switches to JSON lines. Safe to call repeatedly.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("completeness=info,plan_completeness_analyzer=info,warn"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}
