//! Plan Completeness Analyzer — Binary Entrypoint
//! Boots the Axum HTTP server with the completeness engine behind it.
//!
//! See `README.md` for configuration.

use shuttle_axum::ShuttleAxum;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    plan_completeness_analyzer::init_tracing();

    let router = plan_completeness_analyzer::app()
        .await
        .map_err(shuttle_runtime::Error::Custom)?;

    Ok(router.into())
}
