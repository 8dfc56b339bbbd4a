use chrono::Utc;
use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::analyze::{AnalysisInput, AnalysisResponse, CompletenessEngine};
use crate::error::EngineError;

/// Response header carrying HIT | MISS | JOINED.
pub const CACHE_HEADER: &str = "x-completeness-cache";

#[derive(Clone)]
pub struct AppState {
    pub engine: CompletenessEngine,
}

pub fn router(engine: CompletenessEngine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .layer(CorsLayer::very_permissive())
        .with_state(AppState { engine })
}

#[derive(Debug, Deserialize)]
struct AnalyzeReq {
    // missing text is an input error, not a body rejection
    #[serde(default)]
    text: String,
    #[serde(default, rename = "docText", alias = "doc_text")]
    doc_text: Option<String>,
}

async fn analyze(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeReq>,
) -> Result<Response, ApiError> {
    let input = AnalysisInput::new(body.text, body.doc_text)?;
    let analysis = state.engine.analyze(&input).await?;

    let mut resp = Json(AnalysisResponse::from(&analysis.score)).into_response();
    resp.headers_mut().insert(
        HeaderName::from_static(CACHE_HEADER),
        HeaderValue::from_static(analysis.cache.as_str()),
    );
    Ok(resp)
}

#[derive(Serialize)]
struct HealthOut {
    status: &'static str,
    provider: &'static str,
    cache_store: &'static str,
    ts: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthOut> {
    Json(HealthOut {
        status: "ok",
        provider: state.engine.provider_name(),
        cache_store: state.engine.cache_store_name(),
        ts: Utc::now().to_rfc3339(),
    })
}

/// `{ "success": false, "error": { "error_code", "message", "details" } }`
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    error_code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Config(_) | EngineError::ComputationAborted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                error_code: self.0.code(),
                message: self.0.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
