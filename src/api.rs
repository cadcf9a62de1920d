use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use rusqlite::Connection;
use tracing::{error, info};
use tower_http::cors::{Any, CorsLayer};
use tokio::task;

use crate::config::{Config, ScoringConfig};
use crate::db;
use crate::error::PipelineError;
use crate::export;
use crate::model::SavedModel;
use crate::normalizer;
use crate::pipeline;

#[derive(Clone)]
pub struct AppState {
    pub scoring: Arc<ScoringConfig>,
    pub conn: Arc<Mutex<Connection>>,
    pub model: Option<Arc<SavedModel>>,
    pub max_upload_bytes: usize,
}

#[derive(Deserialize)]
pub struct ScoreQuery {
    pub format: Option<String>, // "json" (default) or "csv"
    pub as_of: Option<i64>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub wallet: String,
    pub limit: Option<u32>, // defaults to 10
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Json(_) => StatusCode::BAD_REQUEST,
            PipelineError::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request failed: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes);

    Router::new()
        .route("/", get(|| async { "Wallet credit score API running" }))
        .route("/score", post(score))
        .route("/scores", get(history))
        .layer(body_limit)
        .layer(cors)
        .with_state(state)
}

pub async fn serve(cfg: Config, state: AppState) -> eyre::Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Score an uploaded batch of raw records (JSON array or JSON lines).
pub async fn score(
    State(state): State<AppState>,
    Query(q): Query<ScoreQuery>,
    body: String,
) -> Result<Response, ApiError> {
    let as_of = pipeline::resolve_as_of(q.as_of)
        .ok_or_else(|| ApiError::bad_request("as_of is out of range"))?;
    let as_csv = match q.format.as_deref() {
        None | Some("json") => false,
        Some("csv") => true,
        Some(other) => return Err(ApiError::bad_request(format!("unknown format {}", other))),
    };

    let st = state.clone();
    let (output, predictions, run_id) = task::spawn_blocking(move || {
        let records = normalizer::parse_records(&body)?;
        let output = pipeline::score_records(&records, &st.scoring, as_of)?;
        let predictions = st
            .model
            .as_ref()
            .map(|m| m.predict_wallets(&output.wallets))
            .transpose()?;

        let mut conn = st
            .conn
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned"))?;
        let run_id = db::record_run(
            &mut conn,
            as_of,
            st.scoring.version,
            &output.wallets,
            predictions.as_deref(),
            st.model.as_ref().map(|m| m.name()),
        )?;
        Ok::<_, ApiError>((output, predictions, run_id))
    })
    .await
    .map_err(|e| ApiError::internal(format!("scoring task failed: {}", e)))??;

    info!(
        "Run {} scored {} wallets ({} rows dropped)",
        run_id,
        output.wallets.len(),
        output.report.dropped_rows
    );

    if as_csv {
        let mut buf = Vec::new();
        export::write_features(&output.wallets, predictions.as_deref(), &mut buf)?;
        return Ok((
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"credit_scores.csv\""),
            ],
            buf,
        )
            .into_response());
    }

    let wallets = pipeline::attach_predictions(output.wallets, predictions.as_deref());
    Ok(Json(json!({
        "run_id": run_id,
        "evaluated_at": as_of.to_rfc3339(),
        "config_version": state.scoring.version,
        "model": state.model.as_deref().map(|m| m.name()),
        "input_rows": output.report.input_rows,
        "dropped_rows": output.report.dropped_rows,
        "wallets": wallets,
    }))
    .into_response())
}

pub async fn history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<db::ScoreEntry>>, ApiError> {
    let limit = q.limit.unwrap_or(10);
    let entries = task::spawn_blocking(move || {
        let conn = state
            .conn
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned"))?;
        Ok::<_, ApiError>(db::recent_scores(&conn, &q.wallet, limit)?)
    })
    .await
    .map_err(|e| ApiError::internal(format!("history task failed: {}", e)))??;

    Ok(Json(entries))
}
