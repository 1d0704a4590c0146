//! HTTP shell of the controller: request parsing, status mapping, and
//! dispatch into the core. All domain behavior lives in `aurci_core`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use log::error;
use serde::Deserialize;

use aurci_core::api::{Work, WorkResultReport};
use aurci_core::aur::{AurClient, RPC_BATCH_LIMIT};
use aurci_core::db::Store;
use aurci_core::dispatch::{self, DispatchError};
use aurci_core::intake;
use aurci_core::mirror::SourceMirror;

pub struct AppState {
    pub store: Store,
    pub mirror: SourceMirror,
    pub index: AurClient,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/api/v1/reportPackageModification",
            post(report_package_modification),
        )
        .route("/api/v1/worker/heartbeat/{hostname}", post(heartbeat))
        .route("/api/v1/worker/requestWork", get(request_work))
        .route("/api/v1/worker/reportWorkResult", put(report_work_result))
        .with_state(state)
}

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message).into_response(),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message).into_response(),
            ApiError::Internal(e) => {
                error!("request failed: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::UnknownWorker | DispatchError::UnknownBuild(_) => {
                ApiError::NotFound(e.to_string())
            }
            DispatchError::InvalidResultStatus(_) => ApiError::BadRequest(e.to_string()),
            DispatchError::BuildAlreadyFinished(_) => ApiError::Conflict(e.to_string()),
            DispatchError::Internal(inner) => ApiError::Internal(inner),
        }
    }
}

async fn index() -> &'static str {
    "AUR CI controller\n"
}

async fn report_package_modification(
    State(state): State<Arc<AppState>>,
    Json(names): Json<Vec<String>>,
) -> Result<StatusCode, ApiError> {
    if names.is_empty() || names.len() > RPC_BATCH_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "package names outside of range {{1,{RPC_BATCH_LIMIT}}}"
        )));
    }
    intake::report_package_modification(&state.store, &state.mirror, &state.index, &names).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(hostname): Path<String>,
) -> Result<StatusCode, ApiError> {
    if hostname.trim().is_empty() {
        return Err(ApiError::BadRequest("hostname must not be empty".into()));
    }
    dispatch::heartbeat(&state.store, addr.ip(), &hostname, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct WorkQuery {
    amount: Option<i64>,
}

async fn request_work(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WorkQuery>,
) -> Result<Json<Vec<Work>>, ApiError> {
    let work = dispatch::request_work(
        &state.store,
        &state.mirror,
        addr.ip(),
        query.amount.unwrap_or(1),
        Utc::now(),
    )
    .await?;
    Ok(Json(work))
}

async fn report_work_result(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(report): Json<WorkResultReport>,
) -> Result<StatusCode, ApiError> {
    dispatch::report_work_result(&state.store, addr.ip(), &report, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}
