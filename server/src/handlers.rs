use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    BulkOperation, CancelResponse, Caller, ExportQuery, OperationDescriptor, OperationError,
    RetryRequest, StartOperationRequest, StatusView, StoreError, ValidateRequest,
    ValidationReport,
};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

pub const USER_HEADER: &str = "x-user-id";
pub const ORG_HEADER: &str = "x-org-id";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/farmers/bulk", post(start_operation))
        .route("/api/v1/farmers/bulk/validate", post(validate_only))
        .route("/api/v1/farmers/bulk/:id", get(get_operation))
        .route("/api/v1/farmers/bulk/:id/status", get(get_status))
        .route("/api/v1/farmers/bulk/:id/cancel", post(cancel_operation))
        .route("/api/v1/farmers/bulk/:id/retry", post(retry_operation))
        .route("/api/v1/farmers/bulk/:id/results", get(export_results))
        .with_state(state)
}

/* ---------------- errores HTTP ---------------- */

pub enum ApiError {
    Unauthorized,
    Operation(OperationError),
}

impl From<OperationError> for ApiError {
    fn from(e: OperationError) -> Self {
        ApiError::Operation(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let e = match self {
            ApiError::Unauthorized => {
                let body = json!({ "error": "faltan los encabezados X-User-Id / X-Org-Id" });
                return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
            }
            ApiError::Operation(e) => e,
        };

        let status = match &e {
            OperationError::Format { .. } | OperationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OperationError::Forbidden { .. } => StatusCode::FORBIDDEN,
            OperationError::AuthorizationUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OperationError::NotFound(_) | OperationError::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            OperationError::AlreadyComplete(_)
            | OperationError::NotRetryable { .. }
            | OperationError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
            OperationError::Export(_) | OperationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("error interno: {}", e);
        }

        let body = json!({
            "error": e.to_string(),
            "operation_id": e.operation_id(),
        });
        (status, Json(body)).into_response()
    }
}

// La identidad ya viene autenticada por el gateway
fn caller_from(headers: &HeaderMap) -> Result<Caller, ApiError> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    match (value(USER_HEADER), value(ORG_HEADER)) {
        (Some(subject), Some(org)) => Ok(Caller { subject, org }),
        _ => Err(ApiError::Unauthorized),
    }
}

fn descriptor_status(desc: &OperationDescriptor) -> StatusCode {
    if desc.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Inicia una carga masiva: 200 si terminó (modo síncrono), 202 si sigue en segundo plano
async fn start_operation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartOperationRequest>,
) -> Result<(StatusCode, Json<OperationDescriptor>), ApiError> {
    let caller = caller_from(&headers)?;
    let desc = state.orchestrator.start(&caller, req).await?;
    info!("operación {} aceptada en {:?}", desc.id, desc.status);
    Ok((descriptor_status(&desc), Json(desc)))
}

async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BulkOperation>, ApiError> {
    Ok(Json(state.orchestrator.get_operation(&id).await?))
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusView>, ApiError> {
    Ok(Json(state.orchestrator.get_status(&id).await?))
}

async fn cancel_operation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let caller = caller_from(&headers)?;
    info!("{} pide cancelar la operación {}", caller.subject, id);
    Ok(Json(state.orchestrator.cancel(&id).await?))
}

async fn retry_operation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RetryRequest>,
) -> Result<(StatusCode, Json<OperationDescriptor>), ApiError> {
    let caller = caller_from(&headers)?;
    let desc = state.orchestrator.retry_failed(&caller, &id, req).await?;
    Ok((descriptor_status(&desc), Json(desc)))
}

// Descarga de resultados (por defecto sólo los fallidos, en CSV)
async fn export_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let bytes = state
        .orchestrator
        .export(&id, query.format, query.include_all)
        .await?;

    let suffix = if query.include_all { "results" } else { "failed" };
    let disposition = format!(
        "attachment; filename=\"bulk-{}-{}.{}\"",
        id,
        suffix,
        query.format.extension()
    );
    Ok((
        [
            (header::CONTENT_TYPE, query.format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn validate_only(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<ValidationReport>, ApiError> {
    let caller = caller_from(&headers)?;
    Ok(Json(state.orchestrator.validate_only(&caller, req).await?))
}
