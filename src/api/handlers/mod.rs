use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ChangeError;
use crate::models::*;
use crate::operations::{
    GetRefSeqFeaturesOperation, GetRefSeqsOperation, GetSequenceOperation, Operation,
    OperationOutput, SearchFeaturesOperation,
};
use crate::service::ChangeService;

/// Header naming the acting user. Authentication is out of scope; the value is
/// recorded as given.
pub const USER_HEADER: &str = "x-annotd-user";

const ANONYMOUS: &str = "anonymous";

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

/// Map a change error to a response. The body carries the innermost error so
/// clients see what actually went wrong, not the transaction wrapper.
fn api_error(e: ChangeError) -> ApiError {
    use ChangeError::*;

    let inner = e.innermost();
    let status = match inner {
        UnknownOperationType(_)
        | UnknownChangeType(_)
        | MalformedOperation(_)
        | DuplicateRegistration(_)
        | Parse { .. }
        | UnsupportedBackend { .. }
        | InverseNotImplemented(_) => StatusCode::BAD_REQUEST,
        FeatureNotFound(_)
        | AssemblyNotFound(_)
        | RefSeqNotFound(_)
        | ChangeNotFound(_)
        | FileNotFound(_) => StatusCode::NOT_FOUND,
        AlreadyExists(_)
        | LocationMismatch { .. }
        | ValueMismatch { .. }
        | StaleSnapshot(_) => StatusCode::CONFLICT,
        InvalidInterval { .. }
        | OutOfBounds { .. }
        | InvalidLocations { .. }
        | ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TransactionAborted(_) | Storage(_) | Serialization(_) | Io(_) => {
            return internal_error(&e);
        }
    };
    tracing::warn!(status = status.as_u16(), error = %e, "request rejected");
    (
        status,
        Json(ErrorBody {
            error: inner.kind().to_string(),
            message: e.user_message(),
        }),
    )
}

/// Log an internal error and return a sanitized response to the client.
/// The full error is logged server-side, clients only see a generic message.
fn internal_error(e: &ChangeError) -> ApiError {
    tracing::error!("Internal error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: e.innermost().kind().to_string(),
            message: "Internal server error".to_string(),
        }),
    )
}

fn acting_user(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: kind.to_string(),
            message: format!("{} {} not found", kind, id),
        }),
    )
}

fn run(service: &ChangeService, operation: Operation) -> Result<OperationOutput, ApiError> {
    let payload = operation.to_json().map_err(api_error)?;
    service.run_operation(payload).map_err(api_error)
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Changes
// ============================================================

pub async fn submit_change(
    State(service): State<Arc<ChangeService>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<ChangeRecord>), ApiError> {
    let user = acting_user(&headers);
    service
        .submit(payload, &user)
        .map(|record| (StatusCode::CREATED, Json(record)))
        .map_err(api_error)
}

pub async fn undo_change(
    State(service): State<Arc<ChangeService>>,
    headers: HeaderMap,
    Path(sequence): Path<i64>,
) -> Result<(StatusCode, Json<ChangeRecord>), ApiError> {
    let user = acting_user(&headers);
    service
        .undo(sequence, &user)
        .map(|record| (StatusCode::CREATED, Json(record)))
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub since: i64,
}

pub async fn list_changes(
    State(service): State<Arc<ChangeService>>,
    Path(assembly): Path<Uuid>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<Vec<ChangeRecord>>, ApiError> {
    service
        .changes_since(assembly, query.since)
        .map(Json)
        .map_err(api_error)
}

// ============================================================
// Operations
// ============================================================

pub async fn run_operation(
    State(service): State<Arc<ChangeService>>,
    Json(payload): Json<Value>,
) -> Result<Json<OperationOutput>, ApiError> {
    service.run_operation(payload).map(Json).map_err(api_error)
}

// ============================================================
// Assemblies, reference sequences and features
// ============================================================

pub async fn list_assemblies(
    State(service): State<Arc<ChangeService>>,
) -> Result<Json<OperationOutput>, ApiError> {
    run(&service, crate::operations::GetAssembliesOperation {}.into()).map(Json)
}

pub async fn list_ref_seqs(
    State(service): State<Arc<ChangeService>>,
    Path(assembly): Path<Uuid>,
) -> Result<Json<OperationOutput>, ApiError> {
    run(&service, GetRefSeqsOperation { assembly }.into()).map(Json)
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub start: u64,
    pub end: Option<u64>,
}

pub async fn list_ref_seq_features(
    State(service): State<Arc<ChangeService>>,
    Path(ref_seq): Path<Uuid>,
    Query(window): Query<WindowQuery>,
) -> Result<Json<OperationOutput>, ApiError> {
    let operation = GetRefSeqFeaturesOperation {
        ref_seq,
        start: window.start,
        end: window.end.unwrap_or(u64::MAX),
    };
    run(&service, operation.into()).map(Json)
}

pub async fn get_sequence(
    State(service): State<Arc<ChangeService>>,
    Path(ref_seq): Path<Uuid>,
    Query(window): Query<WindowQuery>,
) -> Result<Json<OperationOutput>, ApiError> {
    let operation = GetSequenceOperation {
        ref_seq,
        start: window.start,
        end: window.end.unwrap_or(u64::MAX),
    };
    run(&service, operation.into()).map(Json)
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

pub async fn search_features(
    State(service): State<Arc<ChangeService>>,
    Path(assembly): Path<Uuid>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<OperationOutput>, ApiError> {
    run(
        &service,
        SearchFeaturesOperation {
            assembly,
            term: query.q,
        }
        .into(),
    )
    .map(Json)
}

pub async fn get_feature(
    State(service): State<Arc<ChangeService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AnnotationFeature>, ApiError> {
    service
        .feature(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("Feature", id))
}
