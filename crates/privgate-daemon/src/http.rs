use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use privgate_core::anonymize::AnonRecord;
use privgate_core::audit::AuditRecord;
use privgate_core::gateway::ComputeOp;
use privgate_core::mediation::MediationEngine;
use privgate_core::MediationError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::store::{BudgetStore, DatasetStore};
use crate::telemetry::Telemetry;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MediationEngine>,
    pub telemetry: Telemetry,
    pub budget_store: Arc<BudgetStore>,
    pub dataset_store: Arc<DatasetStore>,
    pub max_body_bytes: usize,
    pub audit_trail_default_limit: usize,
}

/// REST framing is an adapter over the engine's function contracts; no
/// wire protocol is part of the core.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/query", post(mediate_query))
        .route("/v1/datasets", post(encrypt_dataset))
        .route("/v1/datasets/:dataset_id/compute", post(compute_on_dataset))
        .route("/v1/anonymize", post(anonymize))
        .route("/v1/budget/:data_source_id", get(budget_status))
        .route("/v1/audit", get(audit_trail))
        .route("/metrics", get(metrics))
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Public error surface. Internal detail stays in the logs; the response
/// carries a stable code and a parameter-level message only.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn storage(err: std::io::Error) -> Self {
        tracing::error!(target: "privgate.http", error = %err, "durable store write failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "STORAGE_FAILURE",
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({"error": self.code, "message": self.message}));
        (self.status, body).into_response()
    }
}

pub fn error_code(err: &MediationError) -> &'static str {
    match err {
        MediationError::Configuration(_) => "INTERNAL",
        MediationError::InvalidArgument(_) => "INVALID_INPUT",
        MediationError::PolicyNotFound(_) => "POLICY_NOT_FOUND",
        MediationError::PolicyMismatch { .. } => "POLICY_MISMATCH",
        MediationError::InsufficientBudget { .. } => "INSUFFICIENT_BUDGET",
        MediationError::SuppressionThresholdExceeded { .. } => "SUPPRESSION_THRESHOLD_EXCEEDED",
        MediationError::DatasetNotFound(_) => "DATASET_NOT_FOUND",
        MediationError::SchemeUnavailable(_) => "SCHEME_UNAVAILABLE",
        MediationError::AuditWriteFailure(_) => "AUDIT_UNAVAILABLE",
    }
}

impl From<MediationError> for ApiError {
    fn from(err: MediationError) -> Self {
        let (status, message) = match &err {
            MediationError::Configuration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
            MediationError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, err.to_string()),
            MediationError::PolicyNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
            MediationError::PolicyMismatch { .. } => (StatusCode::FORBIDDEN, err.to_string()),
            MediationError::InsufficientBudget { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, err.to_string())
            }
            MediationError::SuppressionThresholdExceeded { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            MediationError::DatasetNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
            MediationError::SchemeUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            MediationError::AuditWriteFailure(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "audit log unavailable".to_string(),
            ),
        };
        Self {
            status,
            code: error_code(&err),
            message,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediateQueryRequest {
    pub data_source_id: String,
    pub data_category: String,
    pub epsilon: f64,
    pub sensitivity: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediateQueryResponse {
    pub noised_values: Vec<f64>,
    pub epsilon_spent: f64,
    pub remaining_budget: f64,
}

pub(crate) fn mediate_query_impl(
    state: &AppState,
    request: &MediateQueryRequest,
) -> Result<MediateQueryResponse, ApiError> {
    match state.engine.mediate_query(
        &request.data_source_id,
        &request.data_category,
        request.epsilon,
        request.sensitivity,
        &request.values,
    ) {
        Ok(result) => {
            state.telemetry.record_query();
            state
                .budget_store
                .persist(&state.engine.ledger().export())
                .map_err(ApiError::storage)?;
            Ok(MediateQueryResponse {
                noised_values: result.noised_values,
                epsilon_spent: result.epsilon_spent,
                remaining_budget: result.remaining_budget,
            })
        }
        Err(err) => {
            state.telemetry.record_reject(error_code(&err));
            // a rejected query may still have debited budget on a
            // post-reserve failure, so the snapshot is persisted either way
            state
                .budget_store
                .persist(&state.engine.ledger().export())
                .map_err(ApiError::storage)?;
            Err(err.into())
        }
    }
}

async fn mediate_query(
    State(state): State<AppState>,
    Json(request): Json<MediateQueryRequest>,
) -> Result<Json<MediateQueryResponse>, ApiError> {
    mediate_query_impl(&state, &request).map(Json)
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptDatasetRequest {
    pub data_category: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncryptDatasetResponse {
    pub dataset_id: String,
}

pub(crate) fn encrypt_dataset_impl(
    state: &AppState,
    request: &EncryptDatasetRequest,
) -> Result<EncryptDatasetResponse, ApiError> {
    match state
        .engine
        .encrypt_dataset(&request.data_category, &request.values)
    {
        Ok(dataset_id) => {
            state.telemetry.record_dataset_encrypted();
            state
                .dataset_store
                .persist(&state.engine.gateway().export())
                .map_err(ApiError::storage)?;
            Ok(EncryptDatasetResponse { dataset_id })
        }
        Err(err) => {
            state.telemetry.record_reject(error_code(&err));
            Err(err.into())
        }
    }
}

async fn encrypt_dataset(
    State(state): State<AppState>,
    Json(request): Json<EncryptDatasetRequest>,
) -> Result<Json<EncryptDatasetResponse>, ApiError> {
    encrypt_dataset_impl(&state, &request).map(Json)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputeRequest {
    pub operation: ComputeOp,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComputeResponse {
    pub operation: ComputeOp,
    pub ciphertext_hex: String,
}

pub(crate) fn compute_impl(
    state: &AppState,
    dataset_id: &str,
    request: &ComputeRequest,
) -> Result<ComputeResponse, ApiError> {
    let outcome = state.engine.compute_on_dataset(dataset_id, request.operation);
    // access counters moved even when the computation failed
    state
        .dataset_store
        .persist(&state.engine.gateway().export())
        .map_err(ApiError::storage)?;
    match outcome {
        Ok(ciphertext) => {
            state.telemetry.record_compute();
            Ok(ComputeResponse {
                operation: request.operation,
                ciphertext_hex: hex::encode(ciphertext),
            })
        }
        Err(err) => {
            state.telemetry.record_reject(error_code(&err));
            Err(err.into())
        }
    }
}

async fn compute_on_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Json(request): Json<ComputeRequest>,
) -> Result<Json<ComputeResponse>, ApiError> {
    compute_impl(&state, &dataset_id, &request).map(Json)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnonymizeRequest {
    #[serde(default)]
    pub data_category: Option<String>,
    pub records: Vec<AnonRecord>,
    pub k: usize,
    pub l: usize,
    pub suppression_threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnonymizeResponse {
    pub records: Vec<AnonRecord>,
    pub suppression_rate: f64,
}

pub(crate) fn anonymize_impl(
    state: &AppState,
    request: &AnonymizeRequest,
) -> Result<AnonymizeResponse, ApiError> {
    let outcome = match &request.data_category {
        Some(category) => state.engine.anonymize_for_category(
            category,
            &request.records,
            request.k,
            request.l,
            request.suppression_threshold,
        ),
        None => state.engine.anonymize(
            &request.records,
            request.k,
            request.l,
            request.suppression_threshold,
        ),
    };
    match outcome {
        Ok(outcome) => {
            state.telemetry.record_anonymize();
            Ok(AnonymizeResponse {
                records: outcome.records,
                suppression_rate: outcome.suppression_rate,
            })
        }
        Err(err) => {
            state.telemetry.record_reject(error_code(&err));
            Err(err.into())
        }
    }
}

async fn anonymize(
    State(state): State<AppState>,
    Json(request): Json<AnonymizeRequest>,
) -> Result<Json<AnonymizeResponse>, ApiError> {
    anonymize_impl(&state, &request).map(Json)
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatusResponse {
    pub data_source_id: String,
    pub allowance: f64,
    pub consumed: f64,
    pub remaining: f64,
}

pub(crate) fn budget_status_impl(state: &AppState, data_source_id: &str) -> BudgetStatusResponse {
    let status = state.engine.budget_status(data_source_id);
    BudgetStatusResponse {
        data_source_id: data_source_id.to_string(),
        allowance: status.allowance,
        consumed: status.consumed,
        remaining: status.remaining,
    }
}

async fn budget_status(
    State(state): State<AppState>,
    Path(data_source_id): Path<String>,
) -> Json<BudgetStatusResponse> {
    Json(budget_status_impl(&state, &data_source_id))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditTrailQuery {
    pub limit: Option<usize>,
}

pub(crate) fn audit_trail_impl(state: &AppState, limit: Option<usize>) -> Vec<AuditRecord> {
    state
        .engine
        .audit_trail(limit.unwrap_or(state.audit_trail_default_limit))
}

async fn audit_trail(
    State(state): State<AppState>,
    Query(query): Query<AuditTrailQuery>,
) -> Json<Vec<AuditRecord>> {
    Json(audit_trail_impl(&state, query.limit))
}

async fn metrics(State(state): State<AppState>) -> String {
    state.telemetry.render_prometheus()
}
