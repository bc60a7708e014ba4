//! Transfer API Layer
//!
//! HTTP surface for custodian-facing callers. Every response uses the
//! `{code, msg, data}` envelope; failures carry the transfer's current
//! stage so the caller can pick its next action.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::core_types::{AuditHash, CustodianId, TransferId};

use super::audit::{AuditRecord, AuditStore};
use super::dispatcher::ActionDispatcher;
use super::error::{DispatchFailure, TransferError};
use super::event::RecordedEvent;
use super::reconcile::{ReconcileReport, ReconciliationService};
use super::state::{TransferStage, TransferView};
use super::types::{ActionKind, ActionRequest, CreateTransferRequest, ExecutionResult, FinancialDetails};

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Body of `POST /api/v1/transfers/{id}/actions`
#[derive(Debug, Deserialize)]
pub struct ActionApiRequest {
    pub action: ActionKind,
    pub initiator: CustodianId,
    #[serde(default)]
    pub financials: Option<FinancialDetails>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after: u64,
}

/// API wrapper for standard response format
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }
}

/// `data` of an error response
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ErrorData {
    pub error: &'static str,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TransferStage>,
}

pub type ApiError = (StatusCode, Json<ApiResponse<ErrorData>>);
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

// ============================================================================
// Error Codes
// ============================================================================

pub mod error_codes {
    pub const INVALID_PARAMETER: i32 = -1001;
    pub const INVALID_AMOUNT: i32 = -1002;
    pub const INVALID_STATE: i32 = -1003;
    pub const UNAUTHORIZED: i32 = -4001;
    pub const FORBIDDEN: i32 = -4003;
    pub const CAPABILITY_MISMATCH: i32 = -4101;
    pub const CAPABILITY_NOT_FOUND: i32 = -4102;
    pub const DUPLICATE_REQUEST: i32 = -3001;
    pub const CONFLICT: i32 = -3002;
    pub const LOCKED: i32 = -3003;
    pub const SERVICE_UNAVAILABLE: i32 = -5001;
    pub const INTERNAL_ERROR: i32 = -5002;
    pub const TRANSFER_NOT_FOUND: i32 = -6001;
    pub const CONTRACT_REVERT: i32 = -6002;
    pub const PENDING: i32 = -6003;
    pub const AUDIT_NOT_FOUND: i32 = -6004;
}

/// Map TransferError to (StatusCode, error_code, message)
fn map_error(e: &TransferError) -> (StatusCode, i32, String) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let code = match e {
        TransferError::TransferNotFound(_) => error_codes::TRANSFER_NOT_FOUND,
        TransferError::DuplicateTransfer(_) => error_codes::DUPLICATE_REQUEST,
        TransferError::InvalidTransferState { .. } => error_codes::INVALID_STATE,
        TransferError::Unauthorized { .. } => error_codes::UNAUTHORIZED,
        TransferError::NotAParty { .. } => error_codes::FORBIDDEN,
        TransferError::InvalidRequest(_) => error_codes::INVALID_PARAMETER,
        TransferError::InvalidAmount(_) => error_codes::INVALID_AMOUNT,
        TransferError::CapabilityNotFound(_) => error_codes::CAPABILITY_NOT_FOUND,
        TransferError::CapabilityMismatch { .. } => error_codes::CAPABILITY_MISMATCH,
        TransferError::ConcurrentAppendConflict { .. } => error_codes::CONFLICT,
        TransferError::LockTimeout(_) => error_codes::LOCKED,
        TransferError::ContractRevert { .. } => error_codes::CONTRACT_REVERT,
        TransferError::ChainUnavailable { .. } | TransferError::ChainError(_) => {
            error_codes::SERVICE_UNAVAILABLE
        }
        TransferError::ConfirmationPending { .. }
        | TransferError::RecordingDeferred { .. }
        | TransferError::UnexpectedMint { .. } => error_codes::PENDING,
        TransferError::DatabaseError(_) | TransferError::SystemError(_) => {
            error_codes::INTERNAL_ERROR
        }
    };

    (status, code, e.to_string())
}

fn error_response(e: &TransferError, state: Option<TransferStage>) -> ApiError {
    let (status, code, msg) = map_error(e);
    (
        status,
        Json(ApiResponse {
            code,
            msg,
            data: Some(ErrorData {
                error: e.code(),
                retryable: e.is_retryable(),
                state,
            }),
        }),
    )
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        error_response(&e, None)
    }
}

impl From<DispatchFailure> for ApiError {
    fn from(f: DispatchFailure) -> Self {
        error_response(&f.error, Some(f.state))
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub struct ApiState {
    pub dispatcher: Arc<ActionDispatcher>,
    pub reconciler: Arc<ReconciliationService>,
    pub audit: Arc<dyn AuditStore>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/transfers", post(create_transfer))
        .route("/api/v1/transfers/{id}", get(get_transfer))
        .route("/api/v1/transfers/{id}/events", get(get_events))
        .route("/api/v1/transfers/{id}/actions", post(submit_action))
        .route("/api/v1/transfers/{id}/reconcile", post(reconcile_transfer))
        .route("/api/v1/audit/{hash}", get(get_audit))
        .with_state(state)
}

pub async fn health() -> ApiResult<&'static str> {
    ok("healthy")
}

/// POST /api/v1/transfers
pub async fn create_transfer(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateTransferRequest>,
) -> ApiResult<TransferView> {
    ok(state.dispatcher.create_transfer(req).await?)
}

/// GET /api/v1/transfers/{id}
pub async fn get_transfer(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<TransferView> {
    ok(state.dispatcher.view(&TransferId::new(id)).await?)
}

/// GET /api/v1/transfers/{id}/events?after=N
pub async fn get_events(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<RecordedEvent>> {
    let transfer_id = TransferId::new(id);
    let events = state.dispatcher.events(&transfer_id, query.after).await?;
    if events.is_empty() && query.after == 0 {
        return Err(TransferError::TransferNotFound(transfer_id).into());
    }
    ok(events)
}

/// POST /api/v1/transfers/{id}/actions
pub async fn submit_action(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<ActionApiRequest>,
) -> ApiResult<ExecutionResult> {
    let mut request = ActionRequest::new(TransferId::new(id), req.action, req.initiator);
    if let Some(financials) = req.financials {
        request = request.with_financials(financials);
    }
    ok(state.dispatcher.dispatch(request).await?)
}

/// POST /api/v1/transfers/{id}/reconcile
pub async fn reconcile_transfer(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<ReconcileReport> {
    ok(state.reconciler.reconcile(&TransferId::new(id)).await?)
}

/// GET /api/v1/audit/{hash}
pub async fn get_audit(
    State(state): State<Arc<ApiState>>,
    Path(hash): Path<String>,
) -> ApiResult<AuditRecord> {
    let hash: AuditHash = hash
        .parse()
        .map_err(|e| TransferError::InvalidRequest(format!("bad audit hash: {}", e)))?;
    match state.audit.get(&hash).await? {
        Some(record) => ok(record),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse {
                code: error_codes::AUDIT_NOT_FOUND,
                msg: format!("No audit record for {}", hash),
                data: None,
            }),
        )),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
