//! Transfer Error Types
//!
//! Every dispatch failure maps to exactly one category so callers can tell
//! "fix your request" from "try again later" from "the contract said no".

use thiserror::Error;

use crate::chain::{ChainError, ExecutionError};
use crate::core_types::{CustodianId, TransferId, TxHash};
use crate::money::MoneyError;

use super::protocol::ContractState;
use super::state::TransferStage;
use super::types::{ActionKind, Party};

/// Coarse classification for API consumers and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Request is wrong for the current state; do not retry as-is
    Validation,
    /// Off-chain and on-chain capability data disagree or are missing
    Capability,
    /// Retryable: lock contention, RPC outage, append race
    Transient,
    /// The contract rejected the call
    Revert,
    /// Outcome unknown; reconciliation owns it now
    Pending,
    Internal,
}

#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("Transfer already exists: {0}")]
    DuplicateTransfer(TransferId),

    #[error("Invalid transfer state for {action}: actual {actual}, expected {expected}")]
    InvalidTransferState {
        action: ActionKind,
        actual: ContractState,
        expected: String,
    },

    #[error("{actor} may not invoke {action}")]
    Unauthorized { action: ActionKind, actor: Party },

    #[error("Custodian {custodian} is not a party to transfer {transfer_id}")]
    NotAParty {
        custodian: CustodianId,
        transfer_id: TransferId,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    // === Capability Errors ===
    #[error("No capability record for custodian {0}")]
    CapabilityNotFound(CustodianId),

    #[error("Capability mismatch for custodian {custodian}: {detail}")]
    CapabilityMismatch {
        custodian: CustodianId,
        detail: String,
    },

    // === Concurrency Errors ===
    #[error("Concurrent append on {transfer_id}: expected last seq {expected}, found {actual}")]
    ConcurrentAppendConflict {
        transfer_id: TransferId,
        expected: u64,
        actual: u64,
    },

    #[error("Timed out waiting for transfer lock: {0}")]
    LockTimeout(TransferId),

    // === Execution Errors ===
    #[error("Contract reverted: {reason}")]
    ContractRevert { reason: String },

    #[error("Blockchain unavailable after {attempts} attempts: {message}")]
    ChainUnavailable { message: String, attempts: u32 },

    #[error("Transaction {tx_hash} not confirmed in time; queued for reconciliation")]
    ConfirmationPending { tx_hash: TxHash },

    #[error("Transaction {tx_hash} succeeded but recording it failed: {reason}")]
    RecordingDeferred { tx_hash: TxHash, reason: String },

    #[error("Contract minted tokens on a transfer dispatched at standard tier ({tx_hash})")]
    UnexpectedMint { tx_hash: TxHash },

    // === System Errors ===
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Chain client error: {0}")]
    ChainError(String),

    #[error("Internal system error: {0}")]
    SystemError(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::DuplicateTransfer(_) => "DUPLICATE_TRANSFER",
            TransferError::InvalidTransferState { .. } => "INVALID_TRANSFER_STATE",
            TransferError::Unauthorized { .. } => "UNAUTHORIZED",
            TransferError::NotAParty { .. } => "NOT_A_PARTY",
            TransferError::InvalidRequest(_) => "INVALID_REQUEST",
            TransferError::InvalidAmount(_) => "INVALID_AMOUNT",
            TransferError::CapabilityNotFound(_) => "CAPABILITY_NOT_FOUND",
            TransferError::CapabilityMismatch { .. } => "CAPABILITY_MISMATCH",
            TransferError::ConcurrentAppendConflict { .. } => "CONCURRENT_APPEND_CONFLICT",
            TransferError::LockTimeout(_) => "LOCK_TIMEOUT",
            TransferError::ContractRevert { .. } => "CONTRACT_REVERT",
            TransferError::ChainUnavailable { .. } => "CHAIN_UNAVAILABLE",
            TransferError::ConfirmationPending { .. } => "CONFIRMATION_PENDING",
            TransferError::RecordingDeferred { .. } => "RECORDING_DEFERRED",
            TransferError::UnexpectedMint { .. } => "UNEXPECTED_MINT",
            TransferError::DatabaseError(_) => "DATABASE_ERROR",
            TransferError::ChainError(_) => "CHAIN_ERROR",
            TransferError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::TransferNotFound(_)
            | TransferError::DuplicateTransfer(_)
            | TransferError::InvalidTransferState { .. }
            | TransferError::Unauthorized { .. }
            | TransferError::NotAParty { .. }
            | TransferError::InvalidRequest(_)
            | TransferError::InvalidAmount(_) => ErrorCategory::Validation,
            TransferError::CapabilityNotFound(_) | TransferError::CapabilityMismatch { .. } => {
                ErrorCategory::Capability
            }
            TransferError::ConcurrentAppendConflict { .. }
            | TransferError::LockTimeout(_)
            | TransferError::ChainUnavailable { .. }
            | TransferError::ChainError(_) => ErrorCategory::Transient,
            TransferError::ContractRevert { .. } => ErrorCategory::Revert,
            TransferError::ConfirmationPending { .. }
            | TransferError::RecordingDeferred { .. }
            | TransferError::UnexpectedMint { .. } => ErrorCategory::Pending,
            TransferError::DatabaseError(_) | TransferError::SystemError(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Would resubmitting the same request possibly succeed?
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::Unauthorized { .. } | TransferError::NotAParty { .. } => 403,
            TransferError::TransferNotFound(_) | TransferError::CapabilityNotFound(_) => 404,
            TransferError::InvalidRequest(_) | TransferError::InvalidAmount(_) => 400,
            TransferError::DuplicateTransfer(_)
            | TransferError::InvalidTransferState { .. }
            | TransferError::ConcurrentAppendConflict { .. } => 409,
            TransferError::CapabilityMismatch { .. } | TransferError::ContractRevert { .. } => 422,
            TransferError::LockTimeout(_) => 423,
            TransferError::ConfirmationPending { .. }
            | TransferError::RecordingDeferred { .. }
            | TransferError::UnexpectedMint { .. } => 202,
            TransferError::ChainUnavailable { .. } | TransferError::ChainError(_) => 503,
            TransferError::DatabaseError(_) | TransferError::SystemError(_) => 500,
        }
    }
}

/// A failed dispatch plus the transfer's stage at the time of failure
#[derive(Error, Debug, Clone)]
#[error("{error} (state: {state})")]
pub struct DispatchFailure {
    pub error: TransferError,
    pub state: TransferStage,
}

impl DispatchFailure {
    pub fn new(error: TransferError, state: TransferStage) -> Self {
        Self { error, state }
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::SystemError(format!("serialization: {}", e))
    }
}

impl From<MoneyError> for TransferError {
    fn from(e: MoneyError) -> Self {
        TransferError::InvalidAmount(e.to_string())
    }
}

impl From<ChainError> for TransferError {
    fn from(e: ChainError) -> Self {
        TransferError::ChainError(e.to_string())
    }
}

impl From<ExecutionError> for TransferError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Reverted { reason, .. } => TransferError::ContractRevert { reason },
            ExecutionError::Exhausted { message, attempts } => {
                TransferError::ChainUnavailable { message, attempts }
            }
            ExecutionError::ConfirmationTimeout { tx_hash } => {
                TransferError::ConfirmationPending { tx_hash }
            }
            ExecutionError::Unconfirmed { tx_hash, detail } => TransferError::RecordingDeferred {
                tx_hash,
                reason: detail,
            },
            ExecutionError::Chain(e) => TransferError::ChainError(e.to_string()),
        }
    }
}
