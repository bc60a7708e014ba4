//! Blockchain Execution Adapter
//!
//! Everything that talks to the rollover contract lives here:
//!
//! - [`abi`]: call data and log codec
//! - [`rpc`]: JSON-RPC [`ContractClient`] and remote [`TransactionSigner`]
//! - [`nonce`]: per-wallet serialized nonce allocator
//! - [`executor`]: self-signed vs platform-proxy [`executor::Executor`]s and the
//!   [`executor::ExecutionAdapter`] retry loop
//! - [`confirmation`]: receipt polling
//! - [`retry`]: backoff and error classification

pub mod abi;
pub mod confirmation;
pub mod executor;
pub mod nonce;
pub mod retry;
pub mod rpc;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core_types::{AuditHash, TransferKey, TxHash, WalletAddress};
use crate::transfer::event::EventKind;
use crate::transfer::protocol::ContractState;
use crate::transfer::types::ActionKind;

pub use executor::{ExecutionAdapter, Executor, ProxyExecutor, SelfSignedExecutor};
pub use nonce::NonceAllocator;
pub use retry::{ErrorClass, RetryConfig, classify_error};

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("RPC connection failed: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Failed to decode chain data: {0}")]
    Decode(String),

    #[error("Failed to encode call: {0}")]
    Encode(String),

    #[error("No signer configured for wallet {0}")]
    NoSigner(WalletAddress),
}

impl ChainError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChainError::Transport(_) => ErrorClass::Transient,
            ChainError::Decode(_) | ChainError::Encode(_) | ChainError::NoSigner(_) => {
                ErrorClass::Permanent
            }
            // JSON-RPC code 3 is "execution reverted" with revert data
            ChainError::Rpc { code: 3, .. } => ErrorClass::Permanent,
            ChainError::Rpc { message, .. } => classify_error(message),
        }
    }
}

/// Outcome of [`ExecutionAdapter::execute`] that did not confirm
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Contract reverted: {reason}")]
    Reverted {
        reason: String,
        tx_hash: Option<TxHash>,
    },

    #[error("Gave up after {attempts} attempts: {message}")]
    Exhausted { message: String, attempts: u32 },

    #[error("Transaction {tx_hash} not confirmed before timeout")]
    ConfirmationTimeout { tx_hash: TxHash },

    #[error("Transaction {tx_hash} confirmed without the expected event: {detail}")]
    Unconfirmed { tx_hash: TxHash, detail: String },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Transaction before signing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub from: WalletAddress,
    pub to: WalletAddress,
    pub data: Vec<u8>,
    pub nonce: u64,
}

/// Decoded rollover contract event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    PreparedBySender {
        wallet: WalletAddress,
        reference: AuditHash,
    },
    PreparedByReceiver {
        wallet: WalletAddress,
        reference: AuditHash,
    },
    FinancialDetailsProvided {
        gross: u128,
        federal: u128,
        state: u128,
        reference: AuditHash,
    },
    Executed {
        tokenized: bool,
        net_amount: u128,
        reference: AuditHash,
    },
    TokensMinted {
        amount: u128,
    },
    TokensBurned {
        amount: u128,
        reference: AuditHash,
    },
    SettlementRecorded {
        reference: AuditHash,
    },
    ReceiptConfirmed {
        reference: AuditHash,
    },
    Cancelled {
        reference: AuditHash,
    },
    Expired,
}

impl ContractEvent {
    /// Log event kind the engine records for this contract event
    pub fn event_kind(&self) -> EventKind {
        match self {
            ContractEvent::PreparedBySender { .. } => EventKind::SenderAgreed,
            ContractEvent::PreparedByReceiver { .. } => EventKind::ReceiverAgreed,
            ContractEvent::FinancialDetailsProvided { .. } => EventKind::FinancialDetailsProvided,
            ContractEvent::Executed { .. } => EventKind::Executed,
            ContractEvent::TokensMinted { .. } => EventKind::Minted,
            ContractEvent::TokensBurned { .. } => EventKind::Burned,
            ContractEvent::SettlementRecorded { .. } => EventKind::FundsSent,
            ContractEvent::ReceiptConfirmed { .. } => EventKind::FundsConfirmed,
            ContractEvent::Cancelled { .. } => EventKind::Cancelled,
            ContractEvent::Expired => EventKind::Expired,
        }
    }

    /// Audit hash carried in the call's reference field, if the event has one
    pub fn reference(&self) -> Option<AuditHash> {
        match self {
            ContractEvent::PreparedBySender { reference, .. }
            | ContractEvent::PreparedByReceiver { reference, .. }
            | ContractEvent::FinancialDetailsProvided { reference, .. }
            | ContractEvent::Executed { reference, .. }
            | ContractEvent::TokensBurned { reference, .. }
            | ContractEvent::SettlementRecorded { reference }
            | ContractEvent::ReceiptConfirmed { reference }
            | ContractEvent::Cancelled { reference } => Some(*reference),
            ContractEvent::TokensMinted { .. } | ContractEvent::Expired => None,
        }
    }

    /// Does this event confirm `action`?
    pub fn confirms(&self, action: ActionKind) -> bool {
        self.event_kind() == EventKind::for_action(action)
    }
}

/// A contract event located on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractLog {
    pub key: TransferKey,
    pub event: ContractEvent,
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// Timestamp of the block the event was mined in
    pub block_timestamp: DateTime<Utc>,
    pub log_index: u64,
}

/// Mined transaction outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub success: bool,
    /// Rollover contract events emitted by this transaction
    pub logs: Vec<ContractLog>,
}

/// Row of the contract's custodian authorization table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CustodianAuthorization {
    pub whitelisted: bool,
    pub tokenized: bool,
}

/// Read/write access to the rollover contract
#[async_trait]
pub trait ContractClient: Send + Sync {
    async fn send_raw_transaction(&self, raw: &str) -> Result<TxHash, ChainError>;

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, ChainError>;

    async fn transfer_state(&self, key: &TransferKey) -> Result<ContractState, ChainError>;

    /// All rollover contract events for one transfer, in chain order
    async fn transfer_logs(&self, key: &TransferKey) -> Result<Vec<ContractLog>, ChainError>;

    async fn custodian_authorization(
        &self,
        wallet: &WalletAddress,
    ) -> Result<CustodianAuthorization, ChainError>;

    /// Next nonce for `wallet`, counting pending transactions
    async fn pending_nonce(&self, wallet: &WalletAddress) -> Result<u64, ChainError>;

    /// Address of the rollover contract
    fn contract_address(&self) -> WalletAddress;
}

/// Produces a signed raw transaction for a wallet it controls
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign(&self, tx: &UnsignedTransaction) -> Result<String, ChainError>;
}

/// Hash of a signed raw transaction (`keccak256` of its bytes)
pub fn raw_transaction_hash(raw: &str) -> Result<TxHash, ChainError> {
    let body = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(body).map_err(|e| ChainError::Decode(format!("raw tx: {}", e)))?;
    Ok(TxHash(crate::core_types::keccak256(&bytes)))
}
