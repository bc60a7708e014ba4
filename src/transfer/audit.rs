//! Audit Hasher
//!
//! Every contract call carries a hash of who executed it, for whom, and when.
//! The hash goes on chain in the call's reference field; the record behind
//! it is stored here, keyed by the hash, so any party holding the on-chain
//! value can look up the execution metadata and recompute the hash.
//!
//! Hash layout (ABI words, then keccak256):
//!
//! ```text
//! executing_wallet | source_wallet | destination_wallet
//!   | keccak256(transfer_id) | proxy_initiated | timestamp_ms
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::chain::abi::{word_address, word_bool, word_u128};
use crate::core_types::{AuditHash, TransferId, WalletAddress, keccak256};

use super::error::TransferError;
use super::types::ActionKind;

/// Execution metadata behind one on-chain audit hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Wallet that signed the transaction (the proxy in platform-proxy mode)
    pub executing_wallet: WalletAddress,
    pub source_wallet: WalletAddress,
    pub destination_wallet: WalletAddress,
    pub transfer_id: TransferId,
    pub proxy_initiated: bool,
    pub timestamp: DateTime<Utc>,
    /// Not part of the hash
    pub action: ActionKind,
}

impl AuditRecord {
    pub fn hash(&self) -> AuditHash {
        let words = [
            word_address(&self.executing_wallet),
            word_address(&self.source_wallet),
            word_address(&self.destination_wallet),
            keccak256(self.transfer_id.as_str().as_bytes()),
            word_bool(self.proxy_initiated),
            word_u128(self.timestamp.timestamp_millis().max(0) as u128),
        ];
        AuditHash(keccak256(&words.concat()))
    }

    /// Does `hash` match this record's contents?
    pub fn verify(&self, hash: &AuditHash) -> bool {
        self.hash() == *hash
    }
}

/// Off-chain audit trail, keyed by hash
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Store `record` and return its hash. Storing the same record twice is a
    /// no-op.
    async fn put(&self, record: &AuditRecord) -> Result<AuditHash, TransferError>;

    async fn get(&self, hash: &AuditHash) -> Result<Option<AuditRecord>, TransferError>;
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    records: DashMap<AuditHash, AuditRecord>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn put(&self, record: &AuditRecord) -> Result<AuditHash, TransferError> {
        let hash = record.hash();
        self.records.entry(hash).or_insert_with(|| record.clone());
        Ok(hash)
    }

    async fn get(&self, hash: &AuditHash) -> Result<Option<AuditRecord>, TransferError> {
        Ok(self.records.get(hash).map(|r| r.clone()))
    }
}

/// PostgreSQL audit trail (`rollover_audit_tb`)
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn put(&self, record: &AuditRecord) -> Result<AuditHash, TransferError> {
        let hash = record.hash();
        sqlx::query(
            r#"
            INSERT INTO rollover_audit_tb (audit_hash, transfer_id, action, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (audit_hash) DO NOTHING
            "#,
        )
        .bind(hash.to_hex())
        .bind(record.transfer_id.as_str())
        .bind(record.action.as_str())
        .bind(Json(record))
        .execute(&self.pool)
        .await?;
        Ok(hash)
    }

    async fn get(&self, hash: &AuditHash) -> Result<Option<AuditRecord>, TransferError> {
        let row = sqlx::query("SELECT body FROM rollover_audit_tb WHERE audit_hash = $1")
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let Json(record): Json<AuditRecord> = row.try_get("body")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}
