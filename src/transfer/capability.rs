//! Custodian Capability Resolver
//!
//! Capability records (wallet, execution mode, tier) are administrative
//! data owned elsewhere. They are read fresh on every action and checked
//! against the contract's own authorization table before anything is sent:
//! the off-chain record is a hint, the contract decides.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{PgPool, Row};
use tracing::{error, info};

use crate::chain::ContractClient;
use crate::core_types::{CustodianId, WalletAddress};

use super::error::TransferError;
use super::types::{CapabilityRecord, ExecutionMode, Party, SettlementTier};

/// Source of capability records
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    async fn get(&self, custodian: &CustodianId) -> Result<Option<CapabilityRecord>, TransferError>;
}

/// Registry held in memory, seeded from configuration or by tests
#[derive(Default)]
pub struct StaticCapabilityRegistry {
    records: DashMap<CustodianId, CapabilityRecord>,
}

impl StaticCapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = CapabilityRecord>) -> Self {
        let registry = Self::new();
        for record in records {
            registry.upsert(record);
        }
        registry
    }

    /// Insert or replace; takes effect on the next action
    pub fn upsert(&self, record: CapabilityRecord) {
        self.records.insert(record.custodian_id.clone(), record);
    }
}

#[async_trait]
impl CapabilityRegistry for StaticCapabilityRegistry {
    async fn get(&self, custodian: &CustodianId) -> Result<Option<CapabilityRecord>, TransferError> {
        Ok(self.records.get(custodian).map(|r| r.clone()))
    }
}

/// PostgreSQL registry (`custodian_capabilities_tb`)
pub struct PgCapabilityRegistry {
    pool: PgPool,
}

impl PgCapabilityRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_mode(s: &str) -> Result<ExecutionMode, TransferError> {
    match s {
        "self-signed" => Ok(ExecutionMode::SelfSigned),
        "platform-proxy" => Ok(ExecutionMode::PlatformProxy),
        other => Err(TransferError::SystemError(format!(
            "unknown execution mode in registry: {}",
            other
        ))),
    }
}

fn parse_tier(s: &str) -> Result<SettlementTier, TransferError> {
    match s {
        "standard" => Ok(SettlementTier::Standard),
        "tokenized" => Ok(SettlementTier::Tokenized),
        other => Err(TransferError::SystemError(format!(
            "unknown settlement tier in registry: {}",
            other
        ))),
    }
}

#[async_trait]
impl CapabilityRegistry for PgCapabilityRegistry {
    async fn get(&self, custodian: &CustodianId) -> Result<Option<CapabilityRecord>, TransferError> {
        let row = sqlx::query(
            r#"
            SELECT wallet, execution_mode, tier
            FROM custodian_capabilities_tb
            WHERE custodian_id = $1
            "#,
        )
        .bind(custodian.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let wallet: String = row.try_get("wallet")?;
        let mode: String = row.try_get("execution_mode")?;
        let tier: String = row.try_get("tier")?;

        Ok(Some(CapabilityRecord {
            custodian_id: custodian.clone(),
            wallet: wallet.parse::<WalletAddress>().map_err(|e| {
                TransferError::SystemError(format!("bad wallet for {}: {}", custodian, e))
            })?,
            execution_mode: parse_mode(&mode)?,
            tier: parse_tier(&tier)?,
        }))
    }
}

/// Both parties' verified capabilities plus the tier the transfer runs at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPair {
    pub sender: CapabilityRecord,
    pub receiver: CapabilityRecord,
    pub tier: SettlementTier,
}

impl ResolvedPair {
    pub fn for_party(&self, party: Party) -> Option<&CapabilityRecord> {
        match party {
            Party::Sender => Some(&self.sender),
            Party::Receiver => Some(&self.receiver),
            Party::Platform => None,
        }
    }
}

/// Tier for a pair of custodians: tokenized only when both are.
///
/// Returns the tier and whether a tokenized custodian was downgraded.
pub fn pair_tier(sender: SettlementTier, receiver: SettlementTier) -> (SettlementTier, bool) {
    match (sender, receiver) {
        (SettlementTier::Tokenized, SettlementTier::Tokenized) => (SettlementTier::Tokenized, false),
        (SettlementTier::Standard, SettlementTier::Standard) => (SettlementTier::Standard, false),
        _ => (SettlementTier::Standard, true),
    }
}

pub struct CapabilityResolver {
    registry: Arc<dyn CapabilityRegistry>,
    client: Arc<dyn ContractClient>,
}

impl CapabilityResolver {
    pub fn new(registry: Arc<dyn CapabilityRegistry>, client: Arc<dyn ContractClient>) -> Self {
        Self { registry, client }
    }

    /// Look up `custodian` and verify the record against the contract's
    /// authorization table.
    pub async fn resolve(&self, custodian: &CustodianId) -> Result<CapabilityRecord, TransferError> {
        let record = self
            .registry
            .get(custodian)
            .await?
            .ok_or_else(|| TransferError::CapabilityNotFound(custodian.clone()))?;

        let on_chain = self.client.custodian_authorization(&record.wallet).await?;

        let detail = if !on_chain.whitelisted {
            Some(format!("wallet {} is not whitelisted on chain", record.wallet))
        } else if record.tier == SettlementTier::Tokenized && !on_chain.tokenized {
            Some(format!(
                "marked tokenized off-chain but wallet {} is not registered for tokenization",
                record.wallet
            ))
        } else if record.tier == SettlementTier::Standard && on_chain.tokenized {
            Some(format!(
                "marked standard off-chain but wallet {} is registered for tokenization",
                record.wallet
            ))
        } else {
            None
        };

        if let Some(detail) = detail {
            error!(
                custodian = %custodian,
                wallet = %record.wallet,
                tier = %record.tier,
                chain_whitelisted = on_chain.whitelisted,
                chain_tokenized = on_chain.tokenized,
                "Capability record disagrees with contract"
            );
            return Err(TransferError::CapabilityMismatch {
                custodian: custodian.clone(),
                detail,
            });
        }

        Ok(record)
    }

    /// Resolve both parties and decide the transfer's tier
    pub async fn resolve_pair(
        &self,
        sender: &CustodianId,
        receiver: &CustodianId,
    ) -> Result<ResolvedPair, TransferError> {
        let sender = self.resolve(sender).await?;
        let receiver = self.resolve(receiver).await?;

        let (tier, fell_back) = pair_tier(sender.tier, receiver.tier);
        if fell_back {
            info!(
                sender = %sender.custodian_id,
                sender_tier = %sender.tier,
                receiver = %receiver.custodian_id,
                receiver_tier = %receiver.tier,
                tier = %tier,
                "Mixed-tier pair; settling at standard tier"
            );
        }

        Ok(ResolvedPair {
            sender,
            receiver,
            tier,
        })
    }
}
