//! Transfer lifecycle events
//!
//! The event log is the single source of truth. Events are immutable facts;
//! corrections are new events (a `*.failed` event followed by a successful
//! retry), never edits.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{AuditHash, CustodianId, TransferId, TxHash, WalletAddress};

use super::types::{AccountType, ActionKind, FinancialDetails, SettlementTier};

/// Closed enumeration of event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransferCreated,
    SenderAgreed,
    ReceiverAgreed,
    FinancialDetailsProvided,
    Executed,
    Minted,
    Burned,
    FundsSent,
    FundsConfirmed,
    Cancelled,
    /// Contract reported the transfer window as expired
    Expired,
    /// Informational: a submission for this action failed
    Failed(ActionKind),
}

impl EventKind {
    /// Event emitted on success of a contract action
    pub fn for_action(action: ActionKind) -> Self {
        match action {
            ActionKind::AgreeSend => EventKind::SenderAgreed,
            ActionKind::AgreeReceive => EventKind::ReceiverAgreed,
            ActionKind::ProvideFinancialDetails => EventKind::FinancialDetailsProvided,
            ActionKind::ExecuteTransfer => EventKind::Executed,
            ActionKind::BurnTokens => EventKind::Burned,
            ActionKind::RecordSettlement => EventKind::FundsSent,
            ActionKind::ConfirmReceipt => EventKind::FundsConfirmed,
            ActionKind::CancelTransfer => EventKind::Cancelled,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, EventKind::Failed(_))
    }

    pub fn name(&self) -> String {
        match self {
            EventKind::TransferCreated => "TransferCreated".to_string(),
            EventKind::SenderAgreed => "SenderAgreed".to_string(),
            EventKind::ReceiverAgreed => "ReceiverAgreed".to_string(),
            EventKind::FinancialDetailsProvided => "FinancialDetailsProvided".to_string(),
            EventKind::Executed => "Executed".to_string(),
            EventKind::Minted => "Minted".to_string(),
            EventKind::Burned => "Burned".to_string(),
            EventKind::FundsSent => "FundsSent".to_string(),
            EventKind::FundsConfirmed => "FundsConfirmed".to_string(),
            EventKind::Cancelled => "Cancelled".to_string(),
            EventKind::Expired => "Expired".to_string(),
            EventKind::Failed(action) => format!("{}.failed", action.as_str()),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        if let Some(action) = name.strip_suffix(".failed") {
            return ActionKind::parse(action).map(EventKind::Failed);
        }
        let kind = match name {
            "TransferCreated" => EventKind::TransferCreated,
            "SenderAgreed" => EventKind::SenderAgreed,
            "ReceiverAgreed" => EventKind::ReceiverAgreed,
            "FinancialDetailsProvided" => EventKind::FinancialDetailsProvided,
            "Executed" => EventKind::Executed,
            "Minted" => EventKind::Minted,
            "Burned" => EventKind::Burned,
            "FundsSent" => EventKind::FundsSent,
            "FundsConfirmed" => EventKind::FundsConfirmed,
            "Cancelled" => EventKind::Cancelled,
            "Expired" => EventKind::Expired,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        EventKind::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event kind: {}", name)))
    }
}

/// Who wrote an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Author {
    Custodian(CustodianId),
    Platform,
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Author::Custodian(id) => write!(f, "custodian:{}", id),
            Author::Platform => f.write_str("platform"),
        }
    }
}

/// Type-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Created {
        sender: CustodianId,
        receiver: CustodianId,
        source_account_type: AccountType,
        destination_account_type: AccountType,
        #[serde(default)]
        client_reference: Option<String>,
    },
    Agreement {
        wallet: WalletAddress,
    },
    Financials(FinancialDetails),
    Execution {
        tier: SettlementTier,
        #[serde(with = "rust_decimal::serde::str")]
        net_amount: Decimal,
    },
    Tokens {
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
    },
    Failure {
        action: ActionKind,
        code: String,
        error: String,
        retryable: bool,
    },
    Empty,
}

/// On-chain provenance of a blockchain-originated event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRef {
    pub tx_hash: TxHash,
    pub block_number: u64,
    #[serde(default)]
    pub audit_hash: Option<AuditHash>,
    /// Synthesized by reconciliation from chain data
    #[serde(default)]
    pub recovered: bool,
}

/// An event before it is sequenced by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub kind: EventKind,
    pub author: Author,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    #[serde(default)]
    pub chain: Option<ChainRef>,
}

impl TransferEvent {
    pub fn new(kind: EventKind, author: Author, payload: EventPayload) -> Self {
        Self {
            kind,
            author,
            timestamp: Utc::now(),
            payload,
            chain: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_chain(mut self, chain: ChainRef) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn tx_hash(&self) -> Option<TxHash> {
        self.chain.as_ref().map(|c| c.tx_hash)
    }
}

/// An event as stored: carries the per-transfer sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub transfer_id: TransferId,
    /// Strictly increasing per transfer, starting at 1
    pub seq: u64,
    #[serde(flatten)]
    pub event: TransferEvent,
}
