//! Transfer Core Types
//!
//! Parties, actions, financial details and custodian capabilities.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{CustodianId, TransferId, TxHash, WalletAddress};
use crate::money::{self, MoneyError};

use super::state::TransferStage;

/// Which side of a transfer an actor is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Sender,
    Receiver,
    /// The platform itself (reconciler, proxy executor)
    Platform,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Sender => "SENDER",
            Party::Receiver => "RECEIVER",
            Party::Platform => "PLATFORM",
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retirement account types, with the contract's `uint8` enum values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AccountType {
    Traditional401k = 0,
    Roth401k = 1,
    TraditionalIra = 2,
    RothIra = 3,
    Plan403b = 4,
    Governmental457b = 5,
}

impl AccountType {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AccountType::Traditional401k),
            1 => Some(AccountType::Roth401k),
            2 => Some(AccountType::TraditionalIra),
            3 => Some(AccountType::RothIra),
            4 => Some(AccountType::Plan403b),
            5 => Some(AccountType::Governmental457b),
            _ => None,
        }
    }
}

/// Tax withholding breakdown (immutable input, never computed here)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaxWithholding {
    #[serde(with = "rust_decimal::serde::str")]
    pub federal: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub state: Decimal,
}

impl TaxWithholding {
    pub fn total(&self) -> Decimal {
        self.federal + self.state
    }
}

/// Payload of `provideFinancialDetails`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialDetails {
    #[serde(with = "rust_decimal::serde::str")]
    pub gross_amount: Decimal,
    pub withholding: TaxWithholding,
}

impl FinancialDetails {
    pub fn new(gross_amount: Decimal, federal: Decimal, state: Decimal) -> Self {
        Self {
            gross_amount,
            withholding: TaxWithholding { federal, state },
        }
    }

    /// Amount that actually moves to the receiver
    pub fn net_amount(&self) -> Decimal {
        self.gross_amount - self.withholding.total()
    }

    /// Amount sanity checks. Business rules for the withholding itself live
    /// outside this engine.
    pub fn validate(&self) -> Result<(), MoneyError> {
        money::check_amount(self.gross_amount)?;
        money::check_amount(self.withholding.federal)?;
        money::check_amount(self.withholding.state)?;
        if self.gross_amount.is_zero() {
            return Err(MoneyError::InvalidFormat(
                "gross amount must be greater than zero".to_string(),
            ));
        }
        if self.net_amount().is_sign_negative() && !self.net_amount().is_zero() {
            return Err(MoneyError::InvalidFormat(
                "withholding exceeds gross amount".to_string(),
            ));
        }
        Ok(())
    }
}

/// Contract actions, named after the contract functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "agreeSend")]
    AgreeSend,
    #[serde(rename = "agreeReceive")]
    AgreeReceive,
    #[serde(rename = "provideFinancialDetails")]
    ProvideFinancialDetails,
    #[serde(rename = "executeTransfer")]
    ExecuteTransfer,
    #[serde(rename = "burnTokens")]
    BurnTokens,
    #[serde(rename = "recordSettlement")]
    RecordSettlement,
    #[serde(rename = "confirmReceipt")]
    ConfirmReceipt,
    #[serde(rename = "cancelTransfer")]
    CancelTransfer,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::AgreeSend,
        ActionKind::AgreeReceive,
        ActionKind::ProvideFinancialDetails,
        ActionKind::ExecuteTransfer,
        ActionKind::BurnTokens,
        ActionKind::RecordSettlement,
        ActionKind::ConfirmReceipt,
        ActionKind::CancelTransfer,
    ];

    /// Contract function name
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::AgreeSend => "agreeSend",
            ActionKind::AgreeReceive => "agreeReceive",
            ActionKind::ProvideFinancialDetails => "provideFinancialDetails",
            ActionKind::ExecuteTransfer => "executeTransfer",
            ActionKind::BurnTokens => "burnTokens",
            ActionKind::RecordSettlement => "recordSettlement",
            ActionKind::ConfirmReceipt => "confirmReceipt",
            ActionKind::CancelTransfer => "cancelTransfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who signs and pays gas for a custodian's calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    SelfSigned,
    PlatformProxy,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::SelfSigned => "self-signed",
            ExecutionMode::PlatformProxy => "platform-proxy",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementTier {
    Standard,
    Tokenized,
}

impl SettlementTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementTier::Standard => "standard",
            SettlementTier::Tokenized => "tokenized",
        }
    }
}

impl fmt::Display for SettlementTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Off-chain capability record, set by administrators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub custodian_id: CustodianId,
    pub wallet: WalletAddress,
    pub execution_mode: ExecutionMode,
    pub tier: SettlementTier,
}

/// Request to open a new transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransferRequest {
    /// Caller-chosen id; a ULID is generated when absent
    #[serde(default)]
    pub transfer_id: Option<TransferId>,
    pub sender: CustodianId,
    pub receiver: CustodianId,
    pub source_account_type: AccountType,
    pub destination_account_type: AccountType,
    #[serde(default)]
    pub client_reference: Option<String>,
}

/// Inbound action request from a custodian
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub transfer_id: TransferId,
    pub action: ActionKind,
    pub initiator: CustodianId,
    /// Required for `provideFinancialDetails`
    #[serde(default)]
    pub financials: Option<FinancialDetails>,
}

impl ActionRequest {
    pub fn new(transfer_id: TransferId, action: ActionKind, initiator: CustodianId) -> Self {
        Self {
            transfer_id,
            action,
            initiator,
            financials: None,
        }
    }

    pub fn with_financials(mut self, financials: FinancialDetails) -> Self {
        self.financials = Some(financials);
        self
    }
}

/// Successful dispatch outcome
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub transfer_id: TransferId,
    pub action: ActionKind,
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// Stage after the appended events
    pub state: TransferStage,
    /// Sequence numbers of the events appended for this action
    pub appended: Vec<u64>,
}
