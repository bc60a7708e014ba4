//! Protocol State Machine
//!
//! Pure mirror of the on-chain rollover contract's transition table. The
//! dispatcher validates every action here before it reaches the chain, and
//! reconciliation uses the same table to compare chain state with the log.
//!
//! | From                       | Action                  | Actor             | To                 |
//! |----------------------------|-------------------------|-------------------|--------------------|
//! | None                       | agreeSend               | sender            | SenderPrepared     |
//! | None                       | agreeReceive            | receiver          | ReceiverPrepared   |
//! | ReceiverPrepared           | agreeSend               | sender            | BothReady          |
//! | SenderPrepared             | agreeReceive            | receiver          | BothReady          |
//! | BothReady                  | provideFinancialDetails | sender            | FinancialsProvided |
//! | FinancialsProvided         | executeTransfer         | sender / receiver | Executed or Minted |
//! | Minted                     | burnTokens              | receiver          | Completed          |
//! | Executed (standard)        | recordSettlement        | sender            | Completed          |
//! | Executed (standard)        | confirmReceipt          | receiver          | Completed          |
//! | any non-terminal           | cancelTransfer          | sender / receiver | Cancelled          |

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::TransferError;
use super::state::TransferStage;
use super::types::{ActionKind, Party, SettlementTier};

/// Contract-side transfer state, with the contract's `uint8` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContractState {
    None = 0,
    SenderPrepared = 1,
    ReceiverPrepared = 2,
    BothReady = 3,
    FinancialsProvided = 4,
    Executed = 5,
    Minted = 6,
    Burned = 7,
    Completed = 8,
    Cancelled = 9,
    TimedOut = 10,
}

impl ContractState {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ContractState::None,
            1 => ContractState::SenderPrepared,
            2 => ContractState::ReceiverPrepared,
            3 => ContractState::BothReady,
            4 => ContractState::FinancialsProvided,
            5 => ContractState::Executed,
            6 => ContractState::Minted,
            7 => ContractState::Burned,
            8 => ContractState::Completed,
            9 => ContractState::Cancelled,
            10 => ContractState::TimedOut,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContractState::Burned
                | ContractState::Completed
                | ContractState::Cancelled
                | ContractState::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractState::None => "None",
            ContractState::SenderPrepared => "SenderPrepared",
            ContractState::ReceiverPrepared => "ReceiverPrepared",
            ContractState::BothReady => "BothReady",
            ContractState::FinancialsProvided => "FinancialsProvided",
            ContractState::Executed => "Executed",
            ContractState::Minted => "Minted",
            ContractState::Burned => "Burned",
            ContractState::Completed => "Completed",
            ContractState::Cancelled => "Cancelled",
            ContractState::TimedOut => "TimedOut",
        }
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TransferStage> for ContractState {
    fn from(stage: TransferStage) -> Self {
        match stage {
            TransferStage::Empty | TransferStage::Created => ContractState::None,
            TransferStage::SenderAgreed => ContractState::SenderPrepared,
            TransferStage::ReceiverAgreed => ContractState::ReceiverPrepared,
            TransferStage::BothAgreed => ContractState::BothReady,
            TransferStage::FinancialsReady => ContractState::FinancialsProvided,
            TransferStage::Executed => ContractState::Executed,
            TransferStage::Minted => ContractState::Minted,
            TransferStage::Settled => ContractState::Completed,
            TransferStage::Cancelled => ContractState::Cancelled,
            TransferStage::TimedOut => ContractState::TimedOut,
        }
    }
}

/// Do a log-derived stage and a chain state describe the same position?
pub fn states_agree(stage: TransferStage, chain: ContractState) -> bool {
    let local = ContractState::from(stage);
    local == chain
        || matches!(
            (local, chain),
            (ContractState::Completed, ContractState::Burned)
        )
}

/// Parties permitted to invoke `action`
pub fn allowed_actors(action: ActionKind) -> &'static [Party] {
    match action {
        ActionKind::AgreeSend
        | ActionKind::ProvideFinancialDetails
        | ActionKind::RecordSettlement => &[Party::Sender],
        ActionKind::AgreeReceive | ActionKind::BurnTokens | ActionKind::ConfirmReceipt => {
            &[Party::Receiver]
        }
        ActionKind::ExecuteTransfer | ActionKind::CancelTransfer => {
            &[Party::Sender, Party::Receiver]
        }
    }
}

/// Compute the contract state `action` moves `from` into.
///
/// `tier` is the settlement tier the contract will apply at execution; it
/// decides between `Executed` and `Minted` and gates the standard-only
/// settlement actions.
pub fn transition(
    from: ContractState,
    action: ActionKind,
    actor: Party,
    tier: SettlementTier,
) -> Result<ContractState, TransferError> {
    use ContractState as C;

    let to = match (action, from) {
        (ActionKind::AgreeSend, C::None) => C::SenderPrepared,
        (ActionKind::AgreeSend, C::ReceiverPrepared) => C::BothReady,
        (ActionKind::AgreeReceive, C::None) => C::ReceiverPrepared,
        (ActionKind::AgreeReceive, C::SenderPrepared) => C::BothReady,
        (ActionKind::ProvideFinancialDetails, C::BothReady) => C::FinancialsProvided,
        (ActionKind::ExecuteTransfer, C::FinancialsProvided) => match tier {
            SettlementTier::Tokenized => C::Minted,
            SettlementTier::Standard => C::Executed,
        },
        (ActionKind::BurnTokens, C::Minted) => C::Completed,
        (ActionKind::RecordSettlement | ActionKind::ConfirmReceipt, C::Executed)
            if tier == SettlementTier::Standard =>
        {
            C::Completed
        }
        (ActionKind::CancelTransfer, s) if !s.is_terminal() => C::Cancelled,
        _ => {
            return Err(TransferError::InvalidTransferState {
                action,
                actual: from,
                expected: expected_from(action),
            });
        }
    };

    if !allowed_actors(action).contains(&actor) {
        return Err(TransferError::Unauthorized {
            action,
            actor,
        });
    }

    Ok(to)
}

/// Human-readable list of states from which `action` is legal
pub fn expected_from(action: ActionKind) -> String {
    match action {
        ActionKind::AgreeSend => "None | ReceiverPrepared",
        ActionKind::AgreeReceive => "None | SenderPrepared",
        ActionKind::ProvideFinancialDetails => "BothReady",
        ActionKind::ExecuteTransfer => "FinancialsProvided",
        ActionKind::BurnTokens => "Minted",
        ActionKind::RecordSettlement | ActionKind::ConfirmReceipt => "Executed (standard tier)",
        ActionKind::CancelTransfer => "any non-terminal state",
    }
    .to_string()
}

/// Actions a given party may legally take next
pub fn next_actions(state: ContractState, party: Party, tier: SettlementTier) -> Vec<ActionKind> {
    ActionKind::ALL
        .into_iter()
        .filter(|a| transition(state, *a, party, tier).is_ok())
        .collect()
}
