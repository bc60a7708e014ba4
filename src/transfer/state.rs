//! Transfer State Computer
//!
//! `compute_state(events) -> TransferView` is a pure fold over the ordered
//! event log: no I/O and no clock reads. The only time-dependent transition,
//! the timeout, is evaluated against the first event's timestamp and an
//! explicit `as_of` instant supplied by the caller.
//!
//! ```text
//! Created → {SenderAgreed, ReceiverAgreed} → BothAgreed → FinancialsReady → Executed
//!   Executed ─(tokenized)→ Minted ─→ Settled
//!   Executed ─(standard)─→ Settled
//!   any non-terminal ─→ Cancelled | TimedOut
//! ```

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::core_types::{CustodianId, TransferId, TxHash};

use super::event::{EventKind, EventPayload, RecordedEvent};
use super::protocol::{self, ContractState};
use super::types::{AccountType, ActionKind, FinancialDetails, Party, SettlementTier};

/// Derived lifecycle stage (never stored, never hand-set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStage {
    /// No events at all
    Empty,
    Created,
    SenderAgreed,
    ReceiverAgreed,
    BothAgreed,
    FinancialsReady,
    Executed,
    Minted,
    Settled,
    Cancelled,
    TimedOut,
}

impl TransferStage {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStage::Settled | TransferStage::Cancelled | TransferStage::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStage::Empty => "EMPTY",
            TransferStage::Created => "CREATED",
            TransferStage::SenderAgreed => "SENDER_AGREED",
            TransferStage::ReceiverAgreed => "RECEIVER_AGREED",
            TransferStage::BothAgreed => "BOTH_AGREED",
            TransferStage::FinancialsReady => "FINANCIALS_READY",
            TransferStage::Executed => "EXECUTED",
            TransferStage::Minted => "MINTED",
            TransferStage::Settled => "SETTLED",
            TransferStage::Cancelled => "CANCELLED",
            TransferStage::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeout window for reaching a terminal event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub window: Duration,
}

impl TimeoutPolicy {
    pub fn days(days: i64) -> Self {
        Self {
            window: Duration::days(days),
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::days(7)
    }
}

/// A `*.failed` event kept for observability
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureNote {
    pub seq: u64,
    pub action: ActionKind,
    pub code: String,
    pub error: String,
}

/// Everything derivable from a transfer's event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferView {
    pub transfer_id: Option<TransferId>,
    pub stage: TransferStage,
    pub sender: Option<CustodianId>,
    pub receiver: Option<CustodianId>,
    pub source_account_type: Option<AccountType>,
    pub destination_account_type: Option<AccountType>,
    pub sender_agreed: bool,
    pub receiver_agreed: bool,
    pub financials: Option<FinancialDetails>,
    /// Tier fixed at execution time
    pub execution_tier: Option<SettlementTier>,
    pub last_tx_hash: Option<TxHash>,
    pub failures: Vec<FailureNote>,
    /// Events that were not legal from the stage they arrived in
    pub ignored: Vec<u64>,
    /// Events whose (kind, tx hash) was already recorded
    pub duplicates: Vec<u64>,
    /// Highest sequence number seen (0 for an empty log)
    pub last_seq: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    /// Actions each side may take from here
    pub sender_next: Vec<ActionKind>,
    pub receiver_next: Vec<ActionKind>,
}

impl TransferView {
    fn empty() -> Self {
        Self {
            transfer_id: None,
            stage: TransferStage::Empty,
            sender: None,
            receiver: None,
            source_account_type: None,
            destination_account_type: None,
            sender_agreed: false,
            receiver_agreed: false,
            financials: None,
            execution_tier: None,
            last_tx_hash: None,
            failures: Vec::new(),
            ignored: Vec::new(),
            duplicates: Vec::new(),
            last_seq: 0,
            created_at: None,
            deadline: None,
            sender_next: Vec::new(),
            receiver_next: Vec::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.stage != TransferStage::Empty && self.sender.is_some()
    }

    /// Map a custodian onto its side of this transfer
    pub fn party_of(&self, custodian: &CustodianId) -> Option<Party> {
        if self.sender.as_ref() == Some(custodian) {
            Some(Party::Sender)
        } else if self.receiver.as_ref() == Some(custodian) {
            Some(Party::Receiver)
        } else {
            None
        }
    }
}

/// Fold the event log into a [`TransferView`].
///
/// `as_of` is the instant against which the timeout window is evaluated.
/// With `None` the latest event timestamp is used, so the result is a
/// function of the log alone.
pub fn compute_state(
    events: &[RecordedEvent],
    policy: &TimeoutPolicy,
    as_of: Option<DateTime<Utc>>,
) -> TransferView {
    let mut view = TransferView::empty();

    let mut ordered: Vec<&RecordedEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.seq);

    let mut seen: FxHashSet<(EventKind, TxHash)> = FxHashSet::default();
    let mut latest: Option<DateTime<Utc>> = None;

    for recorded in ordered {
        let event = &recorded.event;
        view.last_seq = view.last_seq.max(recorded.seq);
        latest = Some(latest.map_or(event.timestamp, |t| t.max(event.timestamp)));

        if let Some(tx) = event.tx_hash() {
            if !seen.insert((event.kind, tx)) {
                view.duplicates.push(recorded.seq);
                continue;
            }
        }

        if let EventKind::Failed(action) = event.kind {
            let (code, error) = match &event.payload {
                EventPayload::Failure { code, error, .. } => (code.clone(), error.clone()),
                _ => (String::new(), String::new()),
            };
            view.failures.push(FailureNote {
                seq: recorded.seq,
                action,
                code,
                error,
            });
            continue;
        }

        // Window elapsed before this event arrived: the transfer was already
        // timed out and the late event cannot advance it.
        if past_deadline(&view, event.timestamp) {
            view.stage = TransferStage::TimedOut;
        }

        if !apply(&mut view, recorded) {
            view.ignored.push(recorded.seq);
            continue;
        }
        if let Some(tx) = event.tx_hash() {
            view.last_tx_hash = Some(tx);
        }
        if view.deadline.is_none() {
            view.deadline = view.created_at.map(|created| created + policy.window);
        }
    }

    if let Some(now) = as_of.or(latest) {
        if past_deadline(&view, now) {
            view.stage = TransferStage::TimedOut;
        }
    }

    if view.exists() && !view.stage.is_terminal() {
        let state = ContractState::from(view.stage);
        let tier = view.execution_tier.unwrap_or(SettlementTier::Standard);
        view.sender_next = protocol::next_actions(state, Party::Sender, tier);
        view.receiver_next = protocol::next_actions(state, Party::Receiver, tier);
    }

    view
}

fn past_deadline(view: &TransferView, at: DateTime<Utc>) -> bool {
    match view.deadline {
        Some(deadline) => !view.stage.is_terminal() && at >= deadline,
        None => false,
    }
}

/// Apply one successful event. Returns false if it is not legal from the
/// current stage.
fn apply(view: &mut TransferView, recorded: &RecordedEvent) -> bool {
    use TransferStage as S;

    let event = &recorded.event;

    if view.stage.is_terminal() {
        return false;
    }

    if event.kind == EventKind::TransferCreated {
        if view.stage != S::Empty {
            return false;
        }
        let EventPayload::Created {
            sender,
            receiver,
            source_account_type,
            destination_account_type,
            ..
        } = &event.payload
        else {
            return false;
        };
        view.transfer_id = Some(recorded.transfer_id.clone());
        view.sender = Some(sender.clone());
        view.receiver = Some(receiver.clone());
        view.source_account_type = Some(*source_account_type);
        view.destination_account_type = Some(*destination_account_type);
        view.created_at = Some(event.timestamp);
        view.stage = S::Created;
        return true;
    }

    if view.stage == S::Empty {
        return false;
    }

    // Agreement is order independent: whichever side arrives second
    // completes the pair.
    let agreed = |v: &TransferView| match (v.sender_agreed, v.receiver_agreed) {
        (true, true) => S::BothAgreed,
        (true, false) => S::SenderAgreed,
        (false, true) => S::ReceiverAgreed,
        (false, false) => S::Created,
    };

    match (event.kind, view.stage) {
        (EventKind::SenderAgreed, S::Created | S::ReceiverAgreed) => {
            view.sender_agreed = true;
            view.stage = agreed(view);
            true
        }
        (EventKind::ReceiverAgreed, S::Created | S::SenderAgreed) => {
            view.receiver_agreed = true;
            view.stage = agreed(view);
            true
        }
        (EventKind::FinancialDetailsProvided, S::BothAgreed) => match &event.payload {
            EventPayload::Financials(details) => {
                view.financials = Some(*details);
                view.stage = S::FinancialsReady;
                true
            }
            _ => false,
        },
        (EventKind::Executed, S::FinancialsReady) => match &event.payload {
            EventPayload::Execution { tier, .. } => {
                view.execution_tier = Some(*tier);
                view.stage = S::Executed;
                true
            }
            _ => false,
        },
        (EventKind::Minted, S::Executed) if view.execution_tier == Some(SettlementTier::Tokenized) => {
            view.stage = S::Minted;
            true
        }
        (EventKind::Burned, S::Minted) => {
            view.stage = S::Settled;
            true
        }
        (EventKind::FundsSent | EventKind::FundsConfirmed, S::Executed)
            if view.execution_tier == Some(SettlementTier::Standard) =>
        {
            view.stage = S::Settled;
            true
        }
        (EventKind::Cancelled, _) => {
            view.stage = S::Cancelled;
            true
        }
        (EventKind::Expired, _) => {
            view.stage = S::TimedOut;
            true
        }
        _ => false,
    }
}
