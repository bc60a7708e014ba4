//! Action Dispatcher
//!
//! `dispatch(request)` runs one custodian action end to end:
//!
//! 1. read the log and compute state
//! 2. check the action is legal for the initiator from that state
//! 3. resolve both custodians' capabilities (fresh, chain-verified)
//! 4. take the transfer's execution lease and re-read the log
//! 5. persist the audit record, then execute through the adapter, renewing
//!    the lease while the call is in flight
//! 6. append the confirmed events under the observed sequence number, only
//!    while the lease is still ours
//!
//! Validation failures append nothing. Submission failures append a
//! `*.failed` event and leave the stage where it was. When the chain outcome
//! is unknown, or the chain succeeded but the append did not, nothing is
//! appended and the transfer is handed to reconciliation.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chain::abi::{CallArgs, CallSpec};
use crate::chain::executor::Execution;
use crate::chain::{ExecutionAdapter, ExecutionError};
use crate::core_types::{TransferId, TxHash};
use crate::money;

use super::audit::{AuditRecord, AuditStore};
use super::capability::{CapabilityResolver, ResolvedPair};
use super::error::{DispatchFailure, TransferError};
use super::event::{Author, ChainRef, EventKind, EventPayload, RecordedEvent, TransferEvent};
use super::lock::{TransferLockGuard, TransferLocks};
use super::protocol::{self, ContractState};
use super::reconcile::{ReconcileRequest, event_from_chain};
use super::state::{TimeoutPolicy, TransferStage, TransferView, compute_state};
use super::store::EventStore;
use super::types::{
    ActionKind, ActionRequest, CreateTransferRequest, ExecutionResult, Party, SettlementTier,
};

pub struct ActionDispatcher {
    store: Arc<dyn EventStore>,
    audit: Arc<dyn AuditStore>,
    resolver: CapabilityResolver,
    adapter: Arc<ExecutionAdapter>,
    locks: TransferLocks,
    policy: TimeoutPolicy,
    reconciler: Option<mpsc::Sender<ReconcileRequest>>,
}

impl ActionDispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        audit: Arc<dyn AuditStore>,
        resolver: CapabilityResolver,
        adapter: Arc<ExecutionAdapter>,
        locks: TransferLocks,
        policy: TimeoutPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            resolver,
            adapter,
            locks,
            policy,
            reconciler: None,
        }
    }

    /// Send ambiguous outcomes to this reconciliation queue
    pub fn with_reconciler(mut self, tx: mpsc::Sender<ReconcileRequest>) -> Self {
        self.reconciler = Some(tx);
        self
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Current view of a transfer, with the timeout evaluated as of now
    pub async fn view(&self, transfer_id: &TransferId) -> Result<TransferView, TransferError> {
        let events = self.store.read(transfer_id).await?;
        let view = compute_state(&events, &self.policy, Some(Utc::now()));
        if !view.exists() {
            return Err(TransferError::TransferNotFound(transfer_id.clone()));
        }
        Ok(view)
    }

    /// Events after `after_seq`, for consumers tailing the log
    pub async fn events(
        &self,
        transfer_id: &TransferId,
        after_seq: u64,
    ) -> Result<Vec<RecordedEvent>, TransferError> {
        self.store.read_from(transfer_id, after_seq).await
    }

    /// Open a transfer by appending its `TransferCreated` event
    pub async fn create_transfer(
        &self,
        request: CreateTransferRequest,
    ) -> Result<TransferView, TransferError> {
        if request.sender == request.receiver {
            return Err(TransferError::InvalidRequest(
                "sender and receiver must be different custodians".to_string(),
            ));
        }

        let transfer_id = request.transfer_id.clone().unwrap_or_else(TransferId::generate);
        if transfer_id.as_str().is_empty() {
            return Err(TransferError::InvalidRequest("empty transfer id".to_string()));
        }

        let event = TransferEvent::new(
            EventKind::TransferCreated,
            Author::Platform,
            EventPayload::Created {
                sender: request.sender,
                receiver: request.receiver,
                source_account_type: request.source_account_type,
                destination_account_type: request.destination_account_type,
                client_reference: request.client_reference,
            },
        );

        match self.store.append(&transfer_id, 0, event).await {
            Ok(_) => {}
            Err(TransferError::ConcurrentAppendConflict { .. }) => {
                return Err(TransferError::DuplicateTransfer(transfer_id));
            }
            Err(e) => return Err(e),
        }

        info!(transfer_id = %transfer_id, "Transfer created");
        self.view(&transfer_id).await
    }

    /// Run one action. Every failure carries the stage known at the time.
    pub async fn dispatch(&self, request: ActionRequest) -> Result<ExecutionResult, DispatchFailure> {
        let transfer_id = request.transfer_id.clone();

        let view = self
            .view(&transfer_id)
            .await
            .map_err(|e| DispatchFailure::new(e, TransferStage::Empty))?;
        let fail = |e: TransferError| DispatchFailure::new(e, view.stage);

        let party = self.validate(&view, &request).map_err(fail)?;

        let (sender, receiver) = match (&view.sender, &view.receiver) {
            (Some(s), Some(r)) => (s.clone(), r.clone()),
            _ => {
                return Err(fail(TransferError::SystemError(
                    "transfer without parties".to_string(),
                )));
            }
        };
        let pair = self
            .resolver
            .resolve_pair(&sender, &receiver)
            .await
            .map_err(fail)?;

        let guard = self.locks.acquire(&transfer_id).await.map_err(fail)?;

        // The stage may have moved while we waited for the lease
        let view = self
            .view(&transfer_id)
            .await
            .map_err(|e| DispatchFailure::new(e, view.stage))?;
        let fail = |e: TransferError| DispatchFailure::new(e, view.stage);
        self.validate(&view, &request).map_err(fail)?;

        let spec = self
            .build_call(&view, &request, party, &pair)
            .await
            .map_err(fail)?;
        let initiator = pair.for_party(party).ok_or_else(|| {
            fail(TransferError::SystemError(format!(
                "no capability for {}",
                party
            )))
        })?;

        debug!(
            transfer_id = %transfer_id,
            action = %request.action,
            initiator = %request.initiator,
            tier = %pair.tier,
            mode = %initiator.execution_mode,
            audit_hash = %spec.reference,
            "Dispatching action"
        );

        if !guard.is_held() {
            warn!(transfer_id = %transfer_id, "Lease lost before submission");
            return Err(fail(TransferError::LockTimeout(transfer_id.clone())));
        }

        match guard.renew_while(self.adapter.execute(&spec, initiator)).await {
            Ok(execution) => {
                self.record_success(&view, &request, &pair, &spec, &guard, execution)
                    .await
            }
            Err(e) => Err(self.record_failure(&view, &request, &guard, e).await),
        }
    }

    /// Legality of `request` against `view`. Returns the initiator's side.
    fn validate(&self, view: &TransferView, request: &ActionRequest) -> Result<Party, TransferError> {
        let party = view
            .party_of(&request.initiator)
            .ok_or_else(|| TransferError::NotAParty {
                custodian: request.initiator.clone(),
                transfer_id: request.transfer_id.clone(),
            })?;

        // Before execution the tier only picks the post-execution state,
        // which legality does not depend on.
        let tier = view.execution_tier.unwrap_or(SettlementTier::Standard);
        protocol::transition(ContractState::from(view.stage), request.action, party, tier)?;

        if request.action == ActionKind::ProvideFinancialDetails {
            let financials = request.financials.as_ref().ok_or_else(|| {
                TransferError::InvalidRequest("provideFinancialDetails requires financials".to_string())
            })?;
            financials.validate()?;
        }

        Ok(party)
    }

    /// Persist the audit record and build the contract call around its hash
    async fn build_call(
        &self,
        view: &TransferView,
        request: &ActionRequest,
        party: Party,
        pair: &ResolvedPair,
    ) -> Result<CallSpec, TransferError> {
        let initiator = pair
            .for_party(party)
            .ok_or_else(|| TransferError::SystemError(format!("no capability for {}", party)))?;

        let args = match request.action {
            ActionKind::AgreeSend => CallArgs::Counterpart(pair.receiver.wallet),
            ActionKind::AgreeReceive => CallArgs::Counterpart(pair.sender.wallet),
            ActionKind::ProvideFinancialDetails => {
                let financials = request.financials.as_ref().ok_or_else(|| {
                    TransferError::InvalidRequest("missing financials".to_string())
                })?;
                let (Some(source), Some(destination)) =
                    (view.source_account_type, view.destination_account_type)
                else {
                    return Err(TransferError::SystemError("transfer without account types".to_string()));
                };
                CallArgs::Financials {
                    gross: money::to_minor_units(financials.gross_amount)?,
                    federal: money::to_minor_units(financials.withholding.federal)?,
                    state: money::to_minor_units(financials.withholding.state)?,
                    source,
                    destination,
                }
            }
            ActionKind::BurnTokens => {
                let financials = view.financials.as_ref().ok_or_else(|| {
                    TransferError::SystemError("minted transfer without financials".to_string())
                })?;
                CallArgs::Amount(money::to_minor_units(financials.net_amount())?)
            }
            ActionKind::ExecuteTransfer
            | ActionKind::RecordSettlement
            | ActionKind::ConfirmReceipt
            | ActionKind::CancelTransfer => CallArgs::None,
        };

        let executing_wallet = self.adapter.signing_wallet(initiator);
        let record = AuditRecord {
            executing_wallet,
            source_wallet: pair.sender.wallet,
            destination_wallet: pair.receiver.wallet,
            transfer_id: request.transfer_id.clone(),
            proxy_initiated: executing_wallet != initiator.wallet,
            timestamp: Utc::now(),
            action: request.action,
        };
        let reference = self.audit.put(&record).await?;

        Ok(CallSpec {
            action: request.action,
            key: request.transfer_id.chain_key(),
            on_behalf_of: initiator.wallet,
            reference,
            args,
        })
    }

    async fn record_success(
        &self,
        view: &TransferView,
        request: &ActionRequest,
        pair: &ResolvedPair,
        spec: &CallSpec,
        guard: &TransferLockGuard,
        execution: Execution,
    ) -> Result<ExecutionResult, DispatchFailure> {
        let transfer_id = &request.transfer_id;
        let fail = |e: TransferError| DispatchFailure::new(e, view.stage);

        // An already-applied call may have been submitted under another
        // request's audit record
        let audit_hash = execution
            .events
            .iter()
            .find_map(|e| e.reference())
            .unwrap_or(spec.reference);
        let chain = ChainRef {
            tx_hash: execution.tx_hash,
            block_number: execution.block_number,
            audit_hash: Some(audit_hash),
            recovered: false,
        };
        let author = Author::Custodian(request.initiator.clone());

        let mut appended = Vec::new();
        let mut last_seq = view.last_seq;
        for contract_event in &execution.events {
            let event = event_from_chain(
                contract_event,
                author.clone(),
                chain.clone(),
                execution.block_timestamp,
            )
            .map_err(fail)?;
            let kind = event.kind;

            if !guard.is_held() {
                warn!(
                    transfer_id = %transfer_id,
                    action = %request.action,
                    tx_hash = %execution.tx_hash,
                    "Lease lost after confirmation; leaving the append to reconciliation"
                );
                let reason = "execution lease lost".to_string();
                self.hand_off(transfer_id, Some(execution.tx_hash), &reason)
                    .await;
                return Err(fail(TransferError::RecordingDeferred {
                    tx_hash: execution.tx_hash,
                    reason,
                }));
            }

            match self.store.append(transfer_id, last_seq, event).await {
                Ok(seq) => {
                    debug!(transfer_id = %transfer_id, kind = %kind, seq, "Event appended");
                    last_seq = seq;
                    appended.push(seq);
                }
                Err(e) => {
                    error!(
                        transfer_id = %transfer_id,
                        action = %request.action,
                        tx_hash = %execution.tx_hash,
                        error = %e,
                        "Chain call confirmed but event append failed"
                    );
                    self.hand_off(transfer_id, Some(execution.tx_hash), &e.to_string())
                        .await;
                    return Err(fail(TransferError::RecordingDeferred {
                        tx_hash: execution.tx_hash,
                        reason: e.to_string(),
                    }));
                }
            }
        }

        let after = self
            .view(transfer_id)
            .await
            .map_err(|e| DispatchFailure::new(e, view.stage))?;

        if request.action == ActionKind::ExecuteTransfer {
            self.check_mint(&after, pair, &execution)?;
        }

        info!(
            transfer_id = %transfer_id,
            action = %request.action,
            tx_hash = %execution.tx_hash,
            already_applied = execution.already_applied,
            attempts = execution.attempts,
            state = %after.stage,
            "Action confirmed"
        );

        Ok(ExecutionResult {
            transfer_id: transfer_id.clone(),
            action: request.action,
            tx_hash: execution.tx_hash,
            block_number: execution.block_number,
            state: after.stage,
            appended,
        })
    }

    /// Tokens must be minted exactly when the pair settles tokenized
    fn check_mint(
        &self,
        after: &TransferView,
        pair: &ResolvedPair,
        execution: &Execution,
    ) -> Result<(), DispatchFailure> {
        match (pair.tier, execution.minted()) {
            (SettlementTier::Standard, true) => {
                error!(
                    transfer_id = ?after.transfer_id,
                    tx_hash = %execution.tx_hash,
                    "Contract minted tokens on a standard-tier transfer"
                );
                Err(DispatchFailure::new(
                    TransferError::UnexpectedMint {
                        tx_hash: execution.tx_hash,
                    },
                    after.stage,
                ))
            }
            (SettlementTier::Tokenized, false) => {
                warn!(
                    transfer_id = ?after.transfer_id,
                    tx_hash = %execution.tx_hash,
                    "Tokenized pair executed without a mint; settling at standard tier"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn record_failure(
        &self,
        view: &TransferView,
        request: &ActionRequest,
        guard: &TransferLockGuard,
        error: ExecutionError,
    ) -> DispatchFailure {
        let transfer_id = &request.transfer_id;

        let pending = match &error {
            ExecutionError::ConfirmationTimeout { tx_hash }
            | ExecutionError::Unconfirmed { tx_hash, .. } => Some(*tx_hash),
            _ => None,
        };

        // Outcome unknown: record nothing, let reconciliation look at the chain
        if let Some(tx_hash) = pending {
            warn!(
                transfer_id = %transfer_id,
                action = %request.action,
                tx_hash = %tx_hash,
                error = %error,
                "Outcome unknown; handing off to reconciliation"
            );
            self.hand_off(transfer_id, Some(tx_hash), &error.to_string())
                .await;
            return DispatchFailure::new(error.into(), view.stage);
        }

        let err: TransferError = error.into();
        warn!(
            transfer_id = %transfer_id,
            action = %request.action,
            code = err.code(),
            error = %err,
            "Submission failed"
        );

        let failed = TransferEvent::new(
            EventKind::Failed(request.action),
            Author::Custodian(request.initiator.clone()),
            EventPayload::Failure {
                action: request.action,
                code: err.code().to_string(),
                error: err.to_string(),
                retryable: err.is_retryable(),
            },
        );
        if !guard.is_held() {
            warn!(transfer_id = %transfer_id, "Lease lost; failure event not recorded");
        } else if let Err(e) = self.store.append(transfer_id, view.last_seq, failed).await {
            warn!(transfer_id = %transfer_id, error = %e, "Could not record failure event");
        }

        DispatchFailure::new(err, view.stage)
    }

    async fn hand_off(&self, transfer_id: &TransferId, tx_hash: Option<TxHash>, reason: &str) {
        let Some(tx) = &self.reconciler else {
            warn!(transfer_id = %transfer_id, "No reconciliation queue configured");
            return;
        };
        let request = ReconcileRequest {
            transfer_id: transfer_id.clone(),
            tx_hash,
            reason: reason.to_string(),
        };
        if tx.send(request).await.is_err() {
            error!(transfer_id = %transfer_id, "Reconciliation queue closed");
        }
    }
}
