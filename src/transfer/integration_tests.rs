//! End-to-end rollover flows against the simulated contract.
//!
//! Each test wires the real dispatcher, reconciler, lock table and stores
//! around a `SimulatedChain`, then drives custodian actions through
//! `ActionDispatcher::dispatch` exactly as the HTTP layer does.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::chain::confirmation::ConfirmationConfig;
use crate::chain::mock::{ChainFault, PROXY_WALLET, SimulatedChain};
use crate::chain::{
    ExecutionAdapter, NonceAllocator, ProxyExecutor, RetryConfig, SelfSignedExecutor,
};
use crate::core_types::{CustodianId, TransferId, TxHash, WalletAddress};
use crate::transfer::audit::{AuditStore, InMemoryAuditStore};
use crate::transfer::capability::{CapabilityResolver, StaticCapabilityRegistry};
use crate::transfer::dispatcher::ActionDispatcher;
use crate::transfer::error::{DispatchFailure, TransferError};
use crate::transfer::event::{EventKind, RecordedEvent, TransferEvent};
use crate::transfer::lock::{LockConfig, TransferLocks};
use crate::transfer::protocol::ContractState;
use crate::transfer::reconcile::{ReconcileRequest, ReconciliationService, ReconciliationWorker, WorkerConfig};
use crate::transfer::state::{TimeoutPolicy, TransferStage};
use crate::transfer::store::{EventStore, InMemoryEventStore};
use crate::transfer::types::{
    AccountType, ActionKind, ActionRequest, CapabilityRecord, CreateTransferRequest,
    ExecutionMode, ExecutionResult, FinancialDetails, SettlementTier,
};

const SENDER: &str = "alpha-trust";
const RECEIVER: &str = "beta-custody";

// ============================================================================
// Harness
// ============================================================================

/// Event store that can be told to reject appends, standing in for a crash
/// between chain confirmation and the write
#[derive(Default)]
struct FlakyEventStore {
    inner: InMemoryEventStore,
    failing: AtomicBool,
}

impl FlakyEventStore {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for FlakyEventStore {
    async fn append(
        &self,
        transfer_id: &TransferId,
        expected_last_seq: u64,
        event: TransferEvent,
    ) -> Result<u64, TransferError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransferError::DatabaseError("connection reset by peer".to_string()));
        }
        self.inner.append(transfer_id, expected_last_seq, event).await
    }

    async fn read_from(
        &self,
        transfer_id: &TransferId,
        after_seq: u64,
    ) -> Result<Vec<RecordedEvent>, TransferError> {
        self.inner.read_from(transfer_id, after_seq).await
    }

    async fn list_transfer_ids(&self) -> Result<Vec<TransferId>, TransferError> {
        self.inner.list_transfer_ids().await
    }
}

struct Harness {
    chain: Arc<SimulatedChain>,
    store: Arc<FlakyEventStore>,
    audit: Arc<InMemoryAuditStore>,
    registry: Arc<StaticCapabilityRegistry>,
    locks: TransferLocks,
    dispatcher: Arc<ActionDispatcher>,
    reconciler: Arc<ReconciliationService>,
    handoffs: mpsc::Receiver<ReconcileRequest>,
}

impl Harness {
    /// Both custodians proxied, at the given tiers
    fn new(sender_tier: SettlementTier, receiver_tier: SettlementTier) -> Self {
        let harness = Self::empty();
        harness.register(SENDER, 1, ExecutionMode::PlatformProxy, sender_tier);
        harness.register(RECEIVER, 2, ExecutionMode::PlatformProxy, receiver_tier);
        harness
    }

    fn standard() -> Self {
        Self::new(SettlementTier::Standard, SettlementTier::Standard)
    }

    /// Standard pair with a custom lease table and timeout window
    fn standard_with(lock: LockConfig, policy: TimeoutPolicy) -> Self {
        let harness = Self::configured(lock, policy);
        harness.register(SENDER, 1, ExecutionMode::PlatformProxy, SettlementTier::Standard);
        harness.register(RECEIVER, 2, ExecutionMode::PlatformProxy, SettlementTier::Standard);
        harness
    }

    fn empty() -> Self {
        Self::configured(
            LockConfig {
                lease: Duration::from_secs(30),
                wait: Duration::from_secs(5),
                retry_interval: Duration::from_millis(2),
            },
            TimeoutPolicy::default(),
        )
    }

    fn configured(lock: LockConfig, policy: TimeoutPolicy) -> Self {
        let chain = Arc::new(SimulatedChain::new());
        let store = Arc::new(FlakyEventStore::default());
        let audit = Arc::new(InMemoryAuditStore::new());
        let registry = Arc::new(StaticCapabilityRegistry::new());
        let locks = TransferLocks::new(lock);

        let adapter = ExecutionAdapter::new(
            chain.clone(),
            NonceAllocator::spawn(chain.clone()),
            Arc::new(SelfSignedExecutor::new(chain.clone())),
            Arc::new(ProxyExecutor::new(PROXY_WALLET, chain.clone())),
        )
        .with_retry(RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        })
        .with_confirmation(ConfirmationConfig {
            timeout: Duration::from_millis(80),
            poll_interval: Duration::from_millis(2),
            max_poll_interval: Duration::from_millis(10),
        });

        let (tx, handoffs) = mpsc::channel(16);
        let dispatcher = ActionDispatcher::new(
            store.clone(),
            audit.clone(),
            CapabilityResolver::new(registry.clone(), chain.clone()),
            Arc::new(adapter),
            locks.clone(),
            policy,
        )
        .with_reconciler(tx);

        let reconciler = Arc::new(ReconciliationService::new(
            store.clone(),
            audit.clone(),
            chain.clone(),
            locks.clone(),
            policy,
        ));

        Self {
            chain,
            store,
            audit,
            registry,
            locks,
            dispatcher: Arc::new(dispatcher),
            reconciler,
            handoffs,
        }
    }

    /// Registry row plus a matching row in the contract's authorization table
    fn register(&self, id: &str, byte: u8, mode: ExecutionMode, tier: SettlementTier) -> CapabilityRecord {
        let record = CapabilityRecord {
            custodian_id: CustodianId::new(id),
            wallet: WalletAddress([byte; 20]),
            execution_mode: mode,
            tier,
        };
        self.registry.upsert(record.clone());
        self.chain
            .authorize(record.wallet, true, tier == SettlementTier::Tokenized);
        record
    }

    async fn open(&self, id: &str) -> TransferId {
        let view = self
            .dispatcher
            .create_transfer(CreateTransferRequest {
                transfer_id: Some(TransferId::new(id)),
                sender: CustodianId::new(SENDER),
                receiver: CustodianId::new(RECEIVER),
                source_account_type: AccountType::Traditional401k,
                destination_account_type: AccountType::TraditionalIra,
                client_reference: None,
            })
            .await
            .unwrap();
        assert_eq!(view.stage, TransferStage::Created);
        TransferId::new(id)
    }

    async fn act(
        &self,
        id: &TransferId,
        action: ActionKind,
        who: &str,
    ) -> Result<ExecutionResult, DispatchFailure> {
        let mut request = ActionRequest::new(id.clone(), action, CustodianId::new(who));
        if action == ActionKind::ProvideFinancialDetails {
            request = request.with_financials(financials());
        }
        self.dispatcher.dispatch(request).await
    }

    /// Both agreements plus financials
    async fn open_ready(&self, id: &str) -> TransferId {
        let id = self.open(id).await;
        self.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();
        self.act(&id, ActionKind::AgreeReceive, RECEIVER).await.unwrap();
        let result = self
            .act(&id, ActionKind::ProvideFinancialDetails, SENDER)
            .await
            .unwrap();
        assert_eq!(result.state, TransferStage::FinancialsReady);
        id
    }

    async fn stage(&self, id: &TransferId) -> TransferStage {
        self.dispatcher.view(id).await.unwrap().stage
    }

    async fn kinds(&self, id: &TransferId) -> Vec<EventKind> {
        self.store
            .read(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event.kind)
            .collect()
    }
}

fn financials() -> FinancialDetails {
    FinancialDetails::new(
        Decimal::new(100_000_00, 2),
        Decimal::new(20_000_00, 2),
        Decimal::new(5_000_00, 2),
    )
}

// ============================================================================
// Scenario A / B: agreement and early financials
// ============================================================================

#[tokio::test]
async fn test_agreement_order_independent() {
    let h = Harness::standard();

    let a = h.open("RLV-A-1").await;
    h.act(&a, ActionKind::AgreeSend, SENDER).await.unwrap();
    let first = h.act(&a, ActionKind::AgreeReceive, RECEIVER).await.unwrap();

    let b = h.open("RLV-A-2").await;
    h.act(&b, ActionKind::AgreeReceive, RECEIVER).await.unwrap();
    let second = h.act(&b, ActionKind::AgreeSend, SENDER).await.unwrap();

    assert_eq!(first.state, TransferStage::BothAgreed);
    assert_eq!(second.state, TransferStage::BothAgreed);
    assert_eq!(h.chain.state_of(&a.chain_key()), ContractState::BothReady);
    assert_eq!(h.chain.state_of(&b.chain_key()), ContractState::BothReady);
}

#[tokio::test]
async fn test_financials_before_both_ready_rejected() {
    let h = Harness::standard();
    let id = h.open("RLV-B").await;
    h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();

    let failure = h
        .act(&id, ActionKind::ProvideFinancialDetails, SENDER)
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        TransferError::InvalidTransferState {
            actual: ContractState::SenderPrepared,
            ..
        }
    ));
    assert_eq!(failure.state, TransferStage::SenderAgreed);
    // Rejected locally: nothing sent, nothing appended
    assert_eq!(h.chain.submitted().len(), 1);
    assert_eq!(
        h.kinds(&id).await,
        vec![EventKind::TransferCreated, EventKind::SenderAgreed]
    );
}

// ============================================================================
// Scenario C: chain confirmed, append lost
// ============================================================================

#[tokio::test]
async fn test_lost_append_recovered_from_chain() {
    let mut h = Harness::standard();
    let id = h.open_ready("RLV-C").await;

    h.store.set_failing(true);
    let failure = h
        .act(&id, ActionKind::ExecuteTransfer, SENDER)
        .await
        .unwrap_err();
    h.store.set_failing(false);

    let tx_hash = match &failure.error {
        TransferError::RecordingDeferred { tx_hash, .. } => *tx_hash,
        other => panic!("unexpected error: {other:?}"),
    };
    assert_eq!(failure.state, TransferStage::FinancialsReady);
    assert_eq!(h.chain.state_of(&id.chain_key()), ContractState::Executed);
    assert_eq!(h.stage(&id).await, TransferStage::FinancialsReady);

    let handoff = h.handoffs.try_recv().unwrap();
    assert_eq!(handoff.transfer_id, id);
    assert_eq!(handoff.tx_hash, Some(tx_hash));

    let report = h.reconciler.reconcile(&id).await.unwrap();
    assert!(report.drift_detected);
    assert!(report.repaired);
    assert_eq!(report.appended.len(), 1);
    assert_eq!(report.local_stage, TransferStage::Executed);

    let events = h.store.read(&id).await.unwrap();
    let executed = events.last().unwrap();
    assert_eq!(executed.event.kind, EventKind::Executed);
    let chain = executed.event.chain.as_ref().unwrap();
    assert_eq!(chain.tx_hash, tx_hash);
    assert!(chain.recovered);
    assert_eq!(h.stage(&id).await, TransferStage::Executed);

    // The transfer carries on normally afterwards
    let settled = h.act(&id, ActionKind::RecordSettlement, SENDER).await.unwrap();
    assert_eq!(settled.state, TransferStage::Settled);
}

#[tokio::test]
async fn test_reconcile_twice_appends_once() {
    let h = Harness::standard();
    let id = h.open_ready("RLV-IDEM").await;

    h.store.set_failing(true);
    let _ = h.act(&id, ActionKind::ExecuteTransfer, SENDER).await;
    h.store.set_failing(false);

    let first = h.reconciler.reconcile(&id).await.unwrap();
    let second = h.reconciler.reconcile(&id).await.unwrap();
    assert_eq!(first.appended.len(), 1);
    assert!(!second.drift_detected);
    assert!(second.appended.is_empty());

    let view = h.dispatcher.view(&id).await.unwrap();
    assert!(view.duplicates.is_empty());
    assert_eq!(
        h.kinds(&id)
            .await
            .iter()
            .filter(|k| **k == EventKind::Executed)
            .count(),
        1
    );
}

// ============================================================================
// Scenario D: lost response, retry finds the applied transaction
// ============================================================================

#[tokio::test]
async fn test_retry_after_lost_response_sends_nothing_new() {
    let h = Harness::standard();
    let id = h.open("RLV-D").await;

    h.chain
        .push_fault(ChainFault::ApplyThenError("request timed out".into()));
    let result = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();

    assert_eq!(result.state, TransferStage::SenderAgreed);
    assert_eq!(h.chain.submitted().len(), 1);
    assert_eq!(result.tx_hash, h.chain.submitted()[0].tx_hash);
    assert_eq!(
        h.kinds(&id).await,
        vec![EventKind::TransferCreated, EventKind::SenderAgreed]
    );
}

#[tokio::test]
async fn test_retry_after_pending_confirmation_adopts_mined_tx() {
    let mut h = Harness::standard();
    let id = h.open("RLV-D-PENDING").await;

    h.chain.push_fault(ChainFault::HoldReceipt);
    let failure = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap_err();
    let pending = match failure.error {
        TransferError::ConfirmationPending { tx_hash } => tx_hash,
        other => panic!("unexpected error: {other:?}"),
    };
    assert!(h.handoffs.try_recv().is_ok());

    // The custodian retries before reconciliation has run
    let result = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();

    assert_eq!(result.state, TransferStage::SenderAgreed);
    assert_eq!(result.tx_hash, pending);
    assert_eq!(h.chain.send_attempts(), 1);
    assert_eq!(h.chain.submitted().len(), 1);
    assert_eq!(
        h.kinds(&id).await,
        vec![EventKind::TransferCreated, EventKind::SenderAgreed]
    );

    let events = h.store.read(&id).await.unwrap();
    let chain = events.last().unwrap().event.chain.as_ref().unwrap();
    assert_eq!(chain.tx_hash, pending);
    assert_eq!(chain.audit_hash, Some(h.chain.submitted()[0].reference));
    assert!(h.dispatcher.view(&id).await.unwrap().failures.is_empty());
}

// ============================================================================
// Tokenization gating
// ============================================================================

#[tokio::test]
async fn test_mixed_tier_settles_without_mint() {
    let h = Harness::new(SettlementTier::Tokenized, SettlementTier::Standard);
    let id = h.open_ready("RLV-MIXED").await;

    let executed = h.act(&id, ActionKind::ExecuteTransfer, RECEIVER).await.unwrap();
    assert_eq!(executed.state, TransferStage::Executed);
    assert_eq!(executed.appended.len(), 1);
    assert!(!h.kinds(&id).await.contains(&EventKind::Minted));
    assert_eq!(
        h.dispatcher.view(&id).await.unwrap().execution_tier,
        Some(SettlementTier::Standard)
    );

    let burn = h.act(&id, ActionKind::BurnTokens, RECEIVER).await.unwrap_err();
    assert!(matches!(burn.error, TransferError::InvalidTransferState { .. }));

    let settled = h.act(&id, ActionKind::ConfirmReceipt, RECEIVER).await.unwrap();
    assert_eq!(settled.state, TransferStage::Settled);
    assert_eq!(h.chain.state_of(&id.chain_key()), ContractState::Completed);
}

#[tokio::test]
async fn test_tokenized_pair_mints_then_burns() {
    let h = Harness::new(SettlementTier::Tokenized, SettlementTier::Tokenized);
    let id = h.open_ready("RLV-TOKEN").await;

    let executed = h.act(&id, ActionKind::ExecuteTransfer, SENDER).await.unwrap();
    assert_eq!(executed.state, TransferStage::Minted);
    assert_eq!(executed.appended.len(), 2);

    let settle = h.act(&id, ActionKind::RecordSettlement, SENDER).await.unwrap_err();
    assert!(matches!(settle.error, TransferError::InvalidTransferState { .. }));

    let burned = h.act(&id, ActionKind::BurnTokens, RECEIVER).await.unwrap();
    assert_eq!(burned.state, TransferStage::Settled);

    let report = h.reconciler.reconcile(&id).await.unwrap();
    assert!(!report.drift_detected);
}

#[tokio::test]
async fn test_unexpected_mint_is_an_error_not_a_log_line() {
    let h = Harness::standard();
    let id = h.open_ready("RLV-MINT").await;

    h.chain.push_fault(ChainFault::ForceMint);
    let failure = h
        .act(&id, ActionKind::ExecuteTransfer, SENDER)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransferError::UnexpectedMint { .. }));
    // What the chain did is still what the log says
    assert_eq!(failure.state, TransferStage::Minted);
    assert_eq!(h.stage(&id).await, TransferStage::Minted);
    assert_eq!(h.chain.state_of(&id.chain_key()), ContractState::Minted);
}

// ============================================================================
// Failure recording and hand-off
// ============================================================================

#[tokio::test]
async fn test_revert_recorded_as_failed_event() {
    let h = Harness::standard();
    let id = h.open("RLV-REVERT").await;

    h.chain.push_fault(ChainFault::RevertOnChain);
    let failure = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap_err();

    assert!(matches!(failure.error, TransferError::ContractRevert { .. }));
    assert!(!failure.error.is_retryable());
    assert_eq!(failure.state, TransferStage::Created);

    let view = h.dispatcher.view(&id).await.unwrap();
    assert_eq!(view.stage, TransferStage::Created);
    assert_eq!(view.failures.len(), 1);
    assert_eq!(view.failures[0].action, ActionKind::AgreeSend);
    assert_eq!(view.failures[0].code, "CONTRACT_REVERT");

    // A failed attempt does not block the next one
    let retry = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();
    assert_eq!(retry.state, TransferStage::SenderAgreed);
}

#[tokio::test]
async fn test_chain_outage_exhausts_retries() {
    let h = Harness::standard();
    let id = h.open("RLV-OUTAGE").await;

    h.chain.set_offline(true);
    let failure = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap_err();
    h.chain.set_offline(false);

    // The resolver reads the chain first, so the outage surfaces there
    assert!(failure.error.is_retryable());
    assert_eq!(failure.state, TransferStage::Created);
    assert_eq!(h.kinds(&id).await, vec![EventKind::TransferCreated]);
}

#[tokio::test]
async fn test_unconfirmed_transaction_handed_to_reconciliation() {
    let mut h = Harness::standard();
    let id = h.open("RLV-PENDING").await;

    h.chain.push_fault(ChainFault::HoldReceipt);
    let failure = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap_err();

    assert!(matches!(failure.error, TransferError::ConfirmationPending { .. }));
    assert_eq!(failure.state, TransferStage::Created);
    // Outcome unknown: no success, no failure event
    assert_eq!(h.kinds(&id).await, vec![EventKind::TransferCreated]);

    let handoff = h.handoffs.try_recv().unwrap();
    assert_eq!(handoff.transfer_id, id);

    h.chain.release_receipts();
    let report = h.reconciler.reconcile(&id).await.unwrap();
    assert!(report.repaired);
    assert_eq!(h.stage(&id).await, TransferStage::SenderAgreed);
}

#[tokio::test]
async fn test_worker_repairs_handed_off_transfer() {
    let h = Harness::standard();
    let id = h.open("RLV-WORKER").await;

    let Harness {
        chain,
        dispatcher,
        reconciler,
        handoffs,
        ..
    } = h;

    let worker = ReconciliationWorker::new(
        reconciler,
        handoffs,
        WorkerConfig {
            scan_interval: Duration::from_secs(3600),
            batch_size: 10,
        },
    );
    let handle = tokio::spawn(worker.run());

    chain.push_fault(ChainFault::HoldReceipt);
    let failure = dispatcher
        .dispatch(ActionRequest::new(
            id.clone(),
            ActionKind::AgreeSend,
            CustodianId::new(SENDER),
        ))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, TransferError::ConfirmationPending { .. }));

    let mut stage = TransferStage::Created;
    for _ in 0..200 {
        stage = dispatcher.view(&id).await.unwrap().stage;
        if stage == TransferStage::SenderAgreed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(stage, TransferStage::SenderAgreed);

    handle.abort();
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_dispatch_single_winner() {
    let h = Harness::standard();
    let id = h.open("RLV-RACE").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let dispatcher = h.dispatcher.clone();
        let request = ActionRequest::new(id.clone(), ActionKind::AgreeSend, CustodianId::new(SENDER));
        handles.push(tokio::spawn(async move { dispatcher.dispatch(request).await }));
    }

    let mut wins = 0;
    for outcome in join_all(handles).await {
        match outcome.unwrap() {
            Ok(result) => {
                assert_eq!(result.state, TransferStage::SenderAgreed);
                wins += 1;
            }
            Err(failure) => assert!(
                matches!(failure.error, TransferError::InvalidTransferState { .. }),
                "unexpected error: {:?}",
                failure.error
            ),
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(h.chain.submitted().len(), 1);
    assert_eq!(h.dispatcher.view(&id).await.unwrap().last_seq, 2);
    assert!(!h.locks.is_locked(&id));
}

// ============================================================================
// Lifecycle exits
// ============================================================================

#[tokio::test]
async fn test_cancel_is_terminal() {
    let h = Harness::standard();
    let id = h.open("RLV-CANCEL").await;
    h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();

    let cancelled = h.act(&id, ActionKind::CancelTransfer, RECEIVER).await.unwrap();
    assert_eq!(cancelled.state, TransferStage::Cancelled);
    assert_eq!(h.chain.state_of(&id.chain_key()), ContractState::Cancelled);

    let late = h.act(&id, ActionKind::AgreeReceive, RECEIVER).await.unwrap_err();
    assert!(matches!(late.error, TransferError::InvalidTransferState { .. }));
    assert_eq!(late.state, TransferStage::Cancelled);
}

#[tokio::test]
async fn test_contract_expiry_recorded_by_reconcile() {
    let h = Harness::standard();
    let id = h.open("RLV-EXPIRE").await;
    h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();

    let expiry_tx = h.chain.expire(id.chain_key());
    let report = h.reconciler.reconcile(&id).await.unwrap();

    assert!(report.repaired);
    assert_eq!(report.local_stage, TransferStage::TimedOut);
    let events = h.store.read(&id).await.unwrap();
    let expired = events.last().unwrap();
    assert_eq!(expired.event.kind, EventKind::Expired);
    assert_eq!(expired.event.tx_hash(), Some(expiry_tx));
}

/// Window short enough to elapse inside a test
fn short_window() -> TimeoutPolicy {
    TimeoutPolicy {
        window: chrono::Duration::milliseconds(300),
    }
}

/// Agreement mined inside the window whose append failed
async fn agreement_lost_inside_window(h: &Harness, id: &str) -> (TransferId, TxHash) {
    let id = h.open(id).await;
    h.store.set_failing(true);
    let failure = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap_err();
    h.store.set_failing(false);
    let tx_hash = match failure.error {
        TransferError::RecordingDeferred { tx_hash, .. } => tx_hash,
        other => panic!("unexpected error: {other:?}"),
    };
    (id, tx_hash)
}

#[tokio::test]
async fn test_repair_after_deadline_keeps_in_window_event() {
    let h = Harness::standard_with(
        LockConfig {
            lease: Duration::from_secs(30),
            wait: Duration::from_secs(5),
            retry_interval: Duration::from_millis(2),
        },
        short_window(),
    );
    let (id, tx_hash) = agreement_lost_inside_window(&h, "RLV-LATE-REPAIR").await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.stage(&id).await, TransferStage::TimedOut);

    let report = h.reconciler.reconcile(&id).await.unwrap();
    assert!(report.repaired);
    assert_eq!(report.appended.len(), 1);
    assert_eq!(report.local_stage, TransferStage::SenderAgreed);

    let events = h.store.read(&id).await.unwrap();
    let view = crate::transfer::state::compute_state(&events, &short_window(), None);
    assert_eq!(view.stage, TransferStage::SenderAgreed);
    assert!(view.sender_agreed);
    assert!(view.ignored.is_empty());

    // Stamped with block time, inside the window
    let recovered = &events.last().unwrap().event;
    assert_eq!(recovered.tx_hash(), Some(tx_hash));
    assert!(recovered.timestamp < view.deadline.unwrap());
}

#[tokio::test]
async fn test_scan_checks_transfers_timed_out_by_clock() {
    let h = Harness::standard_with(
        LockConfig {
            lease: Duration::from_secs(30),
            wait: Duration::from_secs(5),
            retry_interval: Duration::from_millis(2),
        },
        short_window(),
    );
    let (id, _) = agreement_lost_inside_window(&h, "RLV-LATE-SCAN").await;
    let cancelled = h.open("RLV-LATE-CANCELLED").await;
    h.act(&cancelled, ActionKind::AgreeSend, SENDER).await.unwrap();
    h.act(&cancelled, ActionKind::CancelTransfer, RECEIVER)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(h.reconciler.scan(10).await.unwrap(), 1);
    assert_eq!(
        h.kinds(&id).await,
        vec![EventKind::TransferCreated, EventKind::SenderAgreed]
    );
    // A second scan finds nothing left to repair
    assert_eq!(h.reconciler.scan(10).await.unwrap(), 0);
}

// ============================================================================
// Execution lease
// ============================================================================

#[tokio::test]
async fn test_lease_renewed_while_confirmation_outlives_it() {
    let h = Harness::standard_with(
        LockConfig {
            lease: Duration::from_millis(30),
            wait: Duration::from_millis(10),
            retry_interval: Duration::from_millis(2),
        },
        TimeoutPolicy::default(),
    );
    let id = h.open("RLV-LEASE").await;

    // Confirmation polling runs for 80ms, well past the 30ms lease
    h.chain.push_fault(ChainFault::HoldReceipt);
    let dispatcher = h.dispatcher.clone();
    let request = ActionRequest::new(id.clone(), ActionKind::AgreeSend, CustodianId::new(SENDER));
    let in_flight = tokio::spawn(async move { dispatcher.dispatch(request).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let contender = h.locks.acquire(&id).await;
    assert!(matches!(contender, Err(TransferError::LockTimeout(_))));

    let failure = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(failure.error, TransferError::ConfirmationPending { .. }));
    assert!(!h.locks.is_locked(&id));
}

// ============================================================================
// Validation and capabilities
// ============================================================================

#[tokio::test]
async fn test_duplicate_create_rejected() {
    let h = Harness::standard();
    h.open("RLV-DUP").await;
    let err = h
        .dispatcher
        .create_transfer(CreateTransferRequest {
            transfer_id: Some(TransferId::new("RLV-DUP")),
            sender: CustodianId::new(SENDER),
            receiver: CustodianId::new(RECEIVER),
            source_account_type: AccountType::RothIra,
            destination_account_type: AccountType::RothIra,
            client_reference: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::DuplicateTransfer(_)));
}

#[tokio::test]
async fn test_outsider_cannot_act() {
    let h = Harness::standard();
    let id = h.open("RLV-OUTSIDER").await;
    h.register("gamma", 3, ExecutionMode::PlatformProxy, SettlementTier::Standard);

    let failure = h.act(&id, ActionKind::CancelTransfer, "gamma").await.unwrap_err();
    assert!(matches!(failure.error, TransferError::NotAParty { .. }));
    assert!(h.chain.submitted().is_empty());
}

#[tokio::test]
async fn test_capability_mismatch_blocks_before_submission() {
    let h = Harness::standard();
    let id = h.open("RLV-CAP").await;
    // Registry now claims tokenized, the contract does not
    h.registry.upsert(CapabilityRecord {
        custodian_id: CustodianId::new(SENDER),
        wallet: WalletAddress([1; 20]),
        execution_mode: ExecutionMode::PlatformProxy,
        tier: SettlementTier::Tokenized,
    });

    let failure = h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap_err();
    assert!(matches!(failure.error, TransferError::CapabilityMismatch { .. }));
    assert!(h.chain.submitted().is_empty());
    assert_eq!(h.kinds(&id).await, vec![EventKind::TransferCreated]);
    assert!(h.audit.is_empty());
}

// ============================================================================
// Audit trail
// ============================================================================

#[tokio::test]
async fn test_audit_record_behind_every_reference() {
    let h = Harness::empty();
    h.register(SENDER, 1, ExecutionMode::PlatformProxy, SettlementTier::Standard);
    let receiver = h.register(RECEIVER, 2, ExecutionMode::SelfSigned, SettlementTier::Standard);
    let id = h.open("RLV-AUDIT").await;

    h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();
    h.act(&id, ActionKind::AgreeReceive, RECEIVER).await.unwrap();

    let submitted = h.chain.submitted();
    assert_eq!(submitted.len(), 2);

    let proxied = h.audit.get(&submitted[0].reference).await.unwrap().unwrap();
    assert!(proxied.verify(&submitted[0].reference));
    assert!(proxied.proxy_initiated);
    assert_eq!(proxied.executing_wallet, PROXY_WALLET);
    assert_eq!(proxied.transfer_id, id);

    let direct = h.audit.get(&submitted[1].reference).await.unwrap().unwrap();
    assert!(!direct.proxy_initiated);
    assert_eq!(direct.executing_wallet, receiver.wallet);
    assert_eq!(submitted[1].from, receiver.wallet);

    let view = h.dispatcher.view(&id).await.unwrap();
    assert_eq!(view.last_tx_hash, Some(submitted[1].tx_hash));
}

#[tokio::test]
async fn test_reconcile_flags_reference_without_record() {
    let h = Harness::standard();
    let id = h.open("RLV-NOAUDIT").await;
    h.act(&id, ActionKind::AgreeSend, SENDER).await.unwrap();

    // A reconciler reading an audit store that never saw the call
    let blind = ReconciliationService::new(
        h.store.clone(),
        Arc::new(InMemoryAuditStore::new()),
        h.chain.clone(),
        h.locks.clone(),
        TimeoutPolicy::default(),
    );
    let report = blind.reconcile(&id).await.unwrap();
    assert!(!report.drift_detected);
    assert_eq!(report.missing_audit, vec![h.chain.submitted()[0].reference]);
}

// ============================================================================
// Event feed
// ============================================================================

#[tokio::test]
async fn test_event_feed_tails_the_log() {
    let h = Harness::standard();
    let id = h.open_ready("RLV-FEED").await;

    let all = h.dispatcher.events(&id, 0).await.unwrap();
    assert_eq!(all.len(), 4);

    let tail = h.dispatcher.events(&id, 2).await.unwrap();
    let seqs: Vec<u64> = tail.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![3, 4]);
    assert_eq!(tail[1].event.kind, EventKind::FinancialDetailsProvided);

    assert!(h.dispatcher.events(&id, 4).await.unwrap().is_empty());
}
