//! Reconciliation / Recovery Service
//!
//! Compares the contract's view of a transfer with the event log and repairs
//! the log (never the chain). The case it exists for: the transaction
//! confirmed but the event append never happened. Missing events are
//! synthesized from the contract's own logs, so every repaired event carries
//! the real transaction hash, block number and block time. Block time, not
//! repair time, is what the timeout window is judged against.
//!
//! Idempotent by `(event kind, tx hash)`: running it twice appends nothing
//! the second time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chain::{ContractClient, ContractEvent, ContractLog};
use crate::core_types::{AuditHash, TransferId, TxHash};
use crate::money;

use super::audit::AuditStore;
use super::error::TransferError;
use super::event::{Author, ChainRef, EventKind, EventPayload, TransferEvent};
use super::lock::TransferLocks;
use super::protocol::{self, ContractState};
use super::state::{TimeoutPolicy, TransferStage, compute_state};
use super::store::EventStore;
use super::types::{FinancialDetails, SettlementTier};

/// Build the log event for a confirmed contract event
pub fn event_from_chain(
    event: &ContractEvent,
    author: Author,
    chain: ChainRef,
    timestamp: DateTime<Utc>,
) -> Result<TransferEvent, TransferError> {
    let payload = match event {
        ContractEvent::PreparedBySender { wallet, .. }
        | ContractEvent::PreparedByReceiver { wallet, .. } => EventPayload::Agreement { wallet: *wallet },
        ContractEvent::FinancialDetailsProvided {
            gross,
            federal,
            state,
            ..
        } => EventPayload::Financials(FinancialDetails::new(
            money::from_minor_units(*gross)?,
            money::from_minor_units(*federal)?,
            money::from_minor_units(*state)?,
        )),
        ContractEvent::Executed {
            tokenized,
            net_amount,
            ..
        } => EventPayload::Execution {
            tier: if *tokenized {
                SettlementTier::Tokenized
            } else {
                SettlementTier::Standard
            },
            net_amount: money::from_minor_units(*net_amount)?,
        },
        ContractEvent::TokensMinted { amount } | ContractEvent::TokensBurned { amount, .. } => {
            EventPayload::Tokens {
                amount: money::from_minor_units(*amount)?,
            }
        }
        ContractEvent::SettlementRecorded { .. }
        | ContractEvent::ReceiptConfirmed { .. }
        | ContractEvent::Cancelled { .. }
        | ContractEvent::Expired => EventPayload::Empty,
    };

    Ok(TransferEvent::new(event.event_kind(), author, payload)
        .at(timestamp)
        .with_chain(chain))
}

/// Request to reconcile one transfer, sent by the dispatcher when it could
/// not record an outcome itself
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub transfer_id: TransferId,
    pub tx_hash: Option<TxHash>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub transfer_id: TransferId,
    pub local_stage: TransferStage,
    pub chain_state: ContractState,
    pub drift_detected: bool,
    pub repaired: bool,
    /// Sequence numbers of synthesized events
    pub appended: Vec<u64>,
    /// On-chain reference hashes with no off-chain audit record
    pub missing_audit: Vec<AuditHash>,
    /// Drift that could not be repaired from chain data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unresolved: Option<String>,
}

pub struct ReconciliationService {
    store: Arc<dyn EventStore>,
    audit: Arc<dyn AuditStore>,
    client: Arc<dyn ContractClient>,
    locks: TransferLocks,
    policy: TimeoutPolicy,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn EventStore>,
        audit: Arc<dyn AuditStore>,
        client: Arc<dyn ContractClient>,
        locks: TransferLocks,
        policy: TimeoutPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            client,
            locks,
            policy,
        }
    }

    pub async fn reconcile(&self, transfer_id: &TransferId) -> Result<ReconcileReport, TransferError> {
        let _guard = self.locks.acquire(transfer_id).await?;

        let events = self.store.read(transfer_id).await?;
        let before = compute_state(&events, &self.policy, None);
        if !before.exists() {
            return Err(TransferError::TransferNotFound(transfer_id.clone()));
        }

        let key = transfer_id.chain_key();
        let chain_state = self.client.transfer_state(&key).await?;
        let logs = self.client.transfer_logs(&key).await?;

        let recorded: FxHashSet<(EventKind, TxHash)> = events
            .iter()
            .filter_map(|e| e.event.tx_hash().map(|tx| (e.event.kind, tx)))
            .collect();

        let missing: Vec<&ContractLog> = logs
            .iter()
            .filter(|l| !recorded.contains(&(l.event.event_kind(), l.tx_hash)))
            .collect();

        let missing_audit = self.check_audit_trail(transfer_id, &logs).await?;

        let drift_detected = !protocol::states_agree(before.stage, chain_state) || !missing.is_empty();
        if !drift_detected {
            debug!(transfer_id = %transfer_id, state = %chain_state, "No drift");
            return Ok(ReconcileReport {
                transfer_id: transfer_id.clone(),
                local_stage: before.stage,
                chain_state,
                drift_detected,
                repaired: false,
                appended: Vec::new(),
                missing_audit,
                unresolved: None,
            });
        }

        warn!(
            transfer_id = %transfer_id,
            local = %before.stage,
            chain = %chain_state,
            missing = missing.len(),
            "Drift between event log and contract"
        );

        let mut appended = Vec::new();
        let mut last_seq = before.last_seq;
        for log in missing {
            let chain = ChainRef {
                tx_hash: log.tx_hash,
                block_number: log.block_number,
                audit_hash: log.event.reference(),
                recovered: true,
            };
            let event = event_from_chain(&log.event, Author::Platform, chain, log.block_timestamp)?;
            let kind = event.kind;
            last_seq = self.store.append(transfer_id, last_seq, event).await?;
            info!(
                transfer_id = %transfer_id,
                kind = %kind,
                tx_hash = %log.tx_hash,
                block = log.block_number,
                seq = last_seq,
                "Recovered event from chain"
            );
            appended.push(last_seq);
        }

        let after = compute_state(&self.store.read(transfer_id).await?, &self.policy, None);
        let repaired = protocol::states_agree(after.stage, chain_state);
        let unresolved = if repaired {
            None
        } else {
            let detail = format!(
                "log at {} after repair, contract at {}",
                after.stage, chain_state
            );
            error!(transfer_id = %transfer_id, detail = %detail, "Drift not repairable from chain data");
            Some(detail)
        };

        Ok(ReconcileReport {
            transfer_id: transfer_id.clone(),
            local_stage: after.stage,
            chain_state,
            drift_detected,
            repaired,
            appended,
            missing_audit,
            unresolved,
        })
    }

    async fn check_audit_trail(
        &self,
        transfer_id: &TransferId,
        logs: &[ContractLog],
    ) -> Result<Vec<AuditHash>, TransferError> {
        let mut missing = Vec::new();
        for hash in logs.iter().filter_map(|l| l.event.reference()) {
            if missing.contains(&hash) {
                continue;
            }
            if self.audit.get(&hash).await?.is_none() {
                error!(
                    transfer_id = %transfer_id,
                    audit_hash = %hash,
                    "On-chain reference has no audit record"
                );
                missing.push(hash);
            }
        }
        Ok(missing)
    }

    /// Reconcile up to `batch_size` transfers that are not closed on record.
    /// Returns how many were repaired.
    ///
    /// A transfer timed out only by the local clock is still a candidate: the
    /// chain may hold events mined inside the window that never reached the
    /// log.
    pub async fn scan(&self, batch_size: usize) -> Result<usize, TransferError> {
        let mut repaired = 0;
        let mut checked = 0;

        for transfer_id in self.store.list_transfer_ids().await? {
            if checked >= batch_size {
                break;
            }
            let events = self.store.read(&transfer_id).await?;
            let view = compute_state(&events, &self.policy, None);
            let expired_on_chain = events.iter().any(|e| e.event.kind == EventKind::Expired);
            if !view.exists()
                || matches!(view.stage, TransferStage::Settled | TransferStage::Cancelled)
                || expired_on_chain
            {
                continue;
            }
            checked += 1;

            match self.reconcile(&transfer_id).await {
                Ok(report) if report.repaired => repaired += 1,
                Ok(_) => {}
                Err(e) => warn!(transfer_id = %transfer_id, error = %e, "Reconcile failed"),
            }
        }

        if repaired > 0 {
            info!(checked, repaired, "Reconciliation scan repaired transfers");
        }
        Ok(repaired)
    }
}

/// Configuration for the reconciliation worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub scan_interval: Duration,
    /// Maximum transfers to check per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Background worker: periodic scans plus on-demand requests from the
/// dispatcher
pub struct ReconciliationWorker {
    service: Arc<ReconciliationService>,
    requests: mpsc::Receiver<ReconcileRequest>,
    config: WorkerConfig,
}

impl ReconciliationWorker {
    pub fn new(
        service: Arc<ReconciliationService>,
        requests: mpsc::Receiver<ReconcileRequest>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            service,
            requests,
            config,
        }
    }

    /// Handle one dispatcher hand-off
    async fn handle(&self, request: ReconcileRequest) {
        info!(
            transfer_id = %request.transfer_id,
            tx_hash = ?request.tx_hash,
            reason = %request.reason,
            "Reconciliation requested"
        );
        match self.service.reconcile(&request.transfer_id).await {
            Ok(report) if report.unresolved.is_some() || !report.missing_audit.is_empty() => {
                warn!(transfer_id = %request.transfer_id, ?report, "Reconciliation left open issues");
            }
            Ok(report) => {
                debug!(transfer_id = %request.transfer_id, ?report, "Reconciliation done");
            }
            Err(e) => error!(transfer_id = %request.transfer_id, error = %e, "Reconciliation failed"),
        }
    }

    /// Run until the request channel closes
    pub async fn run(mut self) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting reconciliation worker"
        );

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.service.scan(self.config.batch_size).await {
                        error!(error = %e, "Reconciliation scan failed");
                    }
                }
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }

        info!("Reconciliation worker stopped");
    }
}
