//! Executors and the execution retry loop
//!
//! `self-signed` and `platform-proxy` differ only in which wallet signs and
//! pays gas. That difference is the [`Executor`] trait; everything else
//! (nonce allocation, submission, retry, confirmation) is shared by
//! [`ExecutionAdapter`], which is the only place execution mode is looked at.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core_types::{TxHash, WalletAddress};
use crate::transfer::types::{CapabilityRecord, ExecutionMode};

use super::abi::{self, CallSpec};
use super::confirmation::{self, Confirmation, ConfirmationConfig};
use super::retry::{ErrorClass, RetryAction, RetryConfig};
use super::{
    ChainError, ContractClient, ContractEvent, ExecutionError, NonceAllocator, TransactionSigner,
    UnsignedTransaction, raw_transaction_hash,
};

#[async_trait]
pub trait Executor: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Wallet that signs and pays gas for `custodian`'s calls
    fn signing_wallet(&self, custodian: &CapabilityRecord) -> WalletAddress;

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<String, ChainError>;
}

/// The custodian signs with its own key and pays its own gas
pub struct SelfSignedExecutor {
    signer: Arc<dyn TransactionSigner>,
}

impl SelfSignedExecutor {
    pub fn new(signer: Arc<dyn TransactionSigner>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl Executor for SelfSignedExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::SelfSigned
    }

    fn signing_wallet(&self, custodian: &CapabilityRecord) -> WalletAddress {
        custodian.wallet
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<String, ChainError> {
        self.signer.sign(tx).await
    }
}

/// The platform wallet signs and pays gas; the custodian's wallet is carried
/// in the call's `onBehalfOf` argument
pub struct ProxyExecutor {
    proxy_wallet: WalletAddress,
    signer: Arc<dyn TransactionSigner>,
}

impl ProxyExecutor {
    pub fn new(proxy_wallet: WalletAddress, signer: Arc<dyn TransactionSigner>) -> Self {
        Self {
            proxy_wallet,
            signer,
        }
    }
}

#[async_trait]
impl Executor for ProxyExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::PlatformProxy
    }

    fn signing_wallet(&self, _custodian: &CapabilityRecord) -> WalletAddress {
        self.proxy_wallet
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<String, ChainError> {
        self.signer.sign(tx).await
    }
}

/// A confirmed contract call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    /// Contract events the transaction emitted for this transfer
    pub events: Vec<ContractEvent>,
    /// Found on chain by the pre-submit check instead of being submitted
    pub already_applied: bool,
    pub attempts: u32,
}

impl Execution {
    pub fn minted(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, ContractEvent::TokensMinted { .. }))
    }
}

enum Attempt {
    AlreadyApplied(Execution),
    Submitted(TxHash),
}

/// Submission failure, with the hash of the transaction if one was signed
struct SubmitFailure {
    error: ChainError,
    tx_hash: Option<TxHash>,
}

impl From<ChainError> for SubmitFailure {
    fn from(error: ChainError) -> Self {
        Self {
            error,
            tx_hash: None,
        }
    }
}

pub struct ExecutionAdapter {
    client: Arc<dyn ContractClient>,
    nonces: NonceAllocator,
    self_signed: Arc<dyn Executor>,
    proxy: Arc<dyn Executor>,
    retry: RetryConfig,
    confirmation: ConfirmationConfig,
}

impl ExecutionAdapter {
    pub fn new(
        client: Arc<dyn ContractClient>,
        nonces: NonceAllocator,
        self_signed: Arc<dyn Executor>,
        proxy: Arc<dyn Executor>,
    ) -> Self {
        Self {
            client,
            nonces,
            self_signed,
            proxy,
            retry: RetryConfig::default(),
            confirmation: ConfirmationConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationConfig) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn client(&self) -> &Arc<dyn ContractClient> {
        &self.client
    }

    /// Wallet that will sign `custodian`'s calls
    pub fn signing_wallet(&self, custodian: &CapabilityRecord) -> WalletAddress {
        self.executor_for(custodian.execution_mode)
            .signing_wallet(custodian)
    }

    fn executor_for(&self, mode: ExecutionMode) -> &dyn Executor {
        match mode {
            ExecutionMode::SelfSigned => self.self_signed.as_ref(),
            ExecutionMode::PlatformProxy => self.proxy.as_ref(),
        }
    }

    /// Submit `spec` on behalf of `custodian` and wait for confirmation.
    ///
    /// Transient failures are retried up to `retry.max_attempts` with a nonce
    /// resync and backoff in between. Before every submission, the first
    /// included, the chain is checked for the action having already landed:
    /// an earlier attempt that hit a client-side error, or an earlier request
    /// whose confirmation was handed off unresolved.
    pub async fn execute(
        &self,
        spec: &CallSpec,
        custodian: &CapabilityRecord,
    ) -> Result<Execution, ExecutionError> {
        let executor = self.executor_for(custodian.execution_mode);
        let from = executor.signing_wallet(custodian);
        let data = abi::encode_call(spec)?;

        debug!(
            action = %spec.action,
            key = %spec.key,
            mode = %executor.mode(),
            from = %from,
            on_behalf_of = %spec.on_behalf_of,
            "Executing contract call"
        );

        let mut attempts = 0u32;
        let mut last_tx: Option<TxHash> = None;

        loop {
            attempts += 1;
            let outcome = self
                .attempt(executor, from, &data, spec, last_tx.as_ref(), attempts)
                .await;

            let failure = match outcome {
                Ok(Attempt::AlreadyApplied(mut execution)) => {
                    execution.attempts = attempts;
                    info!(
                        action = %spec.action,
                        tx = %execution.tx_hash,
                        "Earlier attempt already applied on chain; not resubmitting"
                    );
                    return Ok(execution);
                }
                Ok(Attempt::Submitted(tx_hash)) => {
                    return self.confirm(spec, tx_hash, attempts).await;
                }
                Err(failure) => failure,
            };

            if failure.tx_hash.is_some() {
                last_tx = failure.tx_hash;
            }
            let class = failure.error.class();

            match self.retry.decide(&class, attempts) {
                RetryAction::ResyncAndRetry(backoff) => {
                    warn!(
                        action = %spec.action,
                        attempt = attempts,
                        max = self.retry.max_attempts,
                        ?backoff,
                        error = %failure.error,
                        "Submission failed; retrying after backoff"
                    );
                    self.nonces.resync(from).await;
                    tokio::time::sleep(backoff).await;
                }
                RetryAction::GiveUp => {
                    self.nonces.resync(from).await;
                    return Err(match (class, failure.error) {
                        (ErrorClass::Permanent, ChainError::Rpc { message, .. }) => {
                            ExecutionError::Reverted {
                                reason: message,
                                tx_hash: None,
                            }
                        }
                        (ErrorClass::Permanent, other) => ExecutionError::Chain(other),
                        (_, other) => ExecutionError::Exhausted {
                            message: other.to_string(),
                            attempts,
                        },
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        executor: &dyn Executor,
        from: WalletAddress,
        data: &[u8],
        spec: &CallSpec,
        last_tx: Option<&TxHash>,
        attempt: u32,
    ) -> Result<Attempt, SubmitFailure> {
        if let Some(execution) = self.find_applied(spec, last_tx).await? {
            return Ok(Attempt::AlreadyApplied(execution));
        }

        let nonce = self.nonces.next(from).await?;
        let unsigned = UnsignedTransaction {
            from,
            to: self.client.contract_address(),
            data: data.to_vec(),
            nonce,
        };
        let raw = executor.sign(&unsigned).await?;
        let expected_hash = raw_transaction_hash(&raw)?;

        match self.client.send_raw_transaction(&raw).await {
            Ok(tx_hash) => {
                debug!(tx = %tx_hash, nonce, attempt, "Transaction broadcast");
                Ok(Attempt::Submitted(tx_hash))
            }
            Err(error) => Err(SubmitFailure {
                error,
                tx_hash: Some(expected_hash),
            }),
        }
    }

    /// Has this action already landed? Checks the last broadcast transaction's
    /// receipt, then the transfer's on-chain events. The contract accepts each
    /// action at most once per transfer, so any confirming event counts, even
    /// one carrying another request's audit hash.
    async fn find_applied(
        &self,
        spec: &CallSpec,
        last_tx: Option<&TxHash>,
    ) -> Result<Option<Execution>, ChainError> {
        if let Some(tx_hash) = last_tx {
            if let Some(receipt) = self.client.transaction_receipt(tx_hash).await? {
                if receipt.success {
                    let events: Vec<ContractEvent> = receipt
                        .logs
                        .into_iter()
                        .filter(|l| l.key == spec.key)
                        .map(|l| l.event)
                        .collect();
                    if events.iter().any(|e| e.confirms(spec.action)) {
                        return Ok(Some(Execution {
                            tx_hash: receipt.tx_hash,
                            block_number: receipt.block_number,
                            block_timestamp: receipt.block_timestamp,
                            events,
                            already_applied: true,
                            attempts: 0,
                        }));
                    }
                }
            }
        }

        let logs = self.client.transfer_logs(&spec.key).await?;
        let Some(applied) = logs.iter().find(|l| l.event.confirms(spec.action)) else {
            return Ok(None);
        };

        let events = logs
            .iter()
            .filter(|l| l.tx_hash == applied.tx_hash)
            .map(|l| l.event.clone())
            .collect();
        Ok(Some(Execution {
            tx_hash: applied.tx_hash,
            block_number: applied.block_number,
            block_timestamp: applied.block_timestamp,
            events,
            already_applied: true,
            attempts: 0,
        }))
    }

    async fn confirm(
        &self,
        spec: &CallSpec,
        tx_hash: TxHash,
        attempts: u32,
    ) -> Result<Execution, ExecutionError> {
        let receipt =
            match confirmation::wait_for_receipt(self.client.as_ref(), &tx_hash, &self.confirmation)
                .await
            {
                Confirmation::Mined(receipt) => receipt,
                Confirmation::TimedOut => {
                    return Err(ExecutionError::ConfirmationTimeout { tx_hash });
                }
            };

        if !receipt.success {
            return Err(ExecutionError::Reverted {
                reason: format!("{} reverted in block {}", spec.action, receipt.block_number),
                tx_hash: Some(tx_hash),
            });
        }

        let events: Vec<ContractEvent> = receipt
            .logs
            .into_iter()
            .filter(|l| l.key == spec.key)
            .map(|l| l.event)
            .collect();

        if !events.iter().any(|e| e.confirms(spec.action)) {
            return Err(ExecutionError::Unconfirmed {
                tx_hash,
                detail: format!("no {} event for {}", spec.action, spec.key),
            });
        }

        info!(
            action = %spec.action,
            tx = %tx_hash,
            block = receipt.block_number,
            attempts,
            "Contract call confirmed"
        );

        Ok(Execution {
            tx_hash,
            block_number: receipt.block_number,
            block_timestamp: receipt.block_timestamp,
            events,
            already_applied: false,
            attempts,
        })
    }
}
