//! In-process simulation of the rollover contract and its node.
//!
//! Executes the same transition table as the real contract, keeps logs and
//! receipts, tracks per-wallet nonces, and can inject the failure modes the
//! engine has to survive (lost responses, unmined transactions, outages).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::core_types::{AuditHash, TransferKey, TxHash, WalletAddress};
use crate::transfer::protocol::{self, ContractState};
use crate::transfer::types::{ActionKind, Party, SettlementTier};

use super::abi::{self, RawLog};
use super::{
    ChainError, ContractClient, ContractEvent, ContractLog, CustodianAuthorization, Receipt,
    TransactionSigner, UnsignedTransaction, raw_transaction_hash,
};

/// Platform proxy wallet recognised by the simulated contract
pub const PROXY_WALLET: WalletAddress = WalletAddress([0xee; 20]);

/// Failure injected into the next `send_raw_transaction`
#[derive(Debug, Clone)]
pub enum ChainFault {
    /// Provider error; nothing reaches the chain
    SendError(String),
    /// Transaction is applied, but the client sees an error
    ApplyThenError(String),
    /// Transaction is applied but its receipt stays hidden
    HoldReceipt,
    /// Mined and reverted
    RevertOnChain,
    /// Contract settles this execution as tokenized regardless of tier
    ForceMint,
}

/// An accepted transaction, as seen by the contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    pub tx_hash: TxHash,
    pub from: WalletAddress,
    pub on_behalf_of: WalletAddress,
    pub action: ActionKind,
    pub nonce: u64,
    pub reference: AuditHash,
}

#[derive(Debug, Clone, Default)]
struct ContractTransfer {
    state: Option<ContractState>,
    sender: Option<WalletAddress>,
    receiver: Option<WalletAddress>,
    net_amount: u128,
}

#[derive(Default)]
struct Inner {
    transfers: HashMap<TransferKey, ContractTransfer>,
    authorizations: HashMap<WalletAddress, CustodianAuthorization>,
    nonces: HashMap<WalletAddress, u64>,
    receipts: HashMap<TxHash, Receipt>,
    held: HashSet<TxHash>,
    logs: Vec<ContractLog>,
    faults: VecDeque<ChainFault>,
    submitted: Vec<SubmittedTx>,
    block: u64,
}

pub struct SimulatedChain {
    inner: Mutex<Inner>,
    offline: AtomicBool,
    send_attempts: AtomicUsize,
    nonce_reads: AtomicUsize,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

fn revert(reason: &str) -> ChainError {
    ChainError::Rpc {
        code: 3,
        message: format!("execution reverted: {}", reason),
    }
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            offline: AtomicBool::new(false),
            send_attempts: AtomicUsize::new(0),
            nonce_reads: AtomicUsize::new(0),
        }
    }

    pub const CONTRACT: WalletAddress = WalletAddress([0xcc; 20]);

    /// Set a wallet's row in the contract's authorization table
    pub fn authorize(&self, wallet: WalletAddress, whitelisted: bool, tokenized: bool) {
        self.inner.lock().unwrap().authorizations.insert(
            wallet,
            CustodianAuthorization {
                whitelisted,
                tokenized,
            },
        );
    }

    pub fn push_fault(&self, fault: ChainFault) {
        self.inner.lock().unwrap().faults.push_back(fault);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_pending_nonce(&self, wallet: WalletAddress, nonce: u64) {
        self.inner.lock().unwrap().nonces.insert(wallet, nonce);
    }

    /// Make every withheld receipt visible
    pub fn release_receipts(&self) {
        self.inner.lock().unwrap().held.clear();
    }

    /// Contract-side timeout of a transfer
    pub fn expire(&self, key: TransferKey) -> TxHash {
        let mut inner = self.inner.lock().unwrap();
        inner.block += 1;
        let block = inner.block;
        let tx_hash = TxHash(crate::core_types::keccak256(&[&key.0[..], b"expire"].concat()));
        inner.transfers.entry(key).or_default().state = Some(ContractState::TimedOut);
        let log = ContractLog {
            key,
            event: ContractEvent::Expired,
            tx_hash,
            block_number: block,
            block_timestamp: Utc::now(),
            log_index: 0,
        };
        inner.logs.push(log.clone());
        inner.receipts.insert(
            tx_hash,
            Receipt {
                tx_hash,
                block_number: block,
                block_timestamp: log.block_timestamp,
                success: true,
                logs: vec![log],
            },
        );
        tx_hash
    }

    /// Insert a bare mined receipt with no logs
    pub fn insert_receipt(&self, success: bool) -> TxHash {
        let mut inner = self.inner.lock().unwrap();
        inner.block += 1;
        let tx_hash = TxHash(crate::core_types::keccak256(&inner.block.to_be_bytes()));
        let block_number = inner.block;
        inner.receipts.insert(
            tx_hash,
            Receipt {
                tx_hash,
                block_number,
                block_timestamp: Utc::now(),
                success,
                logs: Vec::new(),
            },
        );
        tx_hash
    }

    pub fn submitted(&self) -> Vec<SubmittedTx> {
        self.inner.lock().unwrap().submitted.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn nonce_reads(&self) -> usize {
        self.nonce_reads.load(Ordering::SeqCst)
    }

    pub fn state_of(&self, key: &TransferKey) -> ContractState {
        self.inner
            .lock()
            .unwrap()
            .transfers
            .get(key)
            .and_then(|t| t.state)
            .unwrap_or(ContractState::None)
    }

    fn check_online(&self) -> Result<(), ChainError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChainError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    /// Run one call against contract state. Returns the emitted events.
    fn apply_call(
        inner: &mut Inner,
        (from, nonce, tx_hash): (WalletAddress, u64, TxHash),
        data: &[u8],
        force_mint: bool,
    ) -> Result<(SubmittedTx, TransferKey, Vec<(ContractEvent, WalletAddress, WalletAddress)>), ChainError> {
        let (sel, words) = abi::split_call(data)?;
        let action = abi::action_for_selector(sel).ok_or_else(|| revert("unknown selector"))?;
        if words.len() < 3 {
            return Err(revert("short call data"));
        }
        let key = TransferKey(words[0]);
        let reference = AuditHash(words[words.len() - 1]);
        let on_behalf_of = abi::address_from_word(&words[words.len() - 2]);

        if from != on_behalf_of && from != PROXY_WALLET {
            return Err(revert("caller is neither the custodian nor the proxy"));
        }
        let auth = inner
            .authorizations
            .get(&on_behalf_of)
            .copied()
            .unwrap_or_default();
        if !auth.whitelisted {
            return Err(revert("custodian not whitelisted"));
        }

        let record = inner.transfers.get(&key).cloned().unwrap_or_default();
        let current = record.state.unwrap_or(ContractState::None);
        let mut next_record = record.clone();

        let party = match action {
            ActionKind::AgreeSend => {
                let counterpart = abi::address_from_word(&words[1]);
                if record.sender.is_some_and(|s| s != on_behalf_of)
                    || record.receiver.is_some_and(|r| r != counterpart)
                {
                    return Err(revert("party mismatch"));
                }
                next_record.sender = Some(on_behalf_of);
                next_record.receiver = Some(counterpart);
                Party::Sender
            }
            ActionKind::AgreeReceive => {
                let counterpart = abi::address_from_word(&words[1]);
                if record.receiver.is_some_and(|r| r != on_behalf_of)
                    || record.sender.is_some_and(|s| s != counterpart)
                {
                    return Err(revert("party mismatch"));
                }
                next_record.receiver = Some(on_behalf_of);
                next_record.sender = Some(counterpart);
                Party::Receiver
            }
            _ if record.sender == Some(on_behalf_of) => Party::Sender,
            _ if record.receiver == Some(on_behalf_of) => Party::Receiver,
            _ => return Err(revert("unauthorized")),
        };

        let tokenized = force_mint || {
            let tokenized = |w: Option<WalletAddress>| {
                w.and_then(|w| inner.authorizations.get(&w))
                    .is_some_and(|a| a.tokenized)
            };
            tokenized(record.sender) && tokenized(record.receiver)
        };
        let tier = if tokenized {
            SettlementTier::Tokenized
        } else {
            SettlementTier::Standard
        };

        let next = protocol::transition(current, action, party, tier)
            .map_err(|_| revert("InvalidTransferState"))?;
        next_record.state = Some(next);

        let sender = next_record.sender.unwrap_or(on_behalf_of);
        let receiver = next_record.receiver.unwrap_or(on_behalf_of);
        let mut events = Vec::new();
        match action {
            ActionKind::AgreeSend => events.push((
                ContractEvent::PreparedBySender {
                    wallet: on_behalf_of,
                    reference,
                },
                on_behalf_of,
                receiver,
            )),
            ActionKind::AgreeReceive => events.push((
                ContractEvent::PreparedByReceiver {
                    wallet: on_behalf_of,
                    reference,
                },
                on_behalf_of,
                sender,
            )),
            ActionKind::ProvideFinancialDetails => {
                let gross = abi::u128_from_word(&words[1])?;
                let federal = abi::u128_from_word(&words[2])?;
                let state = abi::u128_from_word(&words[3])?;
                next_record.net_amount = gross.saturating_sub(federal + state);
                events.push((
                    ContractEvent::FinancialDetailsProvided {
                        gross,
                        federal,
                        state,
                        reference,
                    },
                    on_behalf_of,
                    receiver,
                ));
            }
            ActionKind::ExecuteTransfer => {
                events.push((
                    ContractEvent::Executed {
                        tokenized,
                        net_amount: record.net_amount,
                        reference,
                    },
                    on_behalf_of,
                    receiver,
                ));
                if tokenized {
                    events.push((
                        ContractEvent::TokensMinted {
                            amount: record.net_amount,
                        },
                        on_behalf_of,
                        receiver,
                    ));
                }
            }
            ActionKind::BurnTokens => events.push((
                ContractEvent::TokensBurned {
                    amount: abi::u128_from_word(&words[1])?,
                    reference,
                },
                on_behalf_of,
                sender,
            )),
            ActionKind::RecordSettlement => events.push((
                ContractEvent::SettlementRecorded { reference },
                on_behalf_of,
                receiver,
            )),
            ActionKind::ConfirmReceipt => events.push((
                ContractEvent::ReceiptConfirmed { reference },
                on_behalf_of,
                sender,
            )),
            ActionKind::CancelTransfer => events.push((
                ContractEvent::Cancelled { reference },
                on_behalf_of,
                receiver,
            )),
        }

        inner.transfers.insert(key, next_record);
        let submitted = SubmittedTx {
            tx_hash,
            from,
            on_behalf_of,
            action,
            nonce,
            reference,
        };
        Ok((submitted, key, events))
    }
}

fn decode_raw(raw: &str) -> Result<(WalletAddress, u64, Vec<u8>), ChainError> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ChainError::Decode(e.to_string()))?;
    if bytes.len() < 28 {
        return Err(ChainError::Decode("raw transaction too short".to_string()));
    }
    let mut from = [0u8; 20];
    from.copy_from_slice(&bytes[..20]);
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&bytes[20..28]);
    Ok((WalletAddress(from), u64::from_be_bytes(nonce), bytes[28..].to_vec()))
}

#[async_trait]
impl TransactionSigner for SimulatedChain {
    async fn sign(&self, tx: &UnsignedTransaction) -> Result<String, ChainError> {
        let mut bytes = Vec::with_capacity(28 + tx.data.len());
        bytes.extend_from_slice(&tx.from.0);
        bytes.extend_from_slice(&tx.nonce.to_be_bytes());
        bytes.extend_from_slice(&tx.data);
        Ok(format!("0x{}", hex::encode(bytes)))
    }
}

#[async_trait]
impl ContractClient for SimulatedChain {
    async fn send_raw_transaction(&self, raw: &str) -> Result<TxHash, ChainError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let mut inner = self.inner.lock().unwrap();
        let fault = inner.faults.pop_front();
        if let Some(ChainFault::SendError(message)) = &fault {
            return Err(ChainError::Transport(message.clone()));
        }

        let (from, nonce, data) = decode_raw(raw)?;
        let expected = inner.nonces.get(&from).copied().unwrap_or(0);
        if nonce < expected {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "nonce too low".to_string(),
            });
        }
        if nonce > expected {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "nonce too high".to_string(),
            });
        }

        let tx_hash = raw_transaction_hash(raw)?;

        if matches!(fault, Some(ChainFault::RevertOnChain)) {
            inner.nonces.insert(from, expected + 1);
            inner.block += 1;
            let block_number = inner.block;
            inner.receipts.insert(
                tx_hash,
                Receipt {
                    tx_hash,
                    block_number,
                    block_timestamp: Utc::now(),
                    success: false,
                    logs: Vec::new(),
                },
            );
            return Ok(tx_hash);
        }

        let force_mint = matches!(fault, Some(ChainFault::ForceMint));
        // Rejected calls fail gas estimation and never consume a nonce
        let (submitted, key, events) =
            Self::apply_call(&mut inner, (from, nonce, tx_hash), &data, force_mint)?;
        inner.submitted.push(submitted);
        inner.nonces.insert(from, expected + 1);
        inner.block += 1;
        let block_number = inner.block;
        let block_timestamp = Utc::now();

        let mut logs = Vec::new();
        for (index, (event, actor, counterpart)) in events.iter().enumerate() {
            let (topics, data) = abi::encode_log(&key, event, actor, counterpart);
            let raw_log = RawLog {
                topics,
                data,
                tx_hash,
                block_number,
                block_timestamp,
                log_index: index as u64,
            };
            if let Some(log) = abi::decode_log(&raw_log)? {
                logs.push(log);
            }
        }
        inner.logs.extend(logs.iter().cloned());
        inner.receipts.insert(
            tx_hash,
            Receipt {
                tx_hash,
                block_number,
                block_timestamp,
                success: true,
                logs,
            },
        );

        match fault {
            Some(ChainFault::ApplyThenError(message)) => Err(ChainError::Transport(message)),
            Some(ChainFault::HoldReceipt) => {
                inner.held.insert(tx_hash);
                Ok(tx_hash)
            }
            _ => Ok(tx_hash),
        }
    }

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, ChainError> {
        self.check_online()?;
        let inner = self.inner.lock().unwrap();
        if inner.held.contains(tx_hash) {
            return Ok(None);
        }
        Ok(inner.receipts.get(tx_hash).cloned())
    }

    async fn transfer_state(&self, key: &TransferKey) -> Result<ContractState, ChainError> {
        self.check_online()?;
        Ok(self.state_of(key))
    }

    async fn transfer_logs(&self, key: &TransferKey) -> Result<Vec<ContractLog>, ChainError> {
        self.check_online()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|l| l.key == *key)
            .cloned()
            .collect())
    }

    async fn custodian_authorization(
        &self,
        wallet: &WalletAddress,
    ) -> Result<CustodianAuthorization, ChainError> {
        self.check_online()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .authorizations
            .get(wallet)
            .copied()
            .unwrap_or_default())
    }

    async fn pending_nonce(&self, wallet: &WalletAddress) -> Result<u64, ChainError> {
        self.check_online()?;
        self.nonce_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .lock()
            .unwrap()
            .nonces
            .get(wallet)
            .copied()
            .unwrap_or(0))
    }

    fn contract_address(&self) -> WalletAddress {
        Self::CONTRACT
    }
}
