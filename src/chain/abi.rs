//! Rollover contract ABI
//!
//! Hand-rolled encoding of the handful of static-typed calls and events the
//! engine needs. Every argument is a single 32-byte word: `bytes32` as-is,
//! `address` left-padded, `uintN`/`bool` big-endian in the low bytes.

use chrono::{DateTime, Utc};

use crate::core_types::{AuditHash, TransferKey, TxHash, WalletAddress, keccak256};
use crate::transfer::protocol::ContractState;
use crate::transfer::types::{AccountType, ActionKind};

use super::{ChainError, ContractEvent, ContractLog, CustodianAuthorization};

pub const WORD: usize = 32;

pub const SIG_AGREE_SEND: &str = "agreeSend(bytes32,address,address,bytes32)";
pub const SIG_AGREE_RECEIVE: &str = "agreeReceive(bytes32,address,address,bytes32)";
pub const SIG_PROVIDE_FINANCIALS: &str =
    "provideFinancialDetails(bytes32,uint256,uint256,uint256,uint8,uint8,address,bytes32)";
pub const SIG_EXECUTE: &str = "executeTransfer(bytes32,address,bytes32)";
pub const SIG_BURN: &str = "burnTokens(bytes32,uint256,address,bytes32)";
pub const SIG_RECORD_SETTLEMENT: &str = "recordSettlement(bytes32,address,bytes32)";
pub const SIG_CONFIRM_RECEIPT: &str = "confirmReceipt(bytes32,address,bytes32)";
pub const SIG_CANCEL: &str = "cancelTransfer(bytes32,address,bytes32)";
pub const SIG_GET_STATE: &str = "getTransferState(bytes32)";
pub const SIG_CUSTODIANS: &str = "custodians(address)";

pub const EV_PREPARED_BY_SENDER: &str = "TransferPreparedBySender(bytes32,address,address,bytes32)";
pub const EV_PREPARED_BY_RECEIVER: &str =
    "TransferPreparedByReceiver(bytes32,address,address,bytes32)";
pub const EV_FINANCIALS: &str = "FinancialDetailsProvided(bytes32,uint256,uint256,uint256,bytes32)";
pub const EV_EXECUTED: &str = "TransferExecuted(bytes32,bool,uint256,bytes32)";
pub const EV_MINTED: &str = "TokensMinted(bytes32,address,uint256)";
pub const EV_BURNED: &str = "TokensBurned(bytes32,address,uint256,bytes32)";
pub const EV_SETTLEMENT: &str = "SettlementRecorded(bytes32,bytes32)";
pub const EV_RECEIPT: &str = "ReceiptConfirmed(bytes32,bytes32)";
pub const EV_CANCELLED: &str = "TransferCancelled(bytes32,address,bytes32)";
pub const EV_EXPIRED: &str = "TransferExpired(bytes32)";

/// First four bytes of `keccak256(signature)`
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic 0 of an event
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

pub fn word_address(addr: &WalletAddress) -> [u8; WORD] {
    let mut w = [0u8; WORD];
    w[12..].copy_from_slice(&addr.0);
    w
}

pub fn word_u128(value: u128) -> [u8; WORD] {
    let mut w = [0u8; WORD];
    w[16..].copy_from_slice(&value.to_be_bytes());
    w
}

pub fn word_u8(value: u8) -> [u8; WORD] {
    let mut w = [0u8; WORD];
    w[31] = value;
    w
}

pub fn word_bool(value: bool) -> [u8; WORD] {
    word_u8(value as u8)
}

/// Action-specific call arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArgs {
    None,
    /// Counterparty wallet, for the agreement calls
    Counterpart(WalletAddress),
    /// Minor units (cents) and account-type enum values
    Financials {
        gross: u128,
        federal: u128,
        state: u128,
        source: AccountType,
        destination: AccountType,
    },
    /// Token amount in minor units, for `burnTokens`
    Amount(u128),
}

/// Everything needed to build one contract call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    pub action: ActionKind,
    pub key: TransferKey,
    /// The custodian's own wallet. Never the proxy's.
    pub on_behalf_of: WalletAddress,
    /// Audit hash, carried in the reference / document-hash field
    pub reference: AuditHash,
    pub args: CallArgs,
}

/// Encode call data for `spec`
pub fn encode_call(spec: &CallSpec) -> Result<Vec<u8>, ChainError> {
    let mismatch = || {
        ChainError::Encode(format!(
            "arguments {:?} do not fit {}",
            spec.args, spec.action
        ))
    };

    let (signature, words): (&str, Vec<[u8; WORD]>) = match (spec.action, &spec.args) {
        (ActionKind::AgreeSend, CallArgs::Counterpart(counterpart)) => (
            SIG_AGREE_SEND,
            vec![
                spec.key.0,
                word_address(counterpart),
                word_address(&spec.on_behalf_of),
                spec.reference.0,
            ],
        ),
        (ActionKind::AgreeReceive, CallArgs::Counterpart(counterpart)) => (
            SIG_AGREE_RECEIVE,
            vec![
                spec.key.0,
                word_address(counterpart),
                word_address(&spec.on_behalf_of),
                spec.reference.0,
            ],
        ),
        (
            ActionKind::ProvideFinancialDetails,
            CallArgs::Financials {
                gross,
                federal,
                state,
                source,
                destination,
            },
        ) => (
            SIG_PROVIDE_FINANCIALS,
            vec![
                spec.key.0,
                word_u128(*gross),
                word_u128(*federal),
                word_u128(*state),
                word_u8(source.code()),
                word_u8(destination.code()),
                word_address(&spec.on_behalf_of),
                spec.reference.0,
            ],
        ),
        (ActionKind::BurnTokens, CallArgs::Amount(amount)) => (
            SIG_BURN,
            vec![
                spec.key.0,
                word_u128(*amount),
                word_address(&spec.on_behalf_of),
                spec.reference.0,
            ],
        ),
        (action, CallArgs::None) => {
            let signature = match action {
                ActionKind::ExecuteTransfer => SIG_EXECUTE,
                ActionKind::RecordSettlement => SIG_RECORD_SETTLEMENT,
                ActionKind::ConfirmReceipt => SIG_CONFIRM_RECEIPT,
                ActionKind::CancelTransfer => SIG_CANCEL,
                _ => return Err(mismatch()),
            };
            (
                signature,
                vec![
                    spec.key.0,
                    word_address(&spec.on_behalf_of),
                    spec.reference.0,
                ],
            )
        }
        _ => return Err(mismatch()),
    };

    Ok(encode_with_selector(signature, &words))
}

pub fn encode_with_selector(signature: &str, words: &[[u8; WORD]]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + words.len() * WORD);
    data.extend_from_slice(&selector(signature));
    for w in words {
        data.extend_from_slice(w);
    }
    data
}

pub fn encode_get_transfer_state(key: &TransferKey) -> Vec<u8> {
    encode_with_selector(SIG_GET_STATE, &[key.0])
}

pub fn encode_custodians(wallet: &WalletAddress) -> Vec<u8> {
    encode_with_selector(SIG_CUSTODIANS, &[word_address(wallet)])
}

fn word_at(data: &[u8], index: usize) -> Result<&[u8], ChainError> {
    data.get(index * WORD..(index + 1) * WORD).ok_or_else(|| {
        ChainError::Decode(format!(
            "expected at least {} words, got {} bytes",
            index + 1,
            data.len()
        ))
    })
}

fn read_u128(word: &[u8]) -> Result<u128, ChainError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("uint256 exceeds u128".to_string()));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf))
}

fn read_bytes32(word: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(word);
    out
}

fn read_address(word: &[u8]) -> WalletAddress {
    let mut out = [0u8; 20];
    out.copy_from_slice(&word[12..]);
    WalletAddress(out)
}

fn read_bool(word: &[u8]) -> Result<bool, ChainError> {
    match read_u128(word)? {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(ChainError::Decode(format!("invalid bool {}", n))),
    }
}

/// Decode the return value of `getTransferState(bytes32)`
pub fn decode_transfer_state(data: &[u8]) -> Result<ContractState, ChainError> {
    let value = read_u128(word_at(data, 0)?)?;
    u8::try_from(value)
        .ok()
        .and_then(ContractState::from_code)
        .ok_or_else(|| ChainError::Decode(format!("unknown contract state {}", value)))
}

/// Decode the return value of `custodians(address)`
pub fn decode_authorization(data: &[u8]) -> Result<CustodianAuthorization, ChainError> {
    Ok(CustodianAuthorization {
        whitelisted: read_bool(word_at(data, 0)?)?,
        tokenized: read_bool(word_at(data, 1)?)?,
    })
}

/// Undecoded log entry as returned by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub log_index: u64,
}

/// Decode a rollover contract log. Returns `Ok(None)` for events this engine
/// does not track.
pub fn decode_log(log: &RawLog) -> Result<Option<ContractLog>, ChainError> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    let key = match log.topics.get(1) {
        Some(k) => TransferKey(*k),
        None => return Ok(None),
    };
    let data = &log.data;
    let reference_at = |i: usize| -> Result<AuditHash, ChainError> {
        Ok(AuditHash(read_bytes32(word_at(data, i)?)))
    };
    let indexed_address = || -> Result<WalletAddress, ChainError> {
        log.topics
            .get(2)
            .map(|t| read_address(t))
            .ok_or_else(|| ChainError::Decode("missing indexed address".to_string()))
    };

    let event = if *topic0 == event_topic(EV_PREPARED_BY_SENDER) {
        ContractEvent::PreparedBySender {
            wallet: indexed_address()?,
            reference: reference_at(1)?,
        }
    } else if *topic0 == event_topic(EV_PREPARED_BY_RECEIVER) {
        ContractEvent::PreparedByReceiver {
            wallet: indexed_address()?,
            reference: reference_at(1)?,
        }
    } else if *topic0 == event_topic(EV_FINANCIALS) {
        ContractEvent::FinancialDetailsProvided {
            gross: read_u128(word_at(data, 0)?)?,
            federal: read_u128(word_at(data, 1)?)?,
            state: read_u128(word_at(data, 2)?)?,
            reference: reference_at(3)?,
        }
    } else if *topic0 == event_topic(EV_EXECUTED) {
        ContractEvent::Executed {
            tokenized: read_bool(word_at(data, 0)?)?,
            net_amount: read_u128(word_at(data, 1)?)?,
            reference: reference_at(2)?,
        }
    } else if *topic0 == event_topic(EV_MINTED) {
        ContractEvent::TokensMinted {
            amount: read_u128(word_at(data, 0)?)?,
        }
    } else if *topic0 == event_topic(EV_BURNED) {
        ContractEvent::TokensBurned {
            amount: read_u128(word_at(data, 0)?)?,
            reference: reference_at(1)?,
        }
    } else if *topic0 == event_topic(EV_SETTLEMENT) {
        ContractEvent::SettlementRecorded {
            reference: reference_at(0)?,
        }
    } else if *topic0 == event_topic(EV_RECEIPT) {
        ContractEvent::ReceiptConfirmed {
            reference: reference_at(0)?,
        }
    } else if *topic0 == event_topic(EV_CANCELLED) {
        ContractEvent::Cancelled {
            reference: reference_at(0)?,
        }
    } else if *topic0 == event_topic(EV_EXPIRED) {
        ContractEvent::Expired
    } else {
        return Ok(None);
    };

    Ok(Some(ContractLog {
        key,
        event,
        tx_hash: log.tx_hash,
        block_number: log.block_number,
        block_timestamp: log.block_timestamp,
        log_index: log.log_index,
    }))
}

/// Build the raw log a contract would emit for `event`.
///
/// Used by the simulated chain in tests and by tooling that replays logs.
pub fn encode_log(
    key: &TransferKey,
    event: &ContractEvent,
    actor: &WalletAddress,
    counterpart: &WalletAddress,
) -> (Vec<[u8; 32]>, Vec<u8>) {
    let key = key.0;
    let join = |words: &[[u8; WORD]]| words.concat();
    match event {
        ContractEvent::PreparedBySender { wallet, reference } => (
            vec![event_topic(EV_PREPARED_BY_SENDER), key, word_address(wallet)],
            join(&[word_address(counterpart), reference.0]),
        ),
        ContractEvent::PreparedByReceiver { wallet, reference } => (
            vec![event_topic(EV_PREPARED_BY_RECEIVER), key, word_address(wallet)],
            join(&[word_address(counterpart), reference.0]),
        ),
        ContractEvent::FinancialDetailsProvided {
            gross,
            federal,
            state,
            reference,
        } => (
            vec![event_topic(EV_FINANCIALS), key],
            join(&[
                word_u128(*gross),
                word_u128(*federal),
                word_u128(*state),
                reference.0,
            ]),
        ),
        ContractEvent::Executed {
            tokenized,
            net_amount,
            reference,
        } => (
            vec![event_topic(EV_EXECUTED), key],
            join(&[word_bool(*tokenized), word_u128(*net_amount), reference.0]),
        ),
        ContractEvent::TokensMinted { amount } => (
            vec![event_topic(EV_MINTED), key, word_address(counterpart)],
            join(&[word_u128(*amount)]),
        ),
        ContractEvent::TokensBurned { amount, reference } => (
            vec![event_topic(EV_BURNED), key, word_address(actor)],
            join(&[word_u128(*amount), reference.0]),
        ),
        ContractEvent::SettlementRecorded { reference } => {
            (vec![event_topic(EV_SETTLEMENT), key], reference.0.to_vec())
        }
        ContractEvent::ReceiptConfirmed { reference } => {
            (vec![event_topic(EV_RECEIPT), key], reference.0.to_vec())
        }
        ContractEvent::Cancelled { reference } => (
            vec![event_topic(EV_CANCELLED), key, word_address(actor)],
            reference.0.to_vec(),
        ),
        ContractEvent::Expired => (vec![event_topic(EV_EXPIRED), key], Vec::new()),
    }
}

/// Read the 4-byte selector and argument words back out of call data
pub fn split_call(data: &[u8]) -> Result<([u8; 4], Vec<[u8; WORD]>), ChainError> {
    if data.len() < 4 || (data.len() - 4) % WORD != 0 {
        return Err(ChainError::Decode(format!(
            "call data of {} bytes is not selector + words",
            data.len()
        )));
    }
    let mut sel = [0u8; 4];
    sel.copy_from_slice(&data[..4]);
    let words = data[4..].chunks(WORD).map(read_bytes32).collect();
    Ok((sel, words))
}

/// Map a selector back to the action it calls
pub fn action_for_selector(sel: [u8; 4]) -> Option<ActionKind> {
    [
        (SIG_AGREE_SEND, ActionKind::AgreeSend),
        (SIG_AGREE_RECEIVE, ActionKind::AgreeReceive),
        (SIG_PROVIDE_FINANCIALS, ActionKind::ProvideFinancialDetails),
        (SIG_EXECUTE, ActionKind::ExecuteTransfer),
        (SIG_BURN, ActionKind::BurnTokens),
        (SIG_RECORD_SETTLEMENT, ActionKind::RecordSettlement),
        (SIG_CONFIRM_RECEIPT, ActionKind::ConfirmReceipt),
        (SIG_CANCEL, ActionKind::CancelTransfer),
    ]
    .into_iter()
    .find(|(sig, _)| selector(sig) == sel)
    .map(|(_, action)| action)
}

/// Decode an address argument word
pub fn address_from_word(word: &[u8; WORD]) -> WalletAddress {
    read_address(word)
}

/// Decode a uint argument word
pub fn u128_from_word(word: &[u8; WORD]) -> Result<u128, ChainError> {
    read_u128(word)
}
