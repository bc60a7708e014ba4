//! JSON-RPC contract client and remote signer
//!
//! Talks plain Ethereum JSON-RPC over HTTP. Signing is delegated to remote
//! signer endpoints (`eth_signTransaction`), one per wallet: the platform's
//! proxy wallet and any self-signing custodian's wallet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core_types::{TransferKey, TxHash, WalletAddress};
use crate::transfer::protocol::ContractState;

use super::abi::{self, RawLog};
use super::{
    ChainError, ContractClient, ContractLog, CustodianAuthorization, Receipt, TransactionSigner,
    UnsignedTransaction,
};

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    transaction_hash: String,
    block_number: String,
    /// Not every node includes this; missing values are looked up per block
    #[serde(default)]
    block_timestamp: Option<String>,
    log_index: String,
}

#[derive(Deserialize, Debug)]
struct RpcBlock {
    timestamp: String,
}

#[derive(Serialize)]
struct CallRequest {
    to: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogFilter {
    address: String,
    from_block: &'static str,
    to_block: &'static str,
    topics: (Option<String>, String),
}

#[derive(Serialize)]
struct SignRequest {
    from: String,
    to: String,
    data: String,
    nonce: String,
}

/// `eth_signTransaction` returns either the raw hex or `{raw, tx}`
#[derive(Deserialize)]
#[serde(untagged)]
enum SignResponse {
    Raw(String),
    Object { raw: String },
}

/// Shared HTTP JSON-RPC transport
struct RpcTransport {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcTransport {
    fn new(timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T, R>(&self, url: &str, method: &'static str, params: T) -> Result<R, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Transport(format!("HTTP request failed: {}", e)))?;

        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| ChainError::Transport(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = rpc_response.error {
            debug!(method, code = error.code, message = %error.message, "RPC error");
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        rpc_response
            .result
            .ok_or_else(|| ChainError::Decode(format!("No result in {} response", method)))
    }

    /// Like [`Self::call`] but a `null` result is `Ok(None)`
    async fn call_optional<T, R>(
        &self,
        url: &str,
        method: &'static str,
        params: T,
    ) -> Result<Option<R>, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        match self.call::<T, Option<R>>(url, method, params).await {
            Ok(v) => Ok(v),
            Err(ChainError::Decode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn parse_quantity(s: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Decode(format!("invalid quantity {}: {}", s, e)))
}

fn parse_bytes(s: &str) -> Result<Vec<u8>, ChainError> {
    hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| ChainError::Decode(format!("invalid hex data: {}", e)))
}

fn parse_word(s: &str) -> Result<[u8; 32], ChainError> {
    let bytes = parse_bytes(s)?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ChainError::Decode(format!("expected 32-byte word, got {}", s)))
}

fn parse_tx_hash(s: &str) -> Result<TxHash, ChainError> {
    s.parse()
        .map_err(|e| ChainError::Decode(format!("invalid tx hash {}: {}", s, e)))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ChainError> {
    let secs = parse_quantity(s)?;
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| ChainError::Decode(format!("block timestamp out of range: {}", s)))
}

fn hex_data(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

/// Rollover contract client over Ethereum JSON-RPC
pub struct RpcContractClient {
    url: String,
    contract: WalletAddress,
    transport: RpcTransport,
}

impl RpcContractClient {
    pub fn new(url: impl Into<String>, contract: WalletAddress, timeout: Duration) -> Result<Self, ChainError> {
        Ok(Self {
            url: url.into(),
            contract,
            transport: RpcTransport::new(timeout)?,
        })
    }

    async fn eth_call(&self, data: Vec<u8>) -> Result<Vec<u8>, ChainError> {
        let request = CallRequest {
            to: self.contract.to_hex(),
            data: hex_data(&data),
        };
        let result: String = self
            .transport
            .call(&self.url, "eth_call", (request, "latest"))
            .await?;
        parse_bytes(&result)
    }

    async fn block_timestamp(
        &self,
        block: u64,
        cache: &mut FxHashMap<u64, DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, ChainError> {
        if let Some(ts) = cache.get(&block) {
            return Ok(*ts);
        }
        let found: Option<RpcBlock> = self
            .transport
            .call_optional(
                &self.url,
                "eth_getBlockByNumber",
                (format!("0x{:x}", block), false),
            )
            .await?;
        let found =
            found.ok_or_else(|| ChainError::Decode(format!("block {} not found", block)))?;
        let ts = parse_timestamp(&found.timestamp)?;
        cache.insert(block, ts);
        Ok(ts)
    }

    /// Decode node logs, keeping only this contract's tracked events
    async fn decode_logs(
        &self,
        logs: &[RpcLog],
        cache: &mut FxHashMap<u64, DateTime<Utc>>,
    ) -> Result<Vec<ContractLog>, ChainError> {
        let contract = self.contract.to_hex();
        let mut decoded = Vec::new();
        for log in logs {
            if !log.address.eq_ignore_ascii_case(&contract) {
                continue;
            }
            let block_number = parse_quantity(&log.block_number)?;
            let block_timestamp = match log.block_timestamp.as_deref() {
                Some(ts) => parse_timestamp(ts)?,
                None => self.block_timestamp(block_number, cache).await?,
            };
            let raw = RawLog {
                topics: log
                    .topics
                    .iter()
                    .map(|t| parse_word(t))
                    .collect::<Result<_, _>>()?,
                data: parse_bytes(&log.data)?,
                tx_hash: parse_tx_hash(&log.transaction_hash)?,
                block_number,
                block_timestamp,
                log_index: parse_quantity(&log.log_index)?,
            };
            if let Some(entry) = abi::decode_log(&raw)? {
                decoded.push(entry);
            }
        }
        Ok(decoded)
    }
}

#[async_trait]
impl ContractClient for RpcContractClient {
    async fn send_raw_transaction(&self, raw: &str) -> Result<TxHash, ChainError> {
        let hash: String = self
            .transport
            .call(&self.url, "eth_sendRawTransaction", [raw])
            .await?;
        parse_tx_hash(&hash)
    }

    async fn transaction_receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self
            .transport
            .call_optional(&self.url, "eth_getTransactionReceipt", [tx_hash.to_hex()])
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        // Pending receipts from some providers carry no block number yet
        let Some(block) = receipt.block_number.as_deref() else {
            return Ok(None);
        };

        let block_number = parse_quantity(block)?;
        let mut timestamps = FxHashMap::default();
        let block_timestamp = self.block_timestamp(block_number, &mut timestamps).await?;
        Ok(Some(Receipt {
            tx_hash: parse_tx_hash(&receipt.transaction_hash)?,
            block_number,
            block_timestamp,
            success: receipt.status.as_deref() == Some("0x1"),
            logs: self.decode_logs(&receipt.logs, &mut timestamps).await?,
        }))
    }

    async fn transfer_state(&self, key: &TransferKey) -> Result<ContractState, ChainError> {
        let data = self.eth_call(abi::encode_get_transfer_state(key)).await?;
        abi::decode_transfer_state(&data)
    }

    async fn transfer_logs(&self, key: &TransferKey) -> Result<Vec<ContractLog>, ChainError> {
        let filter = LogFilter {
            address: self.contract.to_hex(),
            from_block: "earliest",
            to_block: "latest",
            topics: (None, key.to_hex()),
        };
        let logs: Vec<RpcLog> = self
            .transport
            .call(&self.url, "eth_getLogs", [filter])
            .await?;
        let mut decoded = self.decode_logs(&logs, &mut FxHashMap::default()).await?;
        decoded.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(decoded)
    }

    async fn custodian_authorization(
        &self,
        wallet: &WalletAddress,
    ) -> Result<CustodianAuthorization, ChainError> {
        let data = self.eth_call(abi::encode_custodians(wallet)).await?;
        abi::decode_authorization(&data)
    }

    async fn pending_nonce(&self, wallet: &WalletAddress) -> Result<u64, ChainError> {
        let count: String = self
            .transport
            .call(
                &self.url,
                "eth_getTransactionCount",
                (wallet.to_hex(), "pending"),
            )
            .await?;
        parse_quantity(&count)
    }

    fn contract_address(&self) -> WalletAddress {
        self.contract
    }
}

/// Remote signer: one `eth_signTransaction` endpoint per wallet
pub struct RpcSigner {
    endpoints: HashMap<WalletAddress, String>,
    transport: RpcTransport,
}

impl RpcSigner {
    pub fn new(timeout: Duration) -> Result<Self, ChainError> {
        Ok(Self {
            endpoints: HashMap::new(),
            transport: RpcTransport::new(timeout)?,
        })
    }

    pub fn with_endpoint(mut self, wallet: WalletAddress, url: impl Into<String>) -> Self {
        self.endpoints.insert(wallet, url.into());
        self
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

#[async_trait]
impl TransactionSigner for RpcSigner {
    async fn sign(&self, tx: &UnsignedTransaction) -> Result<String, ChainError> {
        let url = self
            .endpoints
            .get(&tx.from)
            .ok_or(ChainError::NoSigner(tx.from))?;

        let request = SignRequest {
            from: tx.from.to_hex(),
            to: tx.to.to_hex(),
            data: hex_data(&tx.data),
            nonce: format!("0x{:x}", tx.nonce),
        };
        let response: SignResponse = self
            .transport
            .call(url, "eth_signTransaction", [request])
            .await?;

        let raw = match response {
            SignResponse::Raw(raw) | SignResponse::Object { raw } => raw,
        };
        if raw.is_empty() {
            warn!(wallet = %tx.from, "Signer returned an empty transaction");
            return Err(ChainError::Decode("empty signed transaction".to_string()));
        }
        Ok(raw)
    }
}
