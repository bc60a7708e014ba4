//! Wallet nonce allocator
//!
//! The proxy wallet signs for many custodians at once, so its nonce sequence
//! is process-wide shared state. Every nonce for every wallet is handed out
//! by one task that owns the counters; callers talk to it over a channel.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core_types::WalletAddress;

use super::{ChainError, ContractClient};

enum NonceRequest {
    Next {
        wallet: WalletAddress,
        response_tx: oneshot::Sender<Result<u64, ChainError>>,
    },
    /// Forget the cached counter; the next `Next` re-reads the chain
    Resync { wallet: WalletAddress },
}

/// Handle to the allocator task
#[derive(Clone)]
pub struct NonceAllocator {
    tx: mpsc::Sender<NonceRequest>,
}

impl NonceAllocator {
    /// Spawn the allocator task on the current runtime
    pub fn spawn(client: Arc<dyn ContractClient>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(client, rx));
        Self { tx }
    }

    /// Reserve the next nonce for `wallet`
    pub async fn next(&self, wallet: WalletAddress) -> Result<u64, ChainError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(NonceRequest::Next {
                wallet,
                response_tx,
            })
            .await
            .map_err(|_| ChainError::Transport("Nonce allocator stopped".to_string()))?;

        response_rx
            .await
            .map_err(|_| ChainError::Transport("Nonce allocator response dropped".to_string()))?
    }

    /// Drop the cached counter for `wallet` after a failed submission
    pub async fn resync(&self, wallet: WalletAddress) {
        if self.tx.send(NonceRequest::Resync { wallet }).await.is_err() {
            warn!(%wallet, "Nonce allocator stopped; resync dropped");
        }
    }
}

async fn run(client: Arc<dyn ContractClient>, mut rx: mpsc::Receiver<NonceRequest>) {
    let mut next_nonce: FxHashMap<WalletAddress, u64> = FxHashMap::default();
    info!("Nonce allocator started");

    while let Some(request) = rx.recv().await {
        match request {
            NonceRequest::Next {
                wallet,
                response_tx,
            } => {
                let result = match next_nonce.get(&wallet) {
                    Some(n) => Ok(*n),
                    None => client.pending_nonce(&wallet).await,
                };
                if let Ok(n) = result {
                    next_nonce.insert(wallet, n + 1);
                    debug!(%wallet, nonce = n, "Nonce allocated");
                }
                // Receiver may have given up waiting
                let _ = response_tx.send(result);
            }
            NonceRequest::Resync { wallet } => {
                if next_nonce.remove(&wallet).is_some() {
                    debug!(%wallet, "Nonce counter dropped for resync");
                }
            }
        }
    }

    info!("Nonce allocator stopped");
}
