//! Receipt polling
//!
//! Waits for a submitted transaction to be mined. Provider errors while
//! polling are not failures of the transaction: polling continues until the
//! deadline, and an expired deadline means "unknown", never "failed".

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core_types::TxHash;

use super::{ContractClient, Receipt};

#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Polling interval ceiling as the wait grows
    pub max_poll_interval: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Mined(Receipt),
    /// Deadline passed without a receipt; the transaction may still land
    TimedOut,
}

/// Poll for `tx_hash`'s receipt until mined or `config.timeout` elapses
pub async fn wait_for_receipt(
    client: &dyn ContractClient,
    tx_hash: &TxHash,
    config: &ConfirmationConfig,
) -> Confirmation {
    let deadline = Instant::now() + config.timeout;
    let mut interval = config.poll_interval;
    let mut polls = 0u32;

    loop {
        polls += 1;
        match client.transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => {
                debug!(tx = %tx_hash, block = receipt.block_number, polls, "Transaction mined");
                return Confirmation::Mined(receipt);
            }
            Ok(None) => {}
            Err(e) => warn!(tx = %tx_hash, error = %e, "Receipt poll failed"),
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(tx = %tx_hash, polls, "Confirmation timed out");
            return Confirmation::TimedOut;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
        interval = (interval * 2).min(config.max_poll_interval);
    }
}
