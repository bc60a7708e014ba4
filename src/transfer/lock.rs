//! Per-transfer execution lease
//!
//! At most one action per transfer is in flight. A holder that crashes or
//! hangs cannot wedge its transfer: leases expire after `lease` and the
//! next waiter takes over. Waiters give up after `wait` with
//! [`TransferError::LockTimeout`]. A live holder keeps its lease with
//! [`TransferLockGuard::renew_while`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core_types::TransferId;

use super::error::TransferError;

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a holder owns the transfer before others may take it
    pub lease: Duration,
    /// How long to wait for a busy transfer
    pub wait: Duration,
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(600),
            wait: Duration::from_secs(5),
            retry_interval: Duration::from_millis(20),
        }
    }
}

/// Lease table shared by all dispatches in this process
#[derive(Clone)]
pub struct TransferLocks {
    leases: Arc<DashMap<TransferId, Lease>>,
    next_token: Arc<AtomicU64>,
    config: LockConfig,
}

impl TransferLocks {
    pub fn new(config: LockConfig) -> Self {
        Self {
            leases: Arc::new(DashMap::new()),
            next_token: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    fn try_acquire(&self, transfer_id: &TransferId) -> Option<u64> {
        let now = Instant::now();
        let lease = Lease {
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            expires_at: now + self.config.lease,
        };
        match self.leases.entry(transfer_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(lease);
                Some(lease.token)
            }
            Entry::Occupied(mut slot) if slot.get().expires_at <= now => {
                warn!(
                    transfer_id = %transfer_id,
                    stale_token = slot.get().token,
                    "Taking over expired transfer lease"
                );
                slot.insert(lease);
                Some(lease.token)
            }
            Entry::Occupied(_) => None,
        }
    }

    /// Wait up to `config.wait` for the transfer's lease
    pub async fn acquire(&self, transfer_id: &TransferId) -> Result<TransferLockGuard, TransferError> {
        let deadline = Instant::now() + self.config.wait;
        loop {
            if let Some(token) = self.try_acquire(transfer_id) {
                debug!(transfer_id = %transfer_id, token, "Transfer lease acquired");
                return Ok(TransferLockGuard {
                    leases: self.leases.clone(),
                    transfer_id: transfer_id.clone(),
                    token,
                    lease: self.config.lease,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransferError::LockTimeout(transfer_id.clone()));
            }
            tokio::time::sleep(self.config.retry_interval.min(deadline - now)).await;
        }
    }

    pub fn is_locked(&self, transfer_id: &TransferId) -> bool {
        self.leases
            .get(transfer_id)
            .is_some_and(|l| l.expires_at > Instant::now())
    }
}

/// Releases the lease on drop, unless it has since been taken over
#[derive(Debug)]
pub struct TransferLockGuard {
    leases: Arc<DashMap<TransferId, Lease>>,
    transfer_id: TransferId,
    token: u64,
    lease: Duration,
}

impl TransferLockGuard {
    /// False once the lease expired and another holder took it
    pub fn is_held(&self) -> bool {
        self.leases
            .get(&self.transfer_id)
            .is_some_and(|l| l.token == self.token)
    }

    /// Push expiry out by a full lease. False if the lease was taken over.
    pub fn renew(&self) -> bool {
        match self.leases.get_mut(&self.transfer_id) {
            Some(mut lease) if lease.token == self.token => {
                lease.expires_at = Instant::now() + self.lease;
                true
            }
            _ => false,
        }
    }

    /// Drive `work` to completion, renewing the lease every third of its
    /// length so a slow holder is not taken over mid-flight
    pub async fn renew_while<F: Future>(&self, work: F) -> F::Output {
        let period = (self.lease / 3).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(work);

        let mut lost = false;
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    if !self.renew() && !lost {
                        lost = true;
                        warn!(
                            transfer_id = %self.transfer_id,
                            token = self.token,
                            "Transfer lease lost while work was in flight"
                        );
                    }
                }
            }
        }
    }
}

impl Drop for TransferLockGuard {
    fn drop(&mut self) {
        let removed = self
            .leases
            .remove_if(&self.transfer_id, |_, lease| lease.token == self.token);
        if removed.is_some() {
            debug!(transfer_id = %self.transfer_id, token = self.token, "Transfer lease released");
        }
    }
}
