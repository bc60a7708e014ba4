//! Event Store
//!
//! Append-only, per-transfer ordered log. Appends carry the sequence number
//! the writer last observed; a mismatch is reported as
//! [`TransferError::ConcurrentAppendConflict`] and nothing is written.

mod memory;
mod postgres;

pub use memory::InMemoryEventStore;
pub use postgres::PgEventStore;

use async_trait::async_trait;

use crate::core_types::TransferId;

use super::error::TransferError;
use super::event::{RecordedEvent, TransferEvent};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `event` if the transfer's current last sequence number is
    /// `expected_last_seq` (0 for a transfer with no events). Returns the new
    /// event's sequence number.
    async fn append(
        &self,
        transfer_id: &TransferId,
        expected_last_seq: u64,
        event: TransferEvent,
    ) -> Result<u64, TransferError>;

    /// Events with `seq > after_seq`, in sequence order
    async fn read_from(
        &self,
        transfer_id: &TransferId,
        after_seq: u64,
    ) -> Result<Vec<RecordedEvent>, TransferError>;

    /// Every transfer with at least one event
    async fn list_transfer_ids(&self) -> Result<Vec<TransferId>, TransferError>;

    /// Full log in sequence order; empty for an unknown transfer
    async fn read(&self, transfer_id: &TransferId) -> Result<Vec<RecordedEvent>, TransferError> {
        self.read_from(transfer_id, 0).await
    }
}
