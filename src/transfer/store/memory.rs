use async_trait::async_trait;
use dashmap::DashMap;

use crate::core_types::TransferId;
use crate::transfer::error::TransferError;
use crate::transfer::event::{RecordedEvent, TransferEvent};

use super::EventStore;

/// Process-local event store.
///
/// The per-key shard lock held by `DashMap::entry` makes the
/// check-then-push in [`EventStore::append`] atomic per transfer.
#[derive(Default)]
pub struct InMemoryEventStore {
    logs: DashMap<TransferId, Vec<RecordedEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        transfer_id: &TransferId,
        expected_last_seq: u64,
        event: TransferEvent,
    ) -> Result<u64, TransferError> {
        let mut log = self.logs.entry(transfer_id.clone()).or_default();
        let actual = log.len() as u64;
        if actual != expected_last_seq {
            return Err(TransferError::ConcurrentAppendConflict {
                transfer_id: transfer_id.clone(),
                expected: expected_last_seq,
                actual,
            });
        }
        let seq = actual + 1;
        log.push(RecordedEvent {
            transfer_id: transfer_id.clone(),
            seq,
            event,
        });
        Ok(seq)
    }

    async fn read_from(
        &self,
        transfer_id: &TransferId,
        after_seq: u64,
    ) -> Result<Vec<RecordedEvent>, TransferError> {
        Ok(self
            .logs
            .get(transfer_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_transfer_ids(&self) -> Result<Vec<TransferId>, TransferError> {
        let mut ids: Vec<TransferId> = self
            .logs
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
