use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::core_types::TransferId;
use crate::transfer::error::TransferError;
use crate::transfer::event::{RecordedEvent, TransferEvent};

use super::EventStore;

/// PostgreSQL-backed event store (`rollover_events_tb`)
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn last_seq(&self, transfer_id: &TransferId) -> Result<u64, TransferError> {
        let seq = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(seq), 0) FROM rollover_events_tb WHERE transfer_id = $1",
        )
        .bind(transfer_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(seq as u64)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(
        &self,
        transfer_id: &TransferId,
        expected_last_seq: u64,
        event: TransferEvent,
    ) -> Result<u64, TransferError> {
        let actual = self.last_seq(transfer_id).await?;
        if actual != expected_last_seq {
            return Err(TransferError::ConcurrentAppendConflict {
                transfer_id: transfer_id.clone(),
                expected: expected_last_seq,
                actual,
            });
        }

        let seq = expected_last_seq + 1;
        let result = sqlx::query(
            r#"
            INSERT INTO rollover_events_tb (transfer_id, seq, kind, tx_hash, body)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(transfer_id.as_str())
        .bind(seq as i64)
        .bind(event.kind.name())
        .bind(event.tx_hash().map(|h| h.to_hex()))
        .bind(Json(&event))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(seq),
            // Lost the race between the read above and the insert
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let actual = self.last_seq(transfer_id).await?;
                Err(TransferError::ConcurrentAppendConflict {
                    transfer_id: transfer_id.clone(),
                    expected: expected_last_seq,
                    actual,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_from(
        &self,
        transfer_id: &TransferId,
        after_seq: u64,
    ) -> Result<Vec<RecordedEvent>, TransferError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, body
            FROM rollover_events_tb
            WHERE transfer_id = $1 AND seq > $2
            ORDER BY seq ASC
            "#,
        )
        .bind(transfer_id.as_str())
        .bind(after_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RecordedEvent, TransferError> {
                let seq: i64 = row.try_get("seq")?;
                let Json(event): Json<TransferEvent> = row.try_get("body")?;
                Ok(RecordedEvent {
                    transfer_id: transfer_id.clone(),
                    seq: seq as u64,
                    event,
                })
            })
            .collect()
    }

    async fn list_transfer_ids(&self) -> Result<Vec<TransferId>, TransferError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT transfer_id FROM rollover_events_tb ORDER BY transfer_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(TransferId::new).collect())
    }
}
