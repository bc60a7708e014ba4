//! Rollover Transfer Engine
//!
//! Event-sourced reconciliation of multi-party retirement rollovers whose
//! authoritative state lives in an on-chain contract.
//!
//! # Architecture
//!
//! ```text
//! API ─→ ActionDispatcher ─→ ProtocolStateMachine (local pre-check)
//!              │          ─→ CapabilityResolver  (registry + contract table)
//!              │          ─→ AuditStore          (persist, then hash on chain)
//!              │          ─→ ExecutionAdapter    (sign, submit, confirm)
//!              └─→ EventStore ←─ ReconciliationService ←─ contract logs
//! ```
//!
//! # Invariants
//!
//! 1. **Log is the only state**: the stage is always recomputed from events
//! 2. **Chain wins**: events are appended only from confirmed contract logs
//! 3. **One action in flight** per transfer, enforced by an expiring lease
//! 4. **Unknown outcomes are never guessed**: they go to reconciliation

pub mod api;
pub mod audit;
pub mod capability;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod lock;
pub mod protocol;
pub mod reconcile;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use audit::{AuditRecord, AuditStore, InMemoryAuditStore, PgAuditStore};
pub use capability::{
    CapabilityRegistry, CapabilityResolver, PgCapabilityRegistry, StaticCapabilityRegistry,
};
pub use dispatcher::ActionDispatcher;
pub use error::{DispatchFailure, TransferError};
pub use event::{EventKind, RecordedEvent, TransferEvent};
pub use lock::{LockConfig, TransferLocks};
pub use reconcile::{ReconciliationService, ReconciliationWorker, WorkerConfig};
pub use state::{TimeoutPolicy, TransferStage, TransferView, compute_state};
pub use store::{EventStore, InMemoryEventStore, PgEventStore};
pub use types::{ActionKind, ActionRequest, CapabilityRecord, CreateTransferRequest};
