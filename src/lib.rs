//! Rollover Engine - event-sourced reconciliation for on-chain rollovers
//!
//! Coordinates custodian-to-custodian retirement rollovers whose authoritative
//! state lives in a smart contract. The engine keeps an append-only event log
//! per transfer, derives state from it, dispatches custodian actions to the
//! contract, and repairs the log from chain data when the two drift.
//!
//! # Modules
//!
//! - [`core_types`] - Identifiers and hashes (TransferId, WalletAddress, etc.)
//! - [`money`] - Decimal amounts and their on-chain minor-unit encoding
//! - [`chain`] - Contract client, signing, nonces, retry and confirmation
//! - [`transfer`] - Event store, state fold, dispatcher, reconciliation, API
//! - [`db`] - PostgreSQL pool and schema
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup

// Core types - must be first!
pub mod core_types;

pub mod money;

pub mod chain;
pub mod db;
pub mod transfer;

pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use core_types::{AuditHash, CustodianId, TransferId, TransferKey, TxHash, WalletAddress};
pub use transfer::{
    ActionDispatcher, ActionKind, DispatchFailure, ReconciliationService, TransferError,
    TransferStage, TransferView,
};
