//! Rollover Engine - HTTP service
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌──────────┐    ┌──────────┐
//! │   API    │───▶│ Dispatcher │───▶│ Adapter  │───▶│ Contract │
//! │  (axum)  │    │(lock+audit)│    │(sign+tx) │    │  (RPC)   │
//! └──────────┘    └─────┬──────┘    └──────────┘    └────┬─────┘
//!                       │ events                         │ logs
//!                  ┌────▼─────┐    hand-off     ┌────────▼───────┐
//!                  │  Event   │◀────────────────│ Reconciliation │
//!                  │  Store   │                 │     Worker     │
//!                  └──────────┘                 └────────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use rollover_engine::chain::{
    ContractClient, ExecutionAdapter, NonceAllocator, ProxyExecutor, SelfSignedExecutor,
    rpc::{RpcContractClient, RpcSigner},
};
use rollover_engine::config::AppConfig;
use rollover_engine::db::Database;
use rollover_engine::transfer::api::{ApiState, router};
use rollover_engine::transfer::{
    ActionDispatcher, AuditStore, CapabilityRegistry, CapabilityResolver, EventStore,
    InMemoryAuditStore, InMemoryEventStore, PgAuditStore, PgCapabilityRegistry, PgEventStore,
    ReconciliationService, ReconciliationWorker, StaticCapabilityRegistry, TransferLocks,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

type Stores = (
    Arc<dyn EventStore>,
    Arc<dyn AuditStore>,
    Arc<dyn CapabilityRegistry>,
);

async fn build_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.init_schema().await.context("Failed to create schema")?;
            let pool = db.pool().clone();
            tracing::info!("Using PostgreSQL stores");
            let store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
            let audit: Arc<dyn AuditStore> = Arc::new(PgAuditStore::new(pool.clone()));
            let registry: Arc<dyn CapabilityRegistry> = Arc::new(PgCapabilityRegistry::new(pool));
            Ok((store, audit, registry))
        }
        None => {
            tracing::warn!(
                custodians = config.custodians.len(),
                "No postgres_url configured; using in-memory stores"
            );
            let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
            let audit: Arc<dyn AuditStore> = Arc::new(InMemoryAuditStore::new());
            let registry: Arc<dyn CapabilityRegistry> = Arc::new(
                StaticCapabilityRegistry::from_records(config.custodians.iter().cloned()),
            );
            Ok((store, audit, registry))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = rollover_engine::logging::init_logging(&config);

    tracing::info!(
        env = %env,
        build = env!("ROLLOVER_BUILD_ID"),
        "Starting rollover engine"
    );

    let (store, audit, registry) = build_stores(&config).await?;

    let timeout = config.chain.request_timeout();
    let client: Arc<dyn ContractClient> = Arc::new(RpcContractClient::new(
        config.chain.rpc_url.clone(),
        config.chain.contract_address,
        timeout,
    )?);

    let mut signer = RpcSigner::new(timeout)?;
    for endpoint in &config.chain.signers {
        signer = signer.with_endpoint(endpoint.wallet, endpoint.url.clone());
    }
    if signer.endpoint_count() == 0 {
        tracing::warn!("No signer endpoints configured; every submission will fail");
    }
    let signer = Arc::new(signer);

    let adapter = ExecutionAdapter::new(
        client.clone(),
        NonceAllocator::spawn(client.clone()),
        Arc::new(SelfSignedExecutor::new(signer.clone())),
        Arc::new(ProxyExecutor::new(config.chain.proxy_wallet, signer)),
    )
    .with_retry(config.execution.retry())
    .with_confirmation(config.execution.confirmation());

    let locks = TransferLocks::new(config.dispatch.lock());
    let policy = config.lifecycle.policy();

    let reconciler = Arc::new(ReconciliationService::new(
        store.clone(),
        audit.clone(),
        client.clone(),
        locks.clone(),
        policy,
    ));

    let mut dispatcher = ActionDispatcher::new(
        store,
        audit.clone(),
        CapabilityResolver::new(registry, client),
        Arc::new(adapter),
        locks,
        policy,
    );

    if config.reconciliation.enabled {
        let (tx, rx) = mpsc::channel(1024);
        dispatcher = dispatcher.with_reconciler(tx);
        let worker = ReconciliationWorker::new(reconciler.clone(), rx, config.reconciliation.worker());
        tokio::spawn(worker.run());
    } else {
        tracing::warn!("Reconciliation worker disabled; hand-offs will be dropped");
    }

    let app = router(Arc::new(ApiState {
        dispatcher: Arc::new(dispatcher),
        reconciler,
        audit,
    }));

    let port = get_port_override().unwrap_or(config.gateway.port);
    let addr = format!("{}:{}", config.gateway.host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(%addr, "Rollover API listening");
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
