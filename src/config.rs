use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::chain::RetryConfig;
use crate::chain::confirmation::ConfirmationConfig;
use crate::core_types::WalletAddress;
use crate::transfer::lock::LockConfig;
use crate::transfer::reconcile::WorkerConfig;
use crate::transfer::state::TimeoutPolicy;
use crate::transfer::types::CapabilityRecord;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    /// PostgreSQL URL for the event, audit and capability tables. In-memory
    /// stores are used when absent.
    pub postgres_url: Option<String>,
    pub chain: ChainConfig,
    pub execution: ExecutionConfig,
    pub dispatch: DispatchConfig,
    pub lifecycle: LifecycleConfig,
    pub reconciliation: ReconciliationConfig,
    /// Static capability records, used when no database is configured
    pub custodians: Vec<CapabilityRecord>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "rollover.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            gateway: GatewayConfig::default(),
            postgres_url: None,
            chain: ChainConfig::default(),
            execution: ExecutionConfig::default(),
            dispatch: DispatchConfig::default(),
            lifecycle: LifecycleConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            custodians: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// A wallet and the `eth_signTransaction` endpoint that holds its key
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignerEndpoint {
    pub wallet: WalletAddress,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub contract_address: WalletAddress,
    /// Platform wallet that signs for platform-proxy custodians
    pub proxy_wallet: WalletAddress,
    pub request_timeout_ms: u64,
    pub signers: Vec<SignerEndpoint>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            contract_address: WalletAddress([0; 20]),
            proxy_wallet: WalletAddress([0; 20]),
            request_timeout_ms: 10_000,
            signers: Vec::new(),
        }
    }
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            confirmation_timeout_secs: 180,
            poll_interval_ms: 500,
        }
    }
}

impl ExecutionConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn confirmation(&self) -> ConfirmationConfig {
        ConfirmationConfig {
            timeout: Duration::from_secs(self.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..ConfirmationConfig::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    pub lock_lease_secs: u64,
    pub lock_wait_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lock_lease_secs: 600,
            lock_wait_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    pub fn lock(&self) -> LockConfig {
        LockConfig {
            lease: Duration::from_secs(self.lock_lease_secs),
            wait: Duration::from_millis(self.lock_wait_ms),
            ..LockConfig::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub timeout_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { timeout_days: 7 }
    }
}

impl LifecycleConfig {
    pub fn policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::days(self.timeout_days)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 60,
            batch_size: 100,
        }
    }
}

impl ReconciliationConfig {
    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            scan_interval: Duration::from_secs(self.scan_interval_secs.max(1)),
            batch_size: self.batch_size,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config =
            Self::from_yaml(&content).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Upper bound on one dispatch's time inside the execution adapter.
    ///
    /// Each attempt makes at most five node round trips (receipt and log
    /// lookup, nonce, signer, broadcast) and backs off at most `max_backoff`;
    /// the winning attempt then waits out the confirmation timeout.
    pub fn worst_case_execution(&self) -> Duration {
        let request = self.chain.request_timeout();
        let attempt = request * 5 + Duration::from_millis(self.execution.max_backoff_ms);
        attempt * self.execution.max_attempts.max(1)
            + Duration::from_secs(self.execution.confirmation_timeout_secs)
            + request
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let lease = self.dispatch.lock().lease;
        let worst = self.worst_case_execution();
        if lease < worst {
            return Err(ConfigError::Invalid(format!(
                "dispatch.lock_lease_secs ({}s) is shorter than the worst-case execution time ({}s)",
                lease.as_secs(),
                worst.as_secs_f64().ceil()
            )));
        }
        if self.lifecycle.timeout_days <= 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.timeout_days must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
