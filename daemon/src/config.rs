use anyhow::Context;
use clap::Parser;
use flow_common::chain::{ChainRegistry, ChainType, PollingConfigs};
use serde_json::json;

// bind address
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 8080;

// Chain RPC rules
// per-request timeout
pub const RPC_REQUEST_TIMEOUT_SECS: u64 = 30;
// transient faults are retried up to this many attempts
pub const RPC_RETRY_ATTEMPTS: usize = 3;
// exponential backoff between retries, 500ms doubling up to 5s
pub const RPC_RETRY_BASE_DELAY_MS: u64 = 500;
pub const RPC_RETRY_MAX_DELAY_MS: u64 = 5_000;

// Worker rules
// how many jobs may run concurrently
pub const WORKER_CONCURRENCY: usize = 5;
// dispatch rate limit (token bucket)
pub const WORKER_JOBS_PER_SECOND: u64 = 10;
// a job is retried this many times before parking in the failed store
pub const JOB_MAX_ATTEMPTS: u32 = 3;
// retry backoff starts at 2s and doubles
pub const JOB_RETRY_BASE_DELAY_MS: u64 = 2_000;
// completed jobs are kept 24h, capped at the most recent 1000
pub const COMPLETED_JOB_RETENTION_SECS: u64 = 24 * 3600;
pub const COMPLETED_JOB_RETENTION_COUNT: usize = 1_000;
// failed jobs are kept 7 days for inspection
pub const FAILED_JOB_RETENTION_SECS: u64 = 7 * 24 * 3600;
// resume jobs are delayed slightly so startup settles first
pub const RESUME_JOB_DELAY_MS: u64 = 1_000;
// idle queue poll; delayed jobs become ready without a notify
pub const QUEUE_IDLE_POLL_MS: u64 = 500;
// retention sweep period
pub const RETENTION_SWEEP_INTERVAL_SECS: u64 = 3600;

// Event bus rules
// per-flow broadcast capacity; lagging subscribers miss events and
// reconcile via the status endpoint
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Daemon configuration, from CLI flags with environment fallbacks
#[derive(Debug, Parser)]
#[command(name = "flowd", version, about = "Cross-chain USDC flow tracking daemon")]
pub struct Config {
    /// Bind host for the API server
    #[clap(long, env = "HOST", default_value = DEFAULT_BIND_HOST)]
    pub host: String,

    /// Bind port for the API server
    #[clap(long, env = "PORT", default_value_t = DEFAULT_BIND_PORT)]
    pub port: u16,

    /// Log level (off, error, warn, info, debug, trace)
    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Comma-separated origins allowed to open WebSocket connections.
    /// Unset allows any origin.
    #[clap(long, env = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    /// Directory for the durable store and job queue
    #[clap(long, env = "DATA_DIR", default_value = "flowd-data")]
    pub data_dir: String,

    /// Path to a chain registry JSON file; the built-in testnet registry is
    /// used when unset
    #[clap(long, env = "CHAIN_REGISTRY_PATH")]
    pub chain_registry_path: Option<String>,

    /// JSON override for per-chain polling configuration
    #[clap(long, env = "CHAIN_POLLING_CONFIGS")]
    pub chain_polling_configs: Option<String>,

    /// Comma-separated RPC urls overriding every EVM registry entry
    #[clap(long, env = "EVM_RPC_URLS")]
    pub evm_rpc_urls: Option<String>,

    /// Comma-separated RPC urls overriding every Tendermint registry entry
    #[clap(long, env = "TENDERMINT_RPC_URLS")]
    pub tendermint_rpc_urls: Option<String>,

    /// Expose Prometheus metrics on /metrics
    #[clap(long)]
    pub prometheus: bool,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn allowed_origins(&self) -> Option<Vec<String>> {
        self.cors_origins.as_ref().map(|origins| {
            origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect()
        })
    }

    /// Load the registry from disk (or the built-in testnet defaults) and
    /// apply the RPC url overrides
    pub fn load_registry(&self) -> Result<ChainRegistry, anyhow::Error> {
        let mut registry = match self.chain_registry_path.as_deref() {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read chain registry at {}", path))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid chain registry at {}", path))?
            }
            None => default_registry(),
        };

        for (urls, chain_type) in [
            (&self.evm_rpc_urls, ChainType::Evm),
            (&self.tendermint_rpc_urls, ChainType::Tendermint),
        ] {
            if let Some(urls) = urls {
                let urls: Vec<String> = urls
                    .split(',')
                    .map(|url| url.trim().to_string())
                    .filter(|url| !url.is_empty())
                    .collect();
                if urls.is_empty() {
                    continue;
                }
                for (_, entry) in registry.0.iter_mut() {
                    if entry.chain_type == chain_type {
                        entry.rpc_urls = urls.clone();
                    }
                }
            }
        }
        Ok(registry)
    }

    /// Built-in polling defaults merged with the JSON env override
    pub fn load_polling_configs(&self) -> Result<PollingConfigs, anyhow::Error> {
        let mut configs = default_polling_configs();
        if let Some(raw) = self.chain_polling_configs.as_deref() {
            let overrides: PollingConfigs =
                serde_json::from_str(raw).context("Invalid CHAIN_POLLING_CONFIGS override")?;
            configs.merge(overrides);
        }
        Ok(configs)
    }
}

// Testnet registry used when no registry file is configured
pub fn default_registry() -> ChainRegistry {
    serde_json::from_value(json!({
        "sepolia": {
            "chainType": "evm",
            "key": "evm",
            "network": "testnet",
            "displayName": "Sepolia",
            "rpcUrls": ["https://ethereum-sepolia-rpc.publicnode.com"],
            "explorer": "https://sepolia.etherscan.io",
            "contracts": {
                "usdc": "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238",
                "tokenMessenger": "0x9f3B8679c73C2Fef8b59B4f3444d4e156fb70AA5",
                "messageTransmitter": "0x7865fAfC2db2093669d92c0F33AeEF291086BEFD"
            },
            "gasless": true
        },
        "noble-testnet": {
            "chainType": "tendermint",
            "key": "noble",
            "network": "testnet",
            "displayName": "Noble Testnet",
            "rpcUrls": ["https://noble-testnet-rpc.polkachu.com"],
            "explorer": "https://www.mintscan.io/noble-testnet"
        },
        "namada-testnet": {
            "chainType": "tendermint",
            "key": "namada",
            "network": "testnet",
            "displayName": "Namada Testnet",
            "rpcUrls": ["https://rpc.knowable.run"]
        }
    }))
    .expect("built-in registry is valid")
}

pub fn default_polling_configs() -> PollingConfigs {
    serde_json::from_value(json!({
        "sepolia": {"maxDurationMin": 30, "blockWindowBackscan": 20, "pollIntervalMs": 5000},
        "noble-testnet": {"maxDurationMin": 30, "blockWindowBackscan": 20, "pollIntervalMs": 5000, "blockRequestDelayMs": 250},
        "namada-testnet": {"maxDurationMin": 30, "blockWindowBackscan": 20, "pollIntervalMs": 5000, "blockRequestDelayMs": 250}
    }))
    .expect("built-in polling configs are valid")
}

#[cfg(test)]
mod tests {
    use flow_common::chain::ChainKey;

    use super::*;

    #[test]
    fn test_default_registry_covers_all_lanes() {
        let registry = default_registry();
        for key in [ChainKey::Evm, ChainKey::Noble, ChainKey::Namada] {
            assert!(registry.find_by_key(key).is_some(), "missing {} lane", key);
        }
    }

    #[test]
    fn test_default_polling_configs_match_defaults() {
        let configs = default_polling_configs();
        let noble = configs.for_chain("noble-testnet");
        assert_eq!(noble.max_duration_min, 30);
        assert_eq!(noble.block_window_backscan, 20);
        assert_eq!(noble.poll_interval_ms, 5000);
        assert_eq!(noble.block_request_delay_ms, Some(250));
    }
}
