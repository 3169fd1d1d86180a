use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// Default observation window per stage, in minutes
pub const DEFAULT_MAX_DURATION_MIN: u64 = 30;
// How many blocks behind the tip we start scanning when no start block is known
pub const DEFAULT_BLOCK_WINDOW_BACKSCAN: u64 = 20;
// Sleep between tip polls once the scan is caught up
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// The closed set of progress lanes a flow can advance on.
/// Registry entries map their chain id onto one of these keys.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChainKey {
    Evm,
    Noble,
    Namada,
}

/// Read-interface family of a chain endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChainType {
    Evm,
    Tendermint,
}

/// Deployed contract addresses for an EVM chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainContracts {
    pub usdc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_messenger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_transmitter: Option<String>,
}

/// One chain registry entry, keyed by chain id (e.g. "sepolia", "noble-testnet")
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEntry {
    pub chain_type: ChainType,
    /// Which progress lane this chain advances
    pub key: ChainKey,
    pub network: String,
    pub display_name: String,
    pub rpc_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contracts: Option<ChainContracts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gasless: Option<bool>,
}

/// Chain id -> entry mapping loaded from the registry file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainRegistry(pub IndexMap<String, ChainEntry>);

impl ChainRegistry {
    pub fn get(&self, chain_id: &str) -> Option<&ChainEntry> {
        self.0.get(chain_id)
    }

    pub fn contains(&self, chain_id: &str) -> bool {
        self.0.contains_key(chain_id)
    }

    // First registry entry advancing the requested lane
    pub fn find_by_key(&self, key: ChainKey) -> Option<(&str, &ChainEntry)> {
        self.0
            .iter()
            .find(|(_, entry)| entry.key == key)
            .map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChainEntry)> {
        self.0.iter()
    }
}

/// Per-chain polling budget and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingConfig {
    pub max_duration_min: u64,
    pub block_window_backscan: u64,
    pub poll_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_request_delay_ms: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_duration_min: DEFAULT_MAX_DURATION_MIN,
            block_window_backscan: DEFAULT_BLOCK_WINDOW_BACKSCAN,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            block_request_delay_ms: None,
        }
    }
}

impl PollingConfig {
    pub fn stage_timeout_ms(&self) -> u64 {
        self.max_duration_min * 60_000
    }
}

/// Chain id -> polling config, falling back to defaults for unknown ids
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollingConfigs(pub IndexMap<String, PollingConfig>);

impl PollingConfigs {
    pub fn for_chain(&self, chain_id: &str) -> PollingConfig {
        self.0.get(chain_id).cloned().unwrap_or_default()
    }

    // Merge overrides on top of the existing mapping (JSON env override)
    pub fn merge(&mut self, overrides: PollingConfigs) {
        for (chain_id, config) in overrides.0 {
            self.0.insert(chain_id, config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_key_roundtrip() {
        for (key, expected) in [
            (ChainKey::Evm, "\"evm\""),
            (ChainKey::Noble, "\"noble\""),
            (ChainKey::Namada, "\"namada\""),
        ] {
            let json = serde_json::to_string(&key).expect("serialize chain key");
            assert_eq!(json, expected);
            let back: ChainKey = serde_json::from_str(&json).expect("deserialize chain key");
            assert_eq!(back, key);
        }
    }

    #[test]
    fn test_polling_config_defaults() {
        let configs = PollingConfigs::default();
        let config = configs.for_chain("unknown-chain");
        assert_eq!(config.max_duration_min, DEFAULT_MAX_DURATION_MIN);
        assert_eq!(config.block_window_backscan, DEFAULT_BLOCK_WINDOW_BACKSCAN);
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.stage_timeout_ms(), 30 * 60_000);
    }

    #[test]
    fn test_registry_lookup() {
        let json = r#"{
            "noble-testnet": {
                "chainType": "tendermint",
                "key": "noble",
                "network": "testnet",
                "displayName": "Noble Testnet",
                "rpcUrls": ["https://noble-testnet-rpc.example.com"]
            }
        }"#;
        let registry: ChainRegistry = serde_json::from_str(json).expect("parse registry");
        assert!(registry.contains("noble-testnet"));
        assert!(!registry.contains("sepolia"));
        let (id, entry) = registry.find_by_key(ChainKey::Noble).expect("noble entry");
        assert_eq!(id, "noble-testnet");
        assert_eq!(entry.chain_type, ChainType::Tendermint);
    }

    #[test]
    fn test_polling_config_merge() {
        let mut configs: PollingConfigs =
            serde_json::from_str(r#"{"noble-testnet": {"maxDurationMin": 30}}"#).expect("parse");
        let overrides: PollingConfigs =
            serde_json::from_str(r#"{"noble-testnet": {"maxDurationMin": 1, "pollIntervalMs": 100}}"#)
                .expect("parse overrides");
        configs.merge(overrides);
        let config = configs.for_chain("noble-testnet");
        assert_eq!(config.max_duration_min, 1);
        assert_eq!(config.poll_interval_ms, 100);
    }
}
