use std::{collections::HashMap, sync::Arc};

use flow_common::chain::{ChainRegistry, ChainType};
use log::info;

use super::{EvmApi, EvmClient, TendermintApi, TendermintClient};

/// Per-chain-id client instances, built once from the registry.
/// Adapters are effectively stateless; reqwest pools connections underneath.
#[derive(Default)]
pub struct ChainClients {
    evm: HashMap<String, Arc<dyn EvmApi>>,
    tendermint: HashMap<String, Arc<dyn TendermintApi>>,
}

impl ChainClients {
    pub fn from_registry(registry: &ChainRegistry) -> Self {
        let mut clients = Self::default();
        for (chain_id, entry) in registry.iter() {
            match entry.chain_type {
                ChainType::Evm => {
                    clients.insert_evm(chain_id, Arc::new(EvmClient::new(entry.rpc_urls.clone())));
                }
                ChainType::Tendermint => {
                    clients.insert_tendermint(
                        chain_id,
                        Arc::new(TendermintClient::new(entry.rpc_urls.clone())),
                    );
                }
            }
            info!(
                "Registered {} client for chain {} ({} RPC urls)",
                entry.chain_type,
                chain_id,
                entry.rpc_urls.len()
            );
        }
        clients
    }

    pub fn insert_evm(&mut self, chain_id: &str, client: Arc<dyn EvmApi>) {
        self.evm.insert(chain_id.to_string(), client);
    }

    pub fn insert_tendermint(&mut self, chain_id: &str, client: Arc<dyn TendermintApi>) {
        self.tendermint.insert(chain_id.to_string(), client);
    }

    pub fn evm(&self, chain_id: &str) -> Option<Arc<dyn EvmApi>> {
        self.evm.get(chain_id).cloned()
    }

    pub fn tendermint(&self, chain_id: &str) -> Option<Arc<dyn TendermintApi>> {
        self.tendermint.get(chain_id).cloned()
    }
}
