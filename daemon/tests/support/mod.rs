#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use flow_common::chain::PollingConfigs;
use flow_daemon::{
    chain::{
        BlockResults, ChainClients, EvmApi, EvmLog, EvmReceipt, LogFilter, RpcClientError,
        TendermintApi, TxResponse, TxSearchResponse,
    },
    config::default_registry,
    core::storage::SledStorage,
    events::EventBus,
    tracker::{FlowTracker, SharedFlowTracker},
};
use serde_json::Value;

/// In-memory Tendermint endpoint fed with literal block fixtures
#[derive(Default)]
pub struct MockTendermint {
    pub tip: Mutex<u64>,
    pub blocks: Mutex<HashMap<u64, BlockResults>>,
    pub txs: Mutex<HashMap<String, TxResponse>>,
}

impl MockTendermint {
    pub fn with_tip(tip: u64) -> Self {
        Self {
            tip: Mutex::new(tip),
            ..Default::default()
        }
    }

    pub fn insert_block(&self, height: u64, block: BlockResults) {
        self.blocks.lock().unwrap().insert(height, block);
    }

    pub fn insert_tx(&self, hash: &str, tx: TxResponse) {
        self.txs.lock().unwrap().insert(hash.to_string(), tx);
    }
}

#[async_trait]
impl TendermintApi for MockTendermint {
    async fn get_latest_block_height(&self) -> Result<u64, RpcClientError> {
        Ok(*self.tip.lock().unwrap())
    }

    async fn get_block_results(&self, height: u64) -> Result<Option<BlockResults>, RpcClientError> {
        if height > *self.tip.lock().unwrap() {
            return Ok(None);
        }
        Ok(Some(
            self.blocks
                .lock()
                .unwrap()
                .get(&height)
                .cloned()
                .unwrap_or_default(),
        ))
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<TxResponse>, RpcClientError> {
        Ok(self.txs.lock().unwrap().get(hash).cloned())
    }

    async fn search_transactions(
        &self,
        _query: &str,
        _page: u32,
        _per_page: u32,
    ) -> Result<TxSearchResponse, RpcClientError> {
        Ok(TxSearchResponse::default())
    }
}

/// In-memory EVM endpoint
#[derive(Default)]
pub struct MockEvm {
    pub tip: Mutex<u64>,
    pub logs: Mutex<Vec<EvmLog>>,
    pub receipts: Mutex<HashMap<String, EvmReceipt>>,
}

impl MockEvm {
    pub fn with_tip(tip: u64) -> Self {
        Self {
            tip: Mutex::new(tip),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EvmApi for MockEvm {
    async fn get_block_number(&self) -> Result<u64, RpcClientError> {
        Ok(*self.tip.lock().unwrap())
    }

    async fn get_logs(&self, _filter: &LogFilter) -> Result<Vec<EvmLog>, RpcClientError> {
        Ok(self.logs.lock().unwrap().clone())
    }

    async fn get_transaction(&self, _hash: &str) -> Result<Option<Value>, RpcClientError> {
        Ok(None)
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<EvmReceipt>, RpcClientError> {
        Ok(self.receipts.lock().unwrap().get(hash).cloned())
    }
}

/// Polling config with a 1-minute budget and tight pacing for tests
pub fn fast_polling() -> PollingConfigs {
    serde_json::from_value(serde_json::json!({
        "sepolia": {"maxDurationMin": 1, "blockWindowBackscan": 20, "pollIntervalMs": 100},
        "noble-testnet": {"maxDurationMin": 1, "blockWindowBackscan": 20, "pollIntervalMs": 100},
        "namada-testnet": {"maxDurationMin": 1, "blockWindowBackscan": 20, "pollIntervalMs": 100}
    }))
    .expect("polling configs")
}

/// Tracker over temporary storage and the given mock endpoints, registered
/// under the built-in testnet chain ids
pub fn build_tracker(
    store: Arc<SledStorage>,
    noble: Option<Arc<dyn TendermintApi>>,
    namada: Option<Arc<dyn TendermintApi>>,
    evm: Option<Arc<dyn EvmApi>>,
) -> SharedFlowTracker<SledStorage> {
    let mut clients = ChainClients::default();
    if let Some(noble) = noble {
        clients.insert_tendermint("noble-testnet", noble);
    }
    if let Some(namada) = namada {
        clients.insert_tendermint("namada-testnet", namada);
    }
    if let Some(evm) = evm {
        clients.insert_evm("sepolia", evm);
    }
    FlowTracker::new(
        store,
        Arc::new(clients),
        default_registry(),
        fast_polling(),
        Arc::new(EventBus::new()),
    )
}
