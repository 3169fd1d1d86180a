use async_trait::async_trait;
use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{with_retry, RpcClientError};
use crate::config::RPC_REQUEST_TIMEOUT_SECS;

/// One event attribute, indexed by key
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventAttribute {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// ABCI event with a type and keyed attributes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbciEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

impl AbciEvent {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }
}

/// Result of one transaction inside a block
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub events: Vec<AbciEvent>,
}

/// Events of one finalized block: transactional events plus the
/// non-transactional events emitted by block finalization
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BlockResults {
    #[serde(default)]
    pub height: String,
    #[serde(default)]
    pub txs_results: Option<Vec<TxResult>>,
    #[serde(default)]
    pub finalize_block_events: Vec<AbciEvent>,
    #[serde(default)]
    pub end_block_events: Vec<AbciEvent>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TxResponse {
    pub hash: String,
    #[serde(default)]
    pub height: String,
    #[serde(default)]
    pub tx_result: TxResult,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TxSearchResponse {
    #[serde(default)]
    pub txs: Vec<TxResponse>,
    #[serde(default)]
    pub total_count: String,
}

/// Uniform read interface over Tendermint RPC
#[async_trait]
pub trait TendermintApi: Send + Sync {
    async fn get_latest_block_height(&self) -> Result<u64, RpcClientError>;
    /// None when the height is not yet available
    async fn get_block_results(&self, height: u64) -> Result<Option<BlockResults>, RpcClientError>;
    async fn get_transaction(&self, hash: &str) -> Result<Option<TxResponse>, RpcClientError>;
    async fn search_transactions(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<TxSearchResponse, RpcClientError>;
}

/// REST client over one or more Tendermint endpoints.
/// Attempts rotate across the configured URLs.
pub struct TendermintClient {
    client: reqwest::Client,
    rpc_urls: Vec<String>,
}

impl TendermintClient {
    pub fn new(rpc_urls: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(RPC_REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, rpc_urls }
    }

    async fn get(&self, path_and_query: &str) -> Result<Value, RpcClientError> {
        if self.rpc_urls.is_empty() {
            return Err(RpcClientError::InvalidResponse(
                "no RPC urls configured".to_string(),
            ));
        }
        with_retry(path_and_query, |attempt| {
            let base = self.rpc_urls[attempt % self.rpc_urls.len()].trim_end_matches('/');
            let url = format!("{}/{}", base, path_and_query);
            let request = self.client.get(url);
            async move {
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(RpcClientError::Http {
                        status: status.as_u16(),
                        body,
                    });
                }
                let value: Value = response.json().await?;
                Ok(value)
            }
        })
        .await
    }

    // Unwrap the JSON-RPC envelope Tendermint REST responses carry
    fn unwrap_result(value: Value) -> Result<Value, RpcClientError> {
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            return Err(RpcClientError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("data")
                    .or_else(|| error.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| RpcClientError::InvalidResponse("missing result".to_string()))
    }
}

#[async_trait]
impl TendermintApi for TendermintClient {
    async fn get_latest_block_height(&self) -> Result<u64, RpcClientError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("tendermint status");
        }
        let value = self.get("status").await?;
        let result = Self::unwrap_result(value)?;
        let height = result
            .pointer("/sync_info/latest_block_height")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RpcClientError::InvalidResponse("missing latest_block_height".to_string())
            })?;
        height
            .parse()
            .map_err(|e| RpcClientError::InvalidResponse(format!("bad height {}: {}", height, e)))
    }

    async fn get_block_results(&self, height: u64) -> Result<Option<BlockResults>, RpcClientError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("block_results height={}", height);
        }
        let value = self.get(&format!("block_results?height={}", height)).await?;
        match Self::unwrap_result(value) {
            Ok(result) => serde_json::from_value(result).map(Some).map_err(|e| {
                RpcClientError::InvalidResponse(format!("bad block_results payload: {}", e))
            }),
            // the node answers with an RPC error for heights it doesn't have yet
            Err(RpcClientError::Rpc { message, .. })
                if message.contains("must be less than or equal")
                    || message.contains("could not find results") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<TxResponse>, RpcClientError> {
        let hash = hash.trim_start_matches("0x");
        let value = self.get(&format!("tx?hash=0x{}", hash)).await?;
        match Self::unwrap_result(value) {
            Ok(result) => serde_json::from_value(result).map(Some).map_err(|e| {
                RpcClientError::InvalidResponse(format!("bad tx payload: {}", e))
            }),
            Err(RpcClientError::Rpc { message, .. }) if message.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search_transactions(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<TxSearchResponse, RpcClientError> {
        let encoded = urlencode(query);
        let value = self
            .get(&format!(
                "tx_search?query=%22{}%22&page={}&per_page={}",
                encoded, page, per_page
            ))
            .await?;
        let result = Self::unwrap_result(value)?;
        serde_json::from_value(result).map_err(|e| {
            RpcClientError::InvalidResponse(format!("bad tx_search payload: {}", e))
        })
    }
}

// Minimal percent-encoding for tx_search queries
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'=' => {
                out.push(byte as char)
            }
            b'\'' => out.push_str("%27"),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
