use async_trait::async_trait;
use log::trace;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{with_retry, RpcClientError};
use crate::config::RPC_REQUEST_TIMEOUT_SECS;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_EVENT_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// 32-byte zero address topic, the `from` of an ERC-20 mint
pub const ZERO_ADDRESS_TOPIC: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

/// Left-pad a 20-byte address into a 32-byte log topic
pub fn pad_address_topic(address: &str) -> String {
    let stripped = address.trim_start_matches("0x").to_lowercase();
    format!("0x{:0>64}", stripped)
}

// Parse a "0x"-prefixed quantity into u64
fn parse_quantity(value: &Value) -> Result<u64, RpcClientError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcClientError::InvalidResponse("quantity is not a string".to_string()))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| RpcClientError::InvalidResponse(format!("bad quantity {}: {}", s, e)))
}

/// Decode a 32-byte big-endian log data word into a U256
pub fn decode_data_word(data: &str) -> Result<U256, RpcClientError> {
    let stripped = data.trim_start_matches("0x");
    if stripped.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(stripped, 16)
        .map_err(|e| RpcClientError::InvalidResponse(format!("bad data word {}: {}", data, e)))
}

/// eth_getLogs filter: block range, contract address, up to three indexed topics
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub address: String,
    pub topics: Vec<Option<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub transaction_hash: String,
}

impl EvmLog {
    pub fn block_number_u64(&self) -> Result<u64, RpcClientError> {
        parse_quantity(&Value::String(self.block_number.clone()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmReceipt {
    pub transaction_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<String>,
    /// "0x1" on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl EvmReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.as_deref() == Some("0x1")
    }
}

/// Uniform read interface over EVM JSON-RPC
#[async_trait]
pub trait EvmApi: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, RpcClientError>;
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<EvmLog>, RpcClientError>;
    async fn get_transaction(&self, hash: &str) -> Result<Option<Value>, RpcClientError>;
    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<EvmReceipt>, RpcClientError>;
}

/// JSON-RPC client over one or more EVM endpoints.
/// Attempts rotate across the configured URLs.
pub struct EvmClient {
    client: reqwest::Client,
    rpc_urls: Vec<String>,
}

impl EvmClient {
    pub fn new(rpc_urls: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(RPC_REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, rpc_urls }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcClientError> {
        if self.rpc_urls.is_empty() {
            return Err(RpcClientError::InvalidResponse(
                "no RPC urls configured".to_string(),
            ));
        }
        with_retry(method, |attempt| {
            let url = &self.rpc_urls[attempt % self.rpc_urls.len()];
            let body = json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params.clone(),
            });
            let request = self.client.post(url).json(&body);
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
                if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
                    return Err(RpcClientError::Rpc {
                        code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                        message: error
                            .get("message")
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
        })
        .await
    }
}

#[async_trait]
impl EvmApi for EvmClient {
    async fn get_block_number(&self) -> Result<u64, RpcClientError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("eth_blockNumber");
        }
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<EvmLog>, RpcClientError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!(
                "eth_getLogs {} [{}..{}]",
                filter.address,
                filter.from_block,
                filter.to_block
            );
        }
        let params = json!([{
            "fromBlock": format!("0x{:x}", filter.from_block),
            "toBlock": format!("0x{:x}", filter.to_block),
            "address": filter.address,
            "topics": filter.topics,
        }]);
        let result = self.call("eth_getLogs", params).await?;
        serde_json::from_value(result)
            .map_err(|e| RpcClientError::InvalidResponse(format!("bad logs payload: {}", e)))
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<Value>, RpcClientError> {
        let result = self
            .call("eth_getTransactionByHash", json!([hash]))
            .await?;
        Ok((!result.is_null()).then_some(result))
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<EvmReceipt>, RpcClientError> {
        let result = self
            .call("eth_getTransactionReceipt", json!([hash]))
            .await?;
        if result.is_null() {
            // not yet mined
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| RpcClientError::InvalidResponse(format!("bad receipt payload: {}", e)))
    }
}
