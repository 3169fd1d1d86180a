use indexmap::IndexMap;
use serde_json::Value;

use super::Flow;

/// Matching parameters derived from a flow's free-form metadata.
/// Each field is populated only when a non-empty string (or number, for
/// `destination_domain`) exists under one of its metadata keys.
#[derive(Debug, Clone, Default)]
pub struct TrackingParams {
    pub evm_burn_tx_hash: Option<String>,
    pub forwarding_address: Option<String>,
    pub namada_receiver: Option<String>,
    pub usdc_address: Option<String>,
    pub recipient: Option<String>,
    pub amount_base_units: Option<String>,
    pub expected_amount_uusdc: Option<String>,
    pub memo_json: Option<String>,
    pub namada_ibc_tx_hash: Option<String>,
    pub destination_caller_b64: Option<String>,
    pub mint_recipient_b64: Option<String>,
    pub channel_id: Option<String>,
    pub destination_domain: Option<u32>,
}

// Non-empty string lookup with ordered fallbacks
fn lookup(metadata: &IndexMap<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(s)) = metadata.get(*key) {
            if !s.is_empty() {
                return Some(s.clone());
            }
        }
    }
    None
}

fn lookup_numeric(metadata: &IndexMap<String, Value>, key: &str) -> Option<u32> {
    match metadata.get(key) {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

impl TrackingParams {
    pub fn derive(flow: &Flow) -> Self {
        let metadata = &flow.metadata;

        let evm_burn_tx_hash = lookup(metadata, &["evmBurnTxHash", "burnTxHash"])
            .or_else(|| flow.tx_hash.clone().filter(|s| !s.is_empty()));

        let amount_base_units = lookup(metadata, &["amountBaseUnits", "amount"]);

        // The uusdc form falls back to the base-units amount with the denom
        // suffix appended when it is not already present
        let expected_amount_uusdc = lookup(metadata, &["expectedAmountUusdc"]).or_else(|| {
            amount_base_units.as_ref().map(|amount| {
                if amount.ends_with("uusdc") {
                    amount.clone()
                } else {
                    format!("{}uusdc", amount)
                }
            })
        });

        Self {
            evm_burn_tx_hash,
            forwarding_address: lookup(metadata, &["forwardingAddress", "nobleForwardingAddress"]),
            namada_receiver: lookup(metadata, &["namadaReceiver", "destinationAddress"]),
            usdc_address: lookup(metadata, &["usdcAddress"]),
            recipient: lookup(metadata, &["recipient", "destinationEvmAddress"]),
            amount_base_units,
            expected_amount_uusdc,
            memo_json: lookup(metadata, &["memoJson"]),
            namada_ibc_tx_hash: lookup(metadata, &["namadaIbcTxHash"]),
            destination_caller_b64: lookup(metadata, &["destinationCallerB64"]),
            mint_recipient_b64: lookup(metadata, &["mintRecipientB64"]),
            channel_id: lookup(metadata, &["channelId"]),
            destination_domain: lookup_numeric(metadata, "destinationDomain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::flow::FlowType;

    fn flow_with_metadata(metadata: IndexMap<String, Value>, tx_hash: Option<&str>) -> Flow {
        Flow::new(
            "flow-1".to_string(),
            FlowType::Deposit,
            "sepolia".to_string(),
            "namada-testnet".to_string(),
            tx_hash.map(String::from),
            metadata,
        )
    }

    #[test]
    fn test_burn_hash_fallback_chain() {
        let mut metadata = IndexMap::new();
        metadata.insert("burnTxHash".to_string(), json!("0xfallback"));
        let flow = flow_with_metadata(metadata, Some("0xflow"));
        let params = TrackingParams::derive(&flow);
        assert_eq!(params.evm_burn_tx_hash.as_deref(), Some("0xfallback"));

        let flow = flow_with_metadata(IndexMap::new(), Some("0xflow"));
        let params = TrackingParams::derive(&flow);
        assert_eq!(params.evm_burn_tx_hash.as_deref(), Some("0xflow"));
    }

    #[test]
    fn test_empty_string_is_absent() {
        let mut metadata = IndexMap::new();
        metadata.insert("forwardingAddress".to_string(), json!(""));
        metadata.insert("nobleForwardingAddress".to_string(), json!("noble1abc"));
        let flow = flow_with_metadata(metadata, None);
        let params = TrackingParams::derive(&flow);
        assert_eq!(params.forwarding_address.as_deref(), Some("noble1abc"));
    }

    #[test]
    fn test_expected_amount_suffix() {
        let mut metadata = IndexMap::new();
        metadata.insert("amountBaseUnits".to_string(), json!("100000"));
        let flow = flow_with_metadata(metadata, None);
        let params = TrackingParams::derive(&flow);
        assert_eq!(params.expected_amount_uusdc.as_deref(), Some("100000uusdc"));

        let mut metadata = IndexMap::new();
        metadata.insert("amountBaseUnits".to_string(), json!("100000uusdc"));
        let flow = flow_with_metadata(metadata, None);
        let params = TrackingParams::derive(&flow);
        assert_eq!(params.expected_amount_uusdc.as_deref(), Some("100000uusdc"));

        let mut metadata = IndexMap::new();
        metadata.insert("expectedAmountUusdc".to_string(), json!("42uusdc"));
        metadata.insert("amountBaseUnits".to_string(), json!("100000"));
        let flow = flow_with_metadata(metadata, None);
        let params = TrackingParams::derive(&flow);
        assert_eq!(params.expected_amount_uusdc.as_deref(), Some("42uusdc"));
    }

    #[test]
    fn test_destination_domain_number_or_string() {
        let mut metadata = IndexMap::new();
        metadata.insert("destinationDomain".to_string(), json!(0));
        let flow = flow_with_metadata(metadata, None);
        assert_eq!(TrackingParams::derive(&flow).destination_domain, Some(0));

        let mut metadata = IndexMap::new();
        metadata.insert("destinationDomain".to_string(), json!("7"));
        let flow = flow_with_metadata(metadata, None);
        assert_eq!(TrackingParams::derive(&flow).destination_domain, Some(7));
    }

    #[test]
    fn test_amount_fallback() {
        let mut metadata = IndexMap::new();
        metadata.insert("amount".to_string(), json!("250000"));
        let flow = flow_with_metadata(metadata, None);
        let params = TrackingParams::derive(&flow);
        assert_eq!(params.amount_base_units.as_deref(), Some("250000"));
    }
}
