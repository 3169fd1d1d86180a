use log::debug;
use serde_json::Value;

use super::{
    decode::{amount_matches_uusdc, decode_packet_data, is_success_ack, strip_quotes},
    scan_blocks, OnUpdate, PollOutcome, PollParams,
};
use crate::chain::{BlockResults, TendermintApi};

/// Matching parameters for the Namada leg of a deposit
#[derive(Debug, Clone)]
pub struct NamadaDepositParams {
    /// Noble forwarding address, the IBC packet sender
    pub forwarding_address: String,
    pub namada_receiver: String,
    /// Numeric amount; an optional `uusdc` suffix on either side is tolerated
    pub expected_amount: String,
}

/// Watch Namada for the acknowledged IBC receive of a deposit.
///
/// Namada emits block events in `end_block_events`, and the inner
/// transaction hash travels in a separate `message` event rather than as an
/// attribute on `write_acknowledgement`. Each block is therefore scanned in
/// two passes: (a) pick up `inner-tx-hash`, (b) match the acknowledgement.
pub async fn poll_for_deposit(
    api: &dyn TendermintApi,
    params: &PollParams,
    matcher: &NamadaDepositParams,
    on_update: OnUpdate<'_>,
) -> PollOutcome {
    scan_blocks(api, params, on_update, |height, block| {
        let inner_tx_hash = find_inner_tx_hash(block);

        let matched = block
            .end_block_events
            .iter()
            .filter(|event| event.kind == "write_acknowledgement")
            .any(|event| {
                event.attr("packet_ack").is_some_and(is_success_ack)
                    && event
                        .attr("packet_data")
                        .and_then(decode_packet_data)
                        .is_some_and(|data| packet_matches(&data, matcher))
            });

        if matched {
            debug!(
                "[{}] namada acknowledgement matched at height {} (inner tx {:?})",
                params.flow_id, height, inner_tx_hash
            );
            Some(PollOutcome::Matched {
                tx_hash: inner_tx_hash,
                block: height,
            })
        } else {
            None
        }
    })
    .await
}

// Pass (a): the `message` event carries the Namada inner transaction hash
fn find_inner_tx_hash(block: &BlockResults) -> Option<String> {
    block
        .end_block_events
        .iter()
        .filter(|event| event.kind == "message")
        .find_map(|event| event.attr("inner-tx-hash"))
        .map(|hash| strip_quotes(hash).to_string())
}

fn packet_matches(data: &Value, matcher: &NamadaDepositParams) -> bool {
    let field = |key: &str| match data.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    field("sender").as_deref() == Some(matcher.forwarding_address.as_str())
        && field("receiver").as_deref() == Some(matcher.namada_receiver.as_str())
        && field("denom").as_deref() == Some("uusdc")
        && field("amount")
            .map(|amount| amount_matches_uusdc(&amount, &matcher.expected_amount))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::poller::test_support::{test_params, MockTendermint};

    const INNER_TX_HASH: &str = "DCAB74A1B0B2C3D4E5F60718293A4B5C6D7E8F90A1B2C3D4E5F6071829304D80";

    fn matcher() -> NamadaDepositParams {
        NamadaDepositParams {
            forwarding_address: "noble1cugfxuln9k2zsvey7yuaeckr7avfzffd7d44jp".to_string(),
            namada_receiver: "tnam1qprxs9n5afscskramwajyrdjw5a64lwweudc0l78".to_string(),
            expected_amount: "100000".to_string(),
        }
    }

    fn namada_block(amount: &str) -> crate::chain::BlockResults {
        let packet_data = json!({
            "sender": "noble1cugfxuln9k2zsvey7yuaeckr7avfzffd7d44jp",
            "receiver": "tnam1qprxs9n5afscskramwajyrdjw5a64lwweudc0l78",
            "denom": "uusdc",
            "amount": amount
        })
        .to_string();
        serde_json::from_value(json!({
            "height": "3418841",
            "end_block_events": [
                {
                    "type": "message",
                    "attributes": [{"key": "inner-tx-hash", "value": INNER_TX_HASH}]
                },
                {
                    "type": "write_acknowledgement",
                    "attributes": [
                        {"key": "packet_ack", "value": "{\"result\":\"AQ==\"}"},
                        {"key": "packet_data", "value": packet_data}
                    ]
                }
            ]
        }))
        .expect("block")
    }

    #[tokio::test]
    async fn test_matches_and_returns_inner_tx_hash() {
        let api = MockTendermint::with_tip(3418841);
        api.insert_block(3418841, namada_block("100000"));

        let params = test_params(3418841, 1_000);
        let outcome = poll_for_deposit(&api, &params, &matcher(), None).await;
        assert_eq!(
            outcome,
            PollOutcome::Matched {
                tx_hash: Some(INNER_TX_HASH.to_string()),
                block: 3418841
            }
        );
    }

    #[tokio::test]
    async fn test_amount_with_suffix_matches() {
        let api = MockTendermint::with_tip(3418841);
        api.insert_block(3418841, namada_block("100000uusdc"));

        let params = test_params(3418841, 1_000);
        let outcome = poll_for_deposit(&api, &params, &matcher(), None).await;
        assert!(outcome.is_matched());
    }

    #[tokio::test]
    async fn test_wrong_receiver_does_not_match() {
        let api = MockTendermint::with_tip(3418841);
        let mut matcher = matcher();
        matcher.namada_receiver = "tnam1other".to_string();
        api.insert_block(3418841, namada_block("100000"));

        let params = test_params(3418841, 50);
        let outcome = poll_for_deposit(&api, &params, &matcher, None).await;
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_failure_ack_does_not_match() {
        let api = MockTendermint::with_tip(3418841);
        let mut block = namada_block("100000");
        block.end_block_events[1].attributes[0].value = r#"{"error":"timeout"}"#.to_string();
        api.insert_block(3418841, block);

        let params = test_params(3418841, 50);
        let outcome = poll_for_deposit(&api, &params, &matcher(), None).await;
        assert_eq!(outcome, PollOutcome::TimedOut);
    }
}
