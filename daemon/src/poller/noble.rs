use log::debug;
use serde_json::Value;

use super::{
    decode::{decode_packet_data, is_success_ack, strip_quotes},
    scan_blocks, OnUpdate, PollOutcome, PollParams,
};
use crate::chain::{BlockResults, TendermintApi};

/// Matching parameters for an EVM -> Noble -> Namada deposit
#[derive(Debug, Clone)]
pub struct NobleDepositParams {
    pub forwarding_address: String,
    pub namada_receiver: String,
    /// Cosmos concatenation, e.g. "100000uusdc"
    pub expected_amount_uusdc: String,
}

// Decoded packet_data fields arrive as strings or numbers depending on the
// encoder; compare through a common textual form
fn field_as_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Watch Noble for the two independent conditions of a deposit: the CCTP
/// mint into the forwarding address (`coin_received`) and the IBC forward
/// towards Namada (`ibc_transfer`). The conditions may appear at the same
/// or different heights; each latches once observed.
pub async fn poll_for_deposit(
    api: &dyn TendermintApi,
    params: &PollParams,
    matcher: &NobleDepositParams,
    on_update: OnUpdate<'_>,
) -> PollOutcome {
    let mut coin_received = false;
    let mut ibc_transferred = false;

    scan_blocks(api, params, on_update, |height, block| {
        if !coin_received && block_has_coin_received(block, matcher) {
            debug!(
                "[{}] coin_received matched at noble height {}",
                params.flow_id, height
            );
            coin_received = true;
        }
        if !ibc_transferred && block_has_ibc_transfer(block, matcher) {
            debug!(
                "[{}] ibc_transfer matched at noble height {}",
                params.flow_id, height
            );
            ibc_transferred = true;
        }

        (coin_received && ibc_transferred).then_some(PollOutcome::Matched {
            tx_hash: None,
            block: height,
        })
    })
    .await
}

fn block_has_coin_received(block: &BlockResults, matcher: &NobleDepositParams) -> bool {
    block
        .txs_results
        .iter()
        .flatten()
        .flat_map(|tx| &tx.events)
        .filter(|event| event.kind == "coin_received")
        .any(|event| {
            event.attr("receiver").map(strip_quotes) == Some(matcher.forwarding_address.as_str())
                && event.attr("amount").map(strip_quotes)
                    == Some(matcher.expected_amount_uusdc.as_str())
        })
}

fn block_has_ibc_transfer(block: &BlockResults, matcher: &NobleDepositParams) -> bool {
    block
        .finalize_block_events
        .iter()
        .filter(|event| event.kind == "ibc_transfer")
        .any(|event| {
            event.attr("sender").map(strip_quotes) == Some(matcher.forwarding_address.as_str())
                && event.attr("receiver").map(strip_quotes)
                    == Some(matcher.namada_receiver.as_str())
                && event.attr("denom").map(strip_quotes) == Some("uusdc")
        })
}

/// Matching parameters for a Namada -> Noble -> EVM payment
#[derive(Debug, Clone)]
pub struct OrbiterParams {
    pub memo_json: String,
    pub amount: String,
    pub receiver: String,
    pub destination_caller_b64: String,
    pub mint_recipient_b64: String,
    pub destination_domain: u32,
}

/// Watch Noble for the two independent conditions of a payment: the
/// acknowledged IBC receive from Namada (`write_acknowledgement`) and the
/// CCTP burn towards the EVM destination (`circle.cctp.v1.DepositForBurn`).
pub async fn poll_for_orbiter(
    api: &dyn TendermintApi,
    params: &PollParams,
    matcher: &OrbiterParams,
    on_update: OnUpdate<'_>,
) -> PollOutcome {
    let mut acknowledged = false;
    let mut burned = false;

    scan_blocks(api, params, on_update, |height, block| {
        for event in block.txs_results.iter().flatten().flat_map(|tx| &tx.events) {
            match event.kind.as_str() {
                "write_acknowledgement" if !acknowledged => {
                    let ack_ok = event.attr("packet_ack").is_some_and(is_success_ack);
                    let data_ok = event
                        .attr("packet_data")
                        .and_then(decode_packet_data)
                        .is_some_and(|data| {
                            field_as_string(&data, "memo").as_deref()
                                == Some(matcher.memo_json.as_str())
                                && field_as_string(&data, "amount").as_deref()
                                    == Some(matcher.amount.as_str())
                                && field_as_string(&data, "receiver").as_deref()
                                    == Some(matcher.receiver.as_str())
                        });
                    if ack_ok && data_ok {
                        debug!(
                            "[{}] write_acknowledgement matched at noble height {}",
                            params.flow_id, height
                        );
                        acknowledged = true;
                    }
                }
                "circle.cctp.v1.DepositForBurn" if !burned => {
                    // CCTP attributes arrive wrapped in double-quotes
                    let matched = event.attr("amount").map(strip_quotes)
                        == Some(matcher.amount.as_str())
                        && event.attr("destination_caller").map(strip_quotes)
                            == Some(matcher.destination_caller_b64.as_str())
                        && event.attr("mint_recipient").map(strip_quotes)
                            == Some(matcher.mint_recipient_b64.as_str())
                        && event
                            .attr("destination_domain")
                            .map(strip_quotes)
                            .and_then(|v| v.parse::<u32>().ok())
                            == Some(matcher.destination_domain);
                    if matched {
                        debug!(
                            "[{}] DepositForBurn matched at noble height {}",
                            params.flow_id, height
                        );
                        burned = true;
                    }
                }
                _ => {}
            }
        }

        (acknowledged && burned).then_some(PollOutcome::Matched {
            tx_hash: None,
            block: height,
        })
    })
    .await
}
