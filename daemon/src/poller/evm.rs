use std::time::Duration;

use flow_common::tokio::time::Instant;
use log::{debug, warn};
use primitive_types::U256;

use super::{PollOutcome, PollParams};
use crate::chain::{
    decode_data_word, pad_address_topic, EvmApi, LogFilter, TRANSFER_EVENT_TOPIC,
    ZERO_ADDRESS_TOPIC,
};

/// Matching parameters for an ERC-20 USDC mint (Transfer from the zero
/// address) towards a known recipient
#[derive(Debug, Clone)]
pub struct UsdcMintParams {
    pub usdc_address: String,
    pub recipient: String,
    /// Decimal base units, e.g. "100000" for 0.1 USDC
    pub amount_base_units: String,
}

async fn sleep_or_cancel(params: &PollParams, millis: u64) -> bool {
    tokio::select! {
        _ = params.cancel.cancelled() => true,
        _ = tokio::time::sleep(Duration::from_millis(millis)) => false,
    }
}

/// Watch an EVM chain for a USDC mint: a Transfer log from the zero address
/// to `recipient` on the token contract whose value equals the expected
/// amount exactly. Scans block ranges through `eth_getLogs`.
pub async fn poll_usdc_mint(
    api: &dyn EvmApi,
    params: &PollParams,
    matcher: &UsdcMintParams,
) -> PollOutcome {
    let expected = match U256::from_dec_str(&matcher.amount_base_units) {
        Ok(amount) => amount,
        Err(e) => {
            warn!(
                "[{}] invalid expected amount {}: {}",
                params.flow_id, matcher.amount_base_units, e
            );
            return PollOutcome::NotMatched;
        }
    };

    let deadline = Instant::now() + Duration::from_millis(params.timeout_ms);
    let recipient_topic = pad_address_topic(&matcher.recipient);
    let mut next_block = params.start_block;

    loop {
        if params.cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return PollOutcome::TimedOut;
        }

        let tip = match api.get_block_number().await {
            Ok(tip) => tip,
            Err(e) => {
                warn!(
                    "[{}] failed to read {} tip: {}",
                    params.flow_id, params.chain_id, e
                );
                if sleep_or_cancel(params, params.interval_ms).await {
                    return PollOutcome::Cancelled;
                }
                continue;
            }
        };

        if next_block <= tip {
            let filter = LogFilter {
                from_block: next_block,
                to_block: tip,
                address: matcher.usdc_address.clone(),
                topics: vec![
                    Some(TRANSFER_EVENT_TOPIC.to_string()),
                    Some(ZERO_ADDRESS_TOPIC.to_string()),
                    Some(recipient_topic.clone()),
                ],
            };

            match api.get_logs(&filter).await {
                Ok(logs) => {
                    for log in logs {
                        let value = match decode_data_word(&log.data) {
                            Ok(value) => value,
                            Err(e) => {
                                warn!(
                                    "[{}] undecodable transfer value in {}: {}",
                                    params.flow_id, log.transaction_hash, e
                                );
                                continue;
                            }
                        };
                        if value == expected {
                            let block = log.block_number_u64().unwrap_or(tip);
                            debug!(
                                "[{}] usdc mint matched in {} at block {}",
                                params.flow_id, log.transaction_hash, block
                            );
                            return PollOutcome::Matched {
                                tx_hash: Some(log.transaction_hash),
                                block,
                            };
                        }
                    }
                    next_block = tip + 1;
                }
                Err(e) if e.is_transient() => {
                    // keep the window, try again next round
                    warn!(
                        "[{}] {} getLogs failed: {}",
                        params.flow_id, params.chain_id, e
                    );
                }
                Err(e) => {
                    // advance past the offending range rather than stall
                    warn!(
                        "[{}] {} getLogs rejected [{}..{}], skipping: {}",
                        params.flow_id, params.chain_id, next_block, tip, e
                    );
                    next_block = tip + 1;
                }
            }
        }

        if sleep_or_cancel(params, params.interval_ms).await {
            return PollOutcome::Cancelled;
        }
    }
}

/// Wait until an EVM transaction is mined and succeeded.
/// Used for the deposit burn stage whose hash is already known.
pub async fn poll_burn_receipt(
    api: &dyn EvmApi,
    params: &PollParams,
    tx_hash: &str,
) -> PollOutcome {
    let deadline = Instant::now() + Duration::from_millis(params.timeout_ms);

    loop {
        if params.cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return PollOutcome::TimedOut;
        }

        match api.get_transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) if receipt.succeeded() => {
                let block = receipt
                    .block_number
                    .as_deref()
                    .and_then(|b| u64::from_str_radix(b.trim_start_matches("0x"), 16).ok())
                    .unwrap_or_default();
                return PollOutcome::Matched {
                    tx_hash: Some(receipt.transaction_hash),
                    block,
                };
            }
            Ok(Some(receipt)) => {
                warn!(
                    "[{}] burn transaction {} reverted",
                    params.flow_id, receipt.transaction_hash
                );
                return PollOutcome::NotMatched;
            }
            // not yet mined
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "[{}] failed to fetch {} receipt {}: {}",
                    params.flow_id, params.chain_id, tx_hash, e
                );
            }
        }

        if sleep_or_cancel(params, params.interval_ms).await {
            return PollOutcome::Cancelled;
        }
    }
}
