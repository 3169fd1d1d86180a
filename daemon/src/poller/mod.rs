pub mod decode;
pub mod evm;
pub mod namada;
pub mod noble;

pub use evm::UsdcMintParams;
pub use namada::NamadaDepositParams;
pub use noble::{NobleDepositParams, OrbiterParams};

use std::time::Duration;

use flow_common::tokio::time::Instant;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::chain::{BlockResults, TendermintApi};

/// Scan parameters shared by every poller. Pollers are stateless and
/// reentrant; all progress lives in these values and in the store.
#[derive(Debug, Clone)]
pub struct PollParams {
    pub flow_id: String,
    pub chain_id: String,
    pub start_block: u64,
    pub timeout_ms: u64,
    pub interval_ms: u64,
    pub block_request_delay_ms: u64,
    pub cancel: CancellationToken,
}

/// Why a poller returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Matched {
        tx_hash: Option<String>,
        block: u64,
    },
    /// The observation definitively cannot match (e.g. the watched
    /// transaction failed on-chain)
    NotMatched,
    /// Wall-clock budget exhausted without a match
    TimedOut,
    /// Cancellation signal fired
    Cancelled,
}

impl PollOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// Heartbeat callback invoked when a scan sweep catches up with the tip
pub type OnUpdate<'a> = Option<&'a (dyn Fn(u64) + Send + Sync)>;

// Sleep that returns early (true) when the token fires
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Generic Tendermint scan loop: walks heights from `start_block` towards
/// the tip, feeding each available block to `visit`, advancing past
/// per-height errors, pacing block fetches, and sleeping `interval_ms`
/// between tip polls when caught up. Terminates on match, deadline or
/// cancellation.
pub async fn scan_blocks<F>(
    api: &dyn TendermintApi,
    params: &PollParams,
    on_update: OnUpdate<'_>,
    mut visit: F,
) -> PollOutcome
where
    F: FnMut(u64, &BlockResults) -> Option<PollOutcome>,
{
    let deadline = Instant::now() + Duration::from_millis(params.timeout_ms);
    let mut next_height = params.start_block;

    loop {
        if params.cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return PollOutcome::TimedOut;
        }

        let tip = match api.get_latest_block_height().await {
            Ok(tip) => tip,
            Err(e) => {
                warn!(
                    "[{}] failed to read {} tip: {}",
                    params.flow_id, params.chain_id, e
                );
                if sleep_or_cancel(&params.cancel, Duration::from_millis(params.interval_ms)).await
                {
                    return PollOutcome::Cancelled;
                }
                continue;
            }
        };

        while next_height <= tip {
            if params.cancel.is_cancelled() {
                return PollOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                return PollOutcome::TimedOut;
            }

            match api.get_block_results(next_height).await {
                Ok(Some(block)) => {
                    if let Some(outcome) = visit(next_height, &block) {
                        return outcome;
                    }
                }
                Ok(None) => {
                    // height not yet available, go back to tip polling
                    break;
                }
                Err(e) => {
                    // do not stall the scan on a bad height
                    warn!(
                        "[{}] skipping {} height {}: {}",
                        params.flow_id, params.chain_id, next_height, e
                    );
                }
            }
            next_height += 1;

            if params.block_request_delay_ms > 0
                && sleep_or_cancel(
                    &params.cancel,
                    Duration::from_millis(params.block_request_delay_ms),
                )
                .await
            {
                return PollOutcome::Cancelled;
            }
        }

        if let Some(update) = on_update {
            update(next_height.saturating_sub(1));
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "[{}] {} caught up at height {}, sleeping {}ms",
                params.flow_id,
                params.chain_id,
                tip,
                params.interval_ms
            );
        }
        if sleep_or_cancel(&params.cancel, Duration::from_millis(params.interval_ms)).await {
            return PollOutcome::Cancelled;
        }
    }
}

/// Wait until a Tendermint transaction is visible on-chain.
/// Used for stages whose initiating hash is already known.
pub async fn poll_transaction(
    api: &dyn TendermintApi,
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

        match api.get_transaction(tx_hash).await {
            Ok(Some(tx)) if tx.tx_result.code == 0 => {
                let block = tx.height.parse().unwrap_or_default();
                return PollOutcome::Matched {
                    tx_hash: Some(tx.hash),
                    block,
                };
            }
            Ok(Some(tx)) => {
                warn!(
                    "[{}] transaction {} failed on-chain with code {}",
                    params.flow_id, tx_hash, tx.tx_result.code
                );
                return PollOutcome::NotMatched;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "[{}] failed to fetch {} tx {}: {}",
                    params.flow_id, params.chain_id, tx_hash, e
                );
            }
        }

        if sleep_or_cancel(&params.cancel, Duration::from_millis(params.interval_ms)).await {
            return PollOutcome::Cancelled;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{collections::HashMap, sync::Mutex};

    use async_trait::async_trait;

    use crate::chain::{
        BlockResults, RpcClientError, TendermintApi, TxResponse, TxSearchResponse,
    };

    /// In-memory Tendermint endpoint for poller tests
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
    }

    #[async_trait]
    impl TendermintApi for MockTendermint {
        async fn get_latest_block_height(&self) -> Result<u64, RpcClientError> {
            Ok(*self.tip.lock().unwrap())
        }

        async fn get_block_results(
            &self,
            height: u64,
        ) -> Result<Option<BlockResults>, RpcClientError> {
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

        async fn get_transaction(
            &self,
            hash: &str,
        ) -> Result<Option<TxResponse>, RpcClientError> {
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

    pub fn test_params(start_block: u64, timeout_ms: u64) -> super::PollParams {
        super::PollParams {
            flow_id: "flow-test".to_string(),
            chain_id: "test-chain".to_string(),
            start_block,
            timeout_ms,
            interval_ms: 5,
            block_request_delay_ms: 0,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{test_support::*, *};
    use crate::chain::TxResult;

    #[tokio::test]
    async fn test_scan_terminates_on_timeout() {
        let api = MockTendermint::with_tip(5);
        let params = test_params(1, 50);
        let outcome = scan_blocks(&api, &params, None, |_, _| None).await;
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_scan_terminates_on_cancel() {
        let api = MockTendermint::with_tip(5);
        let params = test_params(1, 60_000);
        params.cancel.cancel();
        let outcome = scan_blocks(&api, &params, None, |_, _| None).await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_scan_visits_each_height_once() {
        let api = MockTendermint::with_tip(3);
        let params = test_params(1, 200);
        let mut seen = Vec::new();
        let outcome = scan_blocks(&api, &params, None, |height, _| {
            seen.push(height);
            if height == 3 {
                Some(PollOutcome::Matched {
                    tx_hash: None,
                    block: height,
                })
            } else {
                None
            }
        })
        .await;
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(outcome.is_matched());
    }

    #[tokio::test]
    async fn test_poll_transaction_found() {
        let api = MockTendermint::with_tip(10);
        let tx: crate::chain::TxResponse = serde_json::from_value(json!({
            "hash": "DCAB",
            "height": "7",
            "tx_result": {"code": 0, "events": []}
        }))
        .expect("tx");
        api.txs.lock().unwrap().insert("DCAB".to_string(), tx);

        let params = test_params(1, 1_000);
        let outcome = poll_transaction(&api, &params, "DCAB").await;
        assert_eq!(
            outcome,
            PollOutcome::Matched {
                tx_hash: Some("DCAB".to_string()),
                block: 7
            }
        );
    }

    #[tokio::test]
    async fn test_poll_transaction_times_out() {
        let api = MockTendermint::with_tip(10);
        let params = test_params(1, 30);
        let outcome = poll_transaction(&api, &params, "MISSING").await;
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_failed_tx_does_not_match() {
        let api = MockTendermint::with_tip(10);
        api.txs.lock().unwrap().insert(
            "BAD".to_string(),
            crate::chain::TxResponse {
                hash: "BAD".to_string(),
                height: "3".to_string(),
                tx_result: TxResult {
                    code: 5,
                    events: vec![],
                },
            },
        );
        let params = test_params(1, 1_000);
        let outcome = poll_transaction(&api, &params, "BAD").await;
        assert_eq!(outcome, PollOutcome::NotMatched);
    }
}
