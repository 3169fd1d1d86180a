use std::sync::Arc;

use chrono::Utc;
use flow_common::{
    api::StatusUpdate,
    chain::{ChainKey, ChainRegistry, PollingConfig, PollingConfigs},
    flow::{
        poll_stage, stage, ErrorState, Flow, FlowStatus, FlowType, Stage, StageSource,
        StageStatus, StatusLogEntry, TrackingParams,
    },
    tokio::{spawn_task, sync::mpsc},
};
use log::{debug, error, info, warn};
use metrics::counter;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::supervisor::FlowSupervisor;
use crate::{
    chain::ChainClients,
    core::storage::{FlowStore, StorageError},
    events::EventBus,
    poller::{
        self, NamadaDepositParams, NobleDepositParams, OrbiterParams, PollOutcome, PollParams,
        UsdcMintParams,
    },
};

pub type SharedFlowTracker<S> = Arc<FlowTracker<S>>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("flow {0} was not found")]
    FlowNotFound(String),
    #[error("flow {0} is already being tracked")]
    FlowAlreadyActive(String),
    #[error("stage {stage} incomplete: poller returned without a match")]
    StageIncomplete { stage: String, chain: ChainKey },
    #[error("no client configured for chain {0}")]
    MissingChainClient(String),
    #[error("RPC failure: {0}")]
    Rpc(String),
}

// Whether the engine advances to the next stage or stops this run
enum StageControl {
    Advance,
    Halt,
}

/// Drives one flow to terminal status: sequences pollers per flow type,
/// applies per-stage timeouts, persists progress and fans out events.
pub struct FlowTracker<S: FlowStore> {
    store: Arc<S>,
    clients: Arc<ChainClients>,
    registry: ChainRegistry,
    polling: PollingConfigs,
    events: Arc<EventBus>,
    supervisor: FlowSupervisor,
}

impl<S: FlowStore> FlowTracker<S> {
    pub fn new(
        store: Arc<S>,
        clients: Arc<ChainClients>,
        registry: ChainRegistry,
        polling: PollingConfigs,
        events: Arc<EventBus>,
    ) -> SharedFlowTracker<S> {
        Arc::new(Self {
            store,
            clients,
            registry,
            polling,
            events,
            supervisor: FlowSupervisor::new(),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Abort an in-flight engine run; unknown flows are a no-op
    pub async fn stop_flow(&self, flow_id: &str) {
        self.supervisor.stop(flow_id).await;
    }

    pub async fn is_tracking(&self, flow_id: &str) -> bool {
        self.supervisor.is_active(flow_id).await
    }

    /// Run the engine for one flow until terminal status, stage skip
    /// exhaustion, timeout or cancellation
    pub async fn track_flow(&self, flow_id: &str) -> Result<(), TrackerError> {
        let flow = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| TrackerError::FlowNotFound(flow_id.to_string()))?;

        if flow.is_terminal() {
            debug!(
                "Flow {} is already {}, nothing to track",
                flow_id, flow.status
            );
            return Ok(());
        }

        let cancel = self
            .supervisor
            .begin(flow_id)
            .await
            .ok_or_else(|| TrackerError::FlowAlreadyActive(flow_id.to_string()))?;

        info!("Tracking {} flow {}", flow.flow_type, flow_id);
        let result = self.run(flow, &cancel).await;
        self.supervisor.finish(flow_id).await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.handle_engine_error(flow_id, &e).await? {
                    // absorbed by the terminal-status guard
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn run(&self, mut flow: Flow, cancel: &CancellationToken) -> Result<(), TrackerError> {
        let params = TrackingParams::derive(&flow);
        match flow.flow_type {
            FlowType::Deposit => self.run_deposit(&mut flow, &params, cancel).await,
            FlowType::Payment => self.run_payment(&mut flow, &params, cancel).await,
        }
    }

    // EVM burn -> Noble deposit -> Namada receive
    async fn run_deposit(
        &self,
        flow: &mut Flow,
        params: &TrackingParams,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        if let StageControl::Halt = self.evm_burn_stage(flow, params, cancel).await? {
            return Ok(());
        }
        if let StageControl::Halt = self.noble_deposit_stage(flow, params, cancel).await? {
            return Ok(());
        }
        if let StageControl::Halt = self.namada_receive_stage(flow, params, cancel).await? {
            return Ok(());
        }
        Ok(())
    }

    // Namada IBC -> Noble payment -> EVM mint
    async fn run_payment(
        &self,
        flow: &mut Flow,
        params: &TrackingParams,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        if let StageControl::Halt = self.namada_ibc_stage(flow, params, cancel).await? {
            return Ok(());
        }
        if let StageControl::Halt = self.noble_payment_stage(flow, params, cancel).await? {
            return Ok(());
        }
        if let StageControl::Halt = self.evm_mint_stage(flow, params, cancel).await? {
            return Ok(());
        }
        Ok(())
    }

    async fn evm_burn_stage(
        &self,
        flow: &mut Flow,
        params: &TrackingParams,
        cancel: &CancellationToken,
    ) -> Result<StageControl, TrackerError> {
        // deposits carry an EVM lane only when the client seeded one;
        // without it the burn is implied by the Noble mint
        let Some(evm_progress) = flow.chain_progress.get(ChainKey::Evm) else {
            debug!(
                "[{}] skipping {}: flow has no EVM lane",
                flow.id,
                poll_stage::EVM_BURN
            );
            return Ok(StageControl::Advance);
        };
        if evm_progress.has_stage(stage::EVM_USDC_BURNED) {
            return Ok(StageControl::Advance);
        }
        let (Some(burn_hash), Some(chain_id)) = (
            params.evm_burn_tx_hash.as_ref(),
            self.chain_id_for(flow, ChainKey::Evm),
        ) else {
            debug!(
                "[{}] skipping {}: no burn tx hash or EVM chain",
                flow.id,
                poll_stage::EVM_BURN
            );
            return Ok(StageControl::Advance);
        };
        let api = self
            .clients
            .evm(&chain_id)
            .ok_or_else(|| TrackerError::MissingChainClient(chain_id.clone()))?;

        let (poll, _) = self
            .stage_params(flow, &chain_id, poll_stage::EVM_BURN, 0, cancel)
            .await;
        let outcome = poller::evm::poll_burn_receipt(api.as_ref(), &poll, burn_hash).await;
        self.interpret(
            flow,
            ChainKey::Evm,
            poll_stage::EVM_BURN,
            outcome,
            &[(stage::EVM_USDC_BURNED, Some(burn_hash.clone()))],
            false,
        )
        .await
    }

    async fn noble_deposit_stage(
        &self,
        flow: &mut Flow,
        params: &TrackingParams,
        cancel: &CancellationToken,
    ) -> Result<StageControl, TrackerError> {
        if flow
            .chain_progress
            .get(ChainKey::Noble)
            .map(|p| p.has_stage(stage::NOBLE_IBC_FORWARDED))
            .unwrap_or(false)
        {
            return Ok(StageControl::Advance);
        }
        let (Some(forwarding_address), Some(namada_receiver), Some(expected_amount_uusdc)) = (
            params.forwarding_address.clone(),
            params.namada_receiver.clone(),
            params.expected_amount_uusdc.clone(),
        ) else {
            warn!(
                "[{}] skipping {}: missing forwarding address, receiver or amount",
                flow.id,
                poll_stage::NOBLE_DEPOSIT
            );
            return Ok(StageControl::Advance);
        };
        let Some(chain_id) = self.chain_id_for(flow, ChainKey::Noble) else {
            warn!("[{}] skipping {}: no noble chain in registry", flow.id, poll_stage::NOBLE_DEPOSIT);
            return Ok(StageControl::Advance);
        };
        let api = self
            .clients
            .tendermint(&chain_id)
            .ok_or_else(|| TrackerError::MissingChainClient(chain_id.clone()))?;

        let start_block = self
            .ensure_start_block_tendermint(flow, ChainKey::Noble, &chain_id, api.as_ref())
            .await?;
        let (poll, _) = self
            .stage_params(flow, &chain_id, poll_stage::NOBLE_DEPOSIT, start_block, cancel)
            .await;
        let matcher = NobleDepositParams {
            forwarding_address,
            namada_receiver,
            expected_amount_uusdc,
        };

        let (heartbeat, _task) = self.spawn_heartbeat(&flow.id, ChainKey::Noble);
        let on_update = move |height: u64| {
            let _ = heartbeat.send(height);
        };
        let outcome =
            poller::noble::poll_for_deposit(api.as_ref(), &poll, &matcher, Some(&on_update)).await;
        self.interpret(
            flow,
            ChainKey::Noble,
            poll_stage::NOBLE_DEPOSIT,
            outcome,
            &[
                (stage::NOBLE_CCTP_MINTED, None),
                (stage::NOBLE_IBC_FORWARDED, None),
            ],
            false,
        )
        .await
    }

    async fn namada_receive_stage(
        &self,
        flow: &mut Flow,
        params: &TrackingParams,
        cancel: &CancellationToken,
    ) -> Result<StageControl, TrackerError> {
        let (Some(forwarding_address), Some(namada_receiver), Some(expected_amount)) = (
            params.forwarding_address.clone(),
            params.namada_receiver.clone(),
            params
                .amount_base_units
                .clone()
                .or_else(|| params.expected_amount_uusdc.clone()),
        ) else {
            warn!(
                "[{}] skipping {}: missing forwarding address, receiver or amount",
                flow.id,
                poll_stage::NAMADA_RECEIVE
            );
            return Ok(StageControl::Advance);
        };
        let Some(chain_id) = self.chain_id_for(flow, ChainKey::Namada) else {
            warn!("[{}] skipping {}: no namada chain in registry", flow.id, poll_stage::NAMADA_RECEIVE);
            return Ok(StageControl::Advance);
        };
        let api = self
            .clients
            .tendermint(&chain_id)
            .ok_or_else(|| TrackerError::MissingChainClient(chain_id.clone()))?;

        let start_block = self
            .ensure_start_block_tendermint(flow, ChainKey::Namada, &chain_id, api.as_ref())
            .await?;
        let (poll, _) = self
            .stage_params(flow, &chain_id, poll_stage::NAMADA_RECEIVE, start_block, cancel)
            .await;
        let matcher = NamadaDepositParams {
            forwarding_address,
            namada_receiver,
            expected_amount,
        };

        let (heartbeat, _task) = self.spawn_heartbeat(&flow.id, ChainKey::Namada);
        let on_update = move |height: u64| {
            let _ = heartbeat.send(height);
        };
        let outcome =
            poller::namada::poll_for_deposit(api.as_ref(), &poll, &matcher, Some(&on_update)).await;
        let tx_hash = match &outcome {
            PollOutcome::Matched { tx_hash, .. } => tx_hash.clone(),
            _ => None,
        };
        self.interpret(
            flow,
            ChainKey::Namada,
            poll_stage::NAMADA_RECEIVE,
            outcome,
            &[(stage::NAMADA_RECEIVED, tx_hash)],
            true,
        )
        .await
    }

    async fn namada_ibc_stage(
        &self,
        flow: &mut Flow,
        params: &TrackingParams,
        cancel: &CancellationToken,
    ) -> Result<StageControl, TrackerError> {
        if flow
            .chain_progress
            .get(ChainKey::Namada)
            .map(|p| p.has_stage(stage::NAMADA_IBC_SENT))
            .unwrap_or(false)
        {
            return Ok(StageControl::Advance);
        }
        let Some(ibc_hash) = params.namada_ibc_tx_hash.clone() else {
            debug!(
                "[{}] skipping {}: no namada IBC tx hash",
                flow.id,
                poll_stage::NAMADA_IBC
            );
            return Ok(StageControl::Advance);
        };
        let Some(chain_id) = self.chain_id_for(flow, ChainKey::Namada) else {
            warn!("[{}] skipping {}: no namada chain in registry", flow.id, poll_stage::NAMADA_IBC);
            return Ok(StageControl::Advance);
        };
        let api = self
            .clients
            .tendermint(&chain_id)
            .ok_or_else(|| TrackerError::MissingChainClient(chain_id.clone()))?;

        let (poll, _) = self
            .stage_params(flow, &chain_id, poll_stage::NAMADA_IBC, 0, cancel)
            .await;
        let outcome = poller::poll_transaction(api.as_ref(), &poll, &ibc_hash).await;

        self.interpret(
            flow,
            ChainKey::Namada,
            poll_stage::NAMADA_IBC,
            outcome,
            &[(stage::NAMADA_IBC_SENT, Some(ibc_hash))],
            false,
        )
        .await
    }

    async fn noble_payment_stage(
        &self,
        flow: &mut Flow,
        params: &TrackingParams,
        cancel: &CancellationToken,
    ) -> Result<StageControl, TrackerError> {
        if flow
            .chain_progress
            .get(ChainKey::Noble)
            .map(|p| p.has_stage(stage::NOBLE_CCTP_BURNED))
            .unwrap_or(false)
        {
            return Ok(StageControl::Advance);
        }
        let (
            Some(memo_json),
            Some(amount),
            Some(receiver),
            Some(destination_caller_b64),
            Some(mint_recipient_b64),
            Some(destination_domain),
        ) = (
            params.memo_json.clone(),
            params.amount_base_units.clone(),
            params.forwarding_address.clone(),
            params.destination_caller_b64.clone(),
            params.mint_recipient_b64.clone(),
            params.destination_domain,
        )
        else {
            warn!(
                "[{}] skipping {}: missing orbiter matching parameters",
                flow.id,
                poll_stage::NOBLE_PAYMENT
            );
            return Ok(StageControl::Advance);
        };
        let Some(chain_id) = self.chain_id_for(flow, ChainKey::Noble) else {
            warn!("[{}] skipping {}: no noble chain in registry", flow.id, poll_stage::NOBLE_PAYMENT);
            return Ok(StageControl::Advance);
        };
        let api = self
            .clients
            .tendermint(&chain_id)
            .ok_or_else(|| TrackerError::MissingChainClient(chain_id.clone()))?;

        let start_block = self
            .ensure_start_block_tendermint(flow, ChainKey::Noble, &chain_id, api.as_ref())
            .await?;
        let (poll, _) = self
            .stage_params(flow, &chain_id, poll_stage::NOBLE_PAYMENT, start_block, cancel)
            .await;
        let matcher = OrbiterParams {
            memo_json,
            amount,
            receiver,
            destination_caller_b64,
            mint_recipient_b64,
            destination_domain,
        };

        let (heartbeat, _task) = self.spawn_heartbeat(&flow.id, ChainKey::Noble);
        let on_update = move |height: u64| {
            let _ = heartbeat.send(height);
        };
        let outcome =
            poller::noble::poll_for_orbiter(api.as_ref(), &poll, &matcher, Some(&on_update)).await;
        self.interpret(
            flow,
            ChainKey::Noble,
            poll_stage::NOBLE_PAYMENT,
            outcome,
            &[
                (stage::NOBLE_PAYMENT_RECEIVED, None),
                (stage::NOBLE_CCTP_BURNED, None),
            ],
            false,
        )
        .await
    }

    async fn evm_mint_stage(
        &self,
        flow: &mut Flow,
        params: &TrackingParams,
        cancel: &CancellationToken,
    ) -> Result<StageControl, TrackerError> {
        let Some(chain_id) = self.chain_id_for(flow, ChainKey::Evm) else {
            warn!("[{}] skipping {}: no EVM chain in registry", flow.id, poll_stage::EVM_MINT);
            return Ok(StageControl::Advance);
        };
        // the token contract may come from metadata or from the registry
        let usdc_address = params.usdc_address.clone().or_else(|| {
            self.registry
                .get(&chain_id)
                .and_then(|entry| entry.contracts.as_ref())
                .map(|contracts| contracts.usdc.clone())
        });
        let (Some(usdc_address), Some(recipient), Some(amount_base_units)) = (
            usdc_address,
            params.recipient.clone(),
            params.amount_base_units.clone(),
        ) else {
            warn!(
                "[{}] skipping {}: missing token address, recipient or amount",
                flow.id,
                poll_stage::EVM_MINT
            );
            return Ok(StageControl::Advance);
        };
        let api = self
            .clients
            .evm(&chain_id)
            .ok_or_else(|| TrackerError::MissingChainClient(chain_id.clone()))?;

        let start_block = self
            .ensure_start_block_evm(flow, ChainKey::Evm, &chain_id, api.as_ref())
            .await?;
        let (poll, _) = self
            .stage_params(flow, &chain_id, poll_stage::EVM_MINT, start_block, cancel)
            .await;
        let matcher = UsdcMintParams {
            usdc_address,
            recipient,
            amount_base_units,
        };

        let outcome = poller::evm::poll_usdc_mint(api.as_ref(), &poll, &matcher).await;
        let tx_hash = match &outcome {
            PollOutcome::Matched { tx_hash, .. } => tx_hash.clone(),
            _ => None,
        };
        self.interpret(
            flow,
            ChainKey::Evm,
            poll_stage::EVM_MINT,
            outcome,
            &[(stage::EVM_USDC_MINTED, tx_hash)],
            true,
        )
        .await
    }

    // Registry id advancing the requested lane: the flow's own endpoints
    // first, then any registry entry (the Noble hub is not a flow endpoint)
    fn chain_id_for(&self, flow: &Flow, key: ChainKey) -> Option<String> {
        for chain_id in [&flow.initial_chain, &flow.destination_chain] {
            if let Some(entry) = self.registry.get(chain_id) {
                if entry.key == key {
                    return Some(chain_id.clone());
                }
            }
        }
        self.registry.find_by_key(key).map(|(id, _)| id.to_string())
    }

    // Per-stage protocol steps 1-2: resolve the polling budget and record
    // the countdown before invoking the poller
    async fn stage_params(
        &self,
        flow: &Flow,
        chain_id: &str,
        stage_name: &str,
        start_block: u64,
        cancel: &CancellationToken,
    ) -> (PollParams, PollingConfig) {
        let config = self.polling.for_chain(chain_id);
        let timeout_ms = config.stage_timeout_ms();
        self.supervisor
            .record_stage(&flow.id, stage_name, timeout_ms)
            .await;
        let poll = PollParams {
            flow_id: flow.id.clone(),
            chain_id: chain_id.to_string(),
            start_block,
            timeout_ms,
            interval_ms: config.poll_interval_ms,
            block_request_delay_ms: config.block_request_delay_ms.unwrap_or(0),
            // stage cancellation is a leaf of the engine's token
            cancel: cancel.child_token(),
        };
        (poll, config)
    }

    async fn ensure_start_block_tendermint(
        &self,
        flow: &mut Flow,
        key: ChainKey,
        chain_id: &str,
        api: &dyn crate::chain::TendermintApi,
    ) -> Result<u64, TrackerError> {
        if let Some(existing) = flow.chain_progress.get(key).and_then(|p| p.start_block) {
            return Ok(existing);
        }
        let tip = api
            .get_latest_block_height()
            .await
            .map_err(|e| TrackerError::Rpc(format!("{} tip: {}", chain_id, e)))?;
        self.persist_start_block(flow, key, chain_id, tip).await
    }

    async fn ensure_start_block_evm(
        &self,
        flow: &mut Flow,
        key: ChainKey,
        chain_id: &str,
        api: &dyn crate::chain::EvmApi,
    ) -> Result<u64, TrackerError> {
        if let Some(existing) = flow.chain_progress.get(key).and_then(|p| p.start_block) {
            return Ok(existing);
        }
        let tip = api
            .get_block_number()
            .await
            .map_err(|e| TrackerError::Rpc(format!("{} tip: {}", chain_id, e)))?;
        self.persist_start_block(flow, key, chain_id, tip).await
    }

    async fn persist_start_block(
        &self,
        flow: &mut Flow,
        key: ChainKey,
        chain_id: &str,
        tip: u64,
    ) -> Result<u64, TrackerError> {
        let backscan = self.polling.for_chain(chain_id).block_window_backscan;
        let start = tip.saturating_sub(backscan);
        // first write wins; cache locally to avoid a re-fetch
        let effective = self.store.set_start_block(&flow.id, key, start).await?;
        flow.chain_progress.ensure(key).start_block = Some(effective);
        debug!(
            "[{}] {} scan starts at block {} (tip {})",
            flow.id, chain_id, effective, tip
        );
        Ok(effective)
    }

    // Periodic last-checked persistence driven by scan heartbeats
    fn spawn_heartbeat(
        &self,
        flow_id: &str,
        key: ChainKey,
    ) -> (
        mpsc::UnboundedSender<u64>,
        flow_common::tokio::task::JoinHandle<()>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let store = Arc::clone(&self.store);
        let flow_id = flow_id.to_string();
        let task = spawn_task("flow-heartbeat", async move {
            while rx.recv().await.is_some() {
                let result = store
                    .update_flow(&flow_id, &mut |flow: &mut Flow| {
                        flow.chain_progress.ensure(key).last_checked_at = Some(Utc::now());
                    })
                    .await;
                if let Err(e) = result {
                    debug!("heartbeat update for flow {} failed: {}", flow_id, e);
                }
            }
        });
        (tx, task)
    }

    // Per-stage protocol step 5: translate a poll outcome into state
    async fn interpret(
        &self,
        flow: &mut Flow,
        key: ChainKey,
        stage_name: &str,
        outcome: PollOutcome,
        stages_on_match: &[(&str, Option<String>)],
        final_stage: bool,
    ) -> Result<StageControl, TrackerError> {
        match outcome {
            PollOutcome::Matched { block, .. } => {
                self.confirm_stages(flow, key, stages_on_match, block, final_stage)
                    .await?;
                if final_stage {
                    Ok(StageControl::Halt)
                } else {
                    Ok(StageControl::Advance)
                }
            }
            PollOutcome::TimedOut => {
                self.handle_polling_timeout(&flow.id, key, stage_name).await?;
                Ok(StageControl::Halt)
            }
            PollOutcome::Cancelled => {
                // cancellation racing the stage deadline: the timeout verdict
                // applies iff the budget was actually exhausted
                let expired = self
                    .supervisor
                    .current_stage(&flow.id)
                    .await
                    .map(|s| s.expired())
                    .unwrap_or(false);
                if expired {
                    self.handle_polling_timeout(&flow.id, key, stage_name).await?;
                } else {
                    debug!("[{}] stage {} cancelled", flow.id, stage_name);
                }
                Ok(StageControl::Halt)
            }
            PollOutcome::NotMatched => Err(TrackerError::StageIncomplete {
                stage: stage_name.to_string(),
                chain: key,
            }),
        }
    }

    async fn confirm_stages(
        &self,
        flow: &mut Flow,
        key: ChainKey,
        stages: &[(&str, Option<String>)],
        block: u64,
        final_stage: bool,
    ) -> Result<(), TrackerError> {
        let mut appended: Vec<(String, Option<String>)> = Vec::new();
        let mut guarded = false;
        let updated = self
            .store
            .update_flow(&flow.id, &mut |current: &mut Flow| {
                appended.clear();
                // a terminal verdict recorded elsewhere must never be
                // overwritten by a late confirmation
                if current.is_terminal() {
                    guarded = true;
                    return;
                }
                let progress = current.chain_progress.ensure(key);
                for (symbol, tx_hash) in stages {
                    // stages are append-only and confirm at most once
                    if progress.has_stage(symbol) {
                        continue;
                    }
                    progress
                        .stages
                        .push(Stage::confirmed(symbol, tx_hash.clone()));
                    appended.push((symbol.to_string(), tx_hash.clone()));
                    if progress.tx_hash.is_none() {
                        if let Some(hash) = tx_hash {
                            progress.tx_hash = Some(hash.clone());
                        }
                    }
                }
                progress.status = StageStatus::Confirmed;
                progress.last_checked_at = Some(Utc::now());
                if final_stage {
                    current.status = FlowStatus::Completed;
                }
            })
            .await?;
        *flow = updated;
        if guarded {
            debug!(
                "[{}] confirmation on {} ignored, flow already terminal",
                flow.id, key
            );
            return Ok(());
        }

        for (symbol, tx_hash) in &appended {
            self.store
                .append_status_log(StatusLogEntry {
                    flow_id: flow.id.clone(),
                    stage: symbol.clone(),
                    chain: key,
                    source: StageSource::Poller,
                    detail: json!({
                        "status": "confirmed",
                        "txHash": tx_hash,
                        "block": block,
                    }),
                    created_at: Utc::now(),
                })
                .await?;
            self.events
                .publish(StatusUpdate {
                    flow_id: flow.id.clone(),
                    chain: key,
                    stage: symbol.clone(),
                    status: StageStatus::Confirmed,
                    message: None,
                    tx_hash: tx_hash.clone(),
                    occurred_at: Utc::now(),
                    source: StageSource::Poller,
                    metadata: None,
                })
                .await;
            counter!("flowd_stages_confirmed").increment(1);
            info!(
                "[{}] stage {} confirmed on {} at block {}",
                flow.id, symbol, key, block
            );
        }

        if final_stage {
            counter!("flowd_flows_completed").increment(1);
            info!("Flow {} completed", flow.id);
            self.events
                .publish(StatusUpdate {
                    flow_id: flow.id.clone(),
                    chain: flow.terminating_chain(),
                    stage: "completed".to_string(),
                    status: StageStatus::Confirmed,
                    message: None,
                    tx_hash: None,
                    occurred_at: Utc::now(),
                    source: StageSource::Poller,
                    metadata: None,
                })
                .await;
        }
        Ok(())
    }

    /// Timeout verdict: atomically re-read the flow, never overwrite a
    /// terminal status, otherwise mark it `undetermined` and record why
    async fn handle_polling_timeout(
        &self,
        flow_id: &str,
        key: ChainKey,
        stage_name: &str,
    ) -> Result<(), TrackerError> {
        let tracked = self.supervisor.current_stage(flow_id).await;
        let (timeout_ms, elapsed_ms) = tracked
            .map(|s| (s.timeout_ms, s.elapsed_ms()))
            .unwrap_or((0, 0));

        let mut guarded = false;
        self.store
            .update_flow(flow_id, &mut |flow: &mut Flow| {
                if flow.is_terminal() {
                    guarded = true;
                    return;
                }
                flow.status = FlowStatus::Undetermined;
                flow.error_state = Some(ErrorState {
                    reason: "timeout".to_string(),
                    stage: Some(stage_name.to_string()),
                    timeout_ms: Some(timeout_ms),
                    elapsed_ms: Some(elapsed_ms),
                    occurred_at: Utc::now(),
                });
            })
            .await?;
        if guarded {
            debug!(
                "[{}] timeout on {} ignored, flow already terminal",
                flow_id, stage_name
            );
            return Ok(());
        }

        warn!(
            "[{}] stage {} timed out after {}ms (budget {}ms), flow is undetermined",
            flow_id, stage_name, elapsed_ms, timeout_ms
        );
        counter!("flowd_flows_undetermined").increment(1);

        let timeout_stage = format!("{}_timeout", stage_name);
        self.store
            .append_status_log(StatusLogEntry {
                flow_id: flow_id.to_string(),
                stage: timeout_stage.clone(),
                chain: key,
                source: StageSource::Poller,
                detail: json!({
                    "status": "failed",
                    "timeoutMs": timeout_ms,
                    "elapsedMs": elapsed_ms,
                }),
                created_at: Utc::now(),
            })
            .await?;
        self.events
            .publish(StatusUpdate {
                flow_id: flow_id.to_string(),
                chain: key,
                stage: timeout_stage,
                status: StageStatus::Failed,
                message: Some("polling timeout".to_string()),
                tx_hash: None,
                occurred_at: Utc::now(),
                source: StageSource::Poller,
                metadata: None,
            })
            .await;
        Ok(())
    }

    /// Terminal-status guard for non-timeout errors. Returns true when the
    /// error was absorbed because the flow already reached a terminal state.
    async fn handle_engine_error(
        &self,
        flow_id: &str,
        error: &TrackerError,
    ) -> Result<bool, TrackerError> {
        let current = self.store.get_flow(flow_id).await?;
        let Some(current) = current else {
            warn!("error on missing flow {}: {}", flow_id, error);
            return Ok(true);
        };
        if matches!(
            current.status,
            FlowStatus::Undetermined | FlowStatus::Completed
        ) {
            debug!(
                "[{}] late error ignored, flow already {}: {}",
                flow_id, current.status, error
            );
            return Ok(true);
        }

        let message = error.to_string();
        if message.contains("timeout") || message.contains("incomplete") {
            warn!("[{}] {}", flow_id, message);
        } else {
            error!("[{}] {}", flow_id, message);
        }

        self.store
            .update_flow(flow_id, &mut |flow: &mut Flow| {
                flow.status = FlowStatus::Failed;
                flow.error_state = Some(ErrorState {
                    reason: message.clone(),
                    stage: None,
                    timeout_ms: None,
                    elapsed_ms: None,
                    occurred_at: Utc::now(),
                });
            })
            .await?;
        counter!("flowd_flows_failed").increment(1);

        let (chain, stage_name) = match error {
            TrackerError::StageIncomplete { stage, chain } => (*chain, stage.clone()),
            _ => (current.terminating_chain(), "flow_failed".to_string()),
        };
        self.store
            .append_status_log(StatusLogEntry {
                flow_id: flow_id.to_string(),
                stage: format!("{}_failed", stage_name),
                chain,
                source: StageSource::Poller,
                detail: json!({"status": "failed", "error": message}),
                created_at: Utc::now(),
            })
            .await?;
        self.events
            .publish(StatusUpdate {
                flow_id: flow_id.to_string(),
                chain,
                stage: stage_name,
                status: StageStatus::Failed,
                message: Some(message),
                tx_hash: None,
                occurred_at: Utc::now(),
                source: StageSource::Poller,
                metadata: None,
            })
            .await;
        Ok(false)
    }
}
