mod params;

pub use params::TrackingParams;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::ChainKey;

/// Stage symbols appended to chain progress and written to the status log
pub mod stage {
    pub const EVM_USDC_BURNED: &str = "evm_usdc_burned";
    pub const NOBLE_CCTP_MINTED: &str = "noble_cctp_minted";
    pub const NOBLE_IBC_FORWARDED: &str = "noble_ibc_forwarded";
    pub const NAMADA_RECEIVED: &str = "namada_received";
    pub const NAMADA_IBC_SENT: &str = "namada_ibc_sent";
    pub const NOBLE_PAYMENT_RECEIVED: &str = "noble_payment_received";
    pub const NOBLE_CCTP_BURNED: &str = "noble_cctp_burned";
    pub const EVM_USDC_MINTED: &str = "evm_usdc_minted";
}

/// Polling units the engine sequences; timeout log rows are `<name>_timeout`
pub mod poll_stage {
    pub const EVM_BURN: &str = "evm_burn";
    pub const NOBLE_DEPOSIT: &str = "noble_deposit";
    pub const NAMADA_RECEIVE: &str = "namada_receive";
    pub const NAMADA_IBC: &str = "namada_ibc";
    pub const NOBLE_PAYMENT: &str = "noble_payment";
    pub const EVM_MINT: &str = "evm_mint";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FlowType {
    /// EVM burn -> Noble CCTP mint -> Noble IBC forward -> Namada receive
    Deposit,
    /// Namada IBC send -> Noble receive -> Noble CCTP burn -> EVM mint
    Payment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FlowStatus {
    Pending,
    Completed,
    Failed,
    /// Observation window exhausted without a terminal on-chain event
    Undetermined,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StageSource {
    Poller,
    Client,
}

/// One observation in a flow's progression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub stage: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub source: StageSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Stage {
    pub fn confirmed(stage: &str, tx_hash: Option<String>) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Confirmed,
            message: None,
            tx_hash,
            occurred_at: Utc::now(),
            source: StageSource::Poller,
            metadata: None,
        }
    }
}

/// Per-chain sub-state of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainProgress {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Height at which scanning began. Persisted once, never re-derived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub stages: Vec<Stage>,
    /// Client-reported auxiliary stages (evm only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gasless_stages: Vec<Stage>,
}

impl Default for ChainProgress {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            tx_hash: None,
            start_block: None,
            last_checked_at: None,
            stages: Vec::new(),
            gasless_stages: Vec::new(),
        }
    }
}

impl ChainProgress {
    pub fn has_stage(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s.stage == stage)
    }
}

/// Progress on every lane a flow can touch. The key set is closed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainProgressSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evm: Option<ChainProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noble: Option<ChainProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namada: Option<ChainProgress>,
}

impl ChainProgressSet {
    pub fn get(&self, key: ChainKey) -> Option<&ChainProgress> {
        match key {
            ChainKey::Evm => self.evm.as_ref(),
            ChainKey::Noble => self.noble.as_ref(),
            ChainKey::Namada => self.namada.as_ref(),
        }
    }

    pub fn get_mut(&mut self, key: ChainKey) -> Option<&mut ChainProgress> {
        match key {
            ChainKey::Evm => self.evm.as_mut(),
            ChainKey::Noble => self.noble.as_mut(),
            ChainKey::Namada => self.namada.as_mut(),
        }
    }

    pub fn ensure(&mut self, key: ChainKey) -> &mut ChainProgress {
        let slot = match key {
            ChainKey::Evm => &mut self.evm,
            ChainKey::Noble => &mut self.noble,
            ChainKey::Namada => &mut self.namada,
        };
        slot.get_or_insert_with(ChainProgress::default)
    }

    // Initial lane set for a freshly created flow
    pub fn initial_for(flow_type: FlowType) -> Self {
        let mut set = Self::default();
        match flow_type {
            FlowType::Deposit => {
                set.noble = Some(ChainProgress::default());
                set.namada = Some(ChainProgress::default());
            }
            FlowType::Payment => {
                set.namada = Some(ChainProgress::default());
                set.noble = Some(ChainProgress::default());
                set.evm = Some(ChainProgress::default());
            }
        }
        set
    }
}

/// Last terminal error recorded on a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorState {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

/// One record per tracked cross-chain transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    /// Initiating tx hash. Globally unique across flows when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub flow_type: FlowType,
    pub initial_chain: String,
    pub destination_chain: String,
    pub status: FlowStatus,
    pub chain_progress: ChainProgressSet,
    /// Free-form matching parameters; control flow reads them only through
    /// the typed TrackingParams derivation
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_state: Option<ErrorState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(
        id: String,
        flow_type: FlowType,
        initial_chain: String,
        destination_chain: String,
        tx_hash: Option<String>,
        metadata: IndexMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            tx_hash,
            flow_type,
            initial_chain,
            destination_chain,
            status: FlowStatus::Pending,
            chain_progress: ChainProgressSet::initial_for(flow_type),
            metadata,
            error_state: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The lane whose confirmation terminates this flow
    pub fn terminating_chain(&self) -> ChainKey {
        match self.flow_type {
            FlowType::Deposit => ChainKey::Namada,
            FlowType::Payment => ChainKey::Evm,
        }
    }
}

/// Append-only audit row; the ordered log replays the flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLogEntry {
    pub flow_id: String,
    pub stage: String,
    pub chain: ChainKey,
    pub source: StageSource,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}
