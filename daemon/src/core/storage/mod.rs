mod sled;

pub use self::sled::SledStorage;

use async_trait::async_trait;
use flow_common::{
    chain::ChainKey,
    flow::{Flow, FlowStatus, StatusLogEntry},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Backend(#[from] ::sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("flow {0} was not found")]
    FlowNotFound(String),
}

/// Mutation applied under the row lock of `update_flow`
pub type FlowMutation<'a> = &'a mut (dyn FnMut(&mut Flow) + Send);

/// Durable record of flows, their progress and the append-only status log.
///
/// `update_flow` is the only write path for existing rows and serializes
/// read-modify-write cycles, making the Flow row the unit of progress.
#[async_trait]
pub trait FlowStore: Send + Sync + 'static {
    /// Insert a new flow. Idempotent on the initiating tx hash: when a flow
    /// with the same hash already exists it is returned with `created =
    /// false` and nothing is written.
    async fn create_flow(&self, flow: Flow) -> Result<(Flow, bool), StorageError>;

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>, StorageError>;

    async fn get_flow_by_tx_hash(&self, tx_hash: &str) -> Result<Option<Flow>, StorageError>;

    /// Lookup by any chain-specific hash: the initiating hash, a lane's
    /// confirmed hash, or any stage hash recorded on that lane.
    /// Terminal flows are included.
    async fn find_flow_by_any_hash(
        &self,
        chain: ChainKey,
        hash: &str,
    ) -> Result<Option<Flow>, StorageError>;

    async fn list_flows(
        &self,
        status: Option<FlowStatus>,
        limit: usize,
    ) -> Result<Vec<Flow>, StorageError>;

    /// Flows whose status is non-terminal, in creation order
    async fn list_unfinished_flows(&self) -> Result<Vec<Flow>, StorageError>;

    /// Atomic read-modify-write of one flow row
    async fn update_flow(&self, id: &str, mutate: FlowMutation<'_>)
        -> Result<Flow, StorageError>;

    /// Persist `start_block` for a lane unless one is already recorded.
    /// Returns the effective value; the first write wins.
    async fn set_start_block(
        &self,
        id: &str,
        chain: ChainKey,
        start_block: u64,
    ) -> Result<u64, StorageError>;

    async fn append_status_log(&self, entry: StatusLogEntry) -> Result<(), StorageError>;

    /// Status log rows of one flow, ordered ascending by creation
    async fn list_status_logs(&self, flow_id: &str) -> Result<Vec<StatusLogEntry>, StorageError>;
}
