use async_trait::async_trait;
use flow_common::{
    chain::ChainKey,
    flow::{Flow, FlowStatus, StatusLogEntry},
    tokio::sync::Mutex,
};
use log::{debug, trace};
use sled::{Db, Tree};

use super::{FlowMutation, FlowStore, StorageError};

// Tree names
const FLOWS_TREE: &str = "flows";
const FLOW_TX_HASH_TREE: &str = "flow_tx_hash";
const STATUS_LOGS_TREE: &str = "status_logs";

/// Sled-backed flow store.
///
/// Rows are JSON documents; the tx-hash index maps initiating hashes to flow
/// ids; status log keys are `<flow_id>/<zero-padded id>` so a prefix scan
/// yields rows in causal order. A single async mutex serializes row
/// read-modify-write cycles within the process.
pub struct SledStorage {
    flows: Tree,
    flow_tx_hash: Tree,
    status_logs: Tree,
    db: Db,
    // serializes create/update cycles; sled has no multi-key transactions
    // across trees without nested closures
    write_lock: Mutex<()>,
}

impl SledStorage {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            flows: db.open_tree(FLOWS_TREE)?,
            flow_tx_hash: db.open_tree(FLOW_TX_HASH_TREE)?,
            status_logs: db.open_tree(STATUS_LOGS_TREE)?,
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// In-memory database for tests
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::new(db)
    }

    fn read_flow(&self, id: &str) -> Result<Option<Flow>, StorageError> {
        match self.flows.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_flow(&self, flow: &Flow) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(flow)?;
        self.flows.insert(flow.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn iter_flows(&self) -> impl Iterator<Item = Result<Flow, StorageError>> + '_ {
        self.flows.iter().values().map(|result| {
            let bytes = result?;
            Ok(serde_json::from_slice(&bytes)?)
        })
    }
}

#[async_trait]
impl FlowStore for SledStorage {
    async fn create_flow(&self, flow: Flow) -> Result<(Flow, bool), StorageError> {
        let _guard = self.write_lock.lock().await;

        // idempotency on the initiating tx hash
        if let Some(tx_hash) = flow.tx_hash.as_deref() {
            if let Some(existing_id) = self.flow_tx_hash.get(tx_hash.as_bytes())? {
                let id = String::from_utf8_lossy(&existing_id).to_string();
                if let Some(existing) = self.read_flow(&id)? {
                    debug!(
                        "Flow registration for tx {} resolved to existing flow {}",
                        tx_hash, existing.id
                    );
                    return Ok((existing, false));
                }
            }
        }

        self.write_flow(&flow)?;
        if let Some(tx_hash) = flow.tx_hash.as_deref() {
            self.flow_tx_hash
                .insert(tx_hash.as_bytes(), flow.id.as_bytes())?;
        }
        Ok((flow, true))
    }

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>, StorageError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("get flow {}", id);
        }
        self.read_flow(id)
    }

    async fn get_flow_by_tx_hash(&self, tx_hash: &str) -> Result<Option<Flow>, StorageError> {
        match self.flow_tx_hash.get(tx_hash.as_bytes())? {
            Some(id) => self.read_flow(&String::from_utf8_lossy(&id)),
            None => Ok(None),
        }
    }

    async fn find_flow_by_any_hash(
        &self,
        chain: ChainKey,
        hash: &str,
    ) -> Result<Option<Flow>, StorageError> {
        for flow in self.iter_flows() {
            let flow = flow?;
            if flow.tx_hash.as_deref() == Some(hash) {
                return Ok(Some(flow));
            }
            if let Some(progress) = flow.chain_progress.get(chain) {
                let in_lane = progress.tx_hash.as_deref() == Some(hash)
                    || progress
                        .stages
                        .iter()
                        .chain(progress.gasless_stages.iter())
                        .any(|stage| stage.tx_hash.as_deref() == Some(hash));
                if in_lane {
                    return Ok(Some(flow));
                }
            }
        }
        Ok(None)
    }

    async fn list_flows(
        &self,
        status: Option<FlowStatus>,
        limit: usize,
    ) -> Result<Vec<Flow>, StorageError> {
        let mut flows = Vec::new();
        for flow in self.iter_flows() {
            let flow = flow?;
            if status.map_or(true, |s| flow.status == s) {
                flows.push(flow);
                if flows.len() >= limit {
                    break;
                }
            }
        }
        Ok(flows)
    }

    async fn list_unfinished_flows(&self) -> Result<Vec<Flow>, StorageError> {
        let mut flows = Vec::new();
        for flow in self.iter_flows() {
            let flow = flow?;
            if !flow.is_terminal() {
                flows.push(flow);
            }
        }
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(flows)
    }

    async fn update_flow(
        &self,
        id: &str,
        mutate: FlowMutation<'_>,
    ) -> Result<Flow, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut flow = self
            .read_flow(id)?
            .ok_or_else(|| StorageError::FlowNotFound(id.to_string()))?;
        mutate(&mut flow);
        flow.updated_at = chrono::Utc::now();
        self.write_flow(&flow)?;
        Ok(flow)
    }

    async fn set_start_block(
        &self,
        id: &str,
        chain: ChainKey,
        start_block: u64,
    ) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut flow = self
            .read_flow(id)?
            .ok_or_else(|| StorageError::FlowNotFound(id.to_string()))?;

        let progress = flow.chain_progress.ensure(chain);
        if let Some(existing) = progress.start_block {
            // written at most once, never re-derived
            return Ok(existing);
        }
        progress.start_block = Some(start_block);
        flow.updated_at = chrono::Utc::now();
        self.write_flow(&flow)?;
        Ok(start_block)
    }

    async fn append_status_log(&self, entry: StatusLogEntry) -> Result<(), StorageError> {
        // monotonic ids keep per-flow prefix scans in causal order
        let seq = self.db.generate_id()?;
        let key = format!("{}/{:020}", entry.flow_id, seq);
        let bytes = serde_json::to_vec(&entry)?;
        self.status_logs.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    async fn list_status_logs(&self, flow_id: &str) -> Result<Vec<StatusLogEntry>, StorageError> {
        let prefix = format!("{}/", flow_id);
        let mut entries = Vec::new();
        for result in self.status_logs.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = result?;
            entries.push(serde_json::from_slice(&bytes)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use flow_common::flow::{FlowType, StageSource};
    use indexmap::IndexMap;
    use serde_json::json;

    use super::*;

    fn test_flow(id: &str, tx_hash: Option<&str>) -> Flow {
        Flow::new(
            id.to_string(),
            FlowType::Deposit,
            "sepolia".to_string(),
            "namada-testnet".to_string(),
            tx_hash.map(String::from),
            IndexMap::new(),
        )
    }

    #[tokio::test]
    async fn test_create_is_idempotent_on_tx_hash() {
        let store = SledStorage::temporary().expect("open");
        let (first, created) = store
            .create_flow(test_flow("flow-1", Some("0xabc")))
            .await
            .expect("create");
        assert!(created);

        let (second, created) = store
            .create_flow(test_flow("flow-2", Some("0xabc")))
            .await
            .expect("create duplicate");
        assert!(!created);
        assert_eq!(second.id, first.id);

        // only one flow exists
        assert!(store.get_flow("flow-2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_start_block_written_once() {
        let store = SledStorage::temporary().expect("open");
        store
            .create_flow(test_flow("flow-1", None))
            .await
            .expect("create");

        let first = store
            .set_start_block("flow-1", ChainKey::Noble, 100)
            .await
            .expect("set");
        assert_eq!(first, 100);

        let second = store
            .set_start_block("flow-1", ChainKey::Noble, 200)
            .await
            .expect("set again");
        assert_eq!(second, 100);

        let flow = store.get_flow("flow-1").await.expect("get").expect("some");
        assert_eq!(
            flow.chain_progress.get(ChainKey::Noble).unwrap().start_block,
            Some(100)
        );
    }

    #[tokio::test]
    async fn test_update_flow_persists_mutation() {
        let store = SledStorage::temporary().expect("open");
        store
            .create_flow(test_flow("flow-1", None))
            .await
            .expect("create");

        let updated = store
            .update_flow("flow-1", &mut |flow| {
                flow.status = FlowStatus::Completed;
            })
            .await
            .expect("update");
        assert_eq!(updated.status, FlowStatus::Completed);

        let reread = store.get_flow("flow-1").await.expect("get").expect("some");
        assert_eq!(reread.status, FlowStatus::Completed);
    }

    #[tokio::test]
    async fn test_update_missing_flow_errors() {
        let store = SledStorage::temporary().expect("open");
        let result = store.update_flow("nope", &mut |_| {}).await;
        assert!(matches!(result, Err(StorageError::FlowNotFound(_))));
    }

    #[tokio::test]
    async fn test_status_logs_ordered() {
        let store = SledStorage::temporary().expect("open");
        for stage in ["noble_cctp_minted", "noble_ibc_forwarded", "namada_received"] {
            store
                .append_status_log(StatusLogEntry {
                    flow_id: "flow-1".to_string(),
                    stage: stage.to_string(),
                    chain: ChainKey::Noble,
                    source: StageSource::Poller,
                    detail: json!({"status": "confirmed"}),
                    created_at: chrono::Utc::now(),
                })
                .await
                .expect("append");
        }
        // another flow's rows must not leak into the scan
        store
            .append_status_log(StatusLogEntry {
                flow_id: "flow-2".to_string(),
                stage: "noble_cctp_minted".to_string(),
                chain: ChainKey::Noble,
                source: StageSource::Poller,
                detail: serde_json::Value::Null,
                created_at: chrono::Utc::now(),
            })
            .await
            .expect("append");

        let logs = store.list_status_logs("flow-1").await.expect("list");
        let stages: Vec<_> = logs.iter().map(|l| l.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec!["noble_cctp_minted", "noble_ibc_forwarded", "namada_received"]
        );
    }

    #[tokio::test]
    async fn test_unfinished_excludes_terminal() {
        let store = SledStorage::temporary().expect("open");
        store
            .create_flow(test_flow("flow-1", None))
            .await
            .expect("create");
        store
            .create_flow(test_flow("flow-2", None))
            .await
            .expect("create");
        store
            .update_flow("flow-2", &mut |flow| {
                flow.status = FlowStatus::Undetermined;
            })
            .await
            .expect("update");

        let unfinished = store.list_unfinished_flows().await.expect("list");
        let ids: Vec<_> = unfinished.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["flow-1"]);
    }

    #[tokio::test]
    async fn test_find_by_any_hash_includes_terminal() {
        let store = SledStorage::temporary().expect("open");
        store
            .create_flow(test_flow("flow-1", Some("0xinit")))
            .await
            .expect("create");
        store
            .update_flow("flow-1", &mut |flow| {
                flow.status = FlowStatus::Completed;
                flow.chain_progress.ensure(ChainKey::Namada).tx_hash = Some("DCAB".to_string());
            })
            .await
            .expect("update");

        let by_lane = store
            .find_flow_by_any_hash(ChainKey::Namada, "DCAB")
            .await
            .expect("find");
        assert_eq!(by_lane.map(|f| f.id), Some("flow-1".to_string()));

        let by_init = store
            .find_flow_by_any_hash(ChainKey::Evm, "0xinit")
            .await
            .expect("find");
        assert_eq!(by_init.map(|f| f.id), Some("flow-1".to_string()));

        let missing = store
            .find_flow_by_any_hash(ChainKey::Noble, "nope")
            .await
            .expect("find");
        assert!(missing.is_none());
    }
}
