use std::collections::HashMap;

use flow_common::{time::get_current_time_in_millis, time::TimestampMillis, tokio::sync::RwLock};
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

/// Timeout bookkeeping for the stage a flow is currently polling
#[derive(Debug, Clone)]
pub struct StageTimeout {
    pub stage: String,
    pub started_at: TimestampMillis,
    pub timeout_ms: u64,
}

impl StageTimeout {
    pub fn elapsed_ms(&self) -> u64 {
        get_current_time_in_millis().saturating_sub(self.started_at)
    }

    pub fn expired(&self) -> bool {
        self.elapsed_ms() >= self.timeout_ms
    }
}

struct ActiveFlow {
    cancel: CancellationToken,
    stage: Option<StageTimeout>,
}

/// Owns the per-flow in-memory state: active engine runs (id -> cancellation
/// controller) and per-stage timeout tracking. All mutation goes through
/// these methods; nothing else touches the maps.
#[derive(Default)]
pub struct FlowSupervisor {
    active: RwLock<HashMap<String, ActiveFlow>>,
}

impl FlowSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a starting engine run and hand back its cancellation root.
    /// A flow that is already active is a programmer error.
    pub async fn begin(&self, flow_id: &str) -> Option<CancellationToken> {
        let mut active = self.active.write().await;
        if active.contains_key(flow_id) {
            return None;
        }
        let cancel = CancellationToken::new();
        active.insert(
            flow_id.to_string(),
            ActiveFlow {
                cancel: cancel.clone(),
                stage: None,
            },
        );
        cancel.into()
    }

    pub async fn finish(&self, flow_id: &str) {
        self.active.write().await.remove(flow_id);
    }

    /// Abort an in-flight engine run. Unknown flows are a no-op.
    pub async fn stop(&self, flow_id: &str) {
        let active = self.active.read().await;
        match active.get(flow_id) {
            Some(entry) => {
                debug!("Stopping flow {}", flow_id);
                entry.cancel.cancel();
            }
            None => warn!("stop requested for unknown flow {}", flow_id),
        }
    }

    pub async fn is_active(&self, flow_id: &str) -> bool {
        self.active.read().await.contains_key(flow_id)
    }

    /// Record the stage a flow starts polling together with its budget
    pub async fn record_stage(&self, flow_id: &str, stage: &str, timeout_ms: u64) {
        let mut active = self.active.write().await;
        if let Some(entry) = active.get_mut(flow_id) {
            entry.stage = Some(StageTimeout {
                stage: stage.to_string(),
                started_at: get_current_time_in_millis(),
                timeout_ms,
            });
        }
    }

    pub async fn current_stage(&self, flow_id: &str) -> Option<StageTimeout> {
        self.active
            .read()
            .await
            .get(flow_id)
            .and_then(|entry| entry.stage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_twice_is_rejected() {
        let supervisor = FlowSupervisor::new();
        assert!(supervisor.begin("flow-1").await.is_some());
        assert!(supervisor.begin("flow-1").await.is_none());
        supervisor.finish("flow-1").await;
        assert!(supervisor.begin("flow-1").await.is_some());
    }

    #[tokio::test]
    async fn test_stop_cancels_token() {
        let supervisor = FlowSupervisor::new();
        let cancel = supervisor.begin("flow-1").await.expect("begin");
        assert!(!cancel.is_cancelled());
        supervisor.stop("flow-1").await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_unknown_flow_is_noop() {
        let supervisor = FlowSupervisor::new();
        supervisor.stop("missing").await;
    }

    #[tokio::test]
    async fn test_stage_tracking() {
        let supervisor = FlowSupervisor::new();
        supervisor.begin("flow-1").await.expect("begin");
        supervisor.record_stage("flow-1", "noble_deposit", 60_000).await;
        let stage = supervisor.current_stage("flow-1").await.expect("stage");
        assert_eq!(stage.stage, "noble_deposit");
        assert!(!stage.expired());
    }
}
