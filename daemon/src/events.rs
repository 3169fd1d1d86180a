use std::collections::HashMap;

use flow_common::{api::StatusUpdate, tokio::sync::broadcast, tokio::sync::RwLock};
use log::trace;

use crate::config::EVENT_CHANNEL_CAPACITY;

/// Topic-per-flow publish-subscribe with best-effort, at-most-once delivery.
/// Subscribers that miss events reconcile by re-reading the flow status.
#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<String, broadcast::Sender<StatusUpdate>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, flow_id: &str) -> broadcast::Receiver<StatusUpdate> {
        let mut topics = self.topics.write().await;
        topics
            .entry(flow_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub async fn publish(&self, update: StatusUpdate) {
        let mut topics = self.topics.write().await;
        if let Some(sender) = topics.get(&update.flow_id) {
            if sender.receiver_count() == 0 {
                // nobody listening anymore, drop the topic
                topics.remove(&update.flow_id);
                return;
            }
            if log::log_enabled!(log::Level::Trace) {
                trace!(
                    "publishing {} on {} for flow {}",
                    update.stage,
                    update.chain,
                    update.flow_id
                );
            }
            // best-effort: lagging receivers miss events
            let _ = sender.send(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use flow_common::{
        chain::ChainKey,
        flow::{StageSource, StageStatus},
    };

    use super::*;

    fn update(flow_id: &str) -> StatusUpdate {
        StatusUpdate {
            flow_id: flow_id.to_string(),
            chain: ChainKey::Noble,
            stage: "noble_cctp_minted".to_string(),
            status: StageStatus::Confirmed,
            message: None,
            tx_hash: None,
            occurred_at: Utc::now(),
            source: StageSource::Poller,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_update() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe("flow-1").await;
        bus.publish(update("flow-1")).await;
        let received = receiver.recv().await.expect("update");
        assert_eq!(received.flow_id, "flow-1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(update("flow-1")).await;
        // no panic, no delivery; a later subscriber sees nothing old
        let mut receiver = bus.subscribe("flow-1").await;
        bus.publish(update("flow-1")).await;
        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut one = bus.subscribe("flow-1").await;
        let mut two = bus.subscribe("flow-2").await;
        bus.publish(update("flow-2")).await;
        assert_eq!(two.recv().await.expect("update").flow_id, "flow-2");
        assert!(one.try_recv().is_err());
    }
}
