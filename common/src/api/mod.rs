use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    chain::{ChainKey, ChainType},
    flow::{ChainProgressSet, FlowStatus, FlowType, StageSource, StageStatus},
};

/// Body of `POST /api/track/flow`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFlowRequest {
    pub flow_type: FlowType,
    pub initial_chain: String,
    pub destination_chain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_type: Option<ChainType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_progress: Option<ChainProgressSet>,
}

/// Routing for client-reported stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Default,
    Gasless,
}

/// Body of `POST /api/flow/{id}/stage`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStageRequest {
    pub chain: ChainKey,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<StageKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<StageSource>,
}

/// Response of `GET /api/flow/{id}/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatusResponse {
    pub id: String,
    pub status: FlowStatus,
    pub chain_progress: ChainProgressSet,
}

/// Event published on every stage transition, fanned out to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub flow_id: String,
    pub chain: ChainKey,
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

/// Client -> server WebSocket frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsClientMessage {
    Subscribe {
        #[serde(rename = "flowId")]
        flow_id: String,
    },
    Unsubscribe {
        #[serde(rename = "flowId")]
        flow_id: String,
    },
}

/// Server -> client WebSocket frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WsServerMessage {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
        message: String,
    },
    StatusUpdate {
        data: StatusUpdate,
    },
}

/// Field-level validation detail returned with HTTP 400
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.fields.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
        self
    }
}
