use std::str::FromStr;

use actix_web::{
    http::StatusCode,
    web::{Data, Json, Path, Query},
    HttpResponse, Responder, ResponseError,
};
use chrono::Utc;
use flow_common::{
    api::{
        ClientStageRequest, ErrorResponse, FlowStatusResponse, StageKind, StatusUpdate,
        TrackFlowRequest,
    },
    chain::ChainKey,
    flow::{Flow, FlowStatus, Stage, StageSource, StageStatus, StatusLogEntry},
    VERSION,
};
use log::{debug, info};
use metrics::counter;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;

use super::{ApiServer, PrometheusData};
use crate::core::storage::{FlowStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("flow not found")]
    FlowNotFound,
    #[error("unknown chain '{0}'")]
    UnknownChain(String),
    #[error("validation failed")]
    Validation { field: String, message: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::FlowNotFound => StatusCode::NOT_FOUND,
            Self::UnknownChain(_) | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            Self::Validation { field, message } => {
                ErrorResponse::new(self.to_string()).with_field(field.clone(), message.clone())
            }
            Self::UnknownChain(chain) => ErrorResponse::new(self.to_string())
                .with_field("chain", format!("'{}' is not registered", chain)),
            _ => ErrorResponse::new(self.to_string()),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

// Opaque flow id, random 128 bits in hex
fn generate_flow_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({"status": "ok", "version": VERSION}))
}

pub async fn prometheus_metrics(handle: Data<PrometheusData>) -> HttpResponse {
    match handle.as_ref() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().body("Prometheus metrics are not enabled"),
    }
}

/// POST /api/track/flow — register a flow and enqueue its polling job.
/// Idempotent on the initiating tx hash.
pub async fn track_flow<S: FlowStore>(
    server: Data<ApiServer<S>>,
    body: Json<TrackFlowRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = body.into_inner();
    let registry = server.tracker().registry();
    for (field, chain_id) in [
        ("initialChain", &request.initial_chain),
        ("destinationChain", &request.destination_chain),
    ] {
        if !registry.contains(chain_id) {
            debug!("rejecting track request: unknown {} {}", field, chain_id);
            return Err(ApiError::UnknownChain(chain_id.clone()));
        }
    }
    if let Some(tx_hash) = request.tx_hash.as_deref() {
        if tx_hash.is_empty() {
            return Err(ApiError::Validation {
                field: "txHash".to_string(),
                message: "must not be empty when present".to_string(),
            });
        }
    }

    let mut flow = Flow::new(
        generate_flow_id(),
        request.flow_type,
        request.initial_chain,
        request.destination_chain,
        request.tx_hash,
        request.metadata,
    );
    if let Some(progress) = request.chain_progress {
        // client-seeded progress (e.g. a burn already observed)
        flow.chain_progress = progress;
    }

    let (flow, created) = server.tracker().store().create_flow(flow).await?;
    if created {
        server.worker().enqueue_flow(&flow)?;
        counter!("flowd_flows_registered").increment(1);
        info!("Registered {} flow {}", flow.flow_type, flow.id);
    }
    Ok(HttpResponse::Ok().json(flow))
}

pub async fn get_flow<S: FlowStore>(
    server: Data<ApiServer<S>>,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let flow = server
        .tracker()
        .store()
        .get_flow(&id)
        .await?
        .ok_or(ApiError::FlowNotFound)?;
    Ok(HttpResponse::Ok().json(flow))
}

pub async fn flow_status<S: FlowStore>(
    server: Data<ApiServer<S>>,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let flow = server
        .tracker()
        .store()
        .get_flow(&id)
        .await?
        .ok_or(ApiError::FlowNotFound)?;
    Ok(HttpResponse::Ok().json(FlowStatusResponse {
        id: flow.id,
        status: flow.status,
        chain_progress: flow.chain_progress,
    }))
}

pub async fn flow_logs<S: FlowStore>(
    server: Data<ApiServer<S>>,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let store = server.tracker().store();
    if store.get_flow(&id).await?.is_none() {
        return Err(ApiError::FlowNotFound);
    }
    let logs = store.list_status_logs(&id).await?;
    Ok(HttpResponse::Ok().json(logs))
}

pub async fn flow_jobs<S: FlowStore>(
    server: Data<ApiServer<S>>,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    if server.tracker().store().get_flow(&id).await?.is_none() {
        return Err(ApiError::FlowNotFound);
    }
    let jobs = server.worker().queue().jobs_for_flow(&id)?;
    Ok(HttpResponse::Ok().json(jobs))
}

/// POST /api/flow/{id}/stage — append a client-sourced stage entry.
/// `kind=gasless` routes to the auxiliary gasless lane.
pub async fn client_stage<S: FlowStore>(
    server: Data<ApiServer<S>>,
    path: Path<String>,
    body: Json<ClientStageRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let request = body.into_inner();
    if request.stage.is_empty() {
        return Err(ApiError::Validation {
            field: "stage".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    let chain = request.chain;
    let stage_entry = Stage {
        stage: request.stage.clone(),
        status: request.status.unwrap_or(StageStatus::Confirmed),
        message: request.message.clone(),
        tx_hash: request.tx_hash.clone(),
        occurred_at: request.occurred_at.unwrap_or_else(Utc::now),
        source: request.source.unwrap_or(StageSource::Client),
        metadata: request.metadata.clone(),
    };
    let gasless = matches!(request.kind, Some(StageKind::Gasless));

    let store = server.tracker().store();
    let entry = stage_entry.clone();
    match store
        .update_flow(&id, &mut |flow: &mut Flow| {
            let progress = flow.chain_progress.ensure(chain);
            if gasless {
                progress.gasless_stages.push(entry.clone());
            } else {
                progress.stages.push(entry.clone());
            }
        })
        .await
    {
        Ok(_) => {}
        Err(StorageError::FlowNotFound(_)) => return Err(ApiError::FlowNotFound),
        Err(e) => return Err(e.into()),
    }

    store
        .append_status_log(StatusLogEntry {
            flow_id: id.clone(),
            stage: stage_entry.stage.clone(),
            chain,
            source: stage_entry.source,
            detail: json!({
                "status": stage_entry.status,
                "txHash": stage_entry.tx_hash,
                "gasless": gasless,
            }),
            created_at: Utc::now(),
        })
        .await?;
    server
        .tracker()
        .events()
        .publish(StatusUpdate {
            flow_id: id,
            chain,
            stage: stage_entry.stage,
            status: stage_entry.status,
            message: stage_entry.message,
            tx_hash: stage_entry.tx_hash,
            occurred_at: stage_entry.occurred_at,
            source: stage_entry.source,
            metadata: stage_entry.metadata,
        })
        .await;

    Ok(HttpResponse::NoContent().finish())
}

pub async fn flow_by_hash<S: FlowStore>(
    server: Data<ApiServer<S>>,
    path: Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (chain, hash) = path.into_inner();
    // accept a lane key or a registry chain id
    let key = match ChainKey::from_str(&chain) {
        Ok(key) => key,
        Err(_) => server
            .tracker()
            .registry()
            .get(&chain)
            .map(|entry| entry.key)
            .ok_or_else(|| ApiError::UnknownChain(chain.clone()))?,
    };
    let flow = server
        .tracker()
        .store()
        .find_flow_by_any_hash(key, &hash)
        .await?
        .ok_or(ApiError::FlowNotFound)?;
    Ok(HttpResponse::Ok().json(flow))
}

#[derive(Debug, Deserialize)]
pub struct ListFlowsQuery {
    pub status: Option<FlowStatus>,
    pub limit: Option<usize>,
}

pub async fn list_flows<S: FlowStore>(
    server: Data<ApiServer<S>>,
    query: Query<ListFlowsQuery>,
) -> Result<HttpResponse, ApiError> {
    let flows = server
        .tracker()
        .store()
        .list_flows(query.status, query.limit.unwrap_or(100).min(1000))
        .await?;
    Ok(HttpResponse::Ok().json(flows))
}
