mod http;
mod websocket;

pub use http::ApiError;

use std::sync::Arc;

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use anyhow::Context;
use flow_common::tokio::{spawn_task, sync::Mutex};
use log::{info, warn};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{
    core::storage::FlowStore,
    tracker::SharedFlowTracker,
    worker::SharedFlowWorker,
};

/// HTTP surface configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    /// Allowed WebSocket origins; None allows any
    pub allowed_origins: Option<Vec<String>>,
    pub prometheus_enabled: bool,
    pub prometheus_route: String,
}

pub type SharedApiServer<S> = Arc<ApiServer<S>>;

/// REST + WebSocket server over the tracker.
/// Owns the actix server handle so it can be stopped on shutdown.
pub struct ApiServer<S: FlowStore> {
    handle: Mutex<Option<ServerHandle>>,
    tracker: SharedFlowTracker<S>,
    worker: SharedFlowWorker<S>,
    allowed_origins: Option<Vec<String>>,
}

impl<S: FlowStore> ApiServer<S> {
    pub async fn new(
        tracker: SharedFlowTracker<S>,
        worker: SharedFlowWorker<S>,
        config: ApiConfig,
    ) -> Result<SharedApiServer<S>, anyhow::Error> {
        let prometheus = if config.prometheus_enabled {
            let (recorder, _) = PrometheusBuilder::new()
                .build()
                .context("Failed to create Prometheus handler")?;
            let handle = recorder.handle();
            metrics::set_global_recorder(Box::new(recorder))
                .context("Failed to set global recorder for Prometheus")?;
            info!(
                "Prometheus metrics enabled on route: {}",
                config.prometheus_route
            );
            Some((config.prometheus_route.clone(), handle))
        } else {
            None
        };

        if config.bind_address.starts_with("0.0.0.0") {
            warn!("API server is bound to 0.0.0.0 without authentication; prefer 127.0.0.1 behind a reverse proxy");
        }

        let server = Arc::new(Self {
            handle: Mutex::new(None),
            tracker,
            worker,
            allowed_origins: config.allowed_origins.clone(),
        });

        info!("Starting API server on {}", config.bind_address);
        {
            let clone = Arc::clone(&server);
            let builder = HttpServer::new(move || {
                let server = Arc::clone(&clone);
                let mut app = App::new()
                    .app_data(web::Data::from(server))
                    .app_data(web::Data::new(
                        prometheus.as_ref().map(|(_, handle)| handle.clone()),
                    ))
                    .service(
                        web::scope("/api")
                            .route("/track/flow", web::post().to(http::track_flow::<S>))
                            .route("/flows", web::get().to(http::list_flows::<S>))
                            .route("/flow/by-hash/{chain}/{hash}", web::get().to(http::flow_by_hash::<S>))
                            .route("/flow/{id}", web::get().to(http::get_flow::<S>))
                            .route("/flow/{id}/status", web::get().to(http::flow_status::<S>))
                            .route("/flow/{id}/logs", web::get().to(http::flow_logs::<S>))
                            .route("/flow/{id}/job", web::get().to(http::flow_jobs::<S>))
                            .route("/flow/{id}/stage", web::post().to(http::client_stage::<S>)),
                    )
                    .route("/health", web::get().to(http::health))
                    .route("/ws", web::get().to(websocket::websocket_endpoint::<S>));

                if let Some((route, _)) = &prometheus {
                    app = app.route(route, web::get().to(http::prometheus_metrics));
                }
                app
            })
            .disable_signals()
            .bind(&config.bind_address)?;

            let http_server = builder.run();
            {
                // save the server handle to be able to stop it later
                let handle = http_server.handle();
                let mut lock = server.handle.lock().await;
                *lock = Some(handle);
            }
            spawn_task("api-server", http_server);
        }

        Ok(server)
    }

    pub async fn stop(&self) {
        info!("Stopping API server...");
        let mut handle = self.handle.lock().await;
        if let Some(handle) = handle.take() {
            handle.stop(false).await;
            info!("API server is now stopped!");
        } else {
            warn!("API server is not running!");
        }
    }

    pub fn tracker(&self) -> &SharedFlowTracker<S> {
        &self.tracker
    }

    pub fn worker(&self) -> &SharedFlowWorker<S> {
        &self.worker
    }

    pub fn allowed_origins(&self) -> Option<&[String]> {
        self.allowed_origins.as_deref()
    }
}

pub(crate) type PrometheusData = Option<PrometheusHandle>;
