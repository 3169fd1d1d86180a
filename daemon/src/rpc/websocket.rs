use std::collections::HashMap;

use actix_web::{
    http::header,
    web::{Data, Payload},
    HttpRequest, HttpResponse,
};
use actix_ws::{Message, MessageStream, Session};
use flow_common::{
    api::{WsClientMessage, WsServerMessage},
    tokio::{spawn_task, sync::broadcast, task::JoinHandle},
};
use log::{debug, trace};
use rand::RngCore;

use super::ApiServer;
use crate::core::storage::FlowStore;

fn origin_allowed(allowed: Option<&[String]>, request: &HttpRequest) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    request
        .headers()
        .get(header::ORIGIN)
        .and_then(|origin| origin.to_str().ok())
        .map(|origin| allowed.iter().any(|candidate| candidate == origin))
        .unwrap_or(false)
}

/// WebSocket upgrade: per-connection flow subscriptions with best-effort
/// status-update fan-out
pub async fn websocket_endpoint<S: FlowStore>(
    server: Data<ApiServer<S>>,
    request: HttpRequest,
    body: Payload,
) -> actix_web::Result<HttpResponse> {
    if !origin_allowed(server.allowed_origins(), &request) {
        debug!("rejecting websocket upgrade: origin not allowed");
        return Ok(HttpResponse::Forbidden().finish());
    }

    let (response, session, stream) = actix_ws::handle(&request, body)?;
    let server = server.into_inner();
    actix_web::rt::spawn(async move {
        handle_connection(server, session, stream).await;
    });
    Ok(response)
}

async fn handle_connection<S: FlowStore>(
    server: std::sync::Arc<ApiServer<S>>,
    mut session: Session,
    mut stream: MessageStream,
) {
    let connection_id = {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    };
    debug!("websocket connection {} established", connection_id);

    let hello = WsServerMessage::Connected {
        connection_id: connection_id.clone(),
        message: "connected".to_string(),
    };
    let Ok(hello) = serde_json::to_string(&hello) else {
        return;
    };
    if session.text(hello).await.is_err() {
        return;
    }

    // flow id -> forwarding task
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = stream.recv().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<WsClientMessage>(&text) {
                Ok(WsClientMessage::Subscribe { flow_id }) => {
                    if subscriptions.contains_key(&flow_id) {
                        continue;
                    }
                    if log::log_enabled!(log::Level::Trace) {
                        trace!("connection {} subscribes to {}", connection_id, flow_id);
                    }
                    let mut receiver = server.tracker().events().subscribe(&flow_id).await;
                    let mut forward = session.clone();
                    let task = spawn_task("ws-forward", async move {
                        loop {
                            match receiver.recv().await {
                                Ok(update) => {
                                    let frame = WsServerMessage::StatusUpdate { data: update };
                                    let Ok(json) = serde_json::to_string(&frame) else {
                                        continue;
                                    };
                                    if forward.text(json).await.is_err() {
                                        break;
                                    }
                                }
                                // best-effort delivery: a lagging client
                                // reconciles via the status endpoint
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    });
                    subscriptions.insert(flow_id, task);
                }
                Ok(WsClientMessage::Unsubscribe { flow_id }) => {
                    if let Some(task) = subscriptions.remove(&flow_id) {
                        task.abort();
                    }
                }
                Err(e) => {
                    debug!(
                        "connection {} sent an invalid message: {}",
                        connection_id, e
                    );
                }
            },
            Message::Ping(bytes) => {
                if session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    for (_, task) in subscriptions {
        task.abort();
    }
    let _ = session.close(None).await;
    debug!("websocket connection {} closed", connection_id);
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    #[test]
    fn test_origin_allowed_without_allowlist() {
        let request = TestRequest::default().to_http_request();
        assert!(origin_allowed(None, &request));
    }

    #[test]
    fn test_origin_allowed_checks_header() {
        let allowed = vec!["http://localhost:3000".to_string()];
        let request = TestRequest::default()
            .insert_header((header::ORIGIN, "http://localhost:3000"))
            .to_http_request();
        assert!(origin_allowed(Some(&allowed), &request));

        let request = TestRequest::default()
            .insert_header((header::ORIGIN, "http://evil.example"))
            .to_http_request();
        assert!(!origin_allowed(Some(&allowed), &request));

        // no Origin header at all is rejected when an allowlist is set
        let request = TestRequest::default().to_http_request();
        assert!(!origin_allowed(Some(&allowed), &request));
    }
}
