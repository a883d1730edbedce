use std::{net::SocketAddr, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time};
use tracing::{info, warn};

use crate::{
    command,
    correlator::Correlator,
    dispatch::Dispatcher,
    protocol::{
        BeforeRequest, BeforeSendHeaders, CompletedRequest, EventAck, MessageEnvelope,
        TabLifecycle,
    },
    state::TabId,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Clone)]
struct HttpState {
    correlator: Correlator,
    dispatcher: Dispatcher,
}

#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.take() {
            if tx.send(()).is_err() {
                warn!("server shutdown signal receiver dropped");
            }
        }

        let mut join_handle = match self.join_handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        tokio::select! {
            join_result = &mut join_handle => match join_result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(ServerError::Io(error)),
                Err(error) => Err(ServerError::Join(error)),
            },
            _ = time::sleep(Duration::from_secs(2)) => {
                warn!("HTTP server shutdown timed out; aborting");
                join_handle.abort();
                Ok(())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server task failed to join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn spawn(
    correlator: Correlator,
    dispatcher: Dispatcher,
    config: ServerConfig,
) -> Result<ServerHandle, ServerError> {
    let listener = TcpListener::bind(config.bind_addr).await?;

    let router = router(HttpState {
        correlator,
        dispatcher,
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let addr = listener.local_addr()?;

    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });

    let join_handle = tokio::spawn(async move {
        if let Err(error) = server.await {
            warn!(?error, "HTTP server terminated with error");
            Err(error)
        } else {
            Ok(())
        }
    });

    info!(%addr, "HTTP server listening");

    Ok(ServerHandle {
        addr,
        shutdown: Some(shutdown_tx),
        join_handle: Some(join_handle),
    })
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/events/completed", post(completed))
        .route("/events/before-request", post(before_request))
        .route("/events/before-send-headers", post(before_send_headers))
        .route("/events/tab-activated", post(tab_activated))
        .route("/events/tab-removed", post(tab_removed))
        .route("/messages", post(message))
        .route("/tabs", get(tabs))
        .with_state(state)
}

async fn completed(
    State(state): State<HttpState>,
    Json(request): Json<CompletedRequest>,
) -> (StatusCode, Json<EventAck>) {
    let ack = EventAck::from(state.correlator.on_completed(request).await);
    (StatusCode::ACCEPTED, Json(ack))
}

async fn before_request(
    State(state): State<HttpState>,
    Json(request): Json<BeforeRequest>,
) -> (StatusCode, Json<EventAck>) {
    let ack = EventAck::from(state.correlator.on_before_request(request).await);
    (StatusCode::ACCEPTED, Json(ack))
}

async fn before_send_headers(
    State(state): State<HttpState>,
    Json(request): Json<BeforeSendHeaders>,
) -> (StatusCode, Json<EventAck>) {
    let ack = EventAck::from(state.correlator.on_before_send_headers(request).await);
    (StatusCode::ACCEPTED, Json(ack))
}

async fn tab_activated(
    State(state): State<HttpState>,
    Json(event): Json<TabLifecycle>,
) -> StatusCode {
    state.correlator.on_tab_activated(event).await;
    StatusCode::NO_CONTENT
}

async fn tab_removed(
    State(state): State<HttpState>,
    Json(event): Json<TabLifecycle>,
) -> StatusCode {
    state.correlator.on_tab_removed(event).await;
    StatusCode::NO_CONTENT
}

async fn message(
    State(state): State<HttpState>,
    Json(envelope): Json<MessageEnvelope>,
) -> Response {
    match state
        .dispatcher
        .handle(envelope.message, &envelope.sender)
        .await
    {
        Some(body) => (StatusCode::OK, Json(body)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TabSummary {
    tab_id: TabId,
    ready: bool,
    manifest_url: Option<String>,
    license_url: Option<String>,
    header_flags: String,
    title: Option<String>,
}

async fn tabs(State(state): State<HttpState>) -> impl IntoResponse {
    let quote = state.correlator.policy().quote;
    let summaries: Vec<_> = state
        .correlator
        .store()
        .tabs_snapshot()
        .await
        .into_iter()
        .map(|(tab_id, record)| TabSummary {
            tab_id,
            ready: command::is_ready(&record, quote),
            manifest_url: record.manifest_url,
            license_url: record.license_url,
            header_flags: record.header_flags,
            title: record.title,
        })
        .collect();

    (StatusCode::OK, Json(summaries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatch::DispatchOptions, encode::EncodingPolicy, native::MissingHost, state::TabStore,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn http_state() -> HttpState {
        let store = Arc::new(TabStore::default());
        let correlator = Correlator::new(Arc::clone(&store), EncodingPolicy::default());
        let dispatcher = Dispatcher::new(
            correlator.clone(),
            store,
            Arc::new(MissingHost),
            DispatchOptions::default(),
        );
        HttpState {
            correlator,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn completed_handler_acknowledges_with_icon() {
        let state = http_state();
        let request = serde_json::from_value(json!({
            "tabId": 3, "method": "GET", "url": "https://x/manifest.json"
        }))
        .unwrap();

        let (status, Json(ack)) = completed(State(state.clone()), Json(request)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(ack.tracked);
        assert_eq!(
            serde_json::to_value(&ack).unwrap()["icon"]["state"],
            json!("notReady")
        );
        assert!(state.correlator.store().contains(TabId(3)).await);
    }

    #[tokio::test]
    async fn untracked_tab_is_acknowledged_without_icon() {
        let state = http_state();
        let request = serde_json::from_value(json!({
            "tabId": -1, "method": "POST", "url": "https://x/license",
            "requestBody": { "raw": [ { "bytes": "AQI=" } ] }
        }))
        .unwrap();

        let (_, Json(ack)) = before_request(State(state), Json(request)).await;
        assert_eq!(ack, EventAck::ignored());
    }

    #[tokio::test]
    async fn send_message_without_host_reports_error() {
        let state = http_state();
        let request = serde_json::from_value(json!({
            "tabId": 2, "method": "GET", "url": "https://x/manifest.json"
        }))
        .unwrap();
        completed(State(state.clone()), Json(request)).await;
        tab_activated(
            State(state.clone()),
            Json(TabLifecycle { tab_id: TabId(2) }),
        )
        .await;

        let envelope = serde_json::from_value(json!({ "action": "sendData", "title": "x" })).unwrap();
        let response = message(State(state), Json(envelope)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!({
                "status": "error",
                "error": "Specified native messaging host not found."
            })
        );
    }

    #[tokio::test]
    async fn tabs_snapshot_reports_readiness_and_flags() {
        let state = http_state();
        state
            .correlator
            .on_before_send_headers(
                serde_json::from_value(json!({
                    "tabId": 4, "method": "POST", "url": "https://x/license",
                    "requestHeaders": [ { "name": "A", "value": "1" } ]
                }))
                .unwrap(),
            )
            .await;

        let response = tabs(State(state)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!([{
                "tabId": 4,
                "ready": false,
                "manifestUrl": null,
                "licenseUrl": null,
                "headerFlags": " -H 'A: 1'",
                "title": null
            }])
        );
    }

    #[tokio::test]
    async fn unknown_message_has_no_content() {
        let envelope = serde_json::from_value(json!({ "action": "noop" })).unwrap();
        let response = message(State(http_state()), Json(envelope)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn tab_removed_handler_evicts() {
        let state = http_state();
        state
            .correlator
            .on_title(TabId(5), "Page".into())
            .await
            .expect("tracked tab");

        let status = tab_removed(
            State(state.clone()),
            Json(TabLifecycle { tab_id: TabId(5) }),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.correlator.store().contains(TabId(5)).await);
    }
}
