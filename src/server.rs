//! Observer transport: a WebSocket per project fed by the broadcast hub,
//! plus a health probe and a JSON status endpoint.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::hub::BroadcastHub;
use crate::orchestrator::{AgentManager, StatusReport};

/// Interval between server-initiated pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A connection that has not answered a ping for this long is dropped.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub manager: AgentManager,
    pub hub: BroadcastHub,
    /// Per-observer queue capacity.
    pub observer_buffer: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/projects/{project}/status", get(project_status))
        .route("/ws/{project}", get(ws_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn project_status(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Json<StatusReport> {
    Json(state.manager.status_report(&project))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, project))
}

async fn handle_socket(socket: WebSocket, state: AppState, project: String) {
    let subscription = state.hub.subscribe(&project, state.observer_buffer);
    tracing::info!(project = %project, observer = subscription.id, "Observer connected");

    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, subscription.rx).await;

    state.hub.unregister(&project, subscription.id);
    tracing::info!(project = %project, observer = subscription.id, "Observer disconnected");
}

/// Forward hub payloads to the socket until either side goes away or the
/// client stops answering pings.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: mpsc::Receiver<Arc<str>>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("Observer missed pong; closing");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                if sender.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.close().await;
}

/// Serve the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Observer server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Observer server error")
}

/// Bind `addr` and serve. See [`serve`].
pub async fn bind_and_serve<F>(addr: &str, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    serve(listener, state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientFactory, CodeGenClient, SessionSettings};
    use crate::config::Limits;
    use crate::errors::ClientError;
    use crate::orchestrator::ManagerDeps;
    use crate::process::ProcessSupervisor;
    use crate::prompts::TemplatePrompts;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NoClients;

    impl ClientFactory for NoClients {
        fn create(&self, _: &SessionSettings) -> Result<Arc<dyn CodeGenClient>, ClientError> {
            Err(ClientError::Unavailable("not in tests".into()))
        }
    }

    fn test_state() -> AppState {
        let hub = BroadcastHub::new();
        let manager = AgentManager::new(ManagerDeps {
            hub: hub.clone(),
            store: Arc::new(MemoryStore::new()),
            prompts: Arc::new(TemplatePrompts::default()),
            clients: Arc::new(NoClients),
            supervisor: ProcessSupervisor::new(Duration::from_secs(1)),
            limits: Limits::default(),
            validation_category: "build".into(),
        });
        AppState {
            manager,
            hub,
            observer_buffer: 8,
        }
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(test_state());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_status_of_unknown_project_is_stopped() {
        let state = test_state();
        let _sub = state.hub.subscribe("todo-app", 4);
        let app = build_router(state);

        let req = Request::builder()
            .uri("/api/projects/todo-app/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["project"], "todo-app");
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["observers"], 1);
        assert!(json["phase"].is_null());
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = build_router(test_state());
        let req = Request::builder()
            .uri("/ws/todo-app")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        // A plain GET without upgrade headers is rejected, but the route exists.
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.status().is_client_error());
    }
}
