//! Gateway server
//!
//! Owns the subscriber registry and fan-out broadcast, hosts the `/ws`
//! endpoint browsers connect to, and assembles the application: manager,
//! gateway, turn store, refresher, and bridge wired through one event
//! channel.

use crate::api;
use crate::config::{CodedeckConfig, ServerConfig};
use crate::error::Result;
use crate::gateway::messages::{ClientMessage, ServerMessage, ERROR_UNKNOWN_REPO};
use crate::gateway::subscriptions::{ConnId, SubscriptionIndex};
use crate::registry::RepoRegistry;
use crate::session::{SessionFactory, SessionManager};
use crate::threads::{LastMessageSource, ThreadListRefresher};
use crate::turns::TurnStateStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Subscriber registry and fan-out broadcast for browser connections
pub struct Gateway {
    registry: Arc<RepoRegistry>,
    manager: Arc<SessionManager>,
    subscriptions: SubscriptionIndex,
}

impl Gateway {
    pub fn new(registry: Arc<RepoRegistry>, manager: Arc<SessionManager>) -> Self {
        Self {
            registry,
            manager,
            subscriptions: SubscriptionIndex::new(),
        }
    }

    /// Register a connection's outbound sender and return its id
    pub async fn register_connection(
        &self,
        sender: mpsc::UnboundedSender<String>,
    ) -> ConnId {
        self.subscriptions.register(sender).await
    }

    /// Remove a connection from every interest set it belonged to
    pub async fn drop_connection(&self, conn_id: &str) {
        self.subscriptions.unregister(conn_id).await;
    }

    /// Handle one inbound text frame from a connection
    pub async fn handle_message(&self, conn_id: &str, raw: &str) {
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                let preview = &raw[..raw.len().min(200)];
                tracing::warn!(conn_id, "Invalid gateway message: {} (raw: {})", e, preview);
                return;
            }
        };

        match message {
            ClientMessage::Subscribe { repo_id, request_id } => {
                if self.registry.get(&repo_id).is_none() {
                    self.send(
                        conn_id,
                        &ServerMessage::SubscribeError {
                            repo_id: repo_id.clone(),
                            code: ERROR_UNKNOWN_REPO.to_string(),
                            message: format!("Unknown repository: {repo_id}"),
                            request_id,
                        },
                    )
                    .await;
                    return;
                }
                self.subscriptions.subscribe(conn_id, &repo_id).await;
                tracing::debug!(conn_id, repo_id = %repo_id, "Subscribed");
                self.send(conn_id, &ServerMessage::SubscribeAck { repo_id, request_id })
                    .await;
            }
            ClientMessage::Unsubscribe { repo_id, request_id } => {
                self.subscriptions.unsubscribe(conn_id, &repo_id).await;
                self.send(
                    conn_id,
                    &ServerMessage::UnsubscribeAck { repo_id, request_id },
                )
                .await;
            }
            ClientMessage::AppServerResponse { repo_id, message, .. } => {
                // forwarded verbatim; the agent validates its own payloads
                if let Err(e) = self.manager.send_response(&repo_id, message).await {
                    tracing::warn!(
                        conn_id,
                        repo_id = %repo_id,
                        "Failed to forward app-server response: {}",
                        e
                    );
                }
            }
        }
    }

    /// Fan a message out to every subscriber of a repo
    pub async fn broadcast_to_repo(&self, repo_id: &str, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(frame) => self.subscriptions.broadcast(repo_id, &frame).await,
            Err(e) => tracing::warn!(repo_id, "Failed to serialize gateway message: {}", e),
        }
    }

    async fn send(&self, conn_id: &str, message: &ServerMessage) {
        if let Ok(frame) = serde_json::to_string(message) {
            self.subscriptions.send_to(conn_id, frame).await;
        }
    }
}

/// Shared state for HTTP and WebSocket handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RepoRegistry>,
    pub manager: Arc<SessionManager>,
    pub gateway: Arc<Gateway>,
    pub turns: Arc<TurnStateStore>,
    pub refresher: Arc<ThreadListRefresher>,
}

/// Assembled application: handler state plus the running bridge task
pub struct App {
    pub state: AppState,
    _bridge: tokio::task::JoinHandle<()>,
}

/// Wire up manager, gateway, turn store, refresher, and bridge
pub fn build_app(
    config: &CodedeckConfig,
    registry: Arc<RepoRegistry>,
    factory: Arc<dyn SessionFactory>,
    last_message: Option<Arc<dyn LastMessageSource>>,
) -> App {
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let manager = Arc::new(SessionManager::new(
        Arc::clone(&registry),
        factory,
        events_tx,
    ));
    let gateway = Arc::new(Gateway::new(Arc::clone(&registry), Arc::clone(&manager)));
    let turns = Arc::new(TurnStateStore::new());
    let refresher = ThreadListRefresher::new(
        Arc::clone(&manager),
        Arc::clone(&gateway),
        last_message,
    );

    let bridge = crate::bridge::Bridge::new(
        Arc::clone(&turns),
        Arc::clone(&refresher),
        Arc::clone(&gateway),
        Duration::from_millis(config.session.refresh_debounce_ms),
    );
    let bridge_task = bridge.spawn(events_rx);

    App {
        state: AppState {
            registry,
            manager,
            gateway,
            turns,
            refresher,
        },
        _bridge: bridge_task,
    }
}

/// Build the router: the `/ws` gateway endpoint plus the REST surface
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .merge(api::api_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Create and start the server. Returns a handle that keeps it alive.
pub async fn start(config: &ServerConfig, state: AppState) -> Result<ServerHandle> {
    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "Codedeck server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
    })
}

/// Handle returned by [`start`]
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One browser connection: pump outbound frames and route inbound ones
/// until either side closes.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = state.gateway.register_connection(tx).await;
    tracing::info!(conn_id = %conn_id, "Browser connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let recv_gateway = Arc::clone(&state.gateway);
    let recv_conn = conn_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            match message {
                Message::Text(text) => recv_gateway.handle_message(&recv_conn, &text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.gateway.drop_connection(&conn_id).await;
    tracing::info!(conn_id = %conn_id, "Browser disconnected");
}
