//! WebSocket signaling server.
//!
//! One socket per peer. The socket's reader dispatches client messages to the
//! room registry; everything addressed to the peer goes through a bounded
//! outbound queue drained by a writer task, which also sends keep-alive pings.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension,
    Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use handoff_core::signaling::{ClientMessage, ServerMessage};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::SignalConfig;
use crate::registry::{PeerLink, RoomHandle, RoomRegistry, SignalError};

/// Ping interval for keeping idle sockets alive through proxies
const PING_INTERVAL_SECS: u64 = 15;

/// Per-connection outbound queue depth
const OUTBOUND_DEPTH: usize = 64;

#[derive(Clone)]
struct AppState {
    registry: Arc<RoomRegistry>,
    shutdown: CancellationToken,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    rooms: usize,
}

pub struct SignalServer {
    registry: Arc<RoomRegistry>,
    config: SignalConfig,
    shutdown: CancellationToken,
}

impl SignalServer {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(&config)),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    /// Router with `/ws` and `/health`
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
        };
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_check))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
    }

    /// Serve until `shutdown` is cancelled, then drop every room.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let sweeper = spawn_sweeper(
            self.registry.clone(),
            self.config.sweep_interval,
            self.shutdown.clone(),
        );
        let router = self.router();

        tracing::info!("Signaling server ready at ws://{}/ws", addr);
        // Open sockets watch the internal token so they end with the server
        let internal = self.shutdown.clone();
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            internal.cancel();
            tracing::info!("Signaling server shutting down gracefully");
        })
        .await;

        self.shutdown.cancel();
        let _ = sweeper.await;
        self.registry.clear().await;
        result?;
        Ok(())
    }
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "handoff-signal",
        version: env!("CARGO_PKG_VERSION"),
        rooms: state.registry.room_count().await,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    addr: Option<Extension<ConnectInfo<SocketAddr>>>,
) -> Response {
    let client = addr
        .map(|a| a.0.0.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, client))
}

async fn handle_socket(socket: WebSocket, state: AppState, client: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_DEPTH);
    let link = PeerLink::new(tx);
    tracing::info!("Peer {} connected from {}", link.id, client);

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if sink.send(Message::Text(msg.to_json().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut attachment: Option<RoomHandle> = None;
    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(msg) => dispatch(&state.registry, &link, &mut attachment, msg).await,
                    Err(e) => {
                        tracing::warn!("Malformed message from peer {}: {}", link.id, e);
                        let _ = link
                            .tx
                            .send(ServerMessage::error(format!("malformed message: {}", e)))
                            .await;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!("Socket error for peer {}: {}", link.id, e);
                break;
            }
        }
    }

    // A vanished socket releases the room exactly like an explicit leave
    if let Some(handle) = attachment.take() {
        state.registry.leave(&handle, "connection closed").await;
    }
    writer.abort();
    tracing::info!("Peer {} disconnected", link.id);
}

async fn dispatch(
    registry: &RoomRegistry,
    link: &PeerLink,
    attachment: &mut Option<RoomHandle>,
    msg: ClientMessage,
) {
    // The other side or the sweeper may have closed the room under us
    let stale = match attachment.as_ref() {
        Some(handle) => !registry.is_attached(handle).await,
        None => false,
    };
    if stale {
        tracing::debug!("Peer {} detached from a closed room", link.id);
        *attachment = None;
    }

    let reply = match msg {
        ClientMessage::CreateRoom if attachment.is_some() => {
            Some(ServerMessage::error(SignalError::AlreadyAttached.to_string()))
        }
        ClientMessage::CreateRoom => match registry.create_room(link.clone()).await {
            Ok(handle) => {
                let reply = ServerMessage::RoomCreated {
                    code: handle.code.clone(),
                    expires_in_secs: registry.idle_timeout().as_secs(),
                };
                *attachment = Some(handle);
                Some(reply)
            }
            Err(e) => Some(ServerMessage::error(e.to_string())),
        },
        ClientMessage::JoinRoom { .. } if attachment.is_some() => {
            Some(ServerMessage::error(SignalError::AlreadyAttached.to_string()))
        }
        ClientMessage::JoinRoom { code } => match registry.join_room(&code, link.clone()).await {
            // The registry already sent `joined`
            Ok(handle) => {
                *attachment = Some(handle);
                None
            }
            Err(e) => {
                tracing::debug!("Peer {} could not join {}: {}", link.id, code, e);
                Some(match e.join_reject_reason() {
                    Some(reason) => ServerMessage::JoinRejected { reason },
                    None => ServerMessage::error(e.to_string()),
                })
            }
        },
        ClientMessage::Relay { payload } => match attachment {
            Some(handle) => match registry.relay(handle, payload).await {
                Ok(()) => None,
                Err(e) => Some(ServerMessage::error(e.to_string())),
            },
            None => Some(ServerMessage::error("not in a room")),
        },
        ClientMessage::Leave { reason } => {
            if let Some(handle) = attachment.take() {
                registry.leave(&handle, &reason).await;
            }
            None
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
    };

    if let Some(reply) = reply {
        let _ = link.tx.send(reply).await;
    }
}

fn spawn_sweeper(
    registry: Arc<RoomRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    registry.reap_expired().await;
                }
            }
        }
    })
}
