//! Connection handlers for the Confer server.
//!
//! This module owns the WebSocket lifecycle: upgrade on `/room/{code}`,
//! the per-connection socket loop, and the handoff to the room
//! coordinator.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use confer_core::{
    ChannelHandle, CoordinatorConfig, HttpLifecycleClient, Outbound, RoomRegistry,
};
use confer_protocol::{codec, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The room registry.
    pub registry: RoomRegistry,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lifecycle HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let lifecycle = Arc::new(HttpLifecycleClient::new(
            &config.lifecycle.base_url,
            &config.lifecycle.internal_key,
        )?);

        let coordinator_config = CoordinatorConfig {
            sweep_interval: config.sweep.interval(),
        };

        Ok(Self {
            registry: RoomRegistry::new(lifecycle, coordinator_config),
            config,
        })
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route("/room/:room_code", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Confer server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/room/{{room_code}}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Query parameters for a room connection.
#[derive(Debug, Deserialize)]
struct ConnectQuery {
    /// Display name resolved for this connection.
    name: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_code): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let name = query.name.unwrap_or_else(|| "guest".to_string());
    ws.on_upgrade(move |socket| handle_websocket(socket, state, room_code, name))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, room_code: String, name: String) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Generate channel ID
    let channel_id = format!(
        "conn_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );

    debug!(channel = %channel_id, room = %room_code, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let handle = ChannelHandle::new(&channel_id, tx);

    let room = state.registry.get_or_create(&room_code);
    if let Err(e) = room.connect(handle, &room_code, &name).await {
        warn!(
            channel = %channel_id,
            room = %room_code,
            error = %e,
            "Connection rejected"
        );
        metrics::record_error("connect");
        // Flush the queued error message and close instruction, then bail.
        while let Ok(item) = rx.try_recv() {
            if deliver(&mut sender, item).await.is_err() {
                break;
            }
        }
        state.registry.remove_if_idle(&room_code).await;
        metrics::set_active_rooms(state.registry.room_count());
        return;
    }

    info!(channel = %channel_id, room = %room_code, name = %name, "Channel registered");
    metrics::set_active_rooms(state.registry.room_count());

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Deliver coordinator output to this channel, in send order
            Some(item) = rx.recv() => {
                if item.is_frame() {
                    metrics::record_message("outbound");
                }
                match deliver(&mut sender, item).await {
                    Ok(true) => {}
                    Ok(false) => break, // close instruction delivered
                    Err(e) => {
                        debug!(channel = %channel_id, error = %e, "Send failed");
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message("inbound");
                        handle_text(&room, &channel_id, &room_code, &text, &mut sender).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(channel = %channel_id, "Binary frame ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(f) => info!(
                                channel = %channel_id,
                                room = %room_code,
                                code = u16::from(f.code),
                                reason = %f.reason,
                                "Channel closed by peer"
                            ),
                            None => info!(
                                channel = %channel_id,
                                room = %room_code,
                                "Channel closed by peer without close frame"
                            ),
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(channel = %channel_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(channel = %channel_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Detach the channel only; user-record removal happens via userLeft or
    // the liveness sweep, never implicitly on close.
    room.disconnect(&channel_id).await;
    state.registry.remove_if_idle(&room_code).await;
    metrics::set_active_rooms(state.registry.room_count());

    debug!(channel = %channel_id, room = %room_code, "WebSocket disconnected");
}

/// Parse and dispatch one inbound text frame.
///
/// Errors never terminate the channel: malformed input and handler
/// failures are logged and surfaced back to the sender as an error
/// payload.
async fn handle_text(
    room: &Arc<confer_core::RoomCoordinator>,
    channel_id: &str,
    room_code: &str,
    text: &str,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) {
    let client_message = match codec::decode_client(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(
                channel = %channel_id,
                room = %room_code,
                error = %e,
                "Malformed client message"
            );
            metrics::record_error("protocol");
            let _ = send_server(sender, &ServerMessage::error(format!("malformed message: {e}")))
                .await;
            return;
        }
    };

    if let Err(e) = room.handle_message(channel_id, client_message).await {
        error!(
            channel = %channel_id,
            room = %room_code,
            error = %e,
            "Message handling error"
        );
        metrics::record_error("handler");
        let _ = send_server(sender, &ServerMessage::error(e.to_string())).await;
    }
}

/// Deliver one queued outbound item to the socket.
///
/// Returns `Ok(false)` when a close instruction was delivered and the
/// loop should stop.
async fn deliver(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    item: Outbound,
) -> Result<bool, axum::Error> {
    match item {
        Outbound::Frame(message) => {
            send_server(sender, &message).await?;
            Ok(true)
        }
        Outbound::Close(code) => {
            let frame = CloseFrame {
                code,
                reason: Cow::Borrowed(""),
            };
            sender.send(Message::Close(Some(frame))).await?;
            Ok(false)
        }
    }
}

/// Send a server message to the socket as a JSON text frame.
async fn send_server(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match codec::encode_server(message) {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(e) => {
            error!(error = %e, "Failed to encode server message");
            Ok(())
        }
    }
}
