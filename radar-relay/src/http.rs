//! WebSocket and health endpoints.
//!
//! `/publish` and `/subscribe` both upgrade to the same connection driver the
//! TCP listener uses; the route name is informational and either one accepts
//! either role.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{
    broker::BrokerState,
    connection::serve_connection,
    transport::{MAX_FRAME_LENGTH, Transport},
};

pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/publish", get(upgrade))
        .route("/subscribe", get(upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves [`router`] on `listener` until the broker starts shutting down.
pub async fn serve(listener: TcpListener, state: Arc<BrokerState>) -> std::io::Result<()> {
    let shutdown = state.shutdown_token();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<BrokerState>>,
) -> Response {
    ws.max_message_size(MAX_FRAME_LENGTH)
        .on_upgrade(move |socket| async move {
            let transport = Transport::axum_websocket(socket, addr.to_string());
            if let Err(err) = serve_connection(transport, state).await {
                warn!(peer = %addr, error = ?err, "websocket connection closed with error");
            }
        })
}

async fn health(State(state): State<Arc<BrokerState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry().session_count().await,
    }))
}
