//! HTTP endpoints for health checks, relay info, and metrics.

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};

use crate::relay::RelayCoordinator;
use crate::ws::{MAX_FILTERS, MAX_FRAME_LEN, MAX_LIMIT, MAX_SUB_ID_LEN};

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Start an HTTP server exposing `/healthz`, `/metrics`, and relay info.
pub async fn serve_http(
    addr: SocketAddr,
    relay: Arc<RelayCoordinator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(relay);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    /// Human-readable relay name.
    name: String,
    /// Longer relay description.
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pubkey: Option<String>,
    supported_nips: Vec<u32>,
    /// Software identifier.
    software: String,
    /// Semantic version string such as "0.1.0".
    version: String,
    limitation: Limitation,
}

/// Advertised protocol limits, mirroring what the websocket layer enforces.
#[derive(Serialize, Deserialize)]
struct Limitation {
    max_message_length: usize,
    max_filters: usize,
    max_limit: usize,
    max_subid_length: usize,
}

async fn relay_info(State(relay): State<Arc<RelayCoordinator>>) -> impl IntoResponse {
    let s = &relay.settings;
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: s.relay_name.clone(),
            description: s.relay_description.clone(),
            contact: s.relay_contact.clone(),
            pubkey: s.relay_pubkey.clone(),
            supported_nips: vec![1, 11],
            software: "rostr".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            limitation: Limitation {
                max_message_length: MAX_FRAME_LEN,
                max_filters: MAX_FILTERS,
                max_limit: MAX_LIMIT,
                max_subid_length: MAX_SUB_ID_LEN,
            },
        }),
    )
}

/// Prometheus text exposition of the relay counters.
async fn metrics(State(relay): State<Arc<RelayCoordinator>>) -> impl IntoResponse {
    match relay.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
