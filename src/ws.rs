//! NIP-01 WebSocket endpoint: EVENT, REQ, CLOSE in; EVENT, OK, EOSE,
//! CLOSED, NOTICE out.
//!
//! Each connection runs two tasks: the inbound loop below and an outbound
//! forwarder draining a bounded queue into the socket. Replay frames are
//! pushed onto the same queue as live deliveries, so a subscriber observes
//! stored history strictly before anything live.

use std::{collections::HashSet, future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::filter::Filter;
use crate::registry::Delivery;
use crate::relay::{PublishVerdict, RelayCoordinator};

/// Most filters a single REQ may carry.
pub(crate) const MAX_FILTERS: usize = 10;
/// Largest per-filter `limit` honored.
pub(crate) const MAX_LIMIT: usize = 5_000;
/// Longest accepted subscription id.
pub(crate) const MAX_SUB_ID_LEN: usize = 64;
/// Largest accepted text frame, in bytes.
pub(crate) const MAX_FRAME_LEN: usize = 262_144;
/// Protocol violations tolerated before the connection is closed.
const MAX_STRIKES: u32 = 5;

/// Start the WebSocket server.
pub async fn serve_ws(
    addr: SocketAddr,
    relay: Arc<RelayCoordinator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/", get(handler)).with_state(relay);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Handle the HTTP upgrade. The per-address connection cap is enforced here,
/// before the socket exists.
async fn handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<RelayCoordinator>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = peer.ip();
    if !relay.limiter.acquire_connection(ip) {
        relay.metrics.rate_limited.inc();
        debug!(%ip, "refusing connection, per-address cap reached");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    // The slot acquired above is normally released in `process`; if the
    // upgrade never completes, that task never runs and the slot must be
    // given back here instead.
    let on_fail = relay.clone();
    ws.on_failed_upgrade(move |err| {
        debug!(%ip, error = %err, "upgrade failed");
        on_fail.limiter.release_slot(ip);
    })
    .on_upgrade(move |socket| async move { process(socket, relay, peer).await })
    .into_response()
}

/// Run one connection to completion.
async fn process(socket: WebSocket, relay: Arc<RelayCoordinator>, peer: SocketAddr) {
    let ip = peer.ip();
    let conn = relay.next_conn_id();
    info!(%peer, conn, "connection open");
    relay.metrics.connections_open.inc();

    let (tx, mut rx) = mpsc::channel::<Message>(relay.settings.outbound_queue_cap);
    relay.registry.register_connection(conn, tx.clone());

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut strikes = 0u32;
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(txt) => {
                if handle_text(&relay, ip, conn, &tx, txt.as_str()).await {
                    strikes += 1;
                    if strikes >= MAX_STRIKES {
                        let _ = tx
                            .send(notice("too many protocol errors, closing"))
                            .await;
                        break;
                    }
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let open_subs = relay.registry.subscription_count_for(conn) as i64;
    relay.metrics.subscriptions_open.sub(open_subs);
    relay.registry.remove_connection(conn);
    relay.limiter.release_connection(ip, conn);
    relay.metrics.connections_open.dec();
    // Dropping the last sender lets the writer drain queued frames and exit.
    drop(tx);
    let _ = writer.await;
    info!(%peer, conn, "connection closed");
}

/// Dispatch one text frame. Returns true when the frame counts as a
/// protocol violation.
async fn handle_text(
    relay: &Arc<RelayCoordinator>,
    ip: std::net::IpAddr,
    conn: u64,
    tx: &mpsc::Sender<Message>,
    txt: &str,
) -> bool {
    if txt.len() > MAX_FRAME_LEN {
        let _ = tx.send(notice("frame too large")).await;
        return true;
    }
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        let _ = tx.send(notice("could not parse message")).await;
        return true;
    };
    let Some(arr) = val.as_array() else {
        let _ = tx.send(notice("message must be a JSON array")).await;
        return true;
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 2 => handle_event(relay, ip, conn, tx, &arr[1]).await,
        Some("REQ") if arr.len() >= 3 => {
            handle_req(relay, ip, conn, tx, &arr[1], &arr[2..]).await
        }
        Some("CLOSE") if arr.len() >= 2 => {
            let sub = arr[1].as_str().unwrap_or_default();
            if relay.registry.unsubscribe(conn, sub) {
                relay.metrics.subscriptions_open.dec();
            }
            false
        }
        _ => {
            let _ = tx.send(notice("unknown message type")).await;
            true
        }
    }
}

/// Run a published event through the pipeline and answer with an OK frame.
async fn handle_event(
    relay: &Arc<RelayCoordinator>,
    ip: std::net::IpAddr,
    conn: u64,
    tx: &mpsc::Sender<Message>,
    payload: &Value,
) -> bool {
    let id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    match relay.accept_event(ip, conn, payload) {
        Ok(PublishVerdict::Accepted { delivered, .. }) => {
            debug!(%id, delivered, "event accepted");
            let _ = tx.send(ok_frame(&id, true, "")).await;
            false
        }
        Ok(PublishVerdict::Duplicate) => {
            let _ = tx
                .send(ok_frame(&id, true, "duplicate: already have this event"))
                .await;
            false
        }
        Ok(PublishVerdict::Unparseable(detail)) => {
            // Payloads that are not even an event count toward the strike
            // budget; events that merely fail validation do not.
            let _ = tx
                .send(ok_frame(&id, false, &format!("invalid: {}", detail)))
                .await;
            true
        }
        Ok(PublishVerdict::Rejected(reason)) => {
            let _ = tx
                .send(ok_frame(&id, false, &format!("invalid: {}", reason)))
                .await;
            false
        }
        Ok(PublishVerdict::RateLimited(rej)) => {
            let _ = tx.send(ok_frame(&id, false, &rej.to_string())).await;
            false
        }
        Err(e) => {
            error!(error = %e, "publish failed");
            let _ = tx
                .send(ok_frame(&id, false, "error: temporary storage failure, try again"))
                .await;
            false
        }
    }
}

/// Install a subscription: replay stored history, send EOSE, go live.
async fn handle_req(
    relay: &Arc<RelayCoordinator>,
    ip: std::net::IpAddr,
    conn: u64,
    tx: &mpsc::Sender<Message>,
    sub_val: &Value,
    filter_vals: &[Value],
) -> bool {
    let sub = sub_val.as_str().unwrap_or_default().to_string();
    if sub.is_empty() || sub.len() > MAX_SUB_ID_LEN {
        let _ = tx.send(closed(&sub, "invalid: bad subscription id")).await;
        return true;
    }
    if let Err(rej) = relay.limiter.admit_query(ip, conn) {
        relay.metrics.rate_limited.inc();
        let _ = tx.send(closed(&sub, &rej.to_string())).await;
        return false;
    }
    if filter_vals.len() > MAX_FILTERS {
        let _ = tx.send(closed(&sub, "invalid: too many filters")).await;
        return true;
    }
    let mut filters = vec![];
    for fv in filter_vals {
        if !fv.is_object() {
            let _ = tx.send(closed(&sub, "invalid: filter must be an object")).await;
            return true;
        }
        let f = Filter::from_value(fv);
        if f.limit.map(|l| l > MAX_LIMIT).unwrap_or(false) {
            let _ = tx.send(closed(&sub, "invalid: limit too large")).await;
            return true;
        }
        if let (Some(since), Some(until)) = (f.since, f.until) {
            if since > until {
                let _ = tx.send(closed(&sub, "invalid: since after until")).await;
                return true;
            }
        }
        filters.push(f);
    }

    if !relay.registry.subscribe(conn, &sub, filters.clone()) {
        relay.metrics.subscriptions_open.inc();
    }

    // Replay stored history through the outbound queue, then flush whatever
    // arrived live while the replay ran.
    let mut sent = HashSet::new();
    match relay.store.query(&filters) {
        Ok(events) => {
            for ev in events {
                let frame = serde_json::json!(["EVENT", sub, ev]).to_string();
                sent.insert(ev.id);
                relay.metrics.replayed_events.inc();
                let _ = tx.send(Message::Text(frame.into())).await;
            }
        }
        Err(e) => {
            error!(error = %e, "query failed");
            relay.metrics.subscriptions_open.dec();
            relay.registry.unsubscribe(conn, &sub);
            let _ = tx
                .send(closed(&sub, "error: temporary storage failure, try again"))
                .await;
            return false;
        }
    }
    let eose = serde_json::json!(["EOSE", sub]).to_string();
    let _ = tx.send(Message::Text(eose.into())).await;
    for outcome in relay.registry.finish_replay(conn, &sub, &sent) {
        match outcome {
            Delivery::Sent => relay.metrics.deliveries.inc(),
            Delivery::Dropped => relay.metrics.deliveries_dropped.inc(),
            Delivery::Buffered => {}
        }
    }
    false
}

fn ok_frame(id: &str, accepted: bool, message: &str) -> Message {
    Message::Text(serde_json::json!(["OK", id, accepted, message]).to_string().into())
}

fn closed(sub: &str, message: &str) -> Message {
    Message::Text(serde_json::json!(["CLOSED", sub, message]).to_string().into())
}

fn notice(message: &str) -> Message {
    Message::Text(serde_json::json!(["NOTICE", message]).to_string().into())
}
