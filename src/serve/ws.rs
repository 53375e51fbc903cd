//! WebSocket diff channel.
//!
//! One hub fan-out loop listens for committed versions, builds each
//! version's diff messages once, and broadcasts the pre-serialized frames.
//! Per connection the contract is: greeting with the current version, then
//! catch-up for any version the client declared itself behind on, then live
//! messages in strictly increasing version order. A client that cannot keep
//! up with the bounded buffer is told it is lagging and must reconnect and
//! resume over `GET /api/graph/diff?since=`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::DiffMessage;
use crate::store::Store;

use super::cache::ResponseCache;
use super::diffsync;
use super::AppState;

/// Outbound frames buffered per slow client before it is marked lagging.
const CLIENT_BUFFER: usize = 256;
/// Server ping cadence.
const PING_PERIOD: Duration = Duration::from_secs(30);
/// Close the connection when no pong arrives within this window.
const PONG_DEADLINE: Duration = Duration::from_secs(60);

/// One committed version's frames, shared across subscribers.
#[derive(Debug)]
pub struct VersionUpdate {
    pub version_id: i64,
    /// Pre-serialized `{type:"diff", …}` frames.
    pub frames: Vec<String>,
}

/// Fan-out hub. Connections subscribe; the run loop publishes.
pub struct Hub {
    store: Store,
    outbound: broadcast::Sender<Arc<VersionUpdate>>,
}

impl Hub {
    pub fn new(store: Store) -> Arc<Self> {
        let (outbound, _) = broadcast::channel(CLIENT_BUFFER);
        Arc::new(Self { store, outbound })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<VersionUpdate>> {
        self.outbound.subscribe()
    }

    /// Connected subscriber count.
    pub fn client_count(&self) -> usize {
        self.outbound.receiver_count()
    }

    /// Builds and broadcasts one committed version's diff messages.
    pub async fn publish_version(&self, version_id: i64) -> Result<()> {
        let store = self.store.clone();
        let frames = store
            .run(move |s| {
                let versions = s.diffs_since(version_id - 1)?;
                let mut frames = Vec::new();
                for version in versions.iter().filter(|v| v.version.id == version_id) {
                    for message in diffsync::build_messages(s, version)? {
                        frames.push(render_diff_frame(&message));
                    }
                }
                Ok(frames)
            })
            .await?;
        if frames.is_empty() {
            debug!(version_id, "version committed with no diff frames");
            return Ok(());
        }
        let update = Arc::new(VersionUpdate { version_id, frames });
        // No subscribers is fine.
        let _ = self.outbound.send(update);
        Ok(())
    }
}

/// Envelope for every frame the server sends.
#[derive(Serialize)]
struct Frame<T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: T,
}

#[derive(Serialize)]
struct VersionPayload {
    version_id: i64,
    node_count: i64,
    link_count: i64,
}

fn render_diff_frame(message: &DiffMessage) -> String {
    serde_json::to_string(&Frame {
        kind: "diff",
        payload: message,
    })
    .unwrap_or_default()
}

/// What clients may send: a declaration of their known version.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    version_id: Option<i64>,
}

/// The hub's background loop: clear the response cache and fan out on every
/// committed version.
pub async fn run_hub(
    hub: Arc<Hub>,
    mut versions: broadcast::Receiver<i64>,
    cache: Arc<ResponseCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("websocket hub started");
    loop {
        tokio::select! {
            received = versions.recv() => match received {
                Ok(version_id) => {
                    cache.clear();
                    if let Err(err) = hub.publish_version(version_id).await {
                        warn!(version_id, error = %err, "failed to publish version");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "hub lagged behind the precalc event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("websocket hub stopped");
}

/// `WS /api/graph/ws`.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    state.metrics.ws_connected.fetch_add(1, Ordering::Relaxed);
    let outcome = drive_socket(&state, &mut socket).await;
    state.metrics.ws_connected.fetch_sub(1, Ordering::Relaxed);
    if let Err(err) = outcome {
        debug!(error = %err, "websocket closed with error");
    }
}

async fn drive_socket(state: &AppState, socket: &mut WebSocket) -> Result<()> {
    let mut updates = state.hub.subscribe();

    // Greeting: the current committed version.
    let current = {
        let store = state.store.clone();
        store.run(move |s| s.current_version()).await?
    };
    let (mut last_sent, payload) = match current {
        Some(version) => (
            version.id,
            VersionPayload {
                version_id: version.id,
                node_count: version.node_count,
                link_count: version.link_count,
            },
        ),
        None => (
            0,
            VersionPayload {
                version_id: 0,
                node_count: 0,
                link_count: 0,
            },
        ),
    };
    let greeting = serde_json::to_string(&Frame {
        kind: "version",
        payload,
    })?;
    if socket.send(Message::Text(greeting)).await.is_err() {
        return Ok(());
    }

    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(message) = serde_json::from_str::<ClientMessage>(&text) {
                            if message.kind == "version" {
                                let since = message.version_id.unwrap_or(0);
                                if since < last_sent {
                                    send_catch_up(state, socket, since, last_sent).await?;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(_)) => break,
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        if update.version_id <= last_sent {
                            continue;
                        }
                        for frame in &update.frames {
                            if socket.send(Message::Text(frame.clone())).await.is_err() {
                                return Ok(());
                            }
                            state.metrics.ws_messages_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        last_sent = update.version_id;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        state.metrics.ws_clients_lagged.fetch_add(1, Ordering::Relaxed);
                        let notice = format!(
                            "{{\"type\":\"lagging\",\"payload\":{{\"resume_since\":{last_sent}}}}}"
                        );
                        let _ = socket.send(Message::Text(notice)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > PONG_DEADLINE {
                    debug!("websocket pong deadline missed, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Replays committed diffs in `(since, until]` in version order.
async fn send_catch_up(
    state: &AppState,
    socket: &mut WebSocket,
    since: i64,
    until: i64,
) -> Result<()> {
    let store = state.store.clone();
    let frames = store
        .run(move |s| {
            let versions = s.diffs_since(since)?;
            let mut frames = Vec::new();
            for version in versions.iter().filter(|v| v.version.id <= until) {
                for message in diffsync::build_messages(s, version)? {
                    frames.push(render_diff_frame(&message));
                }
            }
            Ok(frames)
        })
        .await?;
    for frame in frames {
        if socket.send(Message::Text(frame)).await.is_err() {
            return Ok(());
        }
        state
            .metrics
            .ws_messages_sent
            .fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}
