//! Control-plane endpoint (C8): `/health`, `/stream` WebSocket upgrade,
//! `/stats`. Grounded on `app.py`'s control-message dispatch and, for the
//! axum/WebSocket plumbing, `odds-processor::network::stream`.

use crate::catalogue::CatalogueClient;
use crate::config::Config;
use crate::engine::StateEngine;
use crate::hub::{new_odds_format_holder, Hub};
use crate::subscription::SubscriptionManager;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub struct Stats {
    pub start: Instant,
    pub updates_received: AtomicU64,
    pub sse_workers_active: AtomicU64,
    last_sample: std::sync::Mutex<(Instant, u64)>,
}

impl Default for Stats {
    fn default() -> Self {
        let start = Instant::now();
        Self { start, updates_received: AtomicU64::new(0), sse_workers_active: AtomicU64::new(0), last_sample: std::sync::Mutex::new((start, 0)) }
    }
}

impl Stats {
    /// Updates-per-second since the last `/stats` read, mirroring
    /// `odds-processor::main`'s periodic `updates_delta / elapsed` sample.
    fn updates_per_second(&self) -> f64 {
        let now = Instant::now();
        let current = self.updates_received.load(Ordering::Relaxed);
        let mut last = self.last_sample.lock().unwrap();
        let elapsed = now.duration_since(last.0).as_secs_f64();
        let rate = if elapsed > 0.0 { (current.saturating_sub(last.1)) as f64 / elapsed } else { 0.0 };
        *last = (now, current);
        rate
    }
}

pub struct AppState {
    pub hub: Arc<Hub>,
    pub engine: Arc<StateEngine>,
    pub catalogue: Arc<CatalogueClient>,
    pub config: Arc<Config>,
    pub stats: Arc<Stats>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/stream", get(stream_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "uptime_seconds": state.stats.start.elapsed().as_secs(),
        "connections": state.hub.connections.len(),
        "updates_received": state.stats.updates_received.load(Ordering::Relaxed),
        "updates_per_second": state.stats.updates_per_second(),
        "sse_workers_active": state.stats.sse_workers_active.load(Ordering::Relaxed),
    }))
}

async fn stream_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One connection's lifecycle: register in the hub, forward outbound frames,
/// lazily start the SSE worker fleet on the first control message, and
/// restart it whenever the resolved filter scope changes.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = state.hub.connect(tx);

    let mut fleet_token: Option<CancellationToken> = None;
    let mut fleet_handle: Option<tokio::task::JoinHandle<()>> = None;
    let mut last_filters_snapshot: Option<Value> = None;

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(control) = serde_json::from_str::<Value>(&text) else { continue };

        let mut quiet = true;
        if let Some(pt) = control.get("prod_type").and_then(|v| v.as_str()) {
            state.hub.set_prod_type(id, pt);
        }
        if let Some(of) = control.get("odds_format").and_then(|v| v.as_str()) {
            state.hub.set_odds_format(id, of);
        }
        if let Some(t) = control.get("ev_threshold").and_then(|v| v.as_f64()) {
            state.hub.set_ev_threshold(id, t);
        }
        if let Some(t) = control.get("arb_threshold").and_then(|v| v.as_f64()) {
            state.hub.set_arb_threshold(id, t);
        }
        if let Some(q) = control.get("quiet").and_then(|v| v.as_bool()) {
            if let Some(mut c) = state.hub.connections.get_mut(&id) {
                c.quiet_controls = q;
            }
        }
        if let Some(d) = control.get("debug_scope").and_then(|v| v.as_bool()) {
            if let Some(mut c) = state.hub.connections.get_mut(&id) {
                c.debug_scope = d;
            }
        }

        let reset = control.get("filters_replace").and_then(|v| v.as_bool()).unwrap_or(false)
            || control.get("filters_clear").and_then(|v| v.as_bool()).unwrap_or(false)
            || control.get("clear_filters").and_then(|v| v.as_bool()).unwrap_or(false);
        let filter_updates = control.get("filters").cloned().unwrap_or_else(|| control.clone());
        let touches_filters = reset
            || ["sport", "market", "sportsbook", "sportbook", "league"].iter().any(|k| control.get(k).is_some() || filter_updates.get(k).is_some());

        if touches_filters {
            state.hub.update_filters(id, &filter_updates, reset);
            quiet = false;
        }

        if let Some(c) = state.hub.connections.get(&id) {
            if let Some(q) = control.get("quiet").and_then(|v| v.as_bool()) {
                quiet = quiet && q;
            } else {
                quiet = quiet && c.quiet_controls;
            }
        }

        let current_filters = state.hub.connections.get(&id).map(|c| {
            json!({
                "sport": c.filters.sport,
                "market": c.filters.market,
                "sportsbook": c.filters.sportsbook,
                "league": c.filters.league,
            })
        });

        let first_start = fleet_token.is_none();
        let needs_restart = touches_filters && current_filters != last_filters_snapshot;

        if first_start || needs_restart {
            if let Some(old_token) = fleet_token.take() {
                old_token.cancel();
            }
            if let Some(handle) = fleet_handle.take() {
                let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
            }

            let token = CancellationToken::new();
            let odds_holder = state.hub.connections.get(&id).map(|c| Arc::clone(&c.odds_holder)).unwrap_or_else(|| new_odds_format_holder(&state.config.default_odds_format));
            let mgr = SubscriptionManager::new(
                Arc::clone(&state.catalogue),
                Arc::clone(&state.engine),
                Arc::clone(&state.hub),
                Arc::clone(&state.config),
                odds_holder,
                Arc::clone(&state.stats),
            );
            let filters_for_task = if state.config.ingest_filters_enabled {
                current_filters.clone().unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            let task_token = token.clone();
            fleet_handle = Some(tokio::spawn(async move {
                mgr.start(filters_for_task, task_token).await;
            }));
            fleet_token = Some(token);
            last_filters_snapshot = current_filters.clone();

            if needs_restart && !quiet {
                let ack = json!({"control": "stream_restarted", "filters": current_filters});
                if let Some(c) = state.hub.connections.get(&id) {
                    let _ = c.sender.send(Message::Text(ack.to_string()));
                }
            }
        } else if !touches_filters {
            if let Some(c) = state.hub.connections.get(&id) {
                if !c.quiet_controls {
                    let ack = json!({"control": "ack"});
                    let _ = c.sender.send(Message::Text(ack.to_string()));
                }
            }
        }
    }

    if let Some(token) = fleet_token.take() {
        token.cancel();
    }
    if let Some(handle) = fleet_handle.take() {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }
    state.hub.disconnect(id);
    forward_task.abort();
}
