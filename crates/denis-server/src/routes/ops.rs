use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use denis_graph::neuro::{read_consciousness, read_layers};

use crate::state::AppState;

/// Aggregated counters for the ops dashboard. Must return 200 even when
/// every subsystem is down.
pub async fn telemetry(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "requests": state.telemetry.requests_block(),
        "persona": state.frontdoor.stats().to_json(),
        "chat": state.telemetry.chat_block(),
        "async": async_block(),
        "providers": {},
        "graph": graph_block(&state),
        "control_room": json!({"enabled": true, "status": "ok"}),
        "vectorstore": vectorstore_block(),
        "neuro": neuro_block(&state).await,
        "timestamp": denis_core::utc_now_iso(),
        "started_utc": state.telemetry.started_utc(),
    }))
}

/// Per-subsystem health mirroring the telemetry structure.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.frontdoor.materializer().stats();
    let status = state.graph.status();
    Json(json!({
        "status": "healthy",
        "timestamp": denis_core::utc_now_iso(),
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "event_bus": {"status": "up", "store_failures": state.frontdoor.store_failures()},
            "persona": {"status": "up", "frontdoor_drops": state.frontdoor.frontdoor_drops()},
        },
        "async": async_block(),
        "graph_ssot": {
            "enabled": status.enabled,
            "up": status.up,
            "last_ok_ts": status.last_ok_ts,
            "last_err_ts": status.last_err_ts,
            "errors_window": status.errors_window,
            "materializer": {
                "last_mutation_ts": stats.last_mutation_ts,
                "last_event_ts": stats.last_event_ts,
                "lag_ms": stats.lag_ms,
                "errors_window": stats.errors_window,
            },
        },
        "vectorstore": vectorstore_block(),
        "neuro": neuro_block(&state).await,
    }))
}

fn graph_block(state: &AppState) -> Value {
    let stats = state.frontdoor.materializer().stats();
    let status = state.graph.status();
    json!({
        "materializer": {
            "last_mutation_ts": stats.last_mutation_ts,
            "last_event_ts": stats.last_event_ts,
            "lag_ms": stats.lag_ms,
            "errors_window": stats.errors_window,
            "graph_up": Value::Null,
        },
        "last_mutation_ts": stats.last_mutation_ts,
        "materializer_lag_ms": stats.lag_ms,
        "materializer_errors_window": stats.errors_window,
        "ssot": {
            "enabled": status.enabled,
            "up": status.up,
            "last_ok_ts": status.last_ok_ts,
            "last_err_ts": status.last_err_ts,
            "errors_window": status.errors_window,
        },
    })
}

async fn neuro_block(state: &AppState) -> Value {
    let layers = read_layers(&state.graph).await;
    let consciousness = read_consciousness(&state.graph).await;
    let mode = consciousness
        .as_ref()
        .and_then(|props| props.get("mode"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    json!({
        "layers_count": layers.len(),
        "consciousness_present": consciousness.is_some(),
        "mode": mode,
    })
}

fn async_block() -> Value {
    // No async worker in this deployment; stable shape with defaults.
    json!({
        "async_enabled": false,
        "worker_seen": false,
        "materializer_stale": false,
        "queue_depth": Value::Null,
    })
}

fn vectorstore_block() -> Value {
    // Vector search is an external collaborator; report the stable shape.
    json!({
        "enabled": false,
        "collection": "",
        "last_upsert_ts": "",
        "upsert_count": 0,
        "search_count": 0,
        "fail_count": 0,
        "qdrant_up": Value::Null,
    })
}
