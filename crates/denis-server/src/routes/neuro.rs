use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use denis_graph::neuro::{default_layers, read_consciousness, read_layers, wake_sequence};
use denis_persona::EmitParams;

use crate::state::AppState;

/// Read the 12-layer snapshot plus consciousness from the graph SSoT.
/// Fail-open: a missing graph yields the default layer set.
pub async fn neuro_state(State(state): State<AppState>) -> Json<Value> {
    let mut layers = read_layers(&state.graph).await;
    if layers.is_empty() {
        layers = default_layers();
    }
    let consciousness = read_consciousness(&state.graph).await;

    let layer_values: Vec<Value> = layers
        .iter()
        .map(|layer| Value::Object(layer.to_props()))
        .collect();
    Json(json!({
        "status": "ok",
        "ts": denis_core::utc_now_iso(),
        "layers": layer_values,
        "consciousness": consciousness.map(Value::Object).unwrap_or(json!({})),
    }))
}

/// Trigger the WAKE sequence and emit its snapshot events.
pub async fn neuro_wake(State(state): State<AppState>) -> Json<Value> {
    let (consciousness, emissions) = wake_sequence(&state.graph).await;

    for emission in emissions {
        let mut params = EmitParams::new(emission.event_type).conversation("neuro_wake");
        params.payload = emission.payload;
        params.stored = emission.stored;
        state.frontdoor.persona_emit(params).await;
    }

    Json(json!({
        "status": "ok",
        "ts": denis_core::utc_now_iso(),
        "consciousness": Value::Object(consciousness.to_props()),
    }))
}
