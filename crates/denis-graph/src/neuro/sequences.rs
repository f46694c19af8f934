//! WAKE and per-turn UPDATE sequences for the 12-layer model.
//!
//! The sequences perform the graph work and return the events to emit; the
//! persona layer feeds those through the frontdoor so this crate never needs
//! an emitter of its own.

use serde_json::{Map, Value};

use crate::client::GraphClient;
use crate::neuro::state::{
    default_layers, derive_consciousness, ConsciousnessState, DeriveSignals, NeuroLayerState,
    CONSCIOUSNESS_ID,
};

pub const IDENTITY_ID: &str = "identity:denis";

/// An event a neuro sequence wants on the bus, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct NeuroEmission {
    pub event_type: &'static str,
    pub payload: Map<String, Value>,
    pub stored: bool,
}

/// Per-turn deltas feeding the UPDATE sequence.
#[derive(Debug, Clone, Default)]
pub struct TurnMeta {
    pub focus_topic_hash: String,
    pub intent_hash: String,
    pub constraints_hit: Vec<String>,
    pub active_plan_ids: Vec<String>,
    pub plan_progress: Option<f64>,
    pub turns_in_session: i64,
    pub retrieval_count: i64,
    pub guardrail_triggers: i64,
    pub risk_signals: i64,
    pub ops_degraded: bool,
    pub contradiction_count: i64,
    pub changed_components_count: i64,
    pub errors_count: i64,
}

/// WAKE: read/bootstrap the 12 layers, derive consciousness, write it back,
/// link everything, and report the snapshot events to emit.
pub async fn wake_sequence(graph: &GraphClient) -> (ConsciousnessState, Vec<NeuroEmission>) {
    let now = denis_core::utc_now_iso();
    let mut emissions = Vec::with_capacity(15);

    let mut wake_payload = Map::new();
    wake_payload.insert("ts".into(), Value::String(now.clone()));
    wake_payload.insert("identity_id".into(), Value::String(IDENTITY_ID.into()));
    emissions.push(NeuroEmission {
        event_type: "neuro.wake.start",
        payload: wake_payload,
        stored: true,
    });

    let existing = read_layers(graph).await;
    let layers = bootstrap_layers(graph, existing).await;

    let signals = DeriveSignals {
        ops_healthy: graph.enabled() && graph.errors_window() < 5,
        voice_enabled: denis_core::env_flag("DENIS_VOICE_ENABLED", false),
        active_plans: false,
        graph_up: graph.enabled(),
    };
    let mut consciousness = derive_consciousness(&layers, &signals);
    consciousness.last_wake_ts = now.clone();
    consciousness.last_turn_ts = now.clone();

    write_consciousness(graph, &consciousness).await;
    link_all(graph, &layers).await;

    for layer in &layers {
        emissions.push(NeuroEmission {
            event_type: "neuro.layer.snapshot",
            payload: layer_snapshot_payload(layer),
            stored: false,
        });
    }

    let mut snapshot = consciousness.to_props();
    snapshot.insert("ts".into(), Value::String(now.clone()));
    emissions.push(NeuroEmission {
        event_type: "neuro.consciousness.snapshot",
        payload: snapshot,
        stored: true,
    });

    emissions.push(NeuroEmission {
        event_type: "persona.state.update",
        payload: persona_state_payload(&consciousness.mode, &now),
        stored: false,
    });

    (consciousness, emissions)
}

/// UPDATE: apply turn deltas to the layers, re-derive consciousness keeping
/// `last_wake_ts`, write both, and report the update events to emit.
pub async fn update_sequence(
    graph: &GraphClient,
    turn_meta: &TurnMeta,
) -> (ConsciousnessState, Vec<NeuroEmission>) {
    let now = denis_core::utc_now_iso();

    let mut layers = read_layers(graph).await;
    if layers.is_empty() {
        layers = default_layers();
    }
    apply_turn_updates(&mut layers, turn_meta, &now);

    for layer in &layers {
        graph.upsert_neuro_layer(&layer.id(), layer.to_props()).await;
    }

    let signals = DeriveSignals {
        ops_healthy: !turn_meta.ops_degraded && graph.errors_window() < 5,
        voice_enabled: denis_core::env_flag("DENIS_VOICE_ENABLED", false),
        active_plans: !turn_meta.active_plan_ids.is_empty(),
        graph_up: graph.enabled(),
    };
    let mut consciousness = derive_consciousness(&layers, &signals);
    consciousness.last_turn_ts = now.clone();

    if let Some(existing) = read_consciousness(graph).await {
        if let Some(last_wake) = existing.get("last_wake_ts").and_then(Value::as_str) {
            if !last_wake.is_empty() {
                consciousness.last_wake_ts = last_wake.to_string();
            }
        }
    }

    write_consciousness(graph, &consciousness).await;

    let mut emissions = Vec::with_capacity(3);
    let layers_summary: Vec<Value> = layers
        .iter()
        .map(|layer| {
            serde_json::json!({
                "layer_index": layer.layer_index,
                "layer_key": layer.layer_key,
                "freshness_score": layer.freshness_score,
                "status": layer.status,
                "signals_count": layer.signals_count,
            })
        })
        .collect();
    let mut turn_payload = Map::new();
    turn_payload.insert("layers_summary".into(), Value::Array(layers_summary));
    turn_payload.insert("ts".into(), Value::String(now.clone()));
    emissions.push(NeuroEmission {
        event_type: "neuro.turn.update",
        payload: turn_payload,
        stored: true,
    });

    let mut update_payload = consciousness.to_props();
    update_payload.insert("ts".into(), Value::String(now.clone()));
    emissions.push(NeuroEmission {
        event_type: "neuro.consciousness.update",
        payload: update_payload,
        stored: true,
    });

    emissions.push(NeuroEmission {
        event_type: "persona.state.update",
        payload: persona_state_payload(&consciousness.mode, &now),
        stored: false,
    });

    (consciousness, emissions)
}

/// The 12 `NeuroLayer` nodes from the graph, sorted by index. Fail-open to
/// empty.
pub async fn read_layers(graph: &GraphClient) -> Vec<NeuroLayerState> {
    let mut layers: Vec<NeuroLayerState> = graph
        .fetch_nodes("NeuroLayer")
        .await
        .iter()
        .map(NeuroLayerState::from_props)
        .filter(|layer| layer.layer_index >= 1)
        .collect();
    layers.sort_by_key(|layer| layer.layer_index);
    layers
}

/// The `ConsciousnessState` node props. Fail-open to `None`.
pub async fn read_consciousness(graph: &GraphClient) -> Option<Map<String, Value>> {
    graph.fetch_node("ConsciousnessState", CONSCIOUSNESS_ID).await
}

async fn bootstrap_layers(
    graph: &GraphClient,
    existing: Vec<NeuroLayerState>,
) -> Vec<NeuroLayerState> {
    let existing_indices: Vec<i64> = existing.iter().map(|layer| layer.layer_index).collect();
    let mut merged = existing;

    for default in default_layers() {
        if !existing_indices.contains(&default.layer_index) {
            graph
                .upsert_neuro_layer(&default.id(), default.to_props())
                .await;
            merged.push(default);
        }
    }
    merged.sort_by_key(|layer| layer.layer_index);
    merged
}

async fn write_consciousness(graph: &GraphClient, consciousness: &ConsciousnessState) {
    graph
        .upsert_consciousness_state(CONSCIOUSNESS_ID, consciousness.to_props())
        .await;
}

async fn link_all(graph: &GraphClient, layers: &[NeuroLayerState]) {
    for layer in layers {
        graph
            .link_identity_neuro_layer(IDENTITY_ID, &layer.id())
            .await;
        graph
            .link_consciousness_layer(CONSCIOUSNESS_ID, &layer.id())
            .await;
    }
    graph
        .link_identity_consciousness(IDENTITY_ID, CONSCIOUSNESS_ID)
        .await;
}

fn layer_snapshot_payload(layer: &NeuroLayerState) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("layer_index".into(), Value::from(layer.layer_index));
    payload.insert("layer_key".into(), Value::String(layer.layer_key.clone()));
    payload.insert("title".into(), Value::String(layer.title.clone()));
    payload.insert("freshness_score".into(), Value::from(layer.freshness_score));
    payload.insert("status".into(), Value::String(layer.status.clone()));
    payload.insert("signals_count".into(), Value::from(layer.signals_count));
    payload.insert(
        "last_update_ts".into(),
        Value::String(layer.last_update_ts.clone()),
    );
    payload
}

fn persona_state_payload(mode: &str, now: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("mode".into(), Value::String(mode.to_string()));
    payload.insert("ts".into(), Value::String(now.to_string()));
    payload
}

fn apply_turn_updates(layers: &mut [NeuroLayerState], meta: &TurnMeta, now: &str) {
    fn touch(
        layers: &mut [NeuroLayerState],
        key: &str,
        signals: i64,
        fresh: Option<f64>,
        now: &str,
    ) {
        let Some(layer) = layers.iter_mut().find(|layer| layer.layer_key == key) else {
            return;
        };
        layer.last_update_ts = now.to_string();
        layer.signals_count += signals.max(0);
        layer.freshness_score = match fresh {
            Some(value) => value.clamp(0.0, 1.0),
            // Mild freshness boost on any touch.
            None => (layer.freshness_score + 0.1).min(1.0),
        };
    }

    // L1: sensory input is always live on a turn.
    touch(layers, "sensory_io", 1, Some(1.0), now);

    if !meta.focus_topic_hash.is_empty() {
        touch(layers, "attention", 1, Some(0.9), now);
    }

    if !meta.intent_hash.is_empty() {
        let constraints_hit = meta.constraints_hit.len() as i64;
        touch(layers, "intent_goals", 1 + constraints_hit, Some(0.85), now);
    }

    if !meta.active_plan_ids.is_empty() {
        let progress = meta.plan_progress.unwrap_or(0.5);
        touch(
            layers,
            "plans_procedures",
            meta.active_plan_ids.len() as i64,
            Some(progress),
            now,
        );
    }

    // L5: short-term memory decays with session length.
    let turns = meta.turns_in_session.max(1);
    let short_fresh = (1.0 - (turns - 1) as f64 * 0.05).max(0.3);
    touch(layers, "memory_short", 1, Some(short_fresh), now);

    if meta.retrieval_count > 0 {
        touch(layers, "memory_long", meta.retrieval_count, Some(0.8), now);
    }

    if meta.risk_signals > 0 || meta.guardrail_triggers > 0 {
        touch(
            layers,
            "safety_governance",
            meta.risk_signals + meta.guardrail_triggers,
            None,
            now,
        );
        if meta.guardrail_triggers > 2 {
            if let Some(l7) = layers
                .iter_mut()
                .find(|layer| layer.layer_key == "safety_governance")
            {
                l7.status = "degraded".to_string();
            }
        }
    } else {
        touch(layers, "safety_governance", 0, Some(0.9), now);
    }

    if meta.ops_degraded {
        if let Some(l8) = layers
            .iter_mut()
            .find(|layer| layer.layer_key == "ops_awareness")
        {
            l8.status = "degraded".to_string();
            l8.last_update_ts = now.to_string();
            l8.freshness_score = 0.3;
        }
    } else {
        touch(layers, "ops_awareness", 0, Some(0.9), now);
    }

    touch(layers, "social_persona", 1, None, now);

    if meta.contradiction_count > 0 {
        touch(
            layers,
            "self_monitoring",
            meta.contradiction_count,
            Some(0.5),
            now,
        );
    } else {
        touch(layers, "self_monitoring", 0, Some(0.9), now);
    }

    if meta.changed_components_count > 0 {
        touch(
            layers,
            "learning_plasticity",
            meta.changed_components_count,
            Some(0.8),
            now,
        );
    }

    // L12: errors feed the meta layer.
    if meta.errors_count > 0 {
        touch(layers, "meta_consciousness", meta.errors_count, Some(0.5), now);
    } else {
        touch(layers, "meta_consciousness", 0, Some(0.9), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraph;
    use std::sync::Arc;

    fn memory_client() -> (Arc<MemoryGraph>, GraphClient) {
        let graph = Arc::new(MemoryGraph::new());
        let client = GraphClient::with_backend(graph.clone());
        (graph, client)
    }

    #[tokio::test]
    async fn wake_bootstraps_12_layers_and_emits_snapshots() {
        let (graph, client) = memory_client();
        let (consciousness, emissions) = wake_sequence(&client).await;

        assert_eq!(consciousness.mode, "awake");
        assert_eq!(consciousness.guardrails_mode, "normal");
        assert_eq!(consciousness.ops_mode, "normal");
        assert!(!consciousness.last_wake_ts.is_empty());

        let layer_snapshots = emissions
            .iter()
            .filter(|e| e.event_type == "neuro.layer.snapshot")
            .count();
        assert_eq!(layer_snapshots, 12);
        assert_eq!(
            emissions
                .iter()
                .filter(|e| e.event_type == "neuro.consciousness.snapshot")
                .count(),
            1
        );
        assert_eq!(
            emissions
                .iter()
                .filter(|e| e.event_type == "persona.state.update")
                .count(),
            1
        );
        assert_eq!(emissions[0].event_type, "neuro.wake.start");
        assert!(emissions[0].stored);

        // Layer snapshots are ephemeral; the consciousness snapshot persists.
        assert!(emissions
            .iter()
            .filter(|e| e.event_type == "neuro.layer.snapshot")
            .all(|e| !e.stored));
        assert!(emissions
            .iter()
            .find(|e| e.event_type == "neuro.consciousness.snapshot")
            .expect("snapshot")
            .stored);

        assert_eq!(graph.nodes_with_label("NeuroLayer").len(), 12);
        assert!(graph.node("ConsciousnessState", CONSCIOUSNESS_ID).is_some());
        assert!(graph.has_edge(
            "Identity",
            IDENTITY_ID,
            "HAS_CONSCIOUSNESS_STATE",
            "ConsciousnessState",
            CONSCIOUSNESS_ID
        ));
        assert!(graph.has_edge(
            "ConsciousnessState",
            CONSCIOUSNESS_ID,
            "DERIVED_FROM",
            "NeuroLayer",
            "neuro:layer:12"
        ));
    }

    #[tokio::test]
    async fn wake_twice_keeps_existing_layers() {
        let (graph, client) = memory_client();
        wake_sequence(&client).await;
        let before = graph.nodes_with_label("NeuroLayer").len();
        wake_sequence(&client).await;
        assert_eq!(graph.nodes_with_label("NeuroLayer").len(), before);
    }

    #[tokio::test]
    async fn update_applies_turn_rules() {
        let (graph, client) = memory_client();
        wake_sequence(&client).await;

        let meta = TurnMeta {
            guardrail_triggers: 3,
            turns_in_session: 5,
            errors_count: 2,
            retrieval_count: 4,
            ..TurnMeta::default()
        };
        let (consciousness, emissions) = update_sequence(&client, &meta).await;

        let layers = read_layers(&client).await;
        let by_key = |key: &str| {
            layers
                .iter()
                .find(|l| l.layer_key == key)
                .expect("layer present")
                .clone()
        };

        assert_eq!(by_key("sensory_io").freshness_score, 1.0);
        assert_eq!(by_key("safety_governance").status, "degraded");
        assert_eq!(by_key("safety_governance").signals_count, 3);
        assert!((by_key("memory_short").freshness_score - 0.8).abs() < 1e-9);
        assert_eq!(by_key("memory_long").freshness_score, 0.8);
        assert_eq!(by_key("meta_consciousness").signals_count, 2);

        // memory_long at 0.8 switches the memory mode.
        assert_eq!(consciousness.memory_mode, "long");
        // Guardrail triggers pushed safety into degraded: risk >= 0.5.
        assert!(consciousness.risk_level >= 0.5);

        let types: Vec<&str> = emissions.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                "neuro.turn.update",
                "neuro.consciousness.update",
                "persona.state.update"
            ]
        );
        assert!(graph.node("ConsciousnessState", CONSCIOUSNESS_ID).is_some());
    }

    #[tokio::test]
    async fn update_preserves_last_wake_ts() {
        let (_graph, client) = memory_client();
        let (wake_state, _) = wake_sequence(&client).await;
        let (updated, _) = update_sequence(&client, &TurnMeta::default()).await;
        assert_eq!(updated.last_wake_ts, wake_state.last_wake_ts);
        assert!(!updated.last_turn_ts.is_empty());
    }

    #[tokio::test]
    async fn ops_degraded_turn_goes_incident() {
        let (_graph, client) = memory_client();
        wake_sequence(&client).await;
        let meta = TurnMeta {
            ops_degraded: true,
            ..TurnMeta::default()
        };
        let (consciousness, _) = update_sequence(&client, &meta).await;
        assert_eq!(consciousness.mode, "degraded");
        assert_eq!(consciousness.ops_mode, "incident");
        assert_eq!(consciousness.guardrails_mode, "strict");
    }

    #[tokio::test]
    async fn disabled_graph_yields_degraded_defaults() {
        let client = GraphClient::disabled();
        let (consciousness, emissions) = wake_sequence(&client).await;
        assert_eq!(consciousness.mode, "degraded");
        assert_eq!(emissions.len(), 15);
    }
}
