use denis_guardrails::sanitize_graph_props;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::backend::{GraphBackend, NodeRef};
use crate::neo4j_http::Neo4jHttpBackend;
use crate::GraphError;

/// Client-local view of the graph connection. `up` is never probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphStatus {
    pub enabled: bool,
    pub up: Option<bool>,
    pub last_ok_ts: String,
    pub last_err_ts: String,
    pub errors_window: u64,
}

#[derive(Debug, Default)]
struct ClientState {
    last_ok_ts: String,
    last_err_ts: String,
    errors_window: u64,
}

/// Fail-open graph client. Every write sanitizes its property dict, runs with
/// a short timeout, and reports success as `bool`; reads degrade to empty.
/// When disabled (or no backend credentials exist) all operations no-op.
pub struct GraphClient {
    enabled: bool,
    backend: Option<Arc<dyn GraphBackend>>,
    state: Mutex<ClientState>,
}

impl GraphClient {
    /// Env-driven client: `GRAPH_ENABLED` gates it, `NEO4J_*` selects the
    /// HTTP backend.
    pub fn from_env() -> Self {
        let enabled = denis_core::env_flag("GRAPH_ENABLED", false);
        let backend: Option<Arc<dyn GraphBackend>> = if enabled {
            Neo4jHttpBackend::from_env().map(|b| Arc::new(b) as Arc<dyn GraphBackend>)
        } else {
            None
        };
        Self {
            enabled,
            backend,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Enabled client over an explicit backend (tests, embedded setups).
    pub fn with_backend(backend: Arc<dyn GraphBackend>) -> Self {
        Self {
            enabled: true,
            backend: Some(backend),
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            backend: None,
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn status(&self) -> GraphStatus {
        let state = self.lock();
        GraphStatus {
            enabled: self.enabled,
            up: None,
            last_ok_ts: state.last_ok_ts.clone(),
            last_err_ts: state.last_err_ts.clone(),
            errors_window: state.errors_window,
        }
    }

    pub fn errors_window(&self) -> u64 {
        self.lock().errors_window
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, result: Result<(), GraphError>) -> bool {
        match result {
            Ok(()) => {
                self.lock().last_ok_ts = denis_core::utc_now_iso();
                true
            }
            Err(err) => {
                debug!(event = "graph_write_failed", error = %err);
                let mut state = self.lock();
                state.last_err_ts = denis_core::utc_now_iso();
                state.errors_window += 1;
                false
            }
        }
    }

    async fn merge(&self, label: &str, id: &str, props: Map<String, Value>) -> bool {
        let Some(backend) = self.backend.as_ref().filter(|_| self.enabled) else {
            return false;
        };
        let safe = sanitize_graph_props(&props).props;
        let result = backend.merge_node(label, id, &safe).await;
        self.record(result)
    }

    async fn link(
        &self,
        from: NodeRef<'_>,
        rel: &str,
        to: NodeRef<'_>,
        props: Map<String, Value>,
        create_endpoints: bool,
    ) -> bool {
        let Some(backend) = self.backend.as_ref().filter(|_| self.enabled) else {
            return false;
        };
        let result = backend
            .merge_edge(from, rel, to, &props, create_endpoints)
            .await;
        self.record(result)
    }

    // --- Node upserts (operational state only, never long text) ---

    pub async fn upsert_component(&self, component_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Component", component_id, props).await
    }

    pub async fn upsert_feature_flag(&self, flag_id: &str, value: &str) -> bool {
        let mut props = Map::new();
        props.insert("value".to_string(), Value::String(value.to_string()));
        props.insert(
            "updated_ts".to_string(),
            Value::String(denis_core::utc_now_iso()),
        );
        self.merge("FeatureFlag", flag_id, props).await
    }

    pub async fn upsert_provider(&self, provider_id: &str, kind: Option<&str>) -> bool {
        let mut props = Map::new();
        if let Some(kind) = kind {
            props.insert("kind".to_string(), Value::String(kind.to_string()));
        }
        self.merge("Provider", provider_id, props).await
    }

    pub async fn upsert_run(&self, run_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Run", run_id, props).await
    }

    pub async fn upsert_step(&self, step_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Step", step_id, props).await
    }

    pub async fn upsert_action(&self, action_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Action", action_id, props).await
    }

    pub async fn upsert_artifact(&self, artifact_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Artifact", artifact_id, props).await
    }

    pub async fn upsert_source(&self, source_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Source", source_id, props).await
    }

    pub async fn upsert_task(&self, task_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Task", task_id, props).await
    }

    pub async fn upsert_approval(&self, approval_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Approval", approval_id, props).await
    }

    pub async fn upsert_voice_session(&self, session_id: &str, props: Map<String, Value>) -> bool {
        self.merge("VoiceSession", session_id, props).await
    }

    pub async fn upsert_intent_detection(
        &self,
        detection_id: &str,
        props: Map<String, Value>,
    ) -> bool {
        self.merge("IntentDetection", detection_id, props).await
    }

    pub async fn upsert_prompt_compile(&self, compile_id: &str, props: Map<String, Value>) -> bool {
        self.merge("PromptCompile", compile_id, props).await
    }

    pub async fn upsert_intent(&self, intent_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Intent", intent_id, props).await
    }

    pub async fn upsert_plan(&self, plan_id: &str, props: Map<String, Value>) -> bool {
        self.merge("Plan", plan_id, props).await
    }

    pub async fn upsert_identity(&self, identity_id: &str, last_wake_ts: &str) -> bool {
        let mut props = Map::new();
        props.insert(
            "last_wake_ts".to_string(),
            Value::String(last_wake_ts.to_string()),
        );
        self.merge("Identity", identity_id, props).await
    }

    pub async fn upsert_neuro_layer(&self, layer_id: &str, props: Map<String, Value>) -> bool {
        self.merge("NeuroLayer", layer_id, props).await
    }

    pub async fn upsert_consciousness_state(
        &self,
        state_id: &str,
        props: Map<String, Value>,
    ) -> bool {
        self.merge("ConsciousnessState", state_id, props).await
    }

    /// Touch `last_event_ts` and bump `error_count` on a voice session.
    pub async fn increment_voice_session_error(&self, session_id: &str, ts: &str) -> bool {
        let Some(backend) = self.backend.as_ref().filter(|_| self.enabled) else {
            return false;
        };
        let mut props = Map::new();
        props.insert("last_event_ts".to_string(), Value::String(ts.to_string()));
        let safe = sanitize_graph_props(&props).props;
        let result = backend
            .merge_node_incrementing("VoiceSession", session_id, &safe, "error_count")
            .await;
        self.record(result)
    }

    // --- Edges (idempotent MERGE; endpoints must exist unless noted) ---

    pub async fn link_run_step(&self, run_id: &str, step_id: &str, order: i64) -> bool {
        let mut props = Map::new();
        props.insert("order".to_string(), Value::from(order));
        self.link(
            NodeRef::new("Run", run_id),
            "HAS_STEP",
            NodeRef::new("Step", step_id),
            props,
            false,
        )
        .await
    }

    pub async fn link_step_action(&self, step_id: &str, action_id: &str, order: i64) -> bool {
        let mut props = Map::new();
        props.insert("order".to_string(), Value::from(order));
        self.link(
            NodeRef::new("Step", step_id),
            "HAS_ACTION",
            NodeRef::new("Action", action_id),
            props,
            false,
        )
        .await
    }

    pub async fn link_step_artifact(&self, step_id: &str, artifact_id: &str) -> bool {
        self.link(
            NodeRef::new("Step", step_id),
            "PRODUCED",
            NodeRef::new("Artifact", artifact_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_artifact_source(&self, artifact_id: &str, source_id: &str) -> bool {
        self.link(
            NodeRef::new("Artifact", artifact_id),
            "FROM_SOURCE",
            NodeRef::new("Source", source_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_run_provider(&self, run_id: &str, provider_id: &str, role: &str) -> bool {
        let mut props = Map::new();
        props.insert("role".to_string(), Value::String(role.to_string()));
        self.link(
            NodeRef::new("Run", run_id),
            "USED_PROVIDER",
            NodeRef::new("Provider", provider_id),
            props,
            false,
        )
        .await
    }

    pub async fn link_component_flag(&self, component_id: &str, flag_id: &str) -> bool {
        self.link(
            NodeRef::new("Component", component_id),
            "GATED_BY",
            NodeRef::new("FeatureFlag", flag_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_component_depends_on(
        &self,
        component_id: &str,
        depends_on_id: &str,
    ) -> bool {
        self.link(
            NodeRef::new("Component", component_id),
            "DEPENDS_ON",
            NodeRef::new("Component", depends_on_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_step_component(&self, step_id: &str, component_id: &str) -> bool {
        self.link(
            NodeRef::new("Step", step_id),
            "TOUCHED",
            NodeRef::new("Component", component_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_task_run(&self, task_id: &str, run_id: &str) -> bool {
        self.link(
            NodeRef::new("Task", task_id),
            "SPAWNS",
            NodeRef::new("Run", run_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_task_approval(&self, task_id: &str, approval_id: &str) -> bool {
        self.link(
            NodeRef::new("Task", task_id),
            "REQUIRES_APPROVAL",
            NodeRef::new("Approval", approval_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_approval_run(&self, approval_id: &str, run_id: &str) -> bool {
        self.link(
            NodeRef::new("Approval", approval_id),
            "GOVERNS",
            NodeRef::new("Run", run_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_approval_step(&self, approval_id: &str, step_id: &str) -> bool {
        self.link(
            NodeRef::new("Approval", approval_id),
            "GOVERNS",
            NodeRef::new("Step", step_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_run_intent_detection(&self, run_id: &str, detection_id: &str) -> bool {
        self.link(
            NodeRef::new("Run", run_id),
            "HAS_INTENT",
            NodeRef::new("IntentDetection", detection_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_run_prompt_compile(&self, run_id: &str, compile_id: &str) -> bool {
        self.link(
            NodeRef::new("Run", run_id),
            "HAS_PROMPT",
            NodeRef::new("PromptCompile", compile_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_intent_plan(&self, intent_id: &str, plan_id: &str) -> bool {
        self.link(
            NodeRef::new("Intent", intent_id),
            "HAS_PLAN",
            NodeRef::new("Plan", plan_id),
            Map::new(),
            false,
        )
        .await
    }

    pub async fn link_plan_task(&self, plan_id: &str, task_id: &str, specialty: &str) -> bool {
        let mut props = Map::new();
        props.insert("specialty".to_string(), Value::String(specialty.to_string()));
        self.link(
            NodeRef::new("Plan", plan_id),
            "HAS_TASK",
            NodeRef::new("Task", task_id),
            props,
            false,
        )
        .await
    }

    // Identity bootstrap links merge their endpoints into existence.

    pub async fn link_identity_neuro_layer(&self, identity_id: &str, layer_id: &str) -> bool {
        self.link(
            NodeRef::new("Identity", identity_id),
            "HAS_NEURO_LAYER",
            NodeRef::new("NeuroLayer", layer_id),
            Map::new(),
            true,
        )
        .await
    }

    pub async fn link_identity_consciousness(&self, identity_id: &str, state_id: &str) -> bool {
        self.link(
            NodeRef::new("Identity", identity_id),
            "HAS_CONSCIOUSNESS_STATE",
            NodeRef::new("ConsciousnessState", state_id),
            Map::new(),
            true,
        )
        .await
    }

    pub async fn link_consciousness_layer(&self, state_id: &str, layer_id: &str) -> bool {
        self.link(
            NodeRef::new("ConsciousnessState", state_id),
            "DERIVED_FROM",
            NodeRef::new("NeuroLayer", layer_id),
            Map::new(),
            false,
        )
        .await
    }

    // --- Reads (fail-open: errors degrade to empty) ---

    pub async fn fetch_node(&self, label: &str, id: &str) -> Option<Map<String, Value>> {
        let backend = self.backend.as_ref().filter(|_| self.enabled)?;
        match backend.fetch_node(label, id).await {
            Ok(node) => {
                self.lock().last_ok_ts = denis_core::utc_now_iso();
                node
            }
            Err(err) => {
                debug!(event = "graph_read_failed", error = %err);
                let mut state = self.lock();
                state.last_err_ts = denis_core::utc_now_iso();
                state.errors_window += 1;
                None
            }
        }
    }

    pub async fn fetch_nodes(&self, label: &str) -> Vec<Map<String, Value>> {
        let Some(backend) = self.backend.as_ref().filter(|_| self.enabled) else {
            return Vec::new();
        };
        match backend.fetch_nodes(label).await {
            Ok(nodes) => {
                self.lock().last_ok_ts = denis_core::utc_now_iso();
                nodes
            }
            Err(err) => {
                debug!(event = "graph_read_failed", error = %err);
                let mut state = self.lock();
                state.last_err_ts = denis_core::utc_now_iso();
                state.errors_window += 1;
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraph;

    fn props(raw: Value) -> Map<String, Value> {
        raw.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn disabled_client_noops_and_reports_false() {
        let client = GraphClient::disabled();
        assert!(!client.enabled());
        assert!(
            !client
                .upsert_component("ws_event_bus", props(serde_json::json!({"status": "ok"})))
                .await
        );
        assert!(client.fetch_nodes("Component").await.is_empty());
        assert_eq!(client.errors_window(), 0);
    }

    #[tokio::test]
    async fn writes_are_sanitized_before_the_backend() {
        let graph = Arc::new(MemoryGraph::new());
        let client = GraphClient::with_backend(graph.clone());
        assert!(
            client
                .upsert_task(
                    "t1",
                    props(serde_json::json!({
                        "status": "queued",
                        "session_token": "sk-very-secret",
                        "requested_paths": ["a", "b"],
                    })),
                )
                .await
        );
        let node = graph.node("Task", "t1").expect("task node");
        assert!(!node.contains_key("session_token"));
        assert_eq!(node["requested_paths"], "[\"a\",\"b\"]");
        assert_eq!(node["status"], "queued");
    }

    #[tokio::test]
    async fn status_tracks_last_ok() {
        let graph = Arc::new(MemoryGraph::new());
        let client = GraphClient::with_backend(graph);
        client
            .upsert_component("pro_search", props(serde_json::json!({"status": "ok"})))
            .await;
        let status = client.status();
        assert!(status.enabled);
        assert!(!status.last_ok_ts.is_empty());
        assert_eq!(status.errors_window, 0);
    }
}
