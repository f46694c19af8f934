use denis_core::{EventKind, EventV1};
use denis_store::MutationLog;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use url::Url;

use crate::client::GraphClient;

/// Best-effort materializer counters for `/telemetry` and `/health`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializerStats {
    pub last_mutation_ts: String,
    pub last_event_ts: String,
    pub lag_ms: i64,
    pub errors_window: u64,
}

/// Outcome of one materialization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingResult {
    pub handled: bool,
    pub component_id: Option<&'static str>,
    pub mutation_kind: Option<&'static str>,
}

impl MappingResult {
    fn unhandled() -> Self {
        Self {
            handled: false,
            component_id: None,
            mutation_kind: None,
        }
    }

    fn handled(component_id: &'static str, mutation_kind: &'static str) -> Self {
        Self {
            handled: true,
            component_id: Some(component_id),
            mutation_kind: Some(mutation_kind),
        }
    }

    fn skipped(component_id: &'static str, mutation_kind: &'static str) -> Self {
        Self {
            handled: false,
            component_id: Some(component_id),
            mutation_kind: Some(mutation_kind),
        }
    }
}

/// Projects persisted `event_v1` envelopes into the graph.
///
/// Every mutation is fingerprinted as
/// `sha256(event_id:mutation_kind:stable_key)` and recorded in the dedupe log
/// before any write; replays short-circuit there, and the writes themselves
/// stay MERGE-idempotent for the case where the dedupe store is unreachable.
pub struct Materializer {
    graph: Arc<GraphClient>,
    dedupe: Arc<MutationLog>,
    stats: Mutex<MaterializerStats>,
}

impl Materializer {
    pub fn new(graph: Arc<GraphClient>, dedupe: Arc<MutationLog>) -> Self {
        Self {
            graph,
            dedupe,
            stats: Mutex::new(MaterializerStats::default()),
        }
    }

    pub fn graph(&self) -> &GraphClient {
        &self.graph
    }

    pub fn stats(&self) -> MaterializerStats {
        let mut snapshot = self.lock_stats().clone();
        snapshot.errors_window = self.graph.errors_window();
        snapshot
    }

    fn lock_stats(&self) -> MutexGuard<'_, MaterializerStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail-open wrapper: materialization may degrade but never surfaces an
    /// error to the event pipeline.
    pub async fn maybe_materialize(&self, event: &EventV1) -> MappingResult {
        let result = self.materialize(event).await;
        self.lock_stats().last_mutation_ts = denis_core::utc_now_iso();
        result
    }

    async fn materialize(&self, event: &EventV1) -> MappingResult {
        if !self.graph.enabled() {
            return MappingResult::unhandled();
        }
        if event.r#type.is_empty() {
            return MappingResult::unhandled();
        }

        {
            let mut stats = self.lock_stats();
            stats.last_event_ts = event.ts.clone();
            stats.lag_ms = compute_lag_ms(&event.ts);
        }

        // Seed the component/flag graph once per dedupe-store lifetime.
        let seed_id = stable_mutation_id(0, "seed_flags", "v1");
        if self.dedupe.try_acquire(&seed_id) {
            self.seed_components_and_flags().await;
        }

        let Some(kind) = EventKind::from_type(&event.r#type) else {
            let mid = stable_mutation_id(event.event_id, "unknown_event", &event.r#type);
            if self.dedupe.try_acquire(&mid) {
                self.graph
                    .upsert_component(
                        "ws_event_bus",
                        component_props(&denis_core::utc_now_iso(), "ok"),
                    )
                    .await;
            }
            debug!(event = "materialize_unknown_type", r#type = %event.r#type);
            return MappingResult::skipped("ws_event_bus", "unknown_event");
        };

        let ctx = EventContext::from_event(event);

        // Always upsert the operational Run envelope for this transaction.
        let mid_run = stable_mutation_id(ctx.event_id, "upsert_run", &ctx.run_id);
        if self.dedupe.try_acquire(&mid_run) {
            let mut props = Map::new();
            props.insert("conversation_id".into(), Value::String(ctx.conv.clone()));
            props.insert("turn_id".into(), Value::String(ctx.turn_id.clone()));
            if let Some(trace) = &ctx.trace_id {
                props.insert("trace_id".into(), Value::String(trace.clone()));
            }
            props.insert("ts".into(), Value::String(ctx.ts.clone()));
            props.insert("status".into(), Value::String("running".into()));
            self.graph.upsert_run(&ctx.run_id, props).await;
        }

        match kind {
            EventKind::RunStep => self.on_run_step(&ctx).await,
            EventKind::RagSearchStart => self.on_rag_search_start(&ctx).await,
            EventKind::RagSearchResult => self.on_rag_search_result(&ctx).await,
            EventKind::RagContextCompiled => self.on_rag_context_compiled(&ctx).await,
            EventKind::ScrapingPage | EventKind::ScrapingDone => self.on_scraping(&ctx).await,
            EventKind::AgentDecisionTraceSummary => self.on_decision_trace(&ctx).await,
            EventKind::AgentReasoningSummary => self.on_reasoning_summary(&ctx).await,
            EventKind::IndexingUpsert => self.on_indexing_upsert(&ctx).await,
            EventKind::Error => self.on_error(&ctx).await,
            EventKind::ControlRoomTaskCreated => self.on_cr_task_created(&ctx).await,
            EventKind::ControlRoomTaskUpdated => self.on_cr_task_updated(&ctx).await,
            EventKind::ControlRoomRunSpawned => self.on_cr_run_spawned(&ctx).await,
            EventKind::ControlRoomApprovalRequested => self.on_cr_approval_requested(&ctx).await,
            EventKind::ControlRoomApprovalResolved => self.on_cr_approval_resolved(&ctx).await,
            EventKind::ControlRoomActionUpdated => self.on_cr_action_updated(&ctx).await,
            EventKind::CompilerResult | EventKind::CompilerFallbackResult => {
                self.on_compiler_result(&ctx, &event.correlation_id).await
            }
            EventKind::VoiceSessionStarted => self.on_voice_session_started(&ctx).await,
            kind if kind.is_voice() => self.on_voice_event(&ctx, &event.r#type).await,
            EventKind::NeuroWakeStart => self.on_neuro_wake_start(&ctx).await,
            EventKind::NeuroLayerSnapshot => self.on_neuro_layer_snapshot(&ctx).await,
            EventKind::NeuroConsciousnessSnapshot => {
                self.on_neuro_consciousness_snapshot(&ctx).await
            }
            EventKind::NeuroTurnUpdate => self.on_neuro_turn_update(&ctx).await,
            EventKind::NeuroConsciousnessUpdate => self.on_neuro_consciousness_update(&ctx).await,
            EventKind::PersonaStateUpdate => self.on_persona_state_update(&ctx).await,
            // Supported but without an event-specific projection: freshness only.
            _ => {
                let mid =
                    stable_mutation_id(ctx.event_id, "component_freshness", &ctx.event_type);
                if self.dedupe.try_acquire(&mid) {
                    self.graph
                        .upsert_component("ws_event_bus", component_props(&ctx.ts, "ok"))
                        .await;
                }
                MappingResult::skipped("ws_event_bus", "component_freshness")
            }
        }
    }

    async fn seed_components_and_flags(&self) {
        const FLAGS: &[&str] = &[
            "VECTORSTORE_ENABLED",
            "RAG_ENABLED",
            "INDEXING_ENABLED",
            "PRO_SEARCH_ENABLED",
            "SCRAPING_ENABLED",
            "MULTIVERSE_MODE",
        ];
        const COMPONENTS: &[(&str, &[&str])] = &[
            ("vectorstore_qdrant", &["VECTORSTORE_ENABLED"]),
            ("pro_search", &["PRO_SEARCH_ENABLED", "VECTORSTORE_ENABLED"]),
            ("rag_context_builder", &["RAG_ENABLED", "PRO_SEARCH_ENABLED"]),
            ("advanced_scraping", &["SCRAPING_ENABLED"]),
            ("ws_event_bus", &[]),
            ("chunker", &[]),
            ("redaction_gate", &[]),
            ("control_room", &[]),
        ];

        for flag in FLAGS {
            let value = std::env::var(flag).unwrap_or_default();
            self.graph.upsert_feature_flag(flag, value.trim()).await;
        }

        let now = denis_core::utc_now_iso();
        for (component, gating) in COMPONENTS {
            self.graph
                .upsert_component(component, component_props(&now, "unknown"))
                .await;
            for flag in *gating {
                self.graph.link_component_flag(component, flag).await;
            }
        }

        self.graph
            .link_component_depends_on("rag_context_builder", "pro_search")
            .await;
        self.graph
            .link_component_depends_on("pro_search", "vectorstore_qdrant")
            .await;
        self.graph
            .link_component_depends_on("pro_search", "redaction_gate")
            .await;
        self.graph
            .link_component_depends_on("pro_search", "chunker")
            .await;
        self.graph
            .link_component_depends_on("ws_event_bus", "control_room")
            .await;
    }

    async fn on_run_step(&self, ctx: &EventContext) -> MappingResult {
        let step_id = ctx.payload_str("step_id");
        if step_id.is_empty() {
            return MappingResult::unhandled();
        }
        let state = {
            let raw = ctx.payload_str("state");
            if raw.is_empty() {
                ctx.payload_str("status")
            } else {
                raw
            }
        }
        .trim()
        .to_uppercase();
        let name = {
            let raw = ctx.payload_str("name");
            if raw.is_empty() {
                ctx.payload_str("step_name")
            } else {
                raw
            }
        };
        let tool = ctx.payload_str("tool");
        let order = ctx.payload_i64("order");
        let component_id = ctx.payload_str("component_id");
        let artifact_id = ctx.payload_str("artifact_id");
        let artifact_kind = {
            let raw = ctx.payload_str("artifact_kind");
            if raw.is_empty() {
                "step_outcome".to_string()
            } else {
                raw
            }
        };

        let step_status = match state.as_str() {
            "QUEUED" => "queued",
            "RUNNING" => "running",
            "SUCCESS" => "success",
            "FAILED" => "failed",
            "STALE" => "stale",
            _ => "running",
        };

        let stable_key = format!("{}:{}:{}:{}", ctx.run_id, step_id, state, order);
        let mid = stable_mutation_id(ctx.event_id, "run_step", &stable_key);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("ws_event_bus", "run_step");
        }

        let mut props = Map::new();
        props.insert("run_id".into(), Value::String(ctx.run_id.clone()));
        props.insert("name".into(), Value::String(name));
        props.insert("tool".into(), Value::String(tool));
        props.insert("order".into(), Value::from(order));
        props.insert("status".into(), Value::String(step_status.into()));
        props.insert("ts".into(), Value::String(ctx.ts.clone()));
        self.graph.upsert_step(&step_id, props).await;
        self.graph.link_run_step(&ctx.run_id, &step_id, order).await;

        if !component_id.is_empty() {
            self.graph
                .upsert_component(&component_id, component_props(&ctx.ts, "ok"))
                .await;
            self.graph.link_step_component(&step_id, &component_id).await;
        }

        if !artifact_id.is_empty() {
            let counts = ctx.payload_object("counts");
            let counts_json = json_string_capped(&Value::Object(counts), 8000);
            let mut artifact = Map::new();
            artifact.insert("kind".into(), Value::String(artifact_kind));
            artifact.insert("ts".into(), Value::String(ctx.ts.clone()));
            artifact.insert("hash_sha256".into(), Value::String(artifact_id.clone()));
            artifact.insert("counts_json".into(), Value::String(counts_json));
            self.graph.upsert_artifact(&artifact_id, artifact).await;
            self.graph.link_step_artifact(&step_id, &artifact_id).await;
        }

        self.graph
            .upsert_component("ws_event_bus", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("ws_event_bus", "run_step")
    }

    async fn on_rag_search_start(&self, ctx: &EventContext) -> MappingResult {
        let sid = denis_core::sha256_hex(&format!("{}:pro_search", ctx.run_id));
        let mid = stable_mutation_id(ctx.event_id, "step_pro_search_start", &sid);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("pro_search", "step_pro_search_start");
        }
        self.graph
            .upsert_component("pro_search", component_props(&ctx.ts, "ok"))
            .await;
        self.graph
            .upsert_step(&sid, step_props(&ctx.run_id, "pro_search", "running", &ctx.ts, 1))
            .await;
        self.graph.link_run_step(&ctx.run_id, &sid, 1).await;
        MappingResult::handled("pro_search", "step_pro_search_start")
    }

    async fn on_rag_search_result(&self, ctx: &EventContext) -> MappingResult {
        let sid = denis_core::sha256_hex(&format!("{}:pro_search", ctx.run_id));
        let selected = ctx.payload_array("selected");
        let selected_count = selected.len() as i64;
        let selected_json = json_string_capped(&Value::Array(selected.clone()), 8000);
        let aid = denis_core::sha256_hex(&selected_json);

        let mid = stable_mutation_id(
            ctx.event_id,
            "step_pro_search_result",
            &format!("{sid}:{aid}"),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("pro_search", "step_pro_search_result");
        }

        self.graph
            .upsert_component("pro_search", component_props(&ctx.ts, "ok"))
            .await;
        self.graph
            .upsert_step(&sid, step_props(&ctx.run_id, "pro_search", "success", &ctx.ts, 1))
            .await;
        self.graph.link_run_step(&ctx.run_id, &sid, 1).await;

        if selected_count > 0 {
            let counts = serde_json::json!({ "selected_count": selected_count });
            let mut artifact = Map::new();
            artifact.insert("kind".into(), Value::String("evidence_pack".into()));
            artifact.insert("ts".into(), Value::String(ctx.ts.clone()));
            artifact.insert("hash_sha256".into(), Value::String(aid.clone()));
            artifact.insert(
                "counts_json".into(),
                Value::String(counts.to_string()),
            );
            self.graph.upsert_artifact(&aid, artifact).await;
            self.graph.link_step_artifact(&sid, &aid).await;

            // Provenance: source ids from the selected evidence (hashes only).
            for item in selected.iter().take(20) {
                let Some(source) = item.get("source").and_then(Value::as_str) else {
                    continue;
                };
                if source.is_empty() {
                    continue;
                }
                let mut props = Map::new();
                props.insert("kind".into(), Value::String("domain".into()));
                props.insert("last_seen_ts".into(), Value::String(ctx.ts.clone()));
                self.graph.upsert_source(source, props).await;
                self.graph.link_artifact_source(&aid, source).await;
            }
        }
        MappingResult::handled("pro_search", "step_pro_search_result")
    }

    async fn on_rag_context_compiled(&self, ctx: &EventContext) -> MappingResult {
        let sid = denis_core::sha256_hex(&format!("{}:rag_build", ctx.run_id));
        let citations = ctx.payload_array("citations");
        let chunks_count = ctx.payload_i64("chunks_count");
        let counts = serde_json::json!({
            "chunks_count": chunks_count,
            "citations_count": citations.len(),
        });
        let aid = denis_core::sha256_hex(&counts.to_string());

        let mid = stable_mutation_id(
            ctx.event_id,
            "rag_context_compiled",
            &format!("{sid}:{aid}"),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("rag_context_builder", "rag_context_compiled");
        }

        self.graph
            .upsert_component("rag_context_builder", component_props(&ctx.ts, "ok"))
            .await;
        self.graph
            .upsert_step(&sid, step_props(&ctx.run_id, "rag_build", "success", &ctx.ts, 2))
            .await;
        self.graph.link_run_step(&ctx.run_id, &sid, 2).await;

        let mut artifact = Map::new();
        artifact.insert("kind".into(), Value::String("context_pack".into()));
        artifact.insert("ts".into(), Value::String(ctx.ts.clone()));
        artifact.insert("hash_sha256".into(), Value::String(aid.clone()));
        artifact.insert("counts_json".into(), Value::String(counts.to_string()));
        self.graph.upsert_artifact(&aid, artifact).await;
        self.graph.link_step_artifact(&sid, &aid).await;

        let mut run_props = Map::new();
        run_props.insert("status".into(), Value::String("ok".into()));
        self.graph.upsert_run(&ctx.run_id, run_props).await;
        MappingResult::handled("rag_context_builder", "rag_context_compiled")
    }

    async fn on_scraping(&self, ctx: &EventContext) -> MappingResult {
        let sid = denis_core::sha256_hex(&format!("{}:scrape", ctx.run_id));
        let url = ctx.payload_str("url");
        let host = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let source_id = if host.is_empty() { "unknown".to_string() } else { host };

        let mid = stable_mutation_id(
            ctx.event_id,
            "scrape_event",
            &format!("{sid}:{}:{source_id}", ctx.event_type),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("advanced_scraping", "scrape_event");
        }

        self.graph
            .upsert_component("advanced_scraping", component_props(&ctx.ts, "ok"))
            .await;
        let status = if ctx.event_type == "scraping.page" {
            "running"
        } else {
            "success"
        };
        self.graph
            .upsert_step(&sid, step_props(&ctx.run_id, "scrape", status, &ctx.ts, 1))
            .await;
        self.graph.link_run_step(&ctx.run_id, &sid, 1).await;

        let mut props = Map::new();
        props.insert("kind".into(), Value::String("host".into()));
        props.insert("last_seen_ts".into(), Value::String(ctx.ts.clone()));
        self.graph.upsert_source(&source_id, props).await;
        MappingResult::handled("advanced_scraping", "scrape_event")
    }

    async fn on_decision_trace(&self, ctx: &EventContext) -> MappingResult {
        let payload_json = json_string_capped(&Value::Object(ctx.payload.clone()), 8000);
        let aid = denis_core::sha256_hex(&payload_json);
        let mid = stable_mutation_id(ctx.event_id, "decision_summary", &aid);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("control_room", "decision_summary");
        }

        self.graph
            .upsert_component("control_room", component_props(&ctx.ts, "ok"))
            .await;
        let counts = serde_json::json!({ "fields": ctx.payload.len() });
        let mut artifact = Map::new();
        artifact.insert("kind".into(), Value::String("decision_summary".into()));
        artifact.insert("ts".into(), Value::String(ctx.ts.clone()));
        artifact.insert("hash_sha256".into(), Value::String(aid.clone()));
        artifact.insert("counts_json".into(), Value::String(counts.to_string()));
        self.graph.upsert_artifact(&aid, artifact).await;
        MappingResult::handled("control_room", "decision_summary")
    }

    async fn on_reasoning_summary(&self, ctx: &EventContext) -> MappingResult {
        let sid = denis_core::sha256_hex(&format!("{}:adaptive_reasoning", ctx.run_id));
        let ar = ctx.payload_object("adaptive_reasoning");
        let retrieval_count = ar
            .get("retrieval")
            .and_then(Value::as_object)
            .and_then(|r| r.get("chunk_ids"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        // Safe metadata only; never raw chain-of-thought.
        let safe_meta = serde_json::json!({
            "goal_sha256": ar.get("goal_sha256").and_then(Value::as_str).unwrap_or(""),
            "goal_len": ar.get("goal_len").and_then(Value::as_i64).unwrap_or(0),
            "tools_used": ar.get("tools_used").cloned().unwrap_or(Value::Array(Vec::new())),
            "constraints_hit": ar.get("constraints_hit").cloned().unwrap_or(Value::Array(Vec::new())),
            "retrieval_count": retrieval_count,
        });
        let aid = denis_core::sha256_hex(&safe_meta.to_string());

        let mid = stable_mutation_id(
            ctx.event_id,
            "adaptive_reasoning",
            &format!("{sid}:{aid}"),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("control_room", "adaptive_reasoning");
        }

        self.graph
            .upsert_step(
                &sid,
                step_props(&ctx.run_id, "adaptive_reasoning", "success", &ctx.ts, 3),
            )
            .await;
        self.graph.link_run_step(&ctx.run_id, &sid, 3).await;

        let mut artifact = Map::new();
        artifact.insert("kind".into(), Value::String("decision_summary".into()));
        artifact.insert("ts".into(), Value::String(ctx.ts.clone()));
        artifact.insert("hash_sha256".into(), Value::String(aid.clone()));
        artifact.insert("counts_json".into(), Value::String(safe_meta.to_string()));
        self.graph.upsert_artifact(&aid, artifact).await;
        self.graph.link_step_artifact(&sid, &aid).await;
        MappingResult::handled("control_room", "adaptive_reasoning")
    }

    async fn on_indexing_upsert(&self, ctx: &EventContext) -> MappingResult {
        let sid = denis_core::sha256_hex(&format!("{}:index_upsert", ctx.run_id));
        let idx_hash = ctx.payload_str("hash_sha256");
        let idx_kind = ctx.payload_str("kind");
        let aid = if idx_hash.is_empty() {
            let payload_json = json_string_capped(&Value::Object(ctx.payload.clone()), 4000);
            denis_core::sha256_hex(&payload_json)
        } else {
            idx_hash.clone()
        };

        let mid = stable_mutation_id(ctx.event_id, "index_upsert", &format!("{sid}:{aid}"));
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("vectorstore_qdrant", "index_upsert");
        }

        self.graph
            .upsert_component("vectorstore_qdrant", component_props(&ctx.ts, "ok"))
            .await;
        self.graph
            .upsert_step(
                &sid,
                step_props(&ctx.run_id, "index_upsert", "success", &ctx.ts, 4),
            )
            .await;
        self.graph.link_run_step(&ctx.run_id, &sid, 4).await;

        let mut artifact = Map::new();
        artifact.insert("kind".into(), Value::String("chunk".into()));
        artifact.insert("ts".into(), Value::String(ctx.ts.clone()));
        artifact.insert("hash_sha256".into(), Value::String(idx_hash));
        artifact.insert("index_kind".into(), Value::String(idx_kind));
        self.graph.upsert_artifact(&aid, artifact).await;
        self.graph.link_step_artifact(&sid, &aid).await;
        MappingResult::handled("vectorstore_qdrant", "index_upsert")
    }

    async fn on_error(&self, ctx: &EventContext) -> MappingResult {
        let mid = stable_mutation_id(ctx.event_id, "run_error", &ctx.run_id);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("ws_event_bus", "run_error");
        }
        let mut run_props = Map::new();
        run_props.insert("status".into(), Value::String("degraded".into()));
        run_props.insert("last_err_ts".into(), Value::String(ctx.ts.clone()));
        self.graph.upsert_run(&ctx.run_id, run_props).await;

        let mut component = component_props(&ctx.ts, "degraded");
        component.insert("last_err_ts".into(), Value::String(ctx.ts.clone()));
        self.graph.upsert_component("ws_event_bus", component).await;
        MappingResult::handled("ws_event_bus", "run_error")
    }

    async fn on_cr_task_created(&self, ctx: &EventContext) -> MappingResult {
        let task_id = ctx.payload_str("task_id");
        if task_id.is_empty() {
            return MappingResult::unhandled();
        }
        let mid = stable_mutation_id(ctx.event_id, "cr_task_created", &task_id);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("control_room", "cr_task_created");
        }

        let task_type = {
            let raw = ctx.payload_str("type");
            if raw.is_empty() {
                ctx.payload_str("task_type")
            } else {
                raw
            }
        };
        let priority = {
            let raw = ctx.payload_str("priority");
            if raw.is_empty() {
                "normal".to_string()
            } else {
                raw
            }
        };
        let payload_hash = {
            let raw = ctx.payload_str("payload_redacted_hash");
            if raw.is_empty() {
                ctx.payload_str("payload_hash")
            } else {
                raw
            }
        };

        let mut props = Map::new();
        props.insert("status".into(), Value::String("queued".into()));
        props.insert("type".into(), Value::String(task_type));
        props.insert("priority".into(), Value::String(priority));
        props.insert("requester".into(), Value::String(ctx.payload_str("requester")));
        props.insert("conversation_id".into(), Value::String(ctx.conv.clone()));
        props.insert(
            "trace_id".into(),
            Value::String(ctx.trace_id.clone().unwrap_or_default()),
        );
        props.insert("payload_redacted_hash".into(), Value::String(payload_hash));
        props.insert(
            "reason_safe".into(),
            Value::String(ctx.payload_str("reason_safe")),
        );
        props.insert("created_ts".into(), Value::String(ctx.ts.clone()));
        props.insert(
            "specialty".into(),
            Value::String(ctx.payload_str("specialty")),
        );
        props.insert(
            "no_overlap_contract_hash".into(),
            Value::String(ctx.payload_str("no_overlap_contract_hash")),
        );
        props.insert(
            "requested_paths".into(),
            Value::Array(ctx.payload_array("requested_paths")),
        );
        self.graph.upsert_task(&task_id, props).await;
        self.graph
            .upsert_component("control_room", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("control_room", "cr_task_created")
    }

    async fn on_cr_task_updated(&self, ctx: &EventContext) -> MappingResult {
        let task_id = ctx.payload_str("task_id");
        if task_id.is_empty() {
            return MappingResult::unhandled();
        }
        let mid = stable_mutation_id(ctx.event_id, "cr_task_updated", &task_id);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("control_room", "cr_task_updated");
        }

        let mut props = Map::new();
        for field in ["status", "retries", "started_ts", "ended_ts"] {
            if let Some(value) = ctx.payload.get(field) {
                if value.is_null() {
                    continue;
                }
                let stored = if value.is_i64() {
                    value.clone()
                } else {
                    Value::String(value_as_string(value))
                };
                props.insert(field.to_string(), stored);
            }
        }
        props.insert("updated_ts".into(), Value::String(ctx.ts.clone()));
        self.graph.upsert_task(&task_id, props).await;
        self.graph
            .upsert_component("control_room", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("control_room", "cr_task_updated")
    }

    async fn on_cr_run_spawned(&self, ctx: &EventContext) -> MappingResult {
        let task_id = ctx.payload_str("task_id");
        let run_id = ctx.payload_str("run_id");
        if task_id.is_empty() || run_id.is_empty() {
            return MappingResult::unhandled();
        }
        let mid = stable_mutation_id(
            ctx.event_id,
            "cr_run_spawned",
            &format!("{task_id}:{run_id}"),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("control_room", "cr_run_spawned");
        }

        let mut props = Map::new();
        props.insert("kind".into(), Value::String("control_room".into()));
        props.insert("ts".into(), Value::String(ctx.ts.clone()));
        props.insert("status".into(), Value::String("running".into()));
        self.graph.upsert_run(&run_id, props).await;
        self.graph.link_task_run(&task_id, &run_id).await;
        self.graph
            .upsert_component("control_room", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("control_room", "cr_run_spawned")
    }

    async fn on_cr_approval_requested(&self, ctx: &EventContext) -> MappingResult {
        let approval_id = ctx.payload_str("approval_id");
        if approval_id.is_empty() {
            return MappingResult::unhandled();
        }
        let mid = stable_mutation_id(ctx.event_id, "cr_approval_requested", &approval_id);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("control_room", "cr_approval_requested");
        }

        let mut props = Map::new();
        props.insert("status".into(), Value::String("pending".into()));
        props.insert(
            "policy_id".into(),
            Value::String(ctx.payload_str("policy_id")),
        );
        props.insert("scope".into(), Value::String(ctx.payload_str("scope")));
        props.insert("requested_ts".into(), Value::String(ctx.ts.clone()));
        self.graph.upsert_approval(&approval_id, props).await;

        let task_id = ctx.payload_str("task_id");
        if !task_id.is_empty() {
            self.graph.link_task_approval(&task_id, &approval_id).await;
        }
        let governs_run = ctx.payload_str("run_id");
        if !governs_run.is_empty() {
            self.graph.link_approval_run(&approval_id, &governs_run).await;
        }
        let governs_step = ctx.payload_str("step_id");
        if !governs_step.is_empty() {
            self.graph
                .link_approval_step(&approval_id, &governs_step)
                .await;
        }
        self.graph
            .upsert_component("control_room", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("control_room", "cr_approval_requested")
    }

    async fn on_cr_approval_resolved(&self, ctx: &EventContext) -> MappingResult {
        let approval_id = ctx.payload_str("approval_id");
        if approval_id.is_empty() {
            return MappingResult::unhandled();
        }
        let mid = stable_mutation_id(ctx.event_id, "cr_approval_resolved", &approval_id);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("control_room", "cr_approval_resolved");
        }

        let status = {
            let raw = ctx.payload_str("status");
            if raw.is_empty() {
                "resolved".to_string()
            } else {
                raw
            }
        };
        let resolved_ts = {
            let raw = ctx.payload_str("resolved_ts");
            if raw.is_empty() {
                ctx.ts.clone()
            } else {
                raw
            }
        };
        let mut props = Map::new();
        props.insert("status".into(), Value::String(status));
        props.insert(
            "resolved_by".into(),
            Value::String(ctx.payload_str("resolved_by")),
        );
        props.insert("resolved_ts".into(), Value::String(resolved_ts));
        props.insert(
            "reason_safe".into(),
            Value::String(ctx.payload_str("reason_safe")),
        );
        self.graph.upsert_approval(&approval_id, props).await;
        self.graph
            .upsert_component("control_room", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("control_room", "cr_approval_resolved")
    }

    async fn on_cr_action_updated(&self, ctx: &EventContext) -> MappingResult {
        let action_id = ctx.payload_str("action_id");
        if action_id.is_empty() {
            return MappingResult::unhandled();
        }
        let mid = stable_mutation_id(ctx.event_id, "cr_action_updated", &action_id);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("control_room", "cr_action_updated");
        }

        let mut props = Map::new();
        props.insert("name".into(), Value::String(ctx.payload_str("name")));
        props.insert("tool".into(), Value::String(ctx.payload_str("tool")));
        props.insert("status".into(), Value::String(ctx.payload_str("status")));
        props.insert(
            "args_redacted_hash".into(),
            Value::String(ctx.payload_str("args_redacted_hash")),
        );
        props.insert(
            "result_redacted_hash".into(),
            Value::String(ctx.payload_str("result_redacted_hash")),
        );
        props.insert("updated_ts".into(), Value::String(ctx.ts.clone()));
        self.graph.upsert_action(&action_id, props).await;

        let step_id = ctx.payload_str("step_id");
        if !step_id.is_empty() {
            let order = ctx.payload_i64("order");
            self.graph.link_step_action(&step_id, &action_id, order).await;
        }
        self.graph
            .upsert_component("control_room", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("control_room", "cr_action_updated")
    }

    async fn on_compiler_result(&self, ctx: &EventContext, correlation_id: &str) -> MappingResult {
        let corr_id = correlation_id.trim();
        if corr_id.is_empty() {
            return MappingResult::unhandled();
        }

        let prompt_sha = ctx.payload_str("prompt_hash_sha256");
        let det_id = denis_core::sha256_hex(&format!("{corr_id}:intent"));
        let comp_id = denis_core::sha256_hex(&format!("{corr_id}:compile"));
        let mid = stable_mutation_id(
            ctx.event_id,
            "compiler_metadata",
            &format!("{}:{corr_id}:{prompt_sha}", ctx.run_id),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("compiler", "compiler_metadata");
        }

        let candidates = ctx.payload_array("candidates_top3");
        let candidates_json = json_string_capped(
            &Value::Array(candidates.into_iter().take(3).collect()),
            4000,
        );
        let compiler_id = {
            let raw = ctx.payload_str("compiler");
            if raw.is_empty() {
                "openai_chat".to_string()
            } else {
                raw
            }
        };

        let mut detection = Map::new();
        detection.insert("correlation_id".into(), Value::String(corr_id.to_string()));
        detection.insert("pick".into(), Value::String(ctx.payload_str("pick")));
        detection.insert("confidence".into(), Value::from(ctx.payload_f64("confidence")));
        detection.insert(
            "candidates_top3_json".into(),
            Value::String(candidates_json),
        );
        detection.insert(
            "input_text_sha256".into(),
            Value::String(ctx.payload_str("input_text_sha256")),
        );
        detection.insert(
            "input_text_len".into(),
            Value::from(ctx.payload_i64("input_text_len")),
        );
        detection.insert("ts".into(), Value::String(ctx.ts.clone()));
        detection.insert("compiler".into(), Value::String(compiler_id));
        self.graph.upsert_intent_detection(&det_id, detection).await;
        self.graph
            .link_run_intent_detection(&ctx.run_id, &det_id)
            .await;

        let mut compile = Map::new();
        compile.insert("correlation_id".into(), Value::String(corr_id.to_string()));
        compile.insert("makina_prompt_sha256".into(), Value::String(prompt_sha));
        compile.insert(
            "makina_prompt_len".into(),
            Value::from(ctx.payload_i64("prompt_len")),
        );
        compile.insert("model".into(), Value::String(ctx.payload_str("model")));
        compile.insert(
            "template_id".into(),
            Value::String(ctx.payload_str("template_id")),
        );
        compile.insert(
            "retrieval_refs_hash".into(),
            Value::String(ctx.payload_str("retrieval_refs_hash")),
        );
        compile.insert("ts".into(), Value::String(ctx.ts.clone()));
        self.graph.upsert_prompt_compile(&comp_id, compile).await;
        self.graph
            .link_run_prompt_compile(&ctx.run_id, &comp_id)
            .await;

        let degraded = ctx.payload_bool("degraded");
        let status = if degraded { "degraded" } else { "ok" };
        self.graph
            .upsert_component("compiler", component_props(&ctx.ts, status))
            .await;
        MappingResult::handled("compiler", "compiler_metadata")
    }

    async fn on_voice_session_started(&self, ctx: &EventContext) -> MappingResult {
        let session_id = ctx.payload_str("voice_session_id");
        if session_id.is_empty() {
            return MappingResult::unhandled();
        }
        let mid = stable_mutation_id(ctx.event_id, "voice_session_started", &session_id);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("voice", "voice_session_started");
        }

        let status = {
            let raw = ctx.payload_str("status");
            if raw.is_empty() {
                "active".to_string()
            } else {
                raw
            }
        };
        let mut props = Map::new();
        props.insert("conversation_id".into(), Value::String(ctx.conv.clone()));
        props.insert("status".into(), Value::String(status));
        props.insert("ts".into(), Value::String(ctx.ts.clone()));
        props.insert("last_event_ts".into(), Value::String(ctx.ts.clone()));
        props.insert(
            "error_count".into(),
            Value::from(ctx.payload_i64("error_count")),
        );
        self.graph.upsert_voice_session(&session_id, props).await;
        self.graph
            .upsert_component("voice", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("voice", "voice_session_started")
    }

    async fn on_voice_event(&self, ctx: &EventContext, event_type: &str) -> MappingResult {
        let session_id = ctx.payload_str("voice_session_id");
        if session_id.is_empty() {
            return MappingResult::unhandled();
        }
        let mid = stable_mutation_id(
            ctx.event_id,
            "voice_event",
            &format!("{session_id}:{event_type}"),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("voice", "voice_event");
        }

        if event_type == "voice.error" {
            self.graph
                .increment_voice_session_error(&session_id, &ctx.ts)
                .await;
            let mut props = Map::new();
            props.insert("status".into(), Value::String("error".into()));
            self.graph.upsert_voice_session(&session_id, props).await;
        } else {
            let mut props = Map::new();
            props.insert("last_event_ts".into(), Value::String(ctx.ts.clone()));
            self.graph.upsert_voice_session(&session_id, props).await;
        }
        self.graph
            .upsert_component("voice", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("voice", "voice_event")
    }

    async fn on_neuro_wake_start(&self, ctx: &EventContext) -> MappingResult {
        let mid = stable_mutation_id(
            ctx.event_id,
            "neuro_wake_start",
            &format!("{}:wake", ctx.run_id),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("neuro_layers", "neuro_wake_start");
        }

        let identity_id = {
            let raw = ctx.payload_str("identity_id");
            if raw.is_empty() {
                "identity:denis".to_string()
            } else {
                raw
            }
        };
        self.graph.upsert_identity(&identity_id, &ctx.ts).await;
        self.graph
            .upsert_component("neuro_layers", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("neuro_layers", "neuro_wake_start")
    }

    async fn on_neuro_layer_snapshot(&self, ctx: &EventContext) -> MappingResult {
        let layer_index = ctx.payload_i64("layer_index");
        let layer_id = format!("neuro:layer:{layer_index}");
        let mid = stable_mutation_id(ctx.event_id, "neuro_layer_snapshot", &layer_id);
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("neuro_layers", "neuro_layer_snapshot");
        }

        let freshness = if ctx.payload.contains_key("freshness_score") {
            ctx.payload_f64("freshness_score")
        } else {
            0.5
        };
        let status = {
            let raw = ctx.payload_str("status");
            if raw.is_empty() {
                "ok".to_string()
            } else {
                raw
            }
        };
        let last_update_ts = {
            let raw = ctx.payload_str("last_update_ts");
            if raw.is_empty() {
                ctx.ts.clone()
            } else {
                raw
            }
        };
        let mut props = Map::new();
        props.insert("layer_index".into(), Value::from(layer_index));
        props.insert(
            "layer_key".into(),
            Value::String(ctx.payload_str("layer_key")),
        );
        props.insert("title".into(), Value::String(ctx.payload_str("title")));
        props.insert("freshness_score".into(), Value::from(freshness));
        props.insert("status".into(), Value::String(status));
        props.insert(
            "signals_count".into(),
            Value::from(ctx.payload_i64("signals_count")),
        );
        props.insert("last_update_ts".into(), Value::String(last_update_ts));
        self.graph.upsert_neuro_layer(&layer_id, props).await;
        MappingResult::handled("neuro_layers", "neuro_layer_snapshot")
    }

    async fn on_neuro_consciousness_snapshot(&self, ctx: &EventContext) -> MappingResult {
        let mid = stable_mutation_id(
            ctx.event_id,
            "neuro_consciousness_snapshot",
            "denis:consciousness",
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("neuro_layers", "neuro_consciousness_snapshot");
        }

        let mut props = consciousness_props(
            &ctx.payload,
            &[
                "mode",
                "fatigue_level",
                "risk_level",
                "confidence_level",
                "guardrails_mode",
                "memory_mode",
                "voice_mode",
                "ops_mode",
                "last_wake_ts",
                "last_turn_ts",
            ],
        );
        props.insert("updated_ts".into(), Value::String(ctx.ts.clone()));
        self.graph
            .upsert_consciousness_state("denis:consciousness", props)
            .await;
        self.graph
            .link_identity_consciousness("identity:denis", "denis:consciousness")
            .await;
        MappingResult::handled("neuro_layers", "neuro_consciousness_snapshot")
    }

    async fn on_neuro_turn_update(&self, ctx: &EventContext) -> MappingResult {
        let mid = stable_mutation_id(
            ctx.event_id,
            "neuro_turn_update",
            &format!("{}:turn", ctx.run_id),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("neuro_layers", "neuro_turn_update");
        }

        for entry in ctx.payload_array("layers_summary").iter().take(12) {
            let Some(summary) = entry.as_object() else {
                continue;
            };
            let layer_index = summary
                .get("layer_index")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if !(1..=12).contains(&layer_index) {
                continue;
            }
            let layer_id = format!("neuro:layer:{layer_index}");
            let mut props = Map::new();
            props.insert(
                "freshness_score".into(),
                Value::from(
                    summary
                        .get("freshness_score")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.5),
                ),
            );
            props.insert(
                "status".into(),
                Value::String(
                    summary
                        .get("status")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .unwrap_or("ok")
                        .to_string(),
                ),
            );
            props.insert(
                "signals_count".into(),
                Value::from(
                    summary
                        .get("signals_count")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                ),
            );
            props.insert("last_update_ts".into(), Value::String(ctx.ts.clone()));
            self.graph.upsert_neuro_layer(&layer_id, props).await;
        }
        self.graph
            .upsert_component("neuro_layers", component_props(&ctx.ts, "ok"))
            .await;
        MappingResult::handled("neuro_layers", "neuro_turn_update")
    }

    async fn on_neuro_consciousness_update(&self, ctx: &EventContext) -> MappingResult {
        let mid = stable_mutation_id(
            ctx.event_id,
            "neuro_consciousness_update",
            &format!("denis:consciousness:{}", ctx.run_id),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("neuro_layers", "neuro_consciousness_update");
        }

        let mut props = consciousness_props(
            &ctx.payload,
            &[
                "mode",
                "fatigue_level",
                "risk_level",
                "confidence_level",
                "guardrails_mode",
                "memory_mode",
                "voice_mode",
                "ops_mode",
                "last_turn_ts",
            ],
        );
        props.insert("updated_ts".into(), Value::String(ctx.ts.clone()));
        self.graph
            .upsert_consciousness_state("denis:consciousness", props)
            .await;
        MappingResult::handled("neuro_layers", "neuro_consciousness_update")
    }

    async fn on_persona_state_update(&self, ctx: &EventContext) -> MappingResult {
        let mid = stable_mutation_id(
            ctx.event_id,
            "persona_state_update",
            &format!("persona:{}", ctx.run_id),
        );
        if !self.dedupe.try_acquire(&mid) {
            return MappingResult::skipped("persona", "persona_state_update");
        }

        let status = {
            let raw = ctx.payload_str("mode");
            if raw.is_empty() {
                "ok".to_string()
            } else {
                raw
            }
        };
        self.graph
            .upsert_component("persona", component_props(&ctx.ts, &status))
            .await;
        MappingResult::handled("persona", "persona_state_update")
    }
}

/// Envelope fields every dispatch arm needs, extracted once.
struct EventContext {
    event_id: i64,
    event_type: String,
    conv: String,
    trace_id: Option<String>,
    turn_id: String,
    ts: String,
    run_id: String,
    payload: Map<String, Value>,
}

impl EventContext {
    fn from_event(event: &EventV1) -> Self {
        let conv = if event.conversation_id.is_empty() {
            "default".to_string()
        } else {
            event.conversation_id.clone()
        };
        let turn_id = if !event.turn_id.is_empty() {
            event.turn_id.clone()
        } else if let Some(trace) = event.trace_id.as_deref().filter(|t| !t.is_empty()) {
            trace.to_string()
        } else {
            format!("event_{}", event.event_id)
        };
        let ts = if event.ts.is_empty() {
            denis_core::utc_now_iso()
        } else {
            event.ts.clone()
        };
        let payload = event.payload.clone();

        // Explicit SSoT run_id wins (Control Room, explicit run.step); generic
        // pipeline events derive one from the envelope.
        let run_id = payload
            .get("run_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| denis_core::sha256_hex(&format!("{conv}:{turn_id}")));

        Self {
            event_id: event.event_id,
            event_type: event.r#type.clone(),
            conv,
            trace_id: event.trace_id.clone(),
            turn_id,
            ts,
            run_id,
            payload,
        }
    }

    fn payload_str(&self, key: &str) -> String {
        match self.payload.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => value_as_string(other),
        }
    }

    fn payload_i64(&self, key: &str) -> i64 {
        match self.payload.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn payload_f64(&self, key: &str) -> f64 {
        match self.payload.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn payload_bool(&self, key: &str) -> bool {
        self.payload.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn payload_array(&self, key: &str) -> Vec<Value> {
        self.payload
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn payload_object(&self, key: &str) -> Map<String, Value> {
        self.payload
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

pub(crate) fn stable_mutation_id(event_id: i64, mutation_kind: &str, stable_key: &str) -> String {
    denis_core::sha256_hex(&format!("{event_id}:{mutation_kind}:{stable_key}"))
}

fn component_props(ts: &str, status: &str) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("freshness_ts".into(), Value::String(ts.to_string()));
    props.insert("status".into(), Value::String(status.to_string()));
    props
}

fn step_props(run_id: &str, name: &str, status: &str, ts: &str, order: i64) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("run_id".into(), Value::String(run_id.to_string()));
    props.insert("name".into(), Value::String(name.to_string()));
    props.insert("status".into(), Value::String(status.to_string()));
    props.insert("ts".into(), Value::String(ts.to_string()));
    props.insert("order".into(), Value::from(order));
    props
}

fn consciousness_props(payload: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    let mut props = Map::new();
    for &key in keys {
        let Some(value) = payload.get(key).filter(|v| !v.is_null()) else {
            continue;
        };
        if key.ends_with("_level") {
            if let Some(n) = value.as_f64() {
                props.insert(key.to_string(), Value::from(n));
                continue;
            }
        }
        props.insert(key.to_string(), Value::String(value_as_string(value)));
    }
    props
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_string_capped(value: &Value, cap: usize) -> String {
    let mut serialized = value.to_string();
    if serialized.len() > cap {
        let mut end = cap;
        while !serialized.is_char_boundary(end) {
            end -= 1;
        }
        serialized.truncate(end);
    }
    serialized
}

fn compute_lag_ms(event_ts: &str) -> i64 {
    let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(event_ts) else {
        return 0;
    };
    let event_ms = parsed.timestamp_millis();
    if event_ms <= 0 {
        return 0;
    }
    (chrono::Utc::now().timestamp_millis() - event_ms).max(0)
}
