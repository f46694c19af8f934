//! Graph-first Intent/Plan/Task creation for a chat turn.
//!
//! Fail-open: when the graph is disabled or unreachable the result carries a
//! warning and the chat response is never blocked.

use serde_json::{Map, Value};

use crate::client::GraphClient;

/// One backfill task per specialty lane.
pub const SPECIALTIES: [(&str, &str); 4] = [
    ("S1_CORE_GRAPH_CONTROLROOM", "plan_subtask"),
    ("S2_VOICE_PIPELINE", "plan_subtask"),
    ("S3_FRONT_UI_VISUALIZATION", "plan_subtask"),
    ("S4_GOV_OPS_SAFETY", "plan_subtask"),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentPlanResult {
    pub success: bool,
    pub intent_id: Option<String>,
    pub plan_id: Option<String>,
    pub task_ids: Vec<String>,
    pub warning: Option<&'static str>,
}

/// Create Intent + Plan + the four specialty Tasks for one turn.
pub async fn create_intent_plan_tasks(
    graph: &GraphClient,
    conversation_id: &str,
    turn_id: &str,
    user_text: &str,
    modality: &str,
) -> IntentPlanResult {
    let mut result = IntentPlanResult::default();

    let Some(intent_id) = create_intent(graph, conversation_id, turn_id, user_text, modality).await
    else {
        result.warning = Some("graph_unavailable");
        return result;
    };

    let Some(plan_id) = create_plan(graph, &intent_id).await else {
        result.intent_id = Some(intent_id);
        result.warning = Some("plan_creation_failed");
        return result;
    };

    let task_ids = create_specialty_tasks(graph, &plan_id, &intent_id, conversation_id, turn_id).await;
    if task_ids.len() != SPECIALTIES.len() {
        result.intent_id = Some(intent_id);
        result.plan_id = Some(plan_id);
        result.task_ids = task_ids;
        result.warning = Some("tasks_creation_failed");
        return result;
    }

    result.success = true;
    result.intent_id = Some(intent_id);
    result.plan_id = Some(plan_id);
    result.task_ids = task_ids;
    result
}

async fn create_intent(
    graph: &GraphClient,
    conversation_id: &str,
    turn_id: &str,
    user_text: &str,
    modality: &str,
) -> Option<String> {
    if !graph.enabled() {
        return None;
    }
    let intent_id = denis_core::sha256_hex(&format!("{conversation_id}:{turn_id}"));
    let user_text_len = user_text.chars().count();
    let ts = denis_core::utc_now_iso();

    let mut props = Map::new();
    props.insert(
        "conversation_id".into(),
        Value::String(conversation_id.to_string()),
    );
    props.insert("turn_id".into(), Value::String(turn_id.to_string()));
    props.insert("ts".into(), Value::String(ts));
    props.insert(
        "user_text_sha256".into(),
        Value::String(denis_core::sha256_hex(user_text)),
    );
    props.insert("user_text_len".into(), Value::from(user_text_len));
    props.insert(
        "user_text_preview".into(),
        Value::String(if user_text_len > 0 {
            format!("[redacted:{user_text_len}chars]")
        } else {
            String::new()
        }),
    );
    props.insert("modality".into(), Value::String(modality.to_string()));
    props.insert("status".into(), Value::String("planned".into()));

    graph
        .upsert_intent(&intent_id, props)
        .await
        .then_some(intent_id)
}

async fn create_plan(graph: &GraphClient, intent_id: &str) -> Option<String> {
    let plan_id = format!("{intent_id}:plan");
    let specialties: Vec<Value> = SPECIALTIES
        .iter()
        .map(|(specialty, _)| Value::String((*specialty).to_string()))
        .collect();

    let mut props = Map::new();
    props.insert("intent_id".into(), Value::String(intent_id.to_string()));
    props.insert("ts".into(), Value::String(denis_core::utc_now_iso()));
    props.insert("status".into(), Value::String("active".into()));
    props.insert("specialties".into(), Value::Array(specialties));
    props.insert("no_overlap_contract_hash".into(), Value::String(String::new()));

    if !graph.upsert_plan(&plan_id, props).await {
        return None;
    }
    graph.link_intent_plan(intent_id, &plan_id).await;
    Some(plan_id)
}

async fn create_specialty_tasks(
    graph: &GraphClient,
    plan_id: &str,
    intent_id: &str,
    conversation_id: &str,
    turn_id: &str,
) -> Vec<String> {
    let ts = denis_core::utc_now_iso();
    let mut task_ids = Vec::with_capacity(SPECIALTIES.len());

    for (specialty, reason_safe) in SPECIALTIES {
        let task_id = format!("{plan_id}:task:{specialty}");

        let mut props = Map::new();
        props.insert("type".into(), Value::String("backfill".into()));
        props.insert("status".into(), Value::String("queued".into()));
        props.insert("reason_safe".into(), Value::String(reason_safe.to_string()));
        props.insert("specialty".into(), Value::String(specialty.to_string()));
        props.insert(
            "conversation_id".into(),
            Value::String(conversation_id.to_string()),
        );
        props.insert("turn_id".into(), Value::String(turn_id.to_string()));
        props.insert("intent_id".into(), Value::String(intent_id.to_string()));
        props.insert("plan_id".into(), Value::String(plan_id.to_string()));
        props.insert("payload_redacted_hash".into(), Value::String(String::new()));
        props.insert("created_ts".into(), Value::String(ts.clone()));
        props.insert("updated_ts".into(), Value::String(ts.clone()));

        if graph.upsert_task(&task_id, props).await {
            graph.link_plan_task(plan_id, &task_id, specialty).await;
            task_ids.push(task_id);
        }
    }
    task_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraph;
    use std::sync::Arc;

    #[tokio::test]
    async fn full_flow_creates_intent_plan_and_four_tasks() {
        let graph = Arc::new(MemoryGraph::new());
        let client = GraphClient::with_backend(graph.clone());

        let result =
            create_intent_plan_tasks(&client, "conv1", "turn1", "summarize the incident", "text")
                .await;
        assert!(result.success);
        assert_eq!(result.task_ids.len(), 4);

        let intent_id = result.intent_id.expect("intent id");
        let plan_id = result.plan_id.expect("plan id");
        let intent = graph.node("Intent", &intent_id).expect("intent node");
        assert_eq!(
            intent["user_text_sha256"],
            denis_core::sha256_hex("summarize the incident")
        );
        assert_eq!(intent["user_text_preview"], "[redacted:22chars]");
        assert!(graph.has_edge("Intent", &intent_id, "HAS_PLAN", "Plan", &plan_id));

        for task_id in &result.task_ids {
            let edge = graph
                .edge_props("Plan", &plan_id, "HAS_TASK", "Task", task_id)
                .expect("plan task edge");
            assert!(edge["specialty"].as_str().expect("specialty").starts_with('S'));
        }
    }

    #[tokio::test]
    async fn disabled_graph_reports_warning() {
        let client = GraphClient::disabled();
        let result = create_intent_plan_tasks(&client, "conv", "turn", "hi", "text").await;
        assert!(!result.success);
        assert_eq!(result.warning, Some("graph_unavailable"));
    }
}
