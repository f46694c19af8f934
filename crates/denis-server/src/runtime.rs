use denis_core::Severity;
use denis_graph::intent_plan;
use denis_graph::neuro::{update_sequence, TurnMeta};
use denis_persona::{with_persona_context, EmitParams, PersonaContext};
use serde_json::{json, Value};

use crate::state::AppState;

/// Outcome of one chat turn run through the persona pipeline.
pub struct ChatTurnOutcome {
    pub assistant_text: String,
    pub completion: Value,
    pub degraded: bool,
    pub turn_id: String,
}

/// Run one chat turn: emit the canonical event subsequence, project the
/// intent/plan into the graph, produce the completion, and apply the per-turn
/// neuro UPDATE. Fail-open end to end.
pub async fn run_chat_turn(
    state: &AppState,
    conversation_id: &str,
    trace_id: Option<&str>,
    user_text: &str,
    model: &str,
    tools: &[Value],
) -> ChatTurnOutcome {
    let ctx = PersonaContext::for_request(Some(conversation_id), trace_id, None, None);
    let state = state.clone();
    let conversation_id = conversation_id.to_string();
    let user_text = user_text.to_string();
    let model = model.to_string();
    let tools = tools.to_vec();

    with_persona_context(ctx.clone(), async move {
        run_turn_in_context(&state, &ctx, &conversation_id, &user_text, &model, &tools).await
    })
    .await
}

async fn run_turn_in_context(
    state: &AppState,
    ctx: &PersonaContext,
    conversation_id: &str,
    user_text: &str,
    model: &str,
    tools: &[Value],
) -> ChatTurnOutcome {
    let frontdoor = &state.frontdoor;
    let user_sha = denis_core::sha256_hex(user_text);
    let user_len = user_text.chars().count();

    frontdoor
        .persona_emit(
            EmitParams::new("chat.message")
                .conversation(conversation_id)
                .ui_hint(json!({"render": "chat_bubble", "icon": "message"}))
                .payload(json!({
                    "role": "user",
                    "content_sha256": user_sha,
                    "content_len": user_len,
                })),
        )
        .await;

    let step_id = denis_core::sha256_hex(&format!("{}:turn_pipeline", ctx.turn_id));
    frontdoor
        .persona_emit(
            EmitParams::new("run.step")
                .conversation(conversation_id)
                .payload(json!({
                    "step_id": step_id,
                    "state": "RUNNING",
                    "name": "turn_pipeline",
                    "tool": "persona_runtime",
                    "order": 0,
                })),
        )
        .await;

    // Graph-first intent/plan projection (fail-open hook).
    let plan = intent_plan::create_intent_plan_tasks(
        &state.graph,
        conversation_id,
        &ctx.turn_id,
        user_text,
        "text",
    )
    .await;

    frontdoor
        .persona_emit(
            EmitParams::new("rag.search.start")
                .conversation(conversation_id)
                .payload(json!({
                    "query_sha256": user_sha,
                    "query_len": user_len,
                })),
        )
        .await;

    // Retrieval backends are external collaborators; the pipeline reports an
    // empty evidence selection.
    frontdoor
        .persona_emit(
            EmitParams::new("rag.search.result")
                .conversation(conversation_id)
                .payload(json!({
                    "selected": [],
                    "selected_count": 0,
                })),
        )
        .await;

    frontdoor
        .persona_emit(
            EmitParams::new("rag.context.compiled")
                .conversation(conversation_id)
                .payload(json!({
                    "chunks_count": 0,
                    "citations": [],
                })),
        )
        .await;

    let (assistant_text, completion, degraded) =
        generate_completion(user_text, model, tools, conversation_id);

    // Record which provider answered the run.
    let run_id = denis_core::sha256_hex(&format!("{conversation_id}:{}", ctx.turn_id));
    state
        .graph
        .upsert_provider("local_runtime", Some("builtin"))
        .await;
    state
        .graph
        .link_run_provider(&run_id, "local_runtime", "chat")
        .await;

    frontdoor
        .persona_emit(
            EmitParams::new("agent.reasoning.summary")
                .conversation(conversation_id)
                .payload(json!({
                    "adaptive_reasoning": {
                        "goal_sha256": user_sha,
                        "goal_len": user_len,
                        "tools_used": [],
                        "constraints_hit": [],
                        "retrieval": {"chunk_ids": []},
                    },
                })),
        )
        .await;

    frontdoor
        .persona_emit(
            EmitParams::new("agent.decision_trace_summary")
                .conversation(conversation_id)
                .payload(json!({
                    "endpoint": "/v1/chat/completions",
                    "decision_type": "chat_turn",
                    "outcome": if degraded { "degraded" } else { "success" },
                    "plan_warning": plan.warning,
                })),
        )
        .await;

    frontdoor
        .persona_emit(
            EmitParams::new("chat.message")
                .conversation(conversation_id)
                .ui_hint(json!({"render": "chat_bubble", "icon": "message"}))
                .payload(json!({
                    "role": "assistant",
                    "content_sha256": denis_core::sha256_hex(&assistant_text),
                    "content_len": assistant_text.chars().count(),
                })),
        )
        .await;

    frontdoor
        .persona_emit(
            EmitParams::new("run.step")
                .conversation(conversation_id)
                .payload(json!({
                    "step_id": step_id,
                    "state": if degraded { "FAILED" } else { "SUCCESS" },
                    "name": "turn_pipeline",
                    "tool": "persona_runtime",
                    "order": 0,
                })),
        )
        .await;

    // Per-turn neuro UPDATE; its events go out through the frontdoor too.
    let meta = TurnMeta {
        intent_hash: user_sha.clone(),
        turns_in_session: count_user_turns(state, conversation_id),
        errors_count: i64::from(degraded),
        ops_degraded: false,
        ..TurnMeta::default()
    };
    let (_, emissions) = update_sequence(&state.graph, &meta).await;
    for emission in emissions {
        let mut params = EmitParams::new(emission.event_type)
            .conversation(conversation_id)
            .severity(Severity::Info);
        params.payload = emission.payload;
        params.stored = emission.stored;
        frontdoor.persona_emit(params).await;
    }

    state.telemetry.record_chat(degraded);

    ChatTurnOutcome {
        assistant_text,
        completion,
        degraded,
        turn_id: ctx.turn_id.clone(),
    }
}

fn count_user_turns(state: &AppState, conversation_id: &str) -> i64 {
    state
        .frontdoor
        .store()
        .query_after(conversation_id, 0)
        .map(|events| {
            events
                .iter()
                .filter(|event| {
                    event.r#type == "chat.message"
                        && event.payload.get("role").and_then(Value::as_str) == Some("user")
                })
                .count() as i64
        })
        .unwrap_or(1)
        .max(1)
}

fn generate_completion(
    user_text: &str,
    model: &str,
    tools: &[Value],
    conversation_id: &str,
) -> (String, Value, bool) {
    let completion_id = format!("chatcmpl-{}", &denis_core::new_id()[..16]);
    let created = chrono::Utc::now().timestamp();
    let prompt_tokens = user_text.split_whitespace().count().max(1);

    if let Some(tool_call) = maybe_tool_call(user_text, tools) {
        let completion = json!({
            "id": completion_id,
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null, "tool_calls": [tool_call]},
                "finish_reason": "tool_calls",
            }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": 0,
                "total_tokens": prompt_tokens,
            },
            "meta": {"path": "tool_calls"},
        });
        return (String::new(), completion, false);
    }

    // Local deterministic runtime; upstream model providers are out of scope.
    let assistant_text = if user_text.is_empty() {
        "No input text was provided for this turn.".to_string()
    } else {
        format!(
            "Denis processed a {} character turn on '{}'. The local runtime answered because no upstream core is attached.",
            user_text.chars().count(),
            conversation_id,
        )
    };
    let completion_tokens = assistant_text.split_whitespace().count().max(1);

    let completion = json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": assistant_text},
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
        "meta": {"path": "local_runtime"},
    });
    (assistant_text, completion, false)
}

fn maybe_tool_call(user_text: &str, tools: &[Value]) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }
    let lowered = user_text.to_lowercase();
    if !lowered.contains("tool") && !lowered.contains("perceive") && !lowered.contains("act") {
        return None;
    }
    let function_name = tools
        .first()
        .and_then(|tool| tool.get("function"))
        .and_then(|function| function.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("denis_tool");
    Some(json!({
        "id": format!("call_{}", &denis_core::new_id()[..12]),
        "type": "function",
        "function": {"name": function_name, "arguments": "{}"},
    }))
}
