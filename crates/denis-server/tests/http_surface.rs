use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use denis_graph::{GraphClient, MemoryGraph};
use denis_persona::{BypassMode, FrontdoorPolicy};
use denis_server::{build_router, AppState};
use denis_store::{EventStore, MutationLog};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn test_state(bearer_token: Option<&str>) -> AppState {
    let store = Arc::new(EventStore::open_in_memory().expect("event store"));
    let dedupe = Arc::new(MutationLog::open_in_memory().expect("dedupe log"));
    let graph = Arc::new(GraphClient::with_backend(Arc::new(MemoryGraph::new())));
    AppState::with_components(
        store,
        dedupe,
        graph,
        FrontdoorPolicy {
            enforced: true,
            bypass_mode: BypassMode::Raise,
        },
        bearer_token.map(str::to_string),
    )
}

fn test_router(bearer_token: Option<&str>) -> (Router, AppState) {
    let state = test_state(bearer_token);
    (build_router(state.clone()), state)
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn assert_subsequence(haystack: &[String], needle: &[&str]) {
    let mut position = 0;
    for expected in needle {
        match haystack[position..]
            .iter()
            .position(|item| item == expected)
        {
            Some(offset) => position += offset + 1,
            None => panic!("missing '{expected}' after index {position} in {haystack:?}"),
        }
    }
}

#[tokio::test]
async fn health_is_200_with_subsystem_blocks() {
    let (router, _) = test_router(None);
    let (status, body) = get_json(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["graph_ssot"]["enabled"].as_bool().expect("enabled"));
    assert!(body["graph_ssot"]["materializer"].is_object());
    assert!(body["async"].is_object());
    assert!(body["vectorstore"].is_object());
}

#[tokio::test]
async fn telemetry_is_200_and_counts_requests() {
    let (router, _) = test_router(None);
    get_json(&router, "/health").await;
    let (status, body) = get_json(&router, "/telemetry").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["requests"]["total_1h"].as_u64().expect("total") >= 1);
    assert_eq!(body["persona"]["emitter"], "denis_persona");
    assert!(body["graph"]["ssot"].is_object());
    assert!(body["neuro"]["layers_count"].is_number());
    assert!(!body["started_utc"].as_str().expect("started").is_empty());
}

#[tokio::test]
async fn events_endpoint_fails_open_with_empty_list() {
    let (router, _) = test_router(None);
    let (status, body) = get_json(&router, "/v1/events?conversation_id=conv9&after=0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conversation_id"], "conv9");
    assert_eq!(body["count"], 0);
    assert!(body["events"].as_array().expect("events").is_empty());
}

#[tokio::test]
async fn bearer_token_gates_http_routes() {
    let (router, _) = test_router(Some("secret-token"));

    let (status, _) = get_json(&router, "/health").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("authorization", "Bearer secret-token")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn chat_completions_returns_openai_shape() {
    let (router, _) = test_router(None);
    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        json!({
            "model": "denis-cognitive",
            "messages": [{"role": "user", "content": "hello denis"}],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().expect("id").starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert!(body["usage"]["total_tokens"].as_u64().expect("usage") > 0);
}

#[tokio::test]
async fn chat_completions_with_tools_returns_tool_call() {
    let (router, _) = test_router(None);
    let (status, body) = post_json(
        &router,
        "/v1/chat/completions",
        json!({
            "messages": [{"role": "user", "content": "use a tool to perceive the room"}],
            "tools": [{"type": "function", "function": {"name": "perceive"}}],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(
        body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
        "perceive"
    );
}

#[tokio::test]
async fn chat_turn_emits_canonical_subsequence() {
    let (router, state) = test_router(None);
    let (status, body) = post_json(
        &router,
        "/persona/chat",
        json!({
            "conversation_id": "conv-turn",
            "trace_id": "trace-turn",
            "text": "summarize the incident report",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["assistant_text"].as_str().expect("text").is_empty());

    let events = state
        .frontdoor
        .store()
        .query_after("conv-turn", 0)
        .expect("events");
    let types: Vec<String> = events.iter().map(|event| event.r#type.clone()).collect();
    assert_subsequence(
        &types,
        &[
            "chat.message",
            "run.step",
            "rag.search.start",
            "rag.search.result",
            "rag.context.compiled",
            "agent.reasoning.summary",
            "agent.decision_trace_summary",
            "chat.message",
        ],
    );

    // First chat.message is the user, last is the assistant; both hashed.
    let chat_messages: Vec<_> = events
        .iter()
        .filter(|event| event.r#type == "chat.message")
        .collect();
    assert!(chat_messages.len() >= 2);
    assert_eq!(chat_messages[0].payload["role"], "user");
    assert_eq!(
        chat_messages.last().expect("assistant message").payload["role"],
        "assistant"
    );
    for message in &chat_messages {
        assert!(message.payload.contains_key("content_sha256"));
        assert!(!message.payload.contains_key("content"));
    }

    // Envelope invariants: persona emitter, dense ids, correlation from trace.
    for (index, event) in events.iter().enumerate() {
        assert_eq!(event.emitter, "denis_persona");
        assert_eq!(event.event_id, index as i64 + 1);
        assert_eq!(event.correlation_id, "trace-turn");
    }
}

#[tokio::test]
async fn chat_turn_materializes_run_and_intent() {
    let (router, state) = test_router(None);
    post_json(
        &router,
        "/persona/chat",
        json!({"conversation_id": "conv-mat", "text": "hello"}),
    )
    .await;

    // The turn projected Run/Step/Intent state into the graph.
    assert!(state.graph.fetch_nodes("Run").await.len() >= 1);
    assert!(state.graph.fetch_nodes("Step").await.len() >= 1);
    assert_eq!(state.graph.fetch_nodes("Intent").await.len(), 1);
    assert_eq!(state.graph.fetch_nodes("Plan").await.len(), 1);
    assert_eq!(state.graph.fetch_nodes("Task").await.len(), 4);
    let provider = state
        .graph
        .fetch_node("Provider", "local_runtime")
        .await
        .expect("provider node");
    assert_eq!(provider["kind"], "builtin");
}

#[tokio::test]
async fn neuro_wake_then_state_reports_12_layers() {
    let (router, state) = test_router(None);
    let (status, body) = post_json(&router, "/neuro/wake", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["consciousness"]["mode"], "awake");
    assert_eq!(body["consciousness"]["guardrails_mode"], "normal");
    assert_eq!(body["consciousness"]["ops_mode"], "normal");

    let (status, body) = get_json(&router, "/neuro/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["layers"].as_array().expect("layers").len(), 12);
    assert!(!body["consciousness"]["last_wake_ts"]
        .as_str()
        .expect("last wake")
        .is_empty());

    // Exactly 12 layer snapshots reached the wake conversation's live bus;
    // only the stored ones are replayable.
    let stored = state
        .frontdoor
        .store()
        .query_after("neuro_wake", 0)
        .expect("stored events");
    let stored_types: Vec<String> = stored.iter().map(|event| event.r#type.clone()).collect();
    assert!(stored_types.contains(&"neuro.wake.start".to_string()));
    assert!(stored_types.contains(&"neuro.consciousness.snapshot".to_string()));
    assert!(!stored_types.contains(&"neuro.layer.snapshot".to_string()));

    let snapshot_count = state.frontdoor.stats().by_type_top.iter().find_map(
        |(event_type, count)| {
            (event_type == "neuro.layer.snapshot").then_some(*count)
        },
    );
    assert_eq!(snapshot_count, Some(12));
}

#[tokio::test]
async fn voice_turn_emits_voice_events() {
    let (router, state) = test_router(None);
    let (status, body) = post_json(
        &router,
        "/persona/voice",
        json!({
            "conversation_id": "conv-voice",
            "text": "read me the status",
            "tts_enabled": true,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = body["voice_session_id"].as_str().expect("session id");
    assert!(session_id.starts_with("vs_"));

    let events = state
        .frontdoor
        .store()
        .query_after("conv-voice", 0)
        .expect("events");
    let types: Vec<String> = events.iter().map(|event| event.r#type.clone()).collect();
    assert_subsequence(
        &types,
        &[
            "voice.session.started",
            "voice.asr.final",
            "chat.message",
            "chat.message",
            "voice.tts.requested",
            "voice.tts.done",
        ],
    );

    let session = state
        .graph
        .fetch_node("VoiceSession", session_id)
        .await
        .expect("voice session node");
    assert_eq!(session["status"], "active");
}

#[tokio::test]
async fn voice_without_text_degrades_with_error_event() {
    let (router, state) = test_router(None);
    let (status, body) = post_json(
        &router,
        "/persona/voice",
        json!({"conversation_id": "conv-voice-err"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["degraded"], true);

    let events = state
        .frontdoor
        .store()
        .query_after("conv-voice-err", 0)
        .expect("events");
    assert!(events.iter().any(|event| event.r#type == "voice.error"));
}

#[tokio::test]
async fn persona_chat_rejects_empty_text_failing_open() {
    let (router, _) = test_router(None);
    let (status, body) =
        post_json(&router, "/persona/chat", json!({"conversation_id": "c"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["degraded"], true);
    assert_eq!(body["warning"]["code"], "empty_text");
}

#[tokio::test]
async fn models_endpoint_lists_denis_models() {
    let (router, _) = test_router(None);
    let (status, body) = get_json(&router, "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["id"], "denis-cognitive");
}

#[tokio::test]
async fn stored_events_never_contain_secret_material() {
    let (router, state) = test_router(None);
    post_json(
        &router,
        "/persona/chat",
        json!({
            "conversation_id": "conv-sec",
            "text": "my key is sk-verysecret123 and header Bearer abcdef",
        }),
    )
    .await;

    let events = state
        .frontdoor
        .store()
        .query_after("conv-sec", 0)
        .expect("events");
    for event in events {
        let serialized = serde_json::to_string(&event).expect("json");
        assert!(!serialized.contains("sk-verysecret123"));
        assert!(!serialized.contains("Bearer abcdef"));
    }
}
