use axum::extract::State;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;

use crate::runtime::run_chat_turn;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

fn default_model() -> String {
    "denis-cognitive".to_string()
}

pub async fn list_models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [
            {"id": "denis-cognitive", "object": "model", "owned_by": "denis"},
            {"id": "denis-fast", "object": "model", "owned_by": "denis"},
        ],
    }))
}

/// OpenAI-compatible completions over the persona pipeline. The streaming
/// variant replays the finished answer as SSE chunks terminated by
/// `data: [DONE]`.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let user_text = extract_user_text(&request.messages);
    let conversation_id =
        denis_core::event::normalize_conversation_id(request.conversation_id.as_deref());

    let outcome = run_chat_turn(
        &state,
        &conversation_id,
        request.trace_id.as_deref(),
        &user_text,
        &request.model,
        &request.tools,
    )
    .await;

    if !request.stream {
        return Json(outcome.completion).into_response();
    }

    let completion_id = outcome.completion["id"]
        .as_str()
        .unwrap_or("chatcmpl-stream")
        .to_string();
    let created = outcome.completion["created"].as_i64().unwrap_or(0);
    let model = request.model.clone();

    let mut events: Vec<Result<SseEvent, Infallible>> = Vec::new();
    events.push(Ok(chunk_event(
        &completion_id,
        created,
        &model,
        json!({"role": "assistant"}),
        None,
    )));
    for piece in split_chunks(&outcome.assistant_text) {
        events.push(Ok(chunk_event(
            &completion_id,
            created,
            &model,
            json!({"content": piece}),
            None,
        )));
    }
    events.push(Ok(chunk_event(
        &completion_id,
        created,
        &model,
        json!({}),
        Some("stop"),
    )));
    events.push(Ok(SseEvent::default().data("[DONE]")));

    Sse::new(stream::iter(events)).into_response()
}

fn chunk_event(
    completion_id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
) -> SseEvent {
    let chunk = json!({
        "id": completion_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    SseEvent::default().data(chunk.to_string())
}

fn extract_user_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .and_then(|message| message.content.as_deref())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn split_chunks(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let words: Vec<&str> = text.split_inclusive(' ').collect();
    words
        .chunks(8)
        .map(|chunk| chunk.concat())
        .collect()
}
