use axum::extract::{Request, State};
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

mod chat;
mod events;
mod neuro;
mod ops;
mod persona;
mod ws;

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/events", get(events::list_events))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(chat::list_models))
        .route("/persona/chat", post(persona::persona_chat))
        .route("/persona/voice", post(persona::persona_voice))
        .route("/neuro/state", get(neuro::neuro_state))
        .route("/neuro/wake", post(neuro::neuro_wake))
        .route("/telemetry", get(ops::telemetry))
        .route("/health", get(ops::health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/v1/ws", get(ws::ws_handler))
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            record_requests,
        ))
        .with_state(state)
}

/// 401 is the only permitted auth failure; everything else stays 200.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(token) = &state.bearer_token {
        let expected = format!("Bearer {token}");
        let authorized = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value == expected)
            .unwrap_or(false);
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"code": "missing_bearer", "msg": "bearer token required"}})),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn record_requests(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    state
        .telemetry
        .record_request(&path, response.status().as_u16());
    response
}
