use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub after: Option<i64>,
}

/// Replay endpoint over the persisted log. Fail-open: always 200, a broken
/// store yields an empty list plus an `error` object.
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Value> {
    let conversation_id =
        denis_core::event::normalize_conversation_id(query.conversation_id.as_deref());
    let after = query.after.unwrap_or(0).max(0);

    match state.frontdoor.store().query_after(&conversation_id, after) {
        Ok(events) => Json(json!({
            "conversation_id": conversation_id,
            "after": after,
            "count": events.len(),
            "events": events,
        })),
        Err(_) => Json(json!({
            "conversation_id": conversation_id,
            "after": after,
            "count": 0,
            "events": [],
            "error": {"code": "degraded", "msg": "events_failed"},
        })),
    }
}
